//! servo_check - bench test for the sorter servo
//!
//! - `--quick` runs every automatic test and exits
//! - `--angle N` moves to one angle and exits
//! - otherwise an interactive menu is read from stdin

use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use servo_sorter::ui::{Ui, UiMode};
use servo_sorter::{Actuator, ServoController, SorterConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Exercise the sorter servo")]
struct Args {
    /// Configuration file providing the [servo] section.
    #[arg(long, env = "SORTER_CONFIG")]
    config: Option<PathBuf>,

    /// Override the servo output (sysfs channel or stub://NAME).
    #[arg(long)]
    output: Option<String>,

    /// Run all automatic tests and exit.
    #[arg(long, conflicts_with = "angle")]
    quick: bool,

    /// Move to this angle (0-180) and exit.
    #[arg(long, value_parser = clap::value_parser!(u16).range(0..=180))]
    angle: Option<u16>,

    /// Pause scale for the automatic tests (1.0 = real-time bench pace).
    #[arg(long, default_value_t = 1.0)]
    pace: f64,

    #[arg(long, value_enum, default_value_t = UiMode::Auto)]
    ui: UiMode,
}

struct Bench {
    servo: ServoController,
    ui: Ui,
    pace: f64,
}

impl Bench {
    fn pause(&self, secs: f64) {
        let scaled = secs * self.pace;
        if scaled > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(scaled));
        }
    }

    fn report(&self) {
        println!("   current position: {:.0}°", self.servo.current_angle());
    }

    fn basic_moves(&mut self) -> Result<()> {
        let stage = self.ui.stage("basic positions");
        for (label, angle) in [("left", 0.0), ("center", 90.0), ("right", 180.0)] {
            stage.progress(label);
            self.servo.move_to(angle)?;
            self.pause(2.0);
        }
        self.servo.home()?;
        self.pause(1.0);
        drop(stage);
        self.report();
        Ok(())
    }

    fn left_right(&mut self) -> Result<()> {
        let stage = self.ui.stage("relative moves");
        self.servo.home()?;
        self.pause(1.0);
        stage.progress("left 45");
        self.servo.move_left(45.0)?;
        self.pause(2.0);
        stage.progress("right 90");
        self.servo.move_right(90.0)?;
        self.pause(2.0);
        stage.progress("left 45");
        self.servo.move_left(45.0)?;
        self.pause(1.0);
        drop(stage);
        self.report();
        Ok(())
    }

    fn sweep(&mut self) -> Result<()> {
        let stage = self.ui.stage("sweep");
        let step_delay = Duration::from_secs_f64(0.05 * self.pace);
        stage.progress("0 -> 180");
        self.servo.sweep(0.0, 180.0, 20, step_delay)?;
        self.pause(1.0);
        stage.progress("180 -> 0");
        self.servo.sweep(180.0, 0.0, 20, step_delay)?;
        self.pause(1.0);
        self.servo.home()?;
        drop(stage);
        self.report();
        Ok(())
    }

    fn run_all(&mut self) -> Result<()> {
        self.basic_moves()?;
        self.pause(2.0);
        self.left_right()?;
        self.pause(2.0);
        self.sweep()?;
        println!("all servo tests complete");
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let cfg = SorterConfig::load_from(args.config.as_deref())?;
    let mut settings = cfg.servo;
    if let Some(output) = args.output {
        settings.output = output;
    }
    if !(args.pace.is_finite() && args.pace >= 0.0) {
        return Err(anyhow!("--pace must be a non-negative number"));
    }

    let servo = ServoController::open(&settings)?;
    let mut bench = Bench {
        servo,
        ui: Ui::for_stderr(args.ui),
        pace: args.pace,
    };

    let result = if let Some(angle) = args.angle {
        bench.servo.move_to(angle as f32).map(|_| ()).map_err(Into::into)
    } else if args.quick {
        bench.run_all()
    } else {
        interactive(&mut bench)
    };
    if result.is_ok() && args.angle.is_some() {
        bench.report();
    }

    bench.servo.release()?;
    result
}

fn interactive(bench: &mut Bench) -> Result<()> {
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print_menu(bench);
        let Some(choice) = prompt(&mut lines, "choice: ")? else {
            return Ok(());
        };
        match choice.as_str() {
            "1" => {
                let Some(angle) = read_number(&mut lines, "angle (0-180): ")? else {
                    return Ok(());
                };
                if !(0.0..=180.0).contains(&angle) {
                    println!("angle must be between 0 and 180");
                    continue;
                }
                bench.servo.move_to(angle)?;
                bench.report();
            }
            "2" | "3" => {
                let Some(degrees) = read_number(&mut lines, "degrees: ")? else {
                    return Ok(());
                };
                if choice == "2" {
                    bench.servo.move_left(degrees)?;
                } else {
                    bench.servo.move_right(degrees)?;
                }
                bench.report();
            }
            "4" => bench.sweep()?,
            "5" => {
                bench.servo.home()?;
                bench.report();
            }
            "6" => bench.run_all()?,
            "0" | "q" => return Ok(()),
            other => println!("unknown choice '{}'", other),
        }
    }
}

fn print_menu(bench: &Bench) {
    println!();
    println!("servo on {}", bench.servo.name());
    println!("current position: {:.0}°", bench.servo.current_angle());
    println!("[1] move to angle");
    println!("[2] move left");
    println!("[3] move right");
    println!("[4] sweep");
    println!("[5] home ({:.0}°)", bench.servo.settings().home_angle);
    println!("[6] run all automatic tests");
    println!("[0] exit");
}

fn prompt(
    lines: &mut impl Iterator<Item = std::io::Result<String>>,
    text: &str,
) -> Result<Option<String>> {
    print!("{text}");
    std::io::stdout().flush()?;
    match lines.next() {
        Some(line) => Ok(Some(line?.trim().to_string())),
        None => Ok(None),
    }
}

/// Prompt until a number is entered. `None` at end of input.
fn read_number(
    lines: &mut impl Iterator<Item = std::io::Result<String>>,
    text: &str,
) -> Result<Option<f32>> {
    loop {
        let Some(input) = prompt(lines, text)? else {
            return Ok(None);
        };
        match input.parse::<f32>() {
            Ok(value) if value.is_finite() => return Ok(Some(value)),
            _ => println!("please enter a number"),
        }
    }
}
