//! capture - headless frame collector for building training sets
//!
//! Reads frames from a camera and saves JPEG snapshots:
//! - type `s` + Enter to save the current frame
//! - type `q` + Enter (or Ctrl-C) to stop
//! - `--save-every N` additionally saves a frame every N seconds

use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use servo_sorter::capture::{AutoSaver, CaptureStore, TerminalCommand};
use servo_sorter::{open_source, CameraSettings, Frame, FrameError, SourceKind};

#[derive(Parser, Debug)]
#[command(author, version, about = "Capture camera frames to a directory")]
struct Args {
    /// V4L2 device node, or stub://NAME for synthetic frames.
    #[arg(long, env = "SORTER_CAMERA_DEVICE", default_value = "/dev/video0")]
    device: String,

    #[arg(long, default_value_t = 640)]
    width: u32,

    #[arg(long, default_value_t = 480)]
    height: u32,

    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Directory for saved frames (created if missing).
    #[arg(long, default_value = "captures")]
    save_dir: PathBuf,

    /// Save a frame every N seconds, fractions allowed (0 disables).
    #[arg(long, value_name = "SECS", default_value_t = 0.0)]
    save_every: f64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut source = open_source(&CameraSettings {
        kind: SourceKind::V4l2,
        device: args.device.clone(),
        width: args.width,
        height: args.height,
        target_fps: args.fps,
    })?;
    source.connect()?;

    let mut store = CaptureStore::open(&args.save_dir)?;
    log::info!(
        "saving to {} ({} images already there)",
        store.dir().display(),
        store.count()?
    );

    let stop = Arc::new(AtomicBool::new(false));
    let handler_flag = stop.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let commands = spawn_stdin_reader();
    eprintln!("commands: s = save frame, q = quit");

    let frame_period = if args.fps > 0 {
        Duration::from_secs_f64(1.0 / args.fps as f64)
    } else {
        Duration::ZERO
    };
    let started = Instant::now();
    let mut auto_saver = AutoSaver::every_secs(args.save_every, started)?;
    let mut latest: Option<Frame> = None;
    let mut frames = 0u64;

    while !stop.load(Ordering::SeqCst) {
        let tick_started = Instant::now();
        match source.next_frame() {
            Ok(frame) => {
                frames += 1;
                latest = Some(frame);
            }
            Err(FrameError::Unavailable(reason)) => {
                log::warn!("frame unavailable: {}", reason);
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }
            Err(FrameError::Fatal(err)) => return Err(err),
        }

        if auto_saver.due(Instant::now()) {
            if let Some(frame) = &latest {
                store.save(frame, "auto")?;
            }
        }

        while let Ok(command) = commands.try_recv() {
            match command {
                TerminalCommand::Save => match &latest {
                    Some(frame) => {
                        let path = store.save(frame, "capture")?;
                        eprintln!("saved {}", path.display());
                    }
                    None => eprintln!("no frame yet"),
                },
                TerminalCommand::Quit => stop.store(true, Ordering::SeqCst),
                TerminalCommand::Unknown(line) if line.is_empty() => {}
                TerminalCommand::Unknown(line) => {
                    eprintln!("unknown command '{}' (s = save, q = quit)", line)
                }
            }
        }

        let spent = tick_started.elapsed();
        if spent < frame_period {
            std::thread::sleep(frame_period - spent);
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    let fps = if elapsed > 0.0 {
        frames as f64 / elapsed
    } else {
        0.0
    };
    println!(
        "captured {} frames in {:.1}s ({:.1} fps), saved {} to {}",
        frames,
        elapsed,
        fps,
        store.saved(),
        store.dir().display()
    );
    Ok(())
}

/// Forward parsed stdin lines. The thread ends at EOF or when the receiver
/// is dropped.
fn spawn_stdin_reader() -> mpsc::Receiver<TerminalCommand> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(TerminalCommand::parse(&line)).is_err() {
                break;
            }
        }
    });
    rx
}
