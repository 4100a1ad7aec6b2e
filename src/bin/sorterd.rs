//! sorterd - detection-driven servo sorter daemon
//!
//! This daemon:
//! 1. Loads configuration (file named by --config / SORTER_CONFIG, then env overrides)
//! 2. Opens the camera, the detector backend and the servo
//! 3. Runs the tick loop: frame -> detect -> coordinate -> move
//!    (optionally saving each frame with detections, boxes drawn, to --annotate-dir)
//! 4. On Ctrl-C, optionally returns the servo home and releases it

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use servo_sorter::annotate::save_annotated;
use servo_sorter::capture::CaptureStore;
use servo_sorter::pipeline::TickAction;
use servo_sorter::{BackendRegistry, Command, RunSummary, Sorter, SorterConfig, TickReport};

#[derive(Parser, Debug)]
#[command(author, version, about = "Sort objects with a camera, a detector and a servo")]
struct Args {
    /// Configuration file (TOML, or JSON when the name ends in .json).
    #[arg(long, env = "SORTER_CONFIG")]
    config: Option<PathBuf>,

    /// Drive a synthetic servo instead of the configured PWM output.
    #[arg(long)]
    dry_run: bool,

    /// Print each tick's detections as one JSON line on stdout.
    #[arg(long)]
    print_detections: bool,

    /// Save every frame with detections, boxes and tags drawn, as JPEG here.
    #[arg(long, value_name = "DIR")]
    annotate_dir: Option<PathBuf>,

    /// Stop after this many ticks.
    #[arg(long, value_name = "N")]
    ticks: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = SorterConfig::load_from(args.config.as_deref())?;
    let registry = BackendRegistry::with_builtin();

    log::info!(
        "sorterd {} starting: camera={} detector={} servo={}{}",
        env!("CARGO_PKG_VERSION"),
        cfg.camera.device,
        cfg.detector.backend,
        cfg.servo.output,
        if args.dry_run { " (dry run)" } else { "" }
    );
    for (class, angle) in &cfg.coordinator.targets {
        log::info!("target {} -> {:.1}", class, angle);
    }

    let mut sorter = Sorter::from_config(&cfg, &registry, args.dry_run)?;
    let mut annotations = match &args.annotate_dir {
        Some(dir) => {
            let store = CaptureStore::open(dir)?;
            log::info!("saving annotated frames to {}", store.dir().display());
            Some(store)
        }
        None => None,
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!(
        "sorterd running (home {:.1}, idle timeout {} ms)",
        cfg.coordinator.home_angle,
        cfg.coordinator.idle_timeout.as_millis()
    );

    let result = sorter.run_with(&shutdown, args.ticks, |report| {
        if args.print_detections {
            print_report(report);
        }
        if let Some(store) = annotations.as_mut() {
            if let Err(e) = save_annotated(store, report) {
                log::warn!("failed to save annotated frame: {:#}", e);
            }
        }
    });
    if shutdown.load(Ordering::SeqCst) {
        log::info!("shutdown signal received, stopping");
    }

    // Release the servo even when the loop failed.
    let released = sorter.shutdown(cfg.tick_loop.home_on_exit);
    let summary = settle(result, released)?;
    if let Some(store) = &annotations {
        log::info!("saved {} annotated frames", store.saved());
    }
    log::info!(
        "processed {} frames, issued {} commands",
        summary.frames,
        summary.commands
    );
    Ok(())
}

/// Combine the loop outcome with the servo release. A release failure wins,
/// but a loop failure before it is logged and kept in the error chain.
fn settle(
    loop_result: Result<RunSummary>,
    released: Result<RunSummary>,
) -> Result<RunSummary> {
    match (loop_result, released) {
        (Ok(_), Ok(summary)) => Ok(summary),
        (Err(loop_err), Ok(_)) => Err(loop_err),
        (Ok(_), Err(release_err)) => Err(release_err),
        (Err(loop_err), Err(release_err)) => {
            log::error!("sorter loop failed: {:#}", loop_err);
            Err(release_err.context(format!("servo release after loop failure ({:#})", loop_err)))
        }
    }
}

fn print_report(report: &TickReport) {
    let command = match &report.action {
        TickAction::Moved {
            command: Command::MoveTo(angle),
            ..
        }
        | TickAction::ActuatorFailed {
            command: Command::MoveTo(angle),
            ..
        } => Some(*angle),
        _ => None,
    };
    if matches!(report.action, TickAction::FrameUnavailable { .. }) {
        return;
    }
    let line = serde_json::json!({
        "detections": report.detections,
        "move_to": command,
    });
    println!("{line}");
}
