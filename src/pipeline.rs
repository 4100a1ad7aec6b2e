//! The tick loop.
//!
//! One tick acquires a frame, runs the detector, orders the detections, asks
//! the coordinator for a command and executes it, in that order and with no
//! overlap between ticks. The caller owns the loop: `tick()` performs exactly
//! one iteration and `run()` repeats it until asked to stop.
//!
//! Failure policy:
//! - frame unavailable: skip the tick (the coordinator is not called) and back
//!   off before retrying
//! - detector error: fatal
//! - actuator error: reported and counted, never retried

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::actuator::{Actuator, MoveOutcome, ServoController};
use crate::config::{LoopSettings, SorterConfig};
use crate::coordinator::{Command, Coordinator};
use crate::detect::{order_detections, BackendRegistry, Detection, DetectionOrder, DetectorBackend};
use crate::error::{ActuatorError, FrameError};
use crate::frame::{Frame, FrameSource, SourceStats};
use crate::ingest::open_source;

/// What happened during one tick.
#[derive(Debug)]
pub struct TickReport {
    /// Detections in the order the coordinator saw them.
    pub detections: Vec<Detection>,
    pub action: TickAction,
    /// The frame the detections came from. `None` when no frame arrived.
    pub frame: Option<Frame>,
}

#[derive(Debug)]
pub enum TickAction {
    /// No frame this tick. `retry_in` is the suggested pause before retrying.
    FrameUnavailable { consecutive: u32, retry_in: Duration },
    /// The coordinator had nothing to do.
    NoCommand,
    Moved {
        command: Command,
        outcome: MoveOutcome,
    },
    ActuatorFailed {
        command: Command,
        error: ActuatorError,
    },
}

/// Counters accumulated over the life of a `Sorter`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: u64,
    pub frames: u64,
    pub frame_errors: u64,
    pub commands: u64,
    pub actuator_failures: u64,
}

/// Exponential retry delay, doubling from `initial` up to `max`.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: None,
        }
    }

    /// Delay for the next retry.
    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.initial,
            Some(current) => current.saturating_mul(2).min(self.max),
        };
        self.current = Some(delay);
        delay
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

pub struct Sorter {
    source: Box<dyn FrameSource>,
    detector: Box<dyn DetectorBackend>,
    coordinator: Coordinator,
    actuator: Box<dyn Actuator>,
    confidence_threshold: f32,
    order: DetectionOrder,
    settings: LoopSettings,
    backoff: Backoff,
    consecutive_frame_errors: u32,
    summary: RunSummary,
}

impl Sorter {
    /// Assemble a sorter from already connected parts.
    pub fn new(
        source: Box<dyn FrameSource>,
        detector: Box<dyn DetectorBackend>,
        coordinator: Coordinator,
        actuator: Box<dyn Actuator>,
    ) -> Self {
        let settings = LoopSettings::default();
        Self {
            source,
            detector,
            coordinator,
            actuator,
            confidence_threshold: 0.25,
            order: DetectionOrder::default(),
            backoff: Backoff::new(settings.retry_initial, settings.retry_max),
            settings,
            consecutive_frame_errors: 0,
            summary: RunSummary::default(),
        }
    }

    /// Open every collaborator named by the configuration.
    ///
    /// `dry_run` swaps the servo output for a synthetic one so the loop can
    /// run without hardware attached.
    pub fn from_config(
        cfg: &SorterConfig,
        registry: &BackendRegistry,
        dry_run: bool,
    ) -> Result<Self> {
        let mut source = open_source(&cfg.camera)?;
        source
            .connect()
            .with_context(|| format!("open camera {}", cfg.camera.device))?;

        let detector = registry.build(&cfg.detector)?;

        let mut servo_settings = cfg.servo.clone();
        if dry_run {
            servo_settings.output = "stub://dry-run".to_string();
        }
        let servo = ServoController::open(&servo_settings)
            .with_context(|| format!("open servo output {}", servo_settings.output))?;

        Ok(Self::new(
            source,
            detector,
            Coordinator::from_settings(&cfg.coordinator),
            Box::new(servo),
        )
        .with_detection(cfg.detector.confidence_threshold, cfg.detector.order)
        .with_loop_settings(cfg.tick_loop.clone()))
    }

    pub fn with_detection(mut self, confidence_threshold: f32, order: DetectionOrder) -> Self {
        self.confidence_threshold = confidence_threshold;
        self.order = order;
        self
    }

    pub fn with_loop_settings(mut self, settings: LoopSettings) -> Self {
        self.backoff = Backoff::new(settings.retry_initial, settings.retry_max);
        self.settings = settings;
        self
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn actuator(&self) -> &dyn Actuator {
        self.actuator.as_ref()
    }

    pub fn source_stats(&self) -> SourceStats {
        self.source.stats()
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Run one tick with the clock read after detection finishes.
    pub fn tick(&mut self) -> Result<TickReport> {
        self.tick_with(Instant::now)
    }

    /// Run one tick with an explicit timestamp.
    pub fn tick_at(&mut self, now: Instant) -> Result<TickReport> {
        self.tick_with(|| now)
    }

    fn tick_with(&mut self, clock: impl FnOnce() -> Instant) -> Result<TickReport> {
        self.summary.ticks += 1;

        let frame = match self.source.next_frame() {
            Ok(frame) => frame,
            Err(FrameError::Unavailable(reason)) => return self.frame_unavailable(reason),
            Err(FrameError::Fatal(err)) => {
                return Err(err.context("frame source failed"));
            }
        };
        self.summary.frames += 1;
        if self.consecutive_frame_errors > 0 {
            log::info!(
                "frames resumed after {} failed attempts",
                self.consecutive_frame_errors
            );
        }
        self.consecutive_frame_errors = 0;
        self.backoff.reset();

        let mut detections = self
            .detector
            .detect(&frame, self.confidence_threshold)
            .with_context(|| format!("detector {} failed", self.detector.name()))?;
        order_detections(&mut detections, self.order);

        let now = clock();
        let action = match self.coordinator.on_tick(&detections, now) {
            None => TickAction::NoCommand,
            Some(command) => self.execute(command),
        };
        Ok(TickReport {
            detections,
            action,
            frame: Some(frame),
        })
    }

    fn frame_unavailable(&mut self, reason: String) -> Result<TickReport> {
        self.summary.frame_errors += 1;
        self.consecutive_frame_errors = self.consecutive_frame_errors.saturating_add(1);
        let limit = self.settings.max_consecutive_frame_errors;
        if limit > 0 && self.consecutive_frame_errors >= limit {
            return Err(anyhow!(
                "no frame from {} after {} attempts (last error: {})",
                self.source.stats().origin,
                self.consecutive_frame_errors,
                reason
            ));
        }
        let retry_in = self.backoff.next_delay();
        log::warn!(
            "frame unavailable ({}), retry {} in {} ms",
            reason,
            self.consecutive_frame_errors,
            retry_in.as_millis()
        );
        Ok(TickReport {
            detections: Vec::new(),
            action: TickAction::FrameUnavailable {
                consecutive: self.consecutive_frame_errors,
                retry_in,
            },
            frame: None,
        })
    }

    fn execute(&mut self, command: Command) -> TickAction {
        self.summary.commands += 1;
        let Command::MoveTo(angle) = command;
        match self.actuator.move_to(angle) {
            Ok(outcome) => {
                if let MoveOutcome::Clamped { requested, applied } = outcome {
                    log::warn!(
                        "{}: angle {:.1} clamped to {:.1}",
                        self.actuator.name(),
                        requested,
                        applied
                    );
                }
                TickAction::Moved { command, outcome }
            }
            Err(error) => {
                self.summary.actuator_failures += 1;
                log::error!("{}: move to {:.1} failed: {}", self.actuator.name(), angle, error);
                TickAction::ActuatorFailed { command, error }
            }
        }
    }

    /// Tick until `shutdown` is set or `max_ticks` ticks have run.
    pub fn run(&mut self, shutdown: &AtomicBool, max_ticks: Option<u64>) -> Result<RunSummary> {
        self.run_with(shutdown, max_ticks, |_| {})
    }

    /// Like `run`, handing every report to `on_report` before pausing.
    pub fn run_with(
        &mut self,
        shutdown: &AtomicBool,
        max_ticks: Option<u64>,
        mut on_report: impl FnMut(&TickReport),
    ) -> Result<RunSummary> {
        let mut ticks_run = 0u64;
        let mut last_health_log = Instant::now();

        while !shutdown.load(Ordering::SeqCst) {
            if max_ticks.is_some_and(|limit| ticks_run >= limit) {
                break;
            }
            let report = self.tick()?;
            ticks_run += 1;
            on_report(&report);

            if !self.settings.health_log_every.is_zero()
                && last_health_log.elapsed() >= self.settings.health_log_every
            {
                let stats = self.source.stats();
                log::info!(
                    "source health={} frames={} missed={} origin={} commands={} actuator_failures={}",
                    self.source.is_healthy(),
                    stats.frames_captured,
                    stats.frames_missed,
                    stats.origin,
                    self.summary.commands,
                    self.summary.actuator_failures
                );
                last_health_log = Instant::now();
            }

            let pause = match &report.action {
                TickAction::FrameUnavailable { retry_in, .. } => *retry_in,
                _ => self.settings.tick_interval,
            };
            if !pause.is_zero() {
                std::thread::sleep(pause);
            }
        }
        Ok(self.summary.clone())
    }

    /// Optionally return home, then release the actuator.
    pub fn shutdown(mut self, home_on_exit: bool) -> Result<RunSummary> {
        if home_on_exit {
            let home = self.coordinator.home_angle();
            if let Err(err) = self.actuator.move_to(home) {
                log::warn!("{}: could not return home: {}", self.actuator.name(), err);
            }
        }
        self.actuator
            .release()
            .with_context(|| format!("release {}", self.actuator.name()))?;
        log::info!(
            "sorter stopped after {} ticks ({} frames, {} commands, {} actuator failures)",
            self.summary.ticks,
            self.summary.frames,
            self.summary.commands,
            self.summary.actuator_failures
        );
        Ok(self.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    /// Source that replays a script of frame / unavailable results.
    struct ScriptedSource {
        script: VecDeque<bool>,
        sequence: u64,
    }

    impl ScriptedSource {
        fn new(script: &[bool]) -> Self {
            Self {
                script: script.iter().copied().collect(),
                sequence: 0,
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        fn next_frame(&mut self) -> std::result::Result<Frame, FrameError> {
            match self.script.pop_front() {
                Some(true) | None => {
                    self.sequence += 1;
                    Ok(Frame::from_rgb(vec![0u8; 12], 2, 2, self.sequence)?)
                }
                Some(false) => Err(FrameError::unavailable("usb hiccup")),
            }
        }

        fn is_healthy(&self) -> bool {
            true
        }

        fn stats(&self) -> SourceStats {
            SourceStats {
                frames_captured: self.sequence,
                frames_missed: 0,
                origin: "scripted".to_string(),
            }
        }
    }

    /// Detector that returns one scripted class list per call.
    struct ScriptedDetector {
        script: VecDeque<Vec<(&'static str, f32, f32)>>,
        calls: Arc<Mutex<u32>>,
    }

    impl DetectorBackend for ScriptedDetector {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn labels(&self) -> &[String] {
            &[]
        }

        fn detect(&mut self, _frame: &Frame, threshold: f32) -> Result<Vec<Detection>> {
            *self.calls.lock().unwrap() += 1;
            let next = self.script.pop_front().unwrap_or_default();
            Ok(next
                .into_iter()
                .filter(|(_, confidence, _)| *confidence >= threshold)
                .map(|(class_name, confidence, x1)| Detection {
                    class_id: 0,
                    class_name: class_name.to_string(),
                    confidence,
                    bounding_box: BoundingBox {
                        x1,
                        y1: 0.0,
                        x2: x1 + 1.0,
                        y2: 1.0,
                    },
                })
                .collect())
        }
    }

    #[derive(Clone, Default)]
    struct RecordingActuator {
        moves: Arc<Mutex<Vec<f32>>>,
        failing: Arc<Mutex<bool>>,
        released: Arc<Mutex<bool>>,
    }

    impl Actuator for RecordingActuator {
        fn name(&self) -> &str {
            "recording"
        }

        fn move_to(&mut self, angle: f32) -> std::result::Result<MoveOutcome, ActuatorError> {
            if *self.failing.lock().unwrap() {
                return Err(ActuatorError::Rejected {
                    angle,
                    reason: "jammed".to_string(),
                });
            }
            self.moves.lock().unwrap().push(angle);
            Ok(MoveOutcome::Reached(angle))
        }

        fn current_angle(&self) -> f32 {
            self.moves.lock().unwrap().last().copied().unwrap_or(90.0)
        }

        fn release(&mut self) -> std::result::Result<(), ActuatorError> {
            *self.released.lock().unwrap() = true;
            Ok(())
        }
    }

    fn coordinator() -> Coordinator {
        Coordinator::new(
            HashMap::from([("battery".to_string(), 45.0), ("motor".to_string(), 135.0)]),
            90.0,
            Duration::from_secs(1),
        )
    }

    fn sorter(
        frames: &[bool],
        detections: Vec<Vec<(&'static str, f32, f32)>>,
    ) -> (Sorter, RecordingActuator, Arc<Mutex<u32>>) {
        let actuator = RecordingActuator::default();
        let calls = Arc::new(Mutex::new(0));
        let detector = ScriptedDetector {
            script: detections.into(),
            calls: calls.clone(),
        };
        let sorter = Sorter::new(
            Box::new(ScriptedSource::new(frames)),
            Box::new(detector),
            coordinator(),
            Box::new(actuator.clone()),
        );
        (sorter, actuator, calls)
    }

    #[test]
    fn unavailable_frame_skips_detector_and_coordinator() -> Result<()> {
        let (mut sorter, actuator, calls) = sorter(&[false, true], vec![vec![("battery", 0.9, 0.0)]]);
        let t0 = Instant::now();

        let report = sorter.tick_at(t0)?;
        assert!(matches!(
            report.action,
            TickAction::FrameUnavailable { consecutive: 1, .. }
        ));
        assert!(report.frame.is_none());
        assert_eq!(*calls.lock().unwrap(), 0);
        assert_eq!(sorter.coordinator().state().last_matched_class(), None);

        let report = sorter.tick_at(t0)?;
        assert!(matches!(report.action, TickAction::Moved { .. }));
        assert_eq!(report.frame.map(|frame| frame.sequence), Some(1));
        assert_eq!(*actuator.moves.lock().unwrap(), vec![45.0]);
        Ok(())
    }

    #[test]
    fn backoff_doubles_and_resets() -> Result<()> {
        let (sorter, _actuator, _calls) = sorter(&[false, false, false, false, true, false], vec![]);
        let mut sorter = sorter.with_loop_settings(LoopSettings {
            retry_initial: Duration::from_millis(100),
            retry_max: Duration::from_millis(300),
            ..LoopSettings::default()
        });
        let t0 = Instant::now();

        let mut delays = Vec::new();
        for _ in 0..6 {
            if let TickAction::FrameUnavailable { retry_in, .. } = sorter.tick_at(t0)?.action {
                delays.push(retry_in.as_millis());
            }
        }
        assert_eq!(delays, vec![100, 200, 300, 300, 100]);
        assert_eq!(sorter.summary().frame_errors, 5);
        Ok(())
    }

    #[test]
    fn long_outage_becomes_fatal() -> Result<()> {
        let (sorter, _actuator, _calls) = sorter(&[false, false, false], vec![]);
        let mut sorter = sorter.with_loop_settings(LoopSettings {
            max_consecutive_frame_errors: 2,
            ..LoopSettings::default()
        });
        let t0 = Instant::now();
        sorter.tick_at(t0)?;
        assert!(sorter.tick_at(t0).is_err());
        Ok(())
    }

    #[test]
    fn detections_are_ordered_before_coordination() -> Result<()> {
        // Motor is listed first but battery is further left.
        let (sorter, actuator, _calls) =
            sorter(&[true], vec![vec![("motor", 0.9, 50.0), ("battery", 0.4, 5.0)]]);
        let mut sorter = sorter.with_detection(0.25, DetectionOrder::LeftToRight);
        let report = sorter.tick_at(Instant::now())?;
        assert_eq!(report.detections[0].class_name, "battery");
        assert_eq!(*actuator.moves.lock().unwrap(), vec![45.0]);
        Ok(())
    }

    #[test]
    fn threshold_is_passed_to_detector() -> Result<()> {
        let (sorter, actuator, _calls) = sorter(&[true], vec![vec![("battery", 0.2, 0.0)]]);
        let mut sorter = sorter.with_detection(0.5, DetectionOrder::Confidence);
        let report = sorter.tick_at(Instant::now())?;
        assert!(report.detections.is_empty());
        assert!(matches!(report.action, TickAction::NoCommand));
        assert!(actuator.moves.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn actuator_failure_is_reported_not_retried() -> Result<()> {
        let (mut sorter, actuator, _calls) = sorter(
            &[true, true],
            vec![vec![("battery", 0.9, 0.0)], vec![("battery", 0.9, 0.0)]],
        );
        *actuator.failing.lock().unwrap() = true;
        let t0 = Instant::now();

        let report = sorter.tick_at(t0)?;
        assert!(matches!(
            report.action,
            TickAction::ActuatorFailed {
                command: Command::MoveTo(angle),
                ..
            } if angle == 45.0
        ));
        // Coordinator believes the command was issued.
        let report = sorter.tick_at(t0 + Duration::from_millis(100))?;
        assert!(matches!(report.action, TickAction::NoCommand));
        assert_eq!(sorter.summary().actuator_failures, 1);
        Ok(())
    }

    #[test]
    fn run_stops_at_tick_limit_and_shutdown_homes() -> Result<()> {
        let (mut sorter, actuator, _calls) = sorter(&[], vec![vec![("motor", 0.9, 0.0)]]);
        let stop = AtomicBool::new(false);
        let mut seen = 0;
        let summary = sorter.run_with(&stop, Some(3), |_| seen += 1)?;
        assert_eq!(seen, 3);
        assert_eq!(summary.ticks, 3);
        assert_eq!(summary.commands, 1);

        sorter.shutdown(true)?;
        assert_eq!(*actuator.moves.lock().unwrap(), vec![135.0, 90.0]);
        assert!(*actuator.released.lock().unwrap());
        Ok(())
    }

    #[test]
    fn run_returns_immediately_when_already_stopped() -> Result<()> {
        let (mut sorter, _actuator, calls) = sorter(&[], vec![]);
        let stop = AtomicBool::new(true);
        let summary = sorter.run(&stop, None)?;
        assert_eq!(summary.ticks, 0);
        assert_eq!(*calls.lock().unwrap(), 0);
        Ok(())
    }

    #[test]
    fn backoff_caps_at_max() {
        let mut backoff = Backoff::new(Duration::from_millis(50), Duration::from_millis(120));
        let delays: Vec<u128> = (0..4).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![50, 100, 120, 120]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(50));
    }
}
