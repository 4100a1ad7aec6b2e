use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::{load_labels, DetectionOrder};

const DEFAULT_CAMERA_DEVICE: &str = "/dev/video0";
const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_CAMERA_FPS: u32 = 30;
const DEFAULT_DETECTOR_BACKEND: &str = "stub";
const DEFAULT_MODEL_PATH: &str = "model/best.onnx";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_CONFIDENCE: f32 = 0.25;
const DEFAULT_IOU: f32 = 0.45;
const DEFAULT_MAX_DETECTIONS: usize = 100;
const DEFAULT_LABELS: &[&str] = &["battery", "motor"];
const DEFAULT_TARGETS: &[(&str, f32)] = &[("battery", 45.0), ("motor", 135.0)];
const DEFAULT_HOME_ANGLE: f32 = 90.0;
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_SERVO_OUTPUT: &str = "stub://servo";
const DEFAULT_MIN_ANGLE: f32 = 0.0;
const DEFAULT_MAX_ANGLE: f32 = 180.0;
const DEFAULT_MIN_PULSE_US: u32 = 500;
const DEFAULT_MAX_PULSE_US: u32 = 2_500;
const DEFAULT_FRAME_US: u32 = 20_000;
const DEFAULT_RETRY_INITIAL_MS: u64 = 50;
const DEFAULT_RETRY_MAX_MS: u64 = 1_000;
const DEFAULT_HEALTH_LOG_SECS: u64 = 5;

// -------------------- File schema (all optional) --------------------

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SorterConfigFile {
    camera: Option<CameraConfigFile>,
    detector: Option<DetectorConfigFile>,
    coordinator: Option<CoordinatorConfigFile>,
    servo: Option<ServoConfigFile>,
    #[serde(rename = "loop")]
    tick_loop: Option<LoopConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CameraConfigFile {
    kind: Option<SourceKind>,
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    confidence_threshold: Option<f32>,
    iou_threshold: Option<f32>,
    max_detections: Option<usize>,
    order: Option<DetectionOrder>,
    labels: Option<Vec<String>>,
    labels_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CoordinatorConfigFile {
    home_angle: Option<f32>,
    idle_timeout_ms: Option<u64>,
    targets: Option<BTreeMap<String, f32>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ServoConfigFile {
    output: Option<String>,
    min_angle: Option<f32>,
    max_angle: Option<f32>,
    home_angle: Option<f32>,
    min_pulse_us: Option<u32>,
    max_pulse_us: Option<u32>,
    frame_us: Option<u32>,
    angle_offset: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct LoopConfigFile {
    retry_initial_ms: Option<u64>,
    retry_max_ms: Option<u64>,
    max_consecutive_frame_errors: Option<u32>,
    tick_interval_ms: Option<u64>,
    health_log_secs: Option<u64>,
    home_on_exit: Option<bool>,
}

// -------------------- Resolved settings --------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// V4L2 device node, or `stub://` for synthetic frames.
    #[default]
    V4l2,
    /// Directory of still images replayed in name order.
    Images,
}

#[derive(Debug, Clone)]
pub struct SorterConfig {
    pub camera: CameraSettings,
    pub detector: DetectorSettings,
    pub coordinator: CoordinatorSettings,
    pub servo: ServoSettings,
    pub tick_loop: LoopSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    pub kind: SourceKind,
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: PathBuf,
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
    pub order: DetectionOrder,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorSettings {
    pub home_angle: f32,
    pub idle_timeout: Duration,
    /// Class name -> target angle in degrees.
    pub targets: BTreeMap<String, f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServoSettings {
    /// `stub://...` or a sysfs channel such as `/sys/class/pwm/pwmchip0/pwm0`.
    pub output: String,
    pub min_angle: f32,
    pub max_angle: f32,
    pub home_angle: f32,
    pub min_pulse_us: u32,
    pub max_pulse_us: u32,
    pub frame_us: u32,
    /// Calibration offset in degrees; positive shifts right.
    pub angle_offset: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopSettings {
    pub retry_initial: Duration,
    pub retry_max: Duration,
    /// Zero means keep retrying forever.
    pub max_consecutive_frame_errors: u32,
    pub tick_interval: Duration,
    pub health_log_every: Duration,
    pub home_on_exit: bool,
}

impl Default for CameraSettings {
    fn default() -> Self {
        CameraConfigFile::default().into()
    }
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_DETECTOR_BACKEND.to_string(),
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            input_size: DEFAULT_INPUT_SIZE,
            confidence_threshold: DEFAULT_CONFIDENCE,
            iou_threshold: DEFAULT_IOU,
            max_detections: DEFAULT_MAX_DETECTIONS,
            order: DetectionOrder::default(),
            labels: DEFAULT_LABELS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        CoordinatorConfigFile::default().into()
    }
}

impl Default for ServoSettings {
    fn default() -> Self {
        ServoConfigFile::default().into()
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        LoopConfigFile::default().into()
    }
}

impl Default for SorterConfig {
    fn default() -> Self {
        Self {
            camera: CameraSettings::default(),
            detector: DetectorSettings::default(),
            coordinator: CoordinatorSettings::default(),
            servo: ServoSettings::default(),
            tick_loop: LoopSettings::default(),
        }
    }
}

impl From<CameraConfigFile> for CameraSettings {
    fn from(file: CameraConfigFile) -> Self {
        Self {
            kind: file.kind.unwrap_or_default(),
            device: file
                .device
                .unwrap_or_else(|| DEFAULT_CAMERA_DEVICE.to_string()),
            width: file.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
            height: file.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
            target_fps: file.target_fps.unwrap_or(DEFAULT_CAMERA_FPS),
        }
    }
}

impl From<CoordinatorConfigFile> for CoordinatorSettings {
    fn from(file: CoordinatorConfigFile) -> Self {
        Self {
            home_angle: file.home_angle.unwrap_or(DEFAULT_HOME_ANGLE),
            idle_timeout: Duration::from_millis(
                file.idle_timeout_ms.unwrap_or(DEFAULT_IDLE_TIMEOUT_MS),
            ),
            targets: file.targets.unwrap_or_else(|| {
                DEFAULT_TARGETS
                    .iter()
                    .map(|(class, angle)| (class.to_string(), *angle))
                    .collect()
            }),
        }
    }
}

impl From<ServoConfigFile> for ServoSettings {
    fn from(file: ServoConfigFile) -> Self {
        Self {
            output: file
                .output
                .unwrap_or_else(|| DEFAULT_SERVO_OUTPUT.to_string()),
            min_angle: file.min_angle.unwrap_or(DEFAULT_MIN_ANGLE),
            max_angle: file.max_angle.unwrap_or(DEFAULT_MAX_ANGLE),
            home_angle: file.home_angle.unwrap_or(DEFAULT_HOME_ANGLE),
            min_pulse_us: file.min_pulse_us.unwrap_or(DEFAULT_MIN_PULSE_US),
            max_pulse_us: file.max_pulse_us.unwrap_or(DEFAULT_MAX_PULSE_US),
            frame_us: file.frame_us.unwrap_or(DEFAULT_FRAME_US),
            angle_offset: file.angle_offset.unwrap_or(0.0),
        }
    }
}

impl From<LoopConfigFile> for LoopSettings {
    fn from(file: LoopConfigFile) -> Self {
        Self {
            retry_initial: Duration::from_millis(
                file.retry_initial_ms.unwrap_or(DEFAULT_RETRY_INITIAL_MS),
            ),
            retry_max: Duration::from_millis(file.retry_max_ms.unwrap_or(DEFAULT_RETRY_MAX_MS)),
            max_consecutive_frame_errors: file.max_consecutive_frame_errors.unwrap_or(0),
            tick_interval: Duration::from_millis(file.tick_interval_ms.unwrap_or(0)),
            health_log_every: Duration::from_secs(
                file.health_log_secs.unwrap_or(DEFAULT_HEALTH_LOG_SECS),
            ),
            home_on_exit: file.home_on_exit.unwrap_or(true),
        }
    }
}

impl ServoSettings {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("servo.min_angle", self.min_angle),
            ("servo.max_angle", self.max_angle),
            ("servo.home_angle", self.home_angle),
            ("servo.angle_offset", self.angle_offset),
        ] {
            if !value.is_finite() {
                return Err(anyhow!("{} must be a finite number", name));
            }
        }
        if self.min_angle >= self.max_angle {
            return Err(anyhow!(
                "servo.min_angle ({}) must be below servo.max_angle ({})",
                self.min_angle,
                self.max_angle
            ));
        }
        if self.min_pulse_us >= self.max_pulse_us || self.max_pulse_us > self.frame_us {
            return Err(anyhow!(
                "servo pulses must satisfy min_pulse_us < max_pulse_us <= frame_us (got {} / {} / {})",
                self.min_pulse_us,
                self.max_pulse_us,
                self.frame_us
            ));
        }
        if self.output.trim().is_empty() {
            return Err(anyhow!("servo.output must not be empty"));
        }
        Ok(())
    }
}

impl SorterConfig {
    /// Load from the file named by `SORTER_CONFIG` (if set), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let path = std::env::var("SORTER_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Load from an explicit file (or defaults), then apply environment
    /// overrides and validate.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => SorterConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SorterConfigFile) -> Result<Self> {
        let detector_file = file.detector.unwrap_or_default();
        let defaults = DetectorSettings::default();
        let labels = match (detector_file.labels, detector_file.labels_path) {
            (Some(_), Some(_)) => {
                return Err(anyhow!(
                    "detector.labels and detector.labels_path are mutually exclusive"
                ))
            }
            (Some(labels), None) => labels,
            (None, Some(path)) => load_labels(&path)?,
            (None, None) => defaults.labels,
        };
        let detector = DetectorSettings {
            backend: detector_file.backend.unwrap_or(defaults.backend),
            model_path: detector_file.model_path.unwrap_or(defaults.model_path),
            input_size: detector_file.input_size.unwrap_or(defaults.input_size),
            confidence_threshold: detector_file
                .confidence_threshold
                .unwrap_or(defaults.confidence_threshold),
            iou_threshold: detector_file.iou_threshold.unwrap_or(defaults.iou_threshold),
            max_detections: detector_file
                .max_detections
                .unwrap_or(defaults.max_detections),
            order: detector_file.order.unwrap_or(defaults.order),
            labels,
        };

        Ok(Self {
            camera: file.camera.unwrap_or_default().into(),
            detector,
            coordinator: file.coordinator.unwrap_or_default().into(),
            servo: file.servo.unwrap_or_default().into(),
            tick_loop: file.tick_loop.unwrap_or_default().into(),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("SORTER_CAMERA_DEVICE") {
            if !device.trim().is_empty() {
                self.camera.device = device;
            }
        }
        if let Ok(path) = std::env::var("SORTER_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.detector.model_path = PathBuf::from(path);
            }
        }
        if let Ok(output) = std::env::var("SORTER_SERVO_OUTPUT") {
            if !output.trim().is_empty() {
                self.servo.output = output;
            }
        }
        if let Ok(timeout) = std::env::var("SORTER_IDLE_TIMEOUT_MS") {
            let millis: u64 = timeout.trim().parse().map_err(|_| {
                anyhow!("SORTER_IDLE_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.coordinator.idle_timeout = Duration::from_millis(millis);
        }
        if let Ok(targets) = std::env::var("SORTER_TARGETS") {
            let parsed = parse_targets(&targets)?;
            if !parsed.is_empty() {
                self.coordinator.targets = parsed;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.camera.device.trim().is_empty() {
            return Err(anyhow!("camera.device must not be empty"));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera width and height must be greater than zero"));
        }

        let threshold = self.detector.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!(
                "detector.confidence_threshold must be within [0, 1], got {}",
                threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.detector.iou_threshold) {
            return Err(anyhow!("detector.iou_threshold must be within [0, 1]"));
        }
        if self.detector.input_size == 0 {
            return Err(anyhow!("detector.input_size must be greater than zero"));
        }
        if self.detector.max_detections == 0 {
            return Err(anyhow!("detector.max_detections must be greater than zero"));
        }

        if self.coordinator.targets.is_empty() {
            return Err(anyhow!("coordinator.targets must name at least one class"));
        }
        if !self.coordinator.home_angle.is_finite() {
            return Err(anyhow!("coordinator.home_angle must be a finite number"));
        }
        for (class, angle) in &self.coordinator.targets {
            if !angle.is_finite() {
                return Err(anyhow!("target angle for '{}' must be a finite number", class));
            }
            if !self.detector.labels.is_empty() && !self.detector.labels.contains(class) {
                return Err(anyhow!(
                    "target class '{}' is not among the detector labels ({})",
                    class,
                    self.detector.labels.join(", ")
                ));
            }
        }

        self.servo.validate()?;
        for (name, angle) in self
            .coordinator
            .targets
            .iter()
            .map(|(class, angle)| (class.as_str(), *angle))
            .chain(std::iter::once(("home", self.coordinator.home_angle)))
        {
            if angle < self.servo.min_angle || angle > self.servo.max_angle {
                log::warn!(
                    "angle {:.1} for {} is outside the servo range and will be clamped",
                    angle,
                    name
                );
            }
        }

        if let Some((coordinator_home, servo_home)) = self.home_mismatch() {
            log::warn!(
                "coordinator.home_angle {:.1} differs from servo.home_angle {:.1}; \
                 idle returns go to {:.1} but startup and bench homing use {:.1}",
                coordinator_home,
                servo_home,
                coordinator_home,
                servo_home
            );
        }

        if self.tick_loop.retry_initial.is_zero() {
            return Err(anyhow!("loop.retry_initial_ms must be greater than zero"));
        }
        if self.tick_loop.retry_max < self.tick_loop.retry_initial {
            self.tick_loop.retry_max = self.tick_loop.retry_initial;
        }
        Ok(())
    }

    /// `(coordinator, servo)` home angles when the two sections disagree.
    pub fn home_mismatch(&self) -> Option<(f32, f32)> {
        let coordinator_home = self.coordinator.home_angle;
        let servo_home = self.servo.home_angle;
        ((coordinator_home - servo_home).abs() > f32::EPSILON)
            .then_some((coordinator_home, servo_home))
    }
}

fn read_config_file(path: &Path) -> Result<SorterConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

/// Parse `class=angle` pairs separated by commas.
pub fn parse_targets(value: &str) -> Result<BTreeMap<String, f32>> {
    split_csv(value)
        .into_iter()
        .map(|entry| {
            let (class, angle) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("target '{}' must look like class=angle", entry))?;
            let angle: f32 = angle
                .trim()
                .parse()
                .map_err(|_| anyhow!("target '{}' has a non-numeric angle", entry))?;
            Ok((class.trim().to_string(), angle))
        })
        .collect()
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() -> Result<()> {
        let mut cfg = SorterConfig::default();
        cfg.validate()?;
        assert_eq!(cfg.coordinator.targets.get("battery"), Some(&45.0));
        assert_eq!(cfg.coordinator.idle_timeout, Duration::from_secs(1));
        assert_eq!(cfg.servo.output, "stub://servo");
        Ok(())
    }

    #[test]
    fn parse_targets_accepts_csv_pairs() -> Result<()> {
        let targets = parse_targets(" battery=45, motor = 135 ,")?;
        assert_eq!(targets.len(), 2);
        assert_eq!(targets["motor"], 135.0);
        assert!(parse_targets("battery").is_err());
        assert!(parse_targets("battery=left").is_err());
        Ok(())
    }

    #[test]
    fn unknown_target_class_is_rejected() {
        let mut cfg = SorterConfig::default();
        cfg.coordinator.targets.insert("screw".to_string(), 10.0);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("screw"));
    }

    #[test]
    fn differing_home_angles_are_allowed_but_reported() -> Result<()> {
        let mut cfg = SorterConfig::default();
        assert_eq!(cfg.home_mismatch(), None);

        cfg.coordinator.home_angle = 80.0;
        cfg.validate()?;
        assert_eq!(cfg.home_mismatch(), Some((80.0, cfg.servo.home_angle)));
        Ok(())
    }

    #[test]
    fn inverted_pulse_range_is_rejected() {
        let mut cfg = SorterConfig::default();
        cfg.servo.min_pulse_us = 2_500;
        cfg.servo.max_pulse_us = 500;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn threshold_out_of_range_is_rejected() {
        let mut cfg = SorterConfig::default();
        cfg.detector.confidence_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn toml_sections_parse() -> Result<()> {
        let file: SorterConfigFile = toml::from_str(
            r#"
            [camera]
            kind = "images"
            device = "captures"

            [detector]
            order = "left_to_right"

            [coordinator.targets]
            battery = 30
            "#,
        )?;
        let cfg = SorterConfig::from_file(file)?;
        assert_eq!(cfg.camera.kind, SourceKind::Images);
        assert_eq!(cfg.detector.order, DetectionOrder::LeftToRight);
        assert_eq!(cfg.coordinator.targets.len(), 1);
        assert_eq!(cfg.coordinator.targets["battery"], 30.0);
        Ok(())
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let parsed: std::result::Result<SorterConfigFile, _> =
            toml::from_str("[servo]\npin = 18\n");
        assert!(parsed.is_err());
    }
}
