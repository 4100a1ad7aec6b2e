//! Servo Sorter
//!
//! A camera watches a conveyor or tray, an object detector names what it
//! sees, and a hobby servo swings a flap to the angle configured for that
//! class. When the class leaves the frame for longer than the idle timeout the
//! servo returns home.
//!
//! # Architecture
//!
//! Control flows one way, once per tick:
//!
//! ```text
//! FrameSource -> DetectorBackend -> Coordinator -> Actuator
//! ```
//!
//! Only the coordinator keeps state across ticks. Everything else is either a
//! pure function of its input (detection post-processing) or a thin wrapper
//! over hardware (V4L2 capture, sysfs PWM).
//!
//! # Module Structure
//!
//! - `frame`: RGB frames and the `FrameSource` contract
//! - `ingest`: V4L2 cameras, synthetic `stub://` cameras, image directories
//! - `detect`: detection types, YOLO post-processing, detector backends
//! - `coordinator`: debounce and idle-return state machine
//! - `actuator`: servo control over PWM
//! - `pipeline`: the tick loop tying the above together
//! - `capture`: saving frames for training data
//! - `annotate`: drawing detections onto frames before they are saved
//! - `config`: TOML/JSON configuration with environment overrides

pub mod actuator;
pub mod annotate;
pub mod capture;
pub mod config;
pub mod coordinator;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod ui;

pub use actuator::{Actuator, MoveOutcome, ServoController};
pub use config::{
    CameraSettings, CoordinatorSettings, DetectorSettings, LoopSettings, ServoSettings,
    SorterConfig, SourceKind,
};
pub use coordinator::{Command, Coordinator, CoordinatorState};
pub use detect::{BackendRegistry, BoundingBox, Detection, DetectionOrder, DetectorBackend};
pub use error::{ActuatorError, FrameError};
pub use frame::{Frame, FrameSource, SourceStats};
pub use ingest::{open_source, ImageDirSource, V4l2Config, V4l2Source};
pub use pipeline::{RunSummary, Sorter, TickAction, TickReport};
