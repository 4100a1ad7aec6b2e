//! Actuators driven by coordinator commands.
//!
//! - `ServoController`: hobby servo on a PWM channel (sysfs or synthetic).
//!
//! Actuators clamp out-of-range angles instead of failing, and report the
//! clamp through `MoveOutcome`.

pub mod pwm;
pub mod servo;

pub use pwm::{PwmOutput, SyntheticPwm, SysfsPwm};
pub use servo::ServoController;

use crate::error::ActuatorError;

/// Result of a successful move.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MoveOutcome {
    Reached(f32),
    Clamped { requested: f32, applied: f32 },
}

impl MoveOutcome {
    /// Angle the actuator now reports as current.
    pub fn angle(&self) -> f32 {
        match self {
            MoveOutcome::Reached(angle) => *angle,
            MoveOutcome::Clamped { applied, .. } => *applied,
        }
    }
}

/// Actuator trait.
pub trait Actuator {
    /// Actuator identifier for logs.
    fn name(&self) -> &str;

    /// Move to an absolute angle in degrees, clamped to the valid range.
    fn move_to(&mut self, angle: f32) -> Result<MoveOutcome, ActuatorError>;

    /// Last commanded angle.
    fn current_angle(&self) -> f32;

    /// Stop driving the output. Later moves fail with `ActuatorError::Released`.
    fn release(&mut self) -> Result<(), ActuatorError>;
}
