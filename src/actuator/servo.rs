use std::time::Duration;

use anyhow::{anyhow, Result};

use super::pwm::{open_output, PwmOutput};
use super::{Actuator, MoveOutcome};
use crate::config::ServoSettings;
use crate::error::ActuatorError;

/// Hobby servo (e.g. MG90S) on a PWM channel.
///
/// Angles map linearly onto pulse widths between `min_pulse_us` and
/// `max_pulse_us`. A calibration offset is added after clamping and the result
/// is clamped again; `current_angle` reports the uncalibrated angle.
pub struct ServoController {
    output: Box<dyn PwmOutput>,
    settings: ServoSettings,
    current_angle: f32,
    released: bool,
}

impl ServoController {
    /// Open the configured output and move to the home position.
    pub fn open(settings: &ServoSettings) -> Result<Self> {
        let output = open_output(&settings.output)?;
        Self::new(output, settings.clone())
    }

    pub fn new(output: Box<dyn PwmOutput>, settings: ServoSettings) -> Result<Self> {
        settings.validate()?;
        let mut servo = Self {
            output,
            current_angle: settings.home_angle,
            settings,
            released: false,
        };
        servo
            .home()
            .map_err(|e| anyhow!("servo {} failed to reach home: {}", servo.name(), e))?;
        log::info!(
            "servo on {} ready at {:.1} (range {:.0}..{:.0})",
            servo.output.describe(),
            servo.current_angle,
            servo.settings.min_angle,
            servo.settings.max_angle
        );
        Ok(servo)
    }

    pub fn settings(&self) -> &ServoSettings {
        &self.settings
    }

    pub fn clamp(&self, angle: f32) -> f32 {
        angle.clamp(self.settings.min_angle, self.settings.max_angle)
    }

    /// Pulse width for an angle, clamped to the servo range.
    pub fn pulse_width_for(&self, angle: f32) -> Duration {
        let s = &self.settings;
        let fraction = (self.clamp(angle) - s.min_angle) / (s.max_angle - s.min_angle);
        let span = (s.max_pulse_us - s.min_pulse_us) as f32;
        let micros = s.min_pulse_us as f32 + fraction * span;
        Duration::from_nanos((micros * 1000.0).round() as u64)
    }

    fn frame_period(&self) -> Duration {
        Duration::from_micros(self.settings.frame_us as u64)
    }

    /// Return to the configured home position.
    pub fn home(&mut self) -> Result<MoveOutcome, ActuatorError> {
        let home = self.settings.home_angle;
        self.move_to(home)
    }

    /// Move left (decrease angle) by `degrees` from the current position.
    pub fn move_left(&mut self, degrees: f32) -> Result<MoveOutcome, ActuatorError> {
        self.move_to(self.current_angle - degrees)
    }

    /// Move right (increase angle) by `degrees` from the current position.
    pub fn move_right(&mut self, degrees: f32) -> Result<MoveOutcome, ActuatorError> {
        self.move_to(self.current_angle + degrees)
    }

    /// Step between two angles, pausing `delay` after each of `steps + 1` moves.
    pub fn sweep(
        &mut self,
        start: f32,
        end: f32,
        steps: u32,
        delay: Duration,
    ) -> Result<(), ActuatorError> {
        let start = self.clamp(start);
        let end = self.clamp(end);
        let steps = steps.max(1);
        let step = (end - start) / steps as f32;
        log::debug!(
            "servo sweep {:.1} -> {:.1} in {} steps",
            start,
            end,
            steps
        );
        for i in 0..=steps {
            self.move_to(start + step * i as f32)?;
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
        }
        Ok(())
    }
}

impl Actuator for ServoController {
    fn name(&self) -> &str {
        &self.settings.output
    }

    fn move_to(&mut self, angle: f32) -> Result<MoveOutcome, ActuatorError> {
        if self.released {
            return Err(ActuatorError::Released);
        }
        if !angle.is_finite() {
            return Err(ActuatorError::Rejected {
                angle,
                reason: "angle is not a finite number".to_string(),
            });
        }

        let clamped = self.clamp(angle);
        let calibrated = self.clamp(clamped + self.settings.angle_offset);
        let pulse = self.pulse_width_for(calibrated);
        self.output.set_pulse(pulse, self.frame_period())?;
        self.current_angle = clamped;

        if self.settings.angle_offset != 0.0 {
            log::debug!(
                "servo moved to {:.1} (calibrated {:.1}, pulse {} us)",
                clamped,
                calibrated,
                pulse.as_micros()
            );
        } else {
            log::debug!("servo moved to {:.1} (pulse {} us)", clamped, pulse.as_micros());
        }

        if clamped != angle {
            Ok(MoveOutcome::Clamped {
                requested: angle,
                applied: clamped,
            })
        } else {
            Ok(MoveOutcome::Reached(clamped))
        }
    }

    fn current_angle(&self) -> f32 {
        self.current_angle
    }

    fn release(&mut self) -> Result<(), ActuatorError> {
        if self.released {
            return Ok(());
        }
        self.output.disable()?;
        self.released = true;
        log::info!("servo on {} released", self.output.describe());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::pwm::{SyntheticPwm, SyntheticPwmLog};

    fn servo_with(settings: ServoSettings) -> (ServoController, SyntheticPwmLog) {
        let pwm = SyntheticPwm::new("stub://servo");
        let log = pwm.log();
        let servo = ServoController::new(Box::new(pwm), settings).expect("servo");
        (servo, log)
    }

    fn servo() -> (ServoController, SyntheticPwmLog) {
        servo_with(ServoSettings::default())
    }

    #[test]
    fn servo_starts_at_home() {
        let (servo, log) = servo();
        assert_eq!(servo.current_angle(), 90.0);
        assert_eq!(log.last_pulse().unwrap().pulse, Duration::from_micros(1500));
        assert_eq!(log.last_pulse().unwrap().period, Duration::from_millis(20));
    }

    #[test]
    fn pulse_width_maps_linearly() {
        let (servo, _log) = servo();
        assert_eq!(servo.pulse_width_for(0.0), Duration::from_micros(500));
        assert_eq!(servo.pulse_width_for(45.0), Duration::from_micros(1000));
        assert_eq!(servo.pulse_width_for(180.0), Duration::from_micros(2500));
        assert_eq!(servo.pulse_width_for(270.0), Duration::from_micros(2500));
    }

    #[test]
    fn out_of_range_angles_are_clamped() -> Result<(), ActuatorError> {
        let (mut servo, _log) = servo();
        assert_eq!(
            servo.move_to(200.0)?,
            MoveOutcome::Clamped {
                requested: 200.0,
                applied: 180.0
            }
        );
        assert_eq!(servo.current_angle(), 180.0);
        assert_eq!(servo.move_to(135.0)?, MoveOutcome::Reached(135.0));
        Ok(())
    }

    #[test]
    fn offset_shifts_pulse_but_not_reported_angle() -> Result<(), ActuatorError> {
        let (mut servo, log) = servo_with(ServoSettings {
            angle_offset: 10.0,
            ..ServoSettings::default()
        });
        servo.move_to(45.0)?;
        assert_eq!(servo.current_angle(), 45.0);
        assert_eq!(log.last_pulse().unwrap().pulse, servo.pulse_width_for(55.0));

        servo.move_to(178.0)?;
        assert_eq!(log.last_pulse().unwrap().pulse, Duration::from_micros(2500));
        Ok(())
    }

    #[test]
    fn relative_moves_and_sweep() -> Result<(), ActuatorError> {
        let (mut servo, log) = servo();
        servo.move_left(45.0)?;
        assert_eq!(servo.current_angle(), 45.0);
        servo.move_right(90.0)?;
        assert_eq!(servo.current_angle(), 135.0);

        let before = log.pulses().len();
        servo.sweep(0.0, 180.0, 4, Duration::ZERO)?;
        assert_eq!(log.pulses().len(), before + 5);
        assert_eq!(servo.current_angle(), 180.0);
        Ok(())
    }

    #[test]
    fn non_finite_angle_is_rejected() {
        let (mut servo, _log) = servo();
        assert!(matches!(
            servo.move_to(f32::NAN),
            Err(ActuatorError::Rejected { .. })
        ));
        assert_eq!(servo.current_angle(), 90.0);
    }

    #[test]
    fn output_fault_surfaces_as_error() {
        let (mut servo, log) = servo();
        log.set_failing(true);
        assert!(matches!(servo.move_to(45.0), Err(ActuatorError::Io(_))));
        assert_eq!(servo.current_angle(), 90.0);
    }

    #[test]
    fn release_disables_output_and_blocks_moves() -> Result<(), ActuatorError> {
        let (mut servo, log) = servo();
        servo.release()?;
        assert!(!log.is_enabled());
        assert!(matches!(servo.move_to(10.0), Err(ActuatorError::Released)));
        servo.release()?;
        Ok(())
    }
}
