//! Detection-driven servo coordination.
//!
//! The coordinator turns one tick's detections into at most one actuator
//! command. It debounces (a class that stays in view is commanded once) and
//! returns home after the tracked class has been out of view for longer than
//! the idle timeout.
//!
//! State machine:
//!
//! ```text
//! Idle --match--> Tracking
//! Tracking --different match--> Tracking   (MoveTo(target), timer reset)
//! Tracking --same match--> Tracking        (timer reset only)
//! Tracking --no match, elapsed <= timeout--> Tracking
//! Tracking --no match, elapsed > timeout--> Idle   (MoveTo(home))
//! ```
//!
//! The coordinator never touches hardware. It owns its state exclusively and
//! expects `now` to be monotonically non-decreasing across calls.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::CoordinatorSettings;
use crate::detect::Detection;

/// Actuator command emitted by the coordinator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Command {
    /// Move to an absolute angle in degrees.
    MoveTo(f32),
}

/// Cross-tick state. Class and timestamp are set and cleared together.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum CoordinatorState {
    #[default]
    Idle,
    Tracking {
        class_name: String,
        last_seen_at: Instant,
    },
}

impl CoordinatorState {
    pub fn last_matched_class(&self) -> Option<&str> {
        match self {
            CoordinatorState::Idle => None,
            CoordinatorState::Tracking { class_name, .. } => Some(class_name),
        }
    }

    pub fn last_seen_at(&self) -> Option<Instant> {
        match self {
            CoordinatorState::Idle => None,
            CoordinatorState::Tracking { last_seen_at, .. } => Some(*last_seen_at),
        }
    }
}

pub struct Coordinator {
    class_to_angle: HashMap<String, f32>,
    home_angle: f32,
    idle_timeout: Duration,
    state: CoordinatorState,
}

impl Coordinator {
    pub fn new(
        class_to_angle: HashMap<String, f32>,
        home_angle: f32,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            class_to_angle,
            home_angle,
            idle_timeout,
            state: CoordinatorState::Idle,
        }
    }

    pub fn from_settings(settings: &CoordinatorSettings) -> Self {
        Self::new(
            settings
                .targets
                .iter()
                .map(|(class, angle)| (class.clone(), *angle))
                .collect(),
            settings.home_angle,
            settings.idle_timeout,
        )
    }

    pub fn state(&self) -> &CoordinatorState {
        &self.state
    }

    pub fn home_angle(&self) -> f32 {
        self.home_angle
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn target_angle(&self, class_name: &str) -> Option<f32> {
        self.class_to_angle.get(class_name).copied()
    }

    /// Advance one tick.
    ///
    /// The first detection (in the order given) whose class has a configured
    /// angle is the tick's match; confidence plays no part. Unknown classes are
    /// ignored. Returns the command to execute, if any. State advances even if
    /// the caller later fails to execute the command.
    pub fn on_tick(&mut self, detections: &[Detection], now: Instant) -> Option<Command> {
        let matched = detections
            .iter()
            .find_map(|d| self.class_to_angle.get_key_value(d.class_name.as_str()));

        match matched {
            Some((class_name, &angle)) => {
                if let CoordinatorState::Tracking {
                    class_name: tracked,
                    last_seen_at,
                } = &mut self.state
                {
                    if tracked == class_name {
                        *last_seen_at = now;
                        log::debug!("coordinator: {} still in view", class_name);
                        return None;
                    }
                }
                log::info!("coordinator: {} in view, moving to {:.1}", class_name, angle);
                self.state = CoordinatorState::Tracking {
                    class_name: class_name.clone(),
                    last_seen_at: now,
                };
                Some(Command::MoveTo(angle))
            }
            None => {
                let CoordinatorState::Tracking {
                    class_name,
                    last_seen_at,
                } = &self.state
                else {
                    return None;
                };
                // An earlier `now` counts as no time elapsed.
                let elapsed = now.saturating_duration_since(*last_seen_at);
                if elapsed <= self.idle_timeout {
                    return None;
                }
                log::info!(
                    "coordinator: {} gone for {} ms, returning home to {:.1}",
                    class_name,
                    elapsed.as_millis(),
                    self.home_angle
                );
                self.state = CoordinatorState::Idle;
                Some(Command::MoveTo(self.home_angle))
            }
        }
    }
}
