//! PWM outputs for servos.
//!
//! Signal generation is left to the kernel: `SysfsPwm` drives a channel under
//! `/sys/class/pwm`. `SyntheticPwm` records pulses in memory and backs
//! `stub://` outputs.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

/// A PWM channel that can hold a pulse width at a fixed period.
pub trait PwmOutput {
    fn describe(&self) -> String;

    /// Output `pulse` every `period` until changed or disabled.
    fn set_pulse(&mut self, pulse: Duration, period: Duration) -> io::Result<()>;

    /// Stop pulsing.
    fn disable(&mut self) -> io::Result<()>;
}

/// Open the output named by a servo `output` setting.
pub fn open_output(output: &str) -> Result<Box<dyn PwmOutput>> {
    if output.starts_with("stub://") {
        Ok(Box::new(SyntheticPwm::new(output)))
    } else {
        Ok(Box::new(SysfsPwm::open(output)?))
    }
}

// ----------------------------------------------------------------------------
// Synthetic output (stub://)
// ----------------------------------------------------------------------------

/// One recorded pulse.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PulseRecord {
    pub pulse: Duration,
    pub period: Duration,
}

#[derive(Debug, Default)]
struct SyntheticState {
    pulses: Vec<PulseRecord>,
    enabled: bool,
    failing: bool,
}

/// Shared view of a synthetic output, kept by tests after the output moves
/// into a controller.
#[derive(Clone, Debug, Default)]
pub struct SyntheticPwmLog {
    state: Arc<Mutex<SyntheticState>>,
}

impl SyntheticPwmLog {
    pub fn pulses(&self) -> Vec<PulseRecord> {
        self.state
            .lock()
            .map(|s| s.pulses.clone())
            .unwrap_or_default()
    }

    pub fn last_pulse(&self) -> Option<PulseRecord> {
        self.pulses().last().copied()
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().map(|s| s.enabled).unwrap_or(false)
    }

    /// Make every later write fail, simulating a hardware fault.
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.failing = failing;
        }
    }
}

pub struct SyntheticPwm {
    name: String,
    log: SyntheticPwmLog,
}

impl SyntheticPwm {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            log: SyntheticPwmLog::default(),
        }
    }

    pub fn log(&self) -> SyntheticPwmLog {
        self.log.clone()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SyntheticState) -> T) -> io::Result<T> {
        let mut state = self
            .log
            .state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "synthetic pwm lock poisoned"))?;
        if state.failing {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{}: simulated output fault", self.name),
            ));
        }
        Ok(f(&mut state))
    }
}

impl PwmOutput for SyntheticPwm {
    fn describe(&self) -> String {
        format!("{} (synthetic)", self.name)
    }

    fn set_pulse(&mut self, pulse: Duration, period: Duration) -> io::Result<()> {
        self.with_state(|state| {
            state.pulses.push(PulseRecord { pulse, period });
            state.enabled = true;
        })
    }

    fn disable(&mut self) -> io::Result<()> {
        self.with_state(|state| state.enabled = false)
    }
}

// ----------------------------------------------------------------------------
// Linux sysfs PWM channel
// ----------------------------------------------------------------------------

/// PWM channel at `/sys/class/pwm/pwmchipN/pwmM`.
///
/// The channel is exported through the chip's `export` file when its
/// directory does not exist yet. Period is written once; later moves only
/// rewrite `duty_cycle`.
pub struct SysfsPwm {
    channel_dir: PathBuf,
    period: Option<Duration>,
    enabled: bool,
}

const EXPORT_WAIT: Duration = Duration::from_secs(1);

impl SysfsPwm {
    pub fn open<P: AsRef<Path>>(channel_dir: P) -> Result<Self> {
        let channel_dir = channel_dir.as_ref().to_path_buf();
        if !channel_dir.exists() {
            export_channel(&channel_dir)?;
        }
        Ok(Self {
            channel_dir,
            period: None,
            enabled: false,
        })
    }

    fn write_attr(&self, name: &str, value: u128) -> io::Result<()> {
        fs::write(self.channel_dir.join(name), value.to_string())
    }
}

fn export_channel(channel_dir: &Path) -> Result<()> {
    let channel = channel_dir
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_prefix("pwm"))
        .and_then(|n| n.parse::<u32>().ok())
        .ok_or_else(|| {
            anyhow!(
                "servo output {} is not a pwmchip channel directory (expected .../pwmchipN/pwmM)",
                channel_dir.display()
            )
        })?;
    let chip = channel_dir
        .parent()
        .ok_or_else(|| anyhow!("servo output {} has no pwmchip parent", channel_dir.display()))?;
    fs::write(chip.join("export"), channel.to_string())
        .with_context(|| format!("export pwm channel {} on {}", channel, chip.display()))?;

    // udev may take a moment to create the channel and fix permissions.
    let started = Instant::now();
    while !channel_dir.join("duty_cycle").exists() {
        if started.elapsed() > EXPORT_WAIT {
            return Err(anyhow!(
                "pwm channel {} did not appear after export",
                channel_dir.display()
            ));
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    log::info!("exported pwm channel {}", channel_dir.display());
    Ok(())
}

impl PwmOutput for SysfsPwm {
    fn describe(&self) -> String {
        self.channel_dir.display().to_string()
    }

    fn set_pulse(&mut self, pulse: Duration, period: Duration) -> io::Result<()> {
        if self.period != Some(period) {
            // duty_cycle must never exceed period, so shrink duty first.
            self.write_attr("duty_cycle", 0)?;
            self.write_attr("period", period.as_nanos())?;
            self.period = Some(period);
        }
        self.write_attr("duty_cycle", pulse.as_nanos())?;
        if !self.enabled {
            self.write_attr("enable", 1)?;
            self.enabled = true;
        }
        Ok(())
    }

    fn disable(&mut self) -> io::Result<()> {
        if self.enabled {
            self.write_attr("enable", 0)?;
            self.enabled = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_output_records_pulses() -> io::Result<()> {
        let mut pwm = SyntheticPwm::new("stub://servo");
        let log = pwm.log();
        pwm.set_pulse(Duration::from_micros(1500), Duration::from_millis(20))?;
        assert!(log.is_enabled());
        assert_eq!(
            log.last_pulse(),
            Some(PulseRecord {
                pulse: Duration::from_micros(1500),
                period: Duration::from_millis(20)
            })
        );
        pwm.disable()?;
        assert!(!log.is_enabled());
        Ok(())
    }

    #[test]
    fn synthetic_output_can_fail() {
        let mut pwm = SyntheticPwm::new("stub://servo");
        pwm.log().set_failing(true);
        assert!(pwm
            .set_pulse(Duration::from_micros(1500), Duration::from_millis(20))
            .is_err());
    }

    #[test]
    fn sysfs_output_writes_period_once() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let channel = dir.path().join("pwm0");
        fs::create_dir(&channel)?;
        let mut pwm = SysfsPwm::open(&channel)?;

        pwm.set_pulse(Duration::from_micros(500), Duration::from_millis(20))?;
        assert_eq!(fs::read_to_string(channel.join("period"))?, "20000000");
        assert_eq!(fs::read_to_string(channel.join("duty_cycle"))?, "500000");
        assert_eq!(fs::read_to_string(channel.join("enable"))?, "1");

        fs::remove_file(channel.join("period"))?;
        pwm.set_pulse(Duration::from_micros(2500), Duration::from_millis(20))?;
        assert!(!channel.join("period").exists());
        assert_eq!(fs::read_to_string(channel.join("duty_cycle"))?, "2500000");

        pwm.disable()?;
        assert_eq!(fs::read_to_string(channel.join("enable"))?, "0");
        Ok(())
    }

    #[test]
    fn sysfs_output_rejects_non_channel_paths() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SysfsPwm::open(dir.path().join("not-a-channel")).is_err());
    }

    #[test]
    fn stub_outputs_are_synthetic() -> anyhow::Result<()> {
        let output = open_output("stub://servo")?;
        assert!(output.describe().contains("synthetic"));
        Ok(())
    }
}
