//! Frame collection for building training sets.
//!
//! `CaptureStore` writes JPEG snapshots into a directory, `AutoSaver` decides
//! when a periodic snapshot is due and `TerminalCommand` parses the stdin
//! controls of the `capture` binary.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::frame::Frame;

const SAVED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Directory of saved frames.
pub struct CaptureStore {
    dir: PathBuf,
    saved: u64,
}

impl CaptureStore {
    /// Open (and create if needed) the save directory.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create capture directory {}", dir.display()))?;
        Ok(Self { dir, saved: 0 })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Frames saved through this store since it was opened.
    pub fn saved(&self) -> u64 {
        self.saved
    }

    /// Save as `<prefix>_<YYYYmmdd-HHMMSS>.jpg` using the local clock.
    pub fn save(&mut self, frame: &Frame, prefix: &str) -> Result<PathBuf> {
        self.save_at(frame, prefix, Local::now())
    }

    /// Save with an explicit timestamp. A second save within the same second
    /// gets a `-N` suffix instead of overwriting.
    pub fn save_at(
        &mut self,
        frame: &Frame,
        prefix: &str,
        timestamp: DateTime<Local>,
    ) -> Result<PathBuf> {
        let stem = format!("{}_{}", prefix, timestamp.format("%Y%m%d-%H%M%S"));
        let mut path = self.dir.join(format!("{stem}.jpg"));
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!("{stem}-{n}.jpg"));
            n += 1;
        }

        frame
            .as_image()
            .save_with_format(&path, image::ImageFormat::Jpeg)
            .with_context(|| format!("write {}", path.display()))?;
        self.saved += 1;
        log::info!("saved frame {} to {}", frame.sequence, path.display());
        Ok(path)
    }

    /// Number of image files currently in the directory.
    pub fn count(&self) -> Result<usize> {
        let mut count = 0;
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("read capture directory {}", self.dir.display()))?
        {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| {
                    SAVED_EXTENSIONS
                        .iter()
                        .any(|known| ext.eq_ignore_ascii_case(known))
                });
            if is_image {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Periodic snapshot schedule. A zero interval never fires.
#[derive(Clone, Debug)]
pub struct AutoSaver {
    interval: Duration,
    last_saved: Instant,
}

impl AutoSaver {
    pub fn new(interval: Duration, start: Instant) -> Self {
        Self {
            interval,
            last_saved: start,
        }
    }

    /// Schedule from a seconds value as typed on the command line. Fractions
    /// are kept; negative or non-finite values are rejected.
    pub fn every_secs(secs: f64, start: Instant) -> Result<Self> {
        if !(secs.is_finite() && secs >= 0.0) {
            return Err(anyhow!(
                "save interval must be a non-negative number of seconds, got {}",
                secs
            ));
        }
        let interval = Duration::try_from_secs_f64(secs)
            .map_err(|e| anyhow!("save interval {} s is out of range: {}", secs, e))?;
        Ok(Self::new(interval, start))
    }

    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    /// True once `interval` has passed since the last save. Marks the save.
    pub fn due(&mut self, now: Instant) -> bool {
        if !self.is_enabled() {
            return false;
        }
        if now.saturating_duration_since(self.last_saved) >= self.interval {
            self.last_saved = now;
            return true;
        }
        false
    }
}

/// A line typed on stdin while capturing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TerminalCommand {
    Save,
    Quit,
    Unknown(String),
}

impl TerminalCommand {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "s" | "save" => TerminalCommand::Save,
            "q" | "quit" | "exit" => TerminalCommand::Quit,
            _ => TerminalCommand::Unknown(trimmed.to_string()),
        }
    }
}
