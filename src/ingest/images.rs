//! Image directory source.
//!
//! Replays `.jpg`, `.jpeg` and `.png` files in filename order and starts over
//! after the last one. Useful for running the sorter against a capture
//! directory without a camera attached.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use crate::error::FrameError;
use crate::frame::{Frame, FrameSource, SourceStats};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

pub struct ImageDirSource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    next_index: usize,
    frame_count: u64,
    frames_missed: u64,
    last_failed: bool,
}

impl ImageDirSource {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            files: Vec::new(),
            next_index: 0,
            frame_count: 0,
            frames_missed: 0,
            last_failed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

impl FrameSource for ImageDirSource {
    fn connect(&mut self) -> Result<()> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("read image directory {}", self.dir.display()))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && is_image(&path) {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(anyhow!(
                "image directory {} contains no .jpg or .png files",
                self.dir.display()
            ));
        }
        files.sort();
        log::info!(
            "ImageDirSource: replaying {} images from {}",
            files.len(),
            self.dir.display()
        );
        self.files = files;
        self.next_index = 0;
        Ok(())
    }

    fn next_frame(&mut self) -> std::result::Result<Frame, FrameError> {
        if self.files.is_empty() {
            return Err(FrameError::Fatal(anyhow!(
                "image directory {} not connected",
                self.dir.display()
            )));
        }
        let path = &self.files[self.next_index];
        self.next_index = (self.next_index + 1) % self.files.len();

        match image::open(path) {
            Ok(decoded) => {
                self.frame_count += 1;
                self.last_failed = false;
                Ok(Frame::from_image(decoded.to_rgb8(), self.frame_count))
            }
            Err(err) => {
                self.frames_missed += 1;
                self.last_failed = true;
                Err(FrameError::unavailable(format!(
                    "{}: {}",
                    path.display(),
                    err
                )))
            }
        }
    }

    fn is_healthy(&self) -> bool {
        !self.files.is_empty() && !self.last_failed
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            frames_missed: self.frames_missed,
            origin: self.dir.display().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn write_png(dir: &Path, name: &str, shade: u8) -> Result<()> {
        RgbImage::from_pixel(4, 3, Rgb([shade, shade, shade])).save(dir.join(name))?;
        Ok(())
    }

    #[test]
    fn replays_images_in_name_order_and_loops() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_png(dir.path(), "b.png", 20)?;
        write_png(dir.path(), "a.png", 10)?;
        std::fs::write(dir.path().join("notes.txt"), "ignored")?;

        let mut source = ImageDirSource::new(dir.path());
        source.connect()?;
        assert_eq!(source.len(), 2);

        let shades: Vec<u8> = (0..3)
            .map(|_| source.next_frame().map(|f| f.pixels()[0]))
            .collect::<std::result::Result<_, _>>()?;
        assert_eq!(shades, vec![10, 20, 10]);
        assert_eq!(source.stats().frames_captured, 3);
        Ok(())
    }

    #[test]
    fn corrupt_image_is_transient() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("a.jpg"), b"not a jpeg")?;
        write_png(dir.path(), "b.png", 50)?;

        let mut source = ImageDirSource::new(dir.path());
        source.connect()?;
        let err = source.next_frame().unwrap_err();
        assert!(err.is_transient());
        assert!(!source.is_healthy());

        let frame = source.next_frame()?;
        assert_eq!(frame.width, 4);
        assert!(source.is_healthy());
        assert_eq!(source.stats().frames_missed, 1);
        Ok(())
    }

    #[test]
    fn empty_directory_fails_at_connect() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut source = ImageDirSource::new(dir.path());
        assert!(source.connect().is_err());
        Ok(())
    }
}
