use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};

use crate::config::DetectorSettings;

use super::backend::DetectorBackend;
use super::backends::StubBackend;

type BackendFactory = fn(&DetectorSettings) -> Result<Box<dyn DetectorBackend>>;

/// Registry of detector backends by name.
///
/// Backends are built on demand so model files are only opened for the
/// backend that is actually selected.
pub struct BackendRegistry {
    factories: BTreeMap<&'static str, BackendFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with every backend compiled into this build.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("stub", build_stub);
        #[cfg(feature = "backend-tract")]
        registry.register("tract", build_tract);
        registry
    }

    /// Register a backend factory, replacing any previous one with that name.
    pub fn register(&mut self, name: &'static str, factory: BackendFactory) {
        self.factories.insert(name, factory);
    }

    /// List registered backends.
    pub fn list(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build the backend named by `settings.backend`.
    pub fn build(&self, settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
        let factory = self.factories.get(settings.backend.as_str()).ok_or_else(|| {
            anyhow!(
                "detector backend '{}' not available (known: {})",
                settings.backend,
                self.list().join(", ")
            )
        })?;
        let backend = factory(settings)?;
        log::info!(
            "detector backend {} ready with {} labels",
            backend.name(),
            backend.labels().len()
        );
        Ok(backend)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

fn build_stub(settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
    Ok(Box::new(StubBackend::new(settings.labels.clone())))
}

#[cfg(feature = "backend-tract")]
fn build_tract(settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
    let mut backend = super::backends::TractBackend::new(
        &settings.model_path,
        settings.input_size,
        settings.labels.clone(),
    )?
    .with_nms(settings.iou_threshold, settings.max_detections);
    backend.warm_up().context("model warm-up failed")?;
    Ok(Box::new(backend))
}

/// Read class names from a labels file: one name per line, blank lines and
/// `#` comments skipped. Line order defines the class id.
pub fn load_labels(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read labels file {}", path.display()))?;
    let labels: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();
    if labels.is_empty() {
        return Err(anyhow!("labels file {} lists no classes", path.display()));
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builtin_registry_builds_stub() -> Result<()> {
        let registry = BackendRegistry::with_builtin();
        assert!(registry.contains("stub"));
        let settings = DetectorSettings::default();
        let backend = registry.build(&settings)?;
        assert_eq!(backend.name(), "stub");
        assert_eq!(backend.labels(), settings.labels.as_slice());
        Ok(())
    }

    #[test]
    fn unknown_backend_lists_known_names() {
        let registry = BackendRegistry::with_builtin();
        let settings = DetectorSettings {
            backend: "cuda".to_string(),
            ..DetectorSettings::default()
        };
        let err = registry.build(&settings).err().expect("unknown backend");
        let message = err.to_string();
        assert!(message.contains("cuda"));
        assert!(message.contains("stub"));
    }

    #[test]
    fn labels_file_skips_blank_and_comment_lines() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "# sorter classes\nbattery\n\n  motor  \n")?;
        assert_eq!(load_labels(file.path())?, vec!["battery", "motor"]);
        Ok(())
    }
}
