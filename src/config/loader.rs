//! Pipeline Configuration Loader
//!
//! Decides when the pipeline file must be re-read and reports which process
//! names were added, updated or dropped since the previous load.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{PipelineConfig, ProcessDefinition};
use crate::error::Result;

/// Registration changes produced by one reload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineReload {
    pub register: Vec<(String, ProcessDefinition)>,
    pub deregister: Vec<String>,
}

/// Flag-file driven reload of the pipeline file
#[derive(Debug)]
pub struct PipelineConfigLoader {
    config_file: PathBuf,
    flag_file: Option<PathBuf>,
    loaded: bool,
    known: BTreeSet<String>,
}

impl PipelineConfigLoader {
    pub fn new(config_file: impl Into<PathBuf>, flag_file: Option<PathBuf>) -> Self {
        Self {
            config_file: config_file.into(),
            flag_file,
            loaded: false,
            known: BTreeSet::new(),
        }
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// True when nothing has been loaded yet, or when the flag file exists.
    /// The flag file is removed before returning.
    pub fn check_reload(&self) -> bool {
        if !self.loaded {
            return true;
        }
        let Some(flag) = &self.flag_file else {
            return false;
        };
        if flag.exists() {
            debug!(flag_file = %flag.display(), "Flag file detected, reloading configuration");
            if let Err(e) = std::fs::remove_file(flag) {
                warn!(flag_file = %flag.display(), error = %e, "Could not remove reload flag file");
            }
            return true;
        }
        false
    }

    /// Re-read the pipeline file unconditionally
    pub fn reload(&mut self) -> Result<PipelineReload> {
        info!(config_file = %self.config_file.display(), "Reloading configuration from disk");
        let pipeline = PipelineConfig::from_path(&self.config_file)?;

        let seen: BTreeSet<String> = pipeline.names().cloned().collect();
        let deregister = self.known.difference(&seen).cloned().collect();
        let register = pipeline
            .processes()
            .map(|(name, definition)| (name.clone(), definition.clone()))
            .collect();

        self.known = seen;
        self.loaded = true;
        Ok(PipelineReload {
            register,
            deregister,
        })
    }

    /// Reload if [`check_reload`](Self::check_reload) says so
    pub fn poll(&mut self) -> Result<Option<PipelineReload>> {
        if self.check_reload() {
            self.reload().map(Some)
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(path: &Path, text: &str) {
        fs::write(path, text).unwrap();
    }

    #[test]
    fn test_first_poll_always_loads() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("pipeline.yaml");
        write(&file, "qc:\n  class_name: nodb_qc\n  count: 2\n");

        let mut loader = PipelineConfigLoader::new(&file, None);
        let reload = loader.poll().unwrap().unwrap();
        assert_eq!(reload.register.len(), 1);
        assert_eq!(reload.register[0].1.count, 2);
        assert!(reload.deregister.is_empty());

        // Without a flag file nothing changes afterwards
        assert!(loader.poll().unwrap().is_none());
    }

    #[test]
    fn test_flag_file_triggers_reload_and_is_removed() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("pipeline.yaml");
        let flag = dir.path().join("reload.flag");
        write(&file, "a:\n  class_name: nodb_qc\nb:\n  class_name: nodb_qc\n");

        let mut loader = PipelineConfigLoader::new(&file, Some(flag.clone()));
        loader.poll().unwrap().unwrap();
        assert!(loader.poll().unwrap().is_none());

        write(&file, "a:\n  class_name: nodb_qc\n  count: 4\n");
        write(&flag, "");
        let reload = loader.poll().unwrap().unwrap();
        assert!(!flag.exists());
        assert_eq!(reload.deregister, vec!["b".to_string()]);
        assert_eq!(reload.register[0].0, "a");
        assert_eq!(reload.register[0].1.count, 4);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut loader = PipelineConfigLoader::new(dir.path().join("absent.yaml"), None);
        assert!(loader.poll().is_err());
        assert!(!loader.is_loaded());
    }
}
