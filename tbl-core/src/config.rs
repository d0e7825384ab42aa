use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::deep_copy::DeepCopyOptions;

/// Defaults for duplication passes and the CLI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyConfig {
    pub clone_external_parents: bool,
    pub preserve_shared_references: bool,
    pub create_display_nodes: bool,
    /// Run passes against a scratch copy and save once on success
    pub atomic: bool,
    /// `tracing` filter used when `RUST_LOG` is not set
    pub log_filter: String,
    pub database_path: Option<String>,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            clone_external_parents: false,
            preserve_shared_references: false,
            create_display_nodes: true,
            atomic: true,
            log_filter: "info".to_string(),
            database_path: None,
        }
    }
}

impl CopyConfig {
    /// Loads the config from `path`; a missing file yields the defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        if !path.as_ref().exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(&self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, content)
            .with_context(|| format!("Failed to write config to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Pass options seeded from this config
    pub fn deep_copy_options(&self) -> DeepCopyOptions {
        DeepCopyOptions {
            clone_external_parents: self.clone_external_parents,
            preserve_shared_references: self.preserve_shared_references,
            create_display_nodes: self.create_display_nodes,
            ..Default::default()
        }
    }

    /// The configured database, or `tree.yaml` in the working directory
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(self.database_path.as_deref().unwrap_or("tree.yaml"))
    }
}

/// Gets the path to the config file
pub fn get_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("TBL_CONFIG_PATH") {
        return Ok(PathBuf::from(path));
    }

    // Default to ~/.tbl/config.yaml
    let home_dir = dirs::home_dir().context("Failed to determine home directory")?;

    Ok(home_dir.join(".tbl").join("config.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = CopyConfig::load(temp_dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config, CopyConfig::default());
        assert!(config.atomic);
        assert!(config.create_display_nodes);
        assert_eq!(config.database_path(), PathBuf::from("tree.yaml"));
    }

    #[test]
    fn test_save_creates_parent_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.yaml");
        let config = CopyConfig {
            clone_external_parents: true,
            database_path: Some("forms.db".into()),
            ..Default::default()
        };

        config.save(&path).unwrap();
        assert_eq!(CopyConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");
        fs::write(&path, "atomic: false\nlog_filter: debug\n").unwrap();

        let config = CopyConfig::load(&path).unwrap();
        assert!(!config.atomic);
        assert_eq!(config.log_filter, "debug");
        assert!(config.create_display_nodes);

        let options = config.deep_copy_options();
        assert!(options.create_display_nodes);
        assert_eq!(options.suffix, None);
    }

    #[test]
    fn test_invalid_yaml_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");
        fs::write(&path, "atomic: [not, a, bool").unwrap();
        let err = CopyConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
