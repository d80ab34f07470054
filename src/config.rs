use crate::importer::DEFAULT_PATH_VARIABLE;
use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf};

/// Persisted defaults for the importer. Every CLI flag overrides its
/// counterpart here for one run; the file itself only changes when the user
/// edits it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub lib_folder: Option<PathBuf>,
    #[serde(default = "default_path_variable")]
    pub path_variable: String,
    #[serde(default)]
    pub overwrite_if_exists: bool,
    #[serde(default)]
    pub source_folder: Option<PathBuf>,
    #[serde(default = "default_watch_interval")]
    pub watch_interval_secs: u64,
    #[serde(default)]
    pub kicad_config_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            lib_folder: None,
            path_variable: default_path_variable(),
            overwrite_if_exists: false,
            source_folder: None,
            watch_interval_secs: default_watch_interval(),
            kicad_config_dir: None,
        }
    }
}

impl AppConfig {
    pub fn load_or_create() -> Result<Self> {
        let base_dir = base_data_dir()?;
        Self::load_or_create_at(&base_dir)
    }

    pub fn load_or_create_at(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir).context("create app data dir")?;
        let path = base_dir.join("config.json");
        if path.exists() {
            let raw = fs::read_to_string(&path).context("read app config")?;
            let config: AppConfig = serde_json::from_str(&raw).context("parse app config")?;
            return Ok(config);
        }
        let config = AppConfig::default();
        config.save_at(base_dir)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let base_dir = base_data_dir()?;
        self.save_at(&base_dir)
    }

    pub fn save_at(&self, base_dir: &Path) -> Result<()> {
        fs::create_dir_all(base_dir).context("create app data dir")?;
        let path = base_dir.join("config.json");
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(path, raw).context("write app config")?;
        Ok(())
    }
}

fn default_path_variable() -> String {
    DEFAULT_PATH_VARIABLE.to_string()
}

fn default_watch_interval() -> u64 {
    5
}

fn base_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("partforge"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_load_writes_the_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_or_create_at(dir.path()).unwrap();
        assert_eq!(config.path_variable, DEFAULT_PATH_VARIABLE);
        assert!(!config.overwrite_if_exists);
        assert!(dir.path().join("config.json").exists());
    }

    #[test]
    fn saved_values_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::load_or_create_at(dir.path()).unwrap();
        config.lib_folder = Some(PathBuf::from("/tmp/libs"));
        config.overwrite_if_exists = true;
        config.save_at(dir.path()).unwrap();

        let reloaded = AppConfig::load_or_create_at(dir.path()).unwrap();
        assert_eq!(reloaded.lib_folder.as_deref(), Some(Path::new("/tmp/libs")));
        assert!(reloaded.overwrite_if_exists);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.json"), "{}").unwrap();
        let config = AppConfig::load_or_create_at(dir.path()).unwrap();
        assert_eq!(config.path_variable, DEFAULT_PATH_VARIABLE);
        assert_eq!(config.watch_interval_secs, 5);
    }
}
