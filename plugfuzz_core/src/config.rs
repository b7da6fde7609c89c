use crate::error::HostError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE_NAME: &str = "config.json";

/// Run-wide settings, read once and passed by value into the engine.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    /// Base path for the cache directory. Falls back to the working directory.
    #[serde(default)]
    pub cache_dir_location: Option<PathBuf>,
    pub cache_dir_name: String,
    pub plugins_location: PathBuf,
    pub amount_of_threads: usize,
    pub amount_of_execution_per_thread: u64,
}

impl HostConfig {
    /// Reads the file at `path`. TOML is used for `.toml` files, JSON otherwise.
    pub fn load_from_file(path: &Path) -> Result<Self, HostError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            HostError::MissingConfiguration(format!(
                "Failed to read config file at {path:?}: {e}"
            ))
        })?;

        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let config = if is_toml {
            Self::from_toml_str(&content)
        } else {
            Self::from_json_str(&content)
        }
        .map_err(|e| match e {
            HostError::MissingConfiguration(msg) => {
                HostError::MissingConfiguration(format!("{path:?}: {msg}"))
            }
            other => other,
        })?;

        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self, HostError> {
        let config: HostConfig = serde_json::from_str(content).map_err(|e| {
            HostError::MissingConfiguration(format!("Failed to parse JSON config: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, HostError> {
        let config: HostConfig = toml::from_str(content).map_err(|e| {
            HostError::MissingConfiguration(format!("Failed to parse TOML config: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), HostError> {
        if self.amount_of_threads == 0 {
            return Err(HostError::MissingConfiguration(
                "amountOfThreads must be at least 1".to_string(),
            ));
        }
        if self.amount_of_execution_per_thread == 0 {
            return Err(HostError::MissingConfiguration(
                "amountOfExecutionPerThread must be at least 1".to_string(),
            ));
        }
        if self.plugins_location.as_os_str().is_empty() {
            return Err(HostError::MissingConfiguration(
                "pluginsLocation must not be blank".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolves where the cache directory lives, relative to `cwd` when no base
    /// location is configured.
    ///
    /// Returns `None` when both the base location and the name are blank: no
    /// cache directory is used for the run.
    pub fn cache_dir_path(&self, cwd: &Path) -> Option<PathBuf> {
        let location = self
            .cache_dir_location
            .as_ref()
            .filter(|p| !is_blank(p.to_string_lossy().as_ref()));
        let name = self.cache_dir_name.trim();

        if location.is_none() && name.is_empty() {
            return None;
        }

        let base = location.cloned().unwrap_or_else(|| cwd.to_path_buf());
        if name.is_empty() {
            Some(base)
        } else {
            Some(base.join(name))
        }
    }
}

fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}
