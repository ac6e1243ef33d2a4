//! Config reloads that fall back to the last configuration that validated

use crate::config::Config;
use crate::error::RetrievalError;
use std::path::{Path, PathBuf};

/// Where the active configuration came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    LastKnownGood,
    Default,
}

#[derive(Debug)]
pub struct LoadedConfig {
    pub config: Config,
    pub source: ConfigSource,
    /// Set when the file could not be used
    pub error: Option<RetrievalError>,
}

pub struct ConfigManager {
    path: PathBuf,
    last_valid: Option<Config>,
}

impl ConfigManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_valid: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the file; on failure use the last valid config, then the default
    pub fn load(&mut self) -> LoadedConfig {
        match Config::load(&self.path) {
            Ok(config) => {
                tracing::debug!("Loaded configuration from {}", self.path.display());
                self.last_valid = Some(config.clone());
                LoadedConfig {
                    config,
                    source: ConfigSource::File,
                    error: None,
                }
            }
            Err(e) => {
                let (config, source) = match &self.last_valid {
                    Some(config) => (config.clone(), ConfigSource::LastKnownGood),
                    None => (Config::default(), ConfigSource::Default),
                };
                tracing::warn!(
                    "Configuration at {} unusable ({}), using {:?}",
                    self.path.display(),
                    e,
                    source
                );
                LoadedConfig {
                    config,
                    source,
                    error: Some(e),
                }
            }
        }
    }

    pub fn last_valid(&self) -> Option<&Config> {
        self.last_valid.as_ref()
    }
}
