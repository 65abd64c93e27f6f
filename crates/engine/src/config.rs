use std::path::Path;

use serde::Deserialize;
use tiered_backup_common::{CONFIG_TAG, SNAPSHOT_NAME};

/// Runtime settings for a backup cycle, loaded from TOML.
///
/// Every key is optional:
///
/// ```toml
/// config_tag = "LambdaBackupConfiguration"
/// snapshot_name = "lambda-backup"
/// max_concurrent_instances = 4
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Instance tag that carries the retention policy.
    pub config_tag: String,
    /// Value of the `Name` tag put on created snapshots.
    pub snapshot_name: String,
    /// Upper bound on instances backed up at the same time.
    pub max_concurrent_instances: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_tag: CONFIG_TAG.to_string(),
            snapshot_name: SNAPSHOT_NAME.to_string(),
            max_concurrent_instances: 4,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid settings file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0}")]
    Invalid(String),
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.config_tag.is_empty() {
            return Err(SettingsError::Invalid("config_tag must not be empty".into()));
        }
        if self.max_concurrent_instances == 0 {
            return Err(SettingsError::Invalid(
                "max_concurrent_instances must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
