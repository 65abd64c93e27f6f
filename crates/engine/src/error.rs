use tiered_backup_common::{CloudError, ResourceRef};
use tiered_backup_policy::ConfigError;

/// Why one instance could not be backed up. Never fatal to the cycle.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("{resource} has no {tag} tag")]
    MissingConfiguration { resource: ResourceRef, tag: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cloud request for {resource} failed: {source}")]
    Cloud {
        resource: ResourceRef,
        #[source]
        source: CloudError,
    },
}
