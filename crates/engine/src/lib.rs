pub mod backup;
pub mod config;
pub mod cycle;
pub mod error;
pub mod expire;

pub use backup::{BackupReport, BackupRunner, InstanceOutcome, InstanceReport};
pub use config::{Settings, SettingsError};
pub use cycle::{BackupCycle, CycleReport};
pub use error::BackupError;
pub use expire::{ExpirationSweep, SweepReport};
