pub mod parser;
pub mod scheduler;

pub use parser::{parse_policy, ConfigError, PolicyError, PolicyParser};
pub use scheduler::{RetentionScheduler, WEEKLY_BACKUP_DAY};
