use std::sync::Arc;

use chrono::NaiveDate;
use tiered_backup_common::{CloudApi, CloudError};
use tracing::info;

use crate::backup::{BackupReport, BackupRunner};
use crate::config::Settings;
use crate::expire::{ExpirationSweep, SweepReport};

/// Everything one daily cycle did.
#[derive(Debug)]
pub struct CycleReport {
    pub date: NaiveDate,
    pub backup: BackupReport,
    pub sweep: SweepReport,
}

/// One scheduling cycle: back up what is due today, then remove what
/// expires today.
pub struct BackupCycle {
    runner: BackupRunner,
    sweep: ExpirationSweep,
}

impl BackupCycle {
    pub fn new(cloud: Arc<dyn CloudApi>, settings: Settings) -> Self {
        Self {
            runner: BackupRunner::new(cloud.clone(), Arc::new(settings)),
            sweep: ExpirationSweep::new(cloud),
        }
    }

    pub async fn run(&self, today: NaiveDate) -> Result<CycleReport, CloudError> {
        let backup = self.runner.backup_all(today).await?;
        let sweep = self.sweep.expire(today).await?;

        info!(
            date = %today,
            backed_up = backup.backed_up(),
            skipped = backup.skipped(),
            failed = backup.failed(),
            snapshots = backup.snapshot_ids().len(),
            expired = sweep.deleted.len(),
            "cycle complete"
        );

        Ok(CycleReport {
            date: today,
            backup,
            sweep,
        })
    }
}
