use std::sync::Arc;

use chrono::NaiveDate;
use tiered_backup_common::{format_delete_on, CloudApi, CloudError, DELETE_ON_TAG};
use tracing::{info, warn};

/// Result of one expiration sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Snapshots removed, in the order they were deleted.
    pub deleted: Vec<String>,
    /// Snapshots that were due but could not be deleted.
    pub failed: Vec<(String, CloudError)>,
}

/// Deletes owned snapshots whose `DeleteOn` tag is today's date.
///
/// Matching is plain string equality on the `YYYY-MM-DD` tag, so a
/// snapshot whose date was missed is never picked up on a later day.
pub struct ExpirationSweep {
    cloud: Arc<dyn CloudApi>,
}

impl ExpirationSweep {
    pub fn new(cloud: Arc<dyn CloudApi>) -> Self {
        Self { cloud }
    }

    pub async fn expire(&self, today: NaiveDate) -> Result<SweepReport, CloudError> {
        let delete_on = format_delete_on(today);
        let due = self
            .cloud
            .owned_snapshots_tagged(DELETE_ON_TAG, &delete_on)
            .await?;

        let mut report = SweepReport::default();
        for snapshot in due {
            info!(
                "Remove snapshot {} (of volume {}) created at {}",
                snapshot.id, snapshot.volume_id, snapshot.started_at
            );
            match self.cloud.delete_snapshot(&snapshot.id).await {
                Ok(()) => report.deleted.push(snapshot.id),
                Err(e) => {
                    warn!(snapshot = %snapshot.id, "failed to delete snapshot: {e}");
                    report.failed.push((snapshot.id, e));
                }
            }
        }
        Ok(report)
    }
}
