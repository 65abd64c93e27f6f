use std::sync::Arc;

use chrono::NaiveDate;
use tiered_backup_common::{
    format_delete_on, CloudApi, CloudError, Instance, Tags, Tier, BACKUP_LABEL_TAG,
    DELETE_ON_TAG, INSTANCE_ID_TAG, INSTANCE_NAME_TAG, NAME_TAG,
};
use tiered_backup_policy::{PolicyParser, RetentionScheduler};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::error::BackupError;

/// What happened to a single instance during a backup run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstanceOutcome {
    /// The policy schedules no backup for today.
    Skipped,
    BackedUp {
        tier: Tier,
        delete_on: NaiveDate,
        snapshot_ids: Vec<String>,
    },
}

#[derive(Debug)]
pub struct InstanceReport {
    pub instance_id: String,
    pub result: Result<InstanceOutcome, BackupError>,
}

/// Per-instance results of one backup run, in inventory order.
#[derive(Debug, Default)]
pub struct BackupReport {
    pub instances: Vec<InstanceReport>,
}

impl BackupReport {
    pub fn backed_up(&self) -> usize {
        self.instances
            .iter()
            .filter(|r| matches!(r.result, Ok(InstanceOutcome::BackedUp { .. })))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.instances
            .iter()
            .filter(|r| matches!(r.result, Ok(InstanceOutcome::Skipped)))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.instances.iter().filter(|r| r.result.is_err()).count()
    }

    /// Ids of every snapshot created in this run.
    pub fn snapshot_ids(&self) -> Vec<&str> {
        self.instances
            .iter()
            .filter_map(|r| match &r.result {
                Ok(InstanceOutcome::BackedUp { snapshot_ids, .. }) => Some(snapshot_ids),
                _ => None,
            })
            .flatten()
            .map(String::as_str)
            .collect()
    }

    pub fn outcome(&self, instance_id: &str) -> Option<&Result<InstanceOutcome, BackupError>> {
        self.instances
            .iter()
            .find(|r| r.instance_id == instance_id)
            .map(|r| &r.result)
    }
}

/// Snapshots every configured instance whose policy schedules a backup today.
pub struct BackupRunner {
    cloud: Arc<dyn CloudApi>,
    settings: Arc<Settings>,
}

impl BackupRunner {
    pub fn new(cloud: Arc<dyn CloudApi>, settings: Arc<Settings>) -> Self {
        Self { cloud, settings }
    }

    /// Back up all instances carrying the configuration tag.
    ///
    /// Only a failure to list instances is returned as an error; problems
    /// with a single instance are logged and recorded in the report.
    pub async fn backup_all(&self, today: NaiveDate) -> Result<BackupReport, CloudError> {
        let instances = self.cloud.instances_with_tag(&self.settings.config_tag).await?;
        info!(
            instances = instances.len(),
            date = %today,
            "starting backup run"
        );

        let limit = self.settings.max_concurrent_instances.max(1);
        let mut tasks = JoinSet::new();
        let mut reports = Vec::with_capacity(instances.len());

        for (position, instance) in instances.into_iter().enumerate() {
            if tasks.len() >= limit {
                if let Some(done) = join_next(&mut tasks).await {
                    reports.push(done);
                }
            }
            let cloud = self.cloud.clone();
            let settings = self.settings.clone();
            tasks.spawn(async move {
                let instance_id = instance.id.clone();
                let result = backup_instance(cloud.as_ref(), &settings, &instance, today).await;
                if let Err(e) = &result {
                    error!(instance = %instance_id, "error backing up instance: {e}");
                }
                (position, InstanceReport { instance_id, result })
            });
        }
        while let Some(done) = join_next(&mut tasks).await {
            reports.push(done);
        }

        reports.sort_by_key(|(position, _)| *position);
        Ok(BackupReport {
            instances: reports.into_iter().map(|(_, report)| report).collect(),
        })
    }
}

async fn join_next(
    tasks: &mut JoinSet<(usize, InstanceReport)>,
) -> Option<(usize, InstanceReport)> {
    loop {
        match tasks.join_next().await? {
            Ok(done) => return Some(done),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => warn!("backup task cancelled: {e}"),
        }
    }
}

/// Decide on and, if due, create today's backup of one instance.
pub async fn backup_instance(
    cloud: &dyn CloudApi,
    settings: &Settings,
    instance: &Instance,
    today: NaiveDate,
) -> Result<InstanceOutcome, BackupError> {
    let resource = instance.resource_ref();
    let raw = instance
        .tags
        .get(&settings.config_tag)
        .ok_or_else(|| BackupError::MissingConfiguration {
            resource: resource.clone(),
            tag: settings.config_tag.clone(),
        })?;

    let policy = PolicyParser::parse(&resource, raw)?;
    let Some((tier, delete_on)) = RetentionScheduler::decide(&policy, today).scheduled() else {
        info!(
            "Skip backup of instance {resource}; {} is {raw}",
            settings.config_tag
        );
        return Ok(InstanceOutcome::Skipped);
    };

    let delete_on_fmt = format_delete_on(delete_on);
    info!("Work on instance {resource}; create {tier} backups to be deleted on {delete_on_fmt}");

    let mut snapshot_ids = Vec::with_capacity(instance.block_devices.len());
    let mut failure = None;
    for device in &instance.block_devices {
        info!(
            "Create snapshot of volume {} (mounted at {})",
            device.volume_id, device.device_name
        );
        let description = format!("Backup of {} {}", resource.name, device.device_name);
        match cloud.create_snapshot(&device.volume_id, &description).await {
            Ok(id) => snapshot_ids.push(id),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    // Snapshots already taken are tagged even after a failure, otherwise
    // the sweep would never find them.
    if !snapshot_ids.is_empty() {
        info!("Create tags for snapshots {snapshot_ids:?}");
        let tags = snapshot_tags(settings, instance, tier, &delete_on_fmt);
        if let Err(source) = cloud.create_tags(&snapshot_ids, &tags).await {
            match &failure {
                Some(_) => warn!("error tagging snapshots {snapshot_ids:?}: {source}"),
                None => return Err(BackupError::Cloud { resource, source }),
            }
        }
    }

    match failure {
        Some(source) => Err(BackupError::Cloud { resource, source }),
        None => Ok(InstanceOutcome::BackedUp {
            tier,
            delete_on,
            snapshot_ids,
        }),
    }
}

fn snapshot_tags(settings: &Settings, instance: &Instance, tier: Tier, delete_on: &str) -> Tags {
    [
        (NAME_TAG, settings.snapshot_name.as_str()),
        (BACKUP_LABEL_TAG, tier.as_str()),
        (INSTANCE_ID_TAG, instance.id.as_str()),
        (INSTANCE_NAME_TAG, instance.name()),
        (DELETE_ON_TAG, delete_on),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}
