use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Tag vocabulary
// ---------------------------------------------------------------------------

/// Instance tag holding the raw `daily,weekly,monthly,yearly` policy.
pub const CONFIG_TAG: &str = "LambdaBackupConfiguration";

/// Instance tag used as the human-readable name in logs and snapshot tags.
pub const NAME_TAG: &str = "Name";

/// Fallback name for instances without a `Name` tag.
pub const UNNAMED: &str = "[unnamed]";

/// Value of the `Name` tag stamped on every snapshot this tool creates.
pub const SNAPSHOT_NAME: &str = "lambda-backup";

pub const BACKUP_LABEL_TAG: &str = "BackupLabel";
pub const INSTANCE_ID_TAG: &str = "InstanceId";
pub const INSTANCE_NAME_TAG: &str = "InstanceName";

/// Snapshot tag the expiration sweep matches against today's date.
pub const DELETE_ON_TAG: &str = "DeleteOn";

/// Date format of the `DeleteOn` tag (ISO-8601 calendar date).
pub const DELETE_ON_FORMAT: &str = "%Y-%m-%d";

pub type Tags = BTreeMap<String, String>;

/// Render a date the way it is persisted in the `DeleteOn` tag.
pub fn format_delete_on(date: NaiveDate) -> String {
    date.format(DELETE_ON_FORMAT).to_string()
}

// ---------------------------------------------------------------------------
// Retention model
// ---------------------------------------------------------------------------

/// Retention tier of a backup. Labels are used verbatim as tag values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Daily => "daily",
            Tier::Weekly => "weekly",
            Tier::Monthly => "monthly",
            Tier::Yearly => "yearly",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(Tier::Daily),
            "weekly" => Ok(Tier::Weekly),
            "monthly" => Ok(Tier::Monthly),
            "yearly" => Ok(Tier::Yearly),
            other => Err(format!("unknown tier label: {other}")),
        }
    }
}

/// Per-resource retention policy. Each count is a number of periods in the
/// tier's unit; 0 disables the tier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Days to keep a daily backup.
    pub daily: u32,
    /// Weeks to keep a weekly backup.
    pub weekly: u32,
    /// Calendar months to keep a monthly backup.
    pub monthly: u32,
    /// Calendar years to keep a yearly backup.
    pub yearly: u32,
}

impl RetentionPolicy {
    pub fn new(daily: u32, weekly: u32, monthly: u32, yearly: u32) -> Self {
        Self {
            daily,
            weekly,
            monthly,
            yearly,
        }
    }

    /// A policy with every tier disabled never produces a backup.
    pub fn is_disabled(&self) -> bool {
        self.daily == 0 && self.weekly == 0 && self.monthly == 0 && self.yearly == 0
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.daily, self.weekly, self.monthly, self.yearly
        )
    }
}

/// Outcome of scheduling one resource for one day. Every backup variant
/// carries the date on which it becomes eligible for deletion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetentionDecision {
    NoBackup,
    Daily(NaiveDate),
    Weekly(NaiveDate),
    Monthly(NaiveDate),
    Yearly(NaiveDate),
}

impl RetentionDecision {
    pub fn backup(tier: Tier, expires_on: NaiveDate) -> Self {
        match tier {
            Tier::Daily => RetentionDecision::Daily(expires_on),
            Tier::Weekly => RetentionDecision::Weekly(expires_on),
            Tier::Monthly => RetentionDecision::Monthly(expires_on),
            Tier::Yearly => RetentionDecision::Yearly(expires_on),
        }
    }

    pub fn tier(&self) -> Option<Tier> {
        match self {
            RetentionDecision::NoBackup => None,
            RetentionDecision::Daily(_) => Some(Tier::Daily),
            RetentionDecision::Weekly(_) => Some(Tier::Weekly),
            RetentionDecision::Monthly(_) => Some(Tier::Monthly),
            RetentionDecision::Yearly(_) => Some(Tier::Yearly),
        }
    }

    pub fn expires_on(&self) -> Option<NaiveDate> {
        match *self {
            RetentionDecision::NoBackup => None,
            RetentionDecision::Daily(d)
            | RetentionDecision::Weekly(d)
            | RetentionDecision::Monthly(d)
            | RetentionDecision::Yearly(d) => Some(d),
        }
    }

    /// Tier and expiration date together, or `None` when no backup is due.
    pub fn scheduled(&self) -> Option<(Tier, NaiveDate)> {
        self.tier().zip(self.expires_on())
    }

    pub fn is_backup(&self) -> bool {
        !matches!(self, RetentionDecision::NoBackup)
    }
}

impl fmt::Display for RetentionDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheduled() {
            Some((tier, date)) => write!(f, "{tier} (delete on {})", format_delete_on(date)),
            None => f.write_str("no backup"),
        }
    }
}

// ---------------------------------------------------------------------------
// Cloud inventory model
// ---------------------------------------------------------------------------

/// Identifies a resource in diagnostics: its id plus its display name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceRef {
    pub id: String,
    pub name: String,
}

impl ResourceRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.name)
    }
}

/// A volume attached to an instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    /// Mount point as reported by the cloud, e.g. `/dev/xvda`.
    pub device_name: String,
    pub volume_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub block_devices: Vec<BlockDevice>,
}

impl Instance {
    /// The `Name` tag, or `[unnamed]`.
    pub fn name(&self) -> &str {
        self.tags.get(NAME_TAG).map(String::as_str).unwrap_or(UNNAMED)
    }

    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef::new(&self.id, self.name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub volume_id: String,
    pub description: String,
    pub started_at: DateTime<Utc>,
    /// Whether the snapshot belongs to the calling account.
    pub owned: bool,
    #[serde(default)]
    pub tags: Tags,
}

impl Snapshot {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// CloudApi trait: the scheduler <-> cloud boundary
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Instances carrying the given tag key, whatever its value.
    async fn instances_with_tag(&self, tag_key: &str) -> Result<Vec<Instance>, CloudError>;

    /// Start a snapshot of a volume. Returns the new snapshot id.
    async fn create_snapshot(&self, volume_id: &str, description: &str)
        -> Result<String, CloudError>;

    /// Apply the same tag set to every listed snapshot.
    async fn create_tags(&self, snapshot_ids: &[String], tags: &Tags) -> Result<(), CloudError>;

    /// Owned snapshots whose tag `key` equals `value`.
    async fn owned_snapshots_tagged(&self, key: &str, value: &str)
        -> Result<Vec<Snapshot>, CloudError>;

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CloudError>;
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file error: {0}")]
    State(#[from] serde_json::Error),

    #[error("volume {0} not found")]
    VolumeNotFound(String),

    #[error("snapshot {0} not found")]
    SnapshotNotFound(String),

    #[error("API request failed: {0}")]
    Api(String),
}
