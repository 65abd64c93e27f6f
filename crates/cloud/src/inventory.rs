use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tiered_backup_common::{CloudApi, CloudError, Instance, Snapshot, Tags};
use tracing::debug;

/// In-process cloud inventory. Implements `CloudApi`.
///
/// Holds instances and snapshots in memory. When opened from a state file
/// the whole inventory is rewritten to that file after every mutation, so
/// consecutive runs of the CLI see each other's snapshots.
pub struct MemoryCloud {
    inner: Mutex<Inner>,
}

struct Inner {
    state: CloudState,
    /// Where to persist `state`; `None` keeps everything in memory.
    state_path: Option<PathBuf>,
    /// Volumes whose snapshot requests fail with an API error.
    failing_volumes: HashSet<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CloudState {
    /// Last snapshot sequence number handed out.
    #[serde(default)]
    last_snapshot_seq: u64,
    #[serde(default)]
    instances: Vec<Instance>,
    /// Snapshot id → snapshot.
    #[serde(default)]
    snapshots: BTreeMap<String, Snapshot>,
}

impl MemoryCloud {
    /// Empty inventory that is never persisted.
    pub fn new() -> Self {
        Self::with_state(CloudState::default(), None)
    }

    /// Open or create an inventory backed by a JSON state file.
    pub fn open(path: &Path) -> Result<Self, CloudError> {
        let state = if path.exists() {
            let bytes = std::fs::read(path)?;
            serde_json::from_slice(&bytes)?
        } else {
            CloudState::default()
        };
        debug!(
            path = %path.display(),
            instances = state.instances.len(),
            snapshots = state.snapshots.len(),
            "opened inventory"
        );
        Ok(Self::with_state(state, Some(path.to_path_buf())))
    }

    fn with_state(state: CloudState, state_path: Option<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state,
                state_path,
                failing_volumes: HashSet::new(),
            }),
        }
    }

    /// Register an instance, replacing any instance with the same id.
    pub fn put_instance(&self, instance: Instance) -> Result<(), CloudError> {
        let mut inner = self.inner.lock().unwrap();
        inner.state.instances.retain(|i| i.id != instance.id);
        inner.state.instances.push(instance);
        inner.persist()
    }

    /// Insert a snapshot as-is, e.g. one shared by another account.
    pub fn put_snapshot(&self, snapshot: Snapshot) -> Result<(), CloudError> {
        let mut inner = self.inner.lock().unwrap();
        inner.state.snapshots.insert(snapshot.id.clone(), snapshot);
        inner.persist()
    }

    /// Make every snapshot request for `volume_id` fail from now on.
    pub fn fail_volume(&self, volume_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .failing_volumes
            .insert(volume_id.to_string());
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.inner.lock().unwrap().state.instances.clone()
    }

    /// All snapshots, ordered by id (and therefore by creation).
    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.inner
            .lock()
            .unwrap()
            .state
            .snapshots
            .values()
            .cloned()
            .collect()
    }

    pub fn snapshot(&self, snapshot_id: &str) -> Option<Snapshot> {
        self.inner
            .lock()
            .unwrap()
            .state
            .snapshots
            .get(snapshot_id)
            .cloned()
    }
}

impl Default for MemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn persist(&self) -> Result<(), CloudError> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        // Write then rename so a crash never leaves a truncated state file.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&self.state)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn volume_exists(&self, volume_id: &str) -> bool {
        self.state
            .instances
            .iter()
            .flat_map(|i| &i.block_devices)
            .any(|d| d.volume_id == volume_id)
    }
}

#[async_trait]
impl CloudApi for MemoryCloud {
    async fn instances_with_tag(&self, tag_key: &str) -> Result<Vec<Instance>, CloudError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .state
            .instances
            .iter()
            .filter(|i| i.tags.contains_key(tag_key))
            .cloned()
            .collect())
    }

    async fn create_snapshot(
        &self,
        volume_id: &str,
        description: &str,
    ) -> Result<String, CloudError> {
        let mut inner = self.inner.lock().unwrap();

        if inner.failing_volumes.contains(volume_id) {
            return Err(CloudError::Api(format!(
                "snapshot request for {volume_id} rejected"
            )));
        }
        if !inner.volume_exists(volume_id) {
            return Err(CloudError::VolumeNotFound(volume_id.to_string()));
        }

        inner.state.last_snapshot_seq += 1;
        let id = format!("snap-{:08}", inner.state.last_snapshot_seq);
        let snapshot = Snapshot {
            id: id.clone(),
            volume_id: volume_id.to_string(),
            description: description.to_string(),
            started_at: Utc::now(),
            owned: true,
            tags: Tags::new(),
        };
        inner.state.snapshots.insert(id.clone(), snapshot);
        inner.persist()?;
        Ok(id)
    }

    async fn create_tags(&self, snapshot_ids: &[String], tags: &Tags) -> Result<(), CloudError> {
        let mut inner = self.inner.lock().unwrap();

        // Validate first so a bad id leaves every snapshot untouched.
        if let Some(missing) = snapshot_ids
            .iter()
            .find(|id| !inner.state.snapshots.contains_key(id.as_str()))
        {
            return Err(CloudError::SnapshotNotFound(missing.clone()));
        }
        for id in snapshot_ids {
            if let Some(snapshot) = inner.state.snapshots.get_mut(id) {
                snapshot
                    .tags
                    .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        inner.persist()
    }

    async fn owned_snapshots_tagged(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<Snapshot>, CloudError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .state
            .snapshots
            .values()
            .filter(|s| s.owned && s.tag(key) == Some(value))
            .cloned()
            .collect())
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CloudError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.snapshots.remove(snapshot_id).is_none() {
            return Err(CloudError::SnapshotNotFound(snapshot_id.to_string()));
        }
        inner.persist()
    }
}
