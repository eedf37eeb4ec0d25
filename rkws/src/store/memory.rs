use std::collections::BTreeMap;

use async_trait::async_trait;
use common::{PodTask, VolumeSnapshot, VolumeSnapshotStatus};
use tokio::sync::{Mutex, broadcast};

use super::{ObjectStore, PodEvent, PodEventStream, StoreError, Versioned};

#[derive(Default)]
struct State {
    revision: i64,
    pods: BTreeMap<String, Versioned<PodTask>>,
    snapshots: BTreeMap<String, VolumeSnapshot>,
    pod_lists: usize,
    pod_writes: usize,
    snapshot_creates: usize,
    // number of upcoming update_pod calls that report a conflict
    forced_conflicts: usize,
    unreachable: bool,
}

/// In-process store with the revision and watch semantics of [`super::XlineStore`].
pub struct MemoryStore {
    state: Mutex<State>,
    events: broadcast::Sender<PodEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }

    /// Create or replace a pod, as the scheduler or rkl would.
    pub async fn insert_pod(&self, pod: PodTask) {
        let mut state = self.state.lock().await;
        state.revision += 1;
        let revision = state.revision;
        state.pods.insert(
            pod.metadata.name.clone(),
            Versioned {
                object: pod.clone(),
                revision,
            },
        );
        let _ = self.events.send(PodEvent::Put(pod));
    }

    pub async fn delete_pod(&self, name: &str) {
        let mut state = self.state.lock().await;
        if let Some(old) = state.pods.remove(name) {
            state.revision += 1;
            let _ = self.events.send(PodEvent::Deleted(old.object));
        }
    }

    pub async fn pod(&self, name: &str) -> Option<PodTask> {
        let state = self.state.lock().await;
        state.pods.get(name).map(|v| v.object.clone())
    }

    /// Calls to [`ObjectStore::list_pods`], failed ones included.
    pub async fn pod_lists(&self) -> usize {
        self.state.lock().await.pod_lists
    }

    /// Successful pod writes issued through [`ObjectStore::update_pod`].
    pub async fn pod_writes(&self) -> usize {
        self.state.lock().await.pod_writes
    }

    pub async fn snapshot_creates(&self) -> usize {
        self.state.lock().await.snapshot_creates
    }

    pub async fn volume_snapshots(&self) -> Vec<VolumeSnapshot> {
        let state = self.state.lock().await;
        state.snapshots.values().cloned().collect()
    }

    /// Report the snapshot as cut, as the snapshot controller would.
    pub async fn set_snapshot_status(&self, name: &str, status: VolumeSnapshotStatus) -> bool {
        let mut state = self.state.lock().await;
        match state.snapshots.get_mut(name) {
            Some(snapshot) => {
                snapshot.status = Some(status);
                true
            }
            None => false,
        }
    }

    /// Make the next `n` conditional pod writes lose their race.
    pub async fn force_conflicts(&self, n: usize) {
        self.state.lock().await.forced_conflicts = n;
    }

    /// Fail every subsequent call as if Xline could not be reached.
    pub async fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().await.unreachable = unreachable;
    }
}

fn unreachable_error() -> StoreError {
    StoreError::Unavailable("memory store is unreachable".to_string())
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_pods(&self) -> Result<Vec<PodTask>, StoreError> {
        let mut state = self.state.lock().await;
        state.pod_lists += 1;
        if state.unreachable {
            return Err(unreachable_error());
        }
        Ok(state.pods.values().map(|v| v.object.clone()).collect())
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Versioned<PodTask>>, StoreError> {
        let state = self.state.lock().await;
        if state.unreachable {
            return Err(unreachable_error());
        }
        Ok(state.pods.get(name).cloned())
    }

    async fn update_pod(&self, pod: &PodTask, revision: i64) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.unreachable {
            return Err(unreachable_error());
        }
        if state.forced_conflicts > 0 {
            state.forced_conflicts -= 1;
            return Ok(false);
        }
        let current = state.pods.get(&pod.metadata.name).map(|v| v.revision);
        if current != Some(revision) {
            return Ok(false);
        }

        state.revision += 1;
        state.pod_writes += 1;
        let next = state.revision;
        state.pods.insert(
            pod.metadata.name.clone(),
            Versioned {
                object: pod.clone(),
                revision: next,
            },
        );
        let _ = self.events.send(PodEvent::Put(pod.clone()));
        Ok(true)
    }

    async fn create_volume_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.unreachable {
            return Err(unreachable_error());
        }
        let name = snapshot.metadata.name.clone();
        if state.snapshots.contains_key(&name) {
            return Err(StoreError::AlreadyExists(name));
        }
        state.revision += 1;
        state.snapshot_creates += 1;
        state.snapshots.insert(name, snapshot.clone());
        Ok(())
    }

    async fn get_volume_snapshot(
        &self,
        name: &str,
    ) -> Result<Option<VolumeSnapshot>, StoreError> {
        let state = self.state.lock().await;
        if state.unreachable {
            return Err(unreachable_error());
        }
        Ok(state.snapshots.get(name).cloned())
    }

    async fn watch_pods(&self) -> Result<PodEventStream, StoreError> {
        if self.state.lock().await.unreachable {
            return Err(unreachable_error());
        }
        let rx = self.events.subscribe();
        let events = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => return Some((Ok(ev), rx)),
                    // a slow watcher misses intermediate events, like a compacted watch
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(events))
    }
}
