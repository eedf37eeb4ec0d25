#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use common::{ObjectMeta, PodPhase, PodTask, VolumeSnapshot};
use rkws::config::{ManagerConfig, PvcConfig, SnapshotConfig, WorkspaceClassConfig};
use rkws::daemon::{DaemonConnection, DaemonConnector};
use rkws::manager::Manager;
use rkws::store::{MemoryStore, ObjectStore, PodEventStream, StoreError, Versioned};
use rkws::workspace::{OWNER_LABEL, PVC_FEATURE_LABEL, WORKSPACE_CLASS_LABEL, WORKSPACE_ID_LABEL};
use rkws::{DaemonError, WsError};

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .is_test(true)
            .try_init();
    });
}

/// Workspace pod as the scheduler leaves it once bound to a node.
pub fn workspace_pod(id: &str, phase: PodPhase) -> PodTask {
    let mut meta = ObjectMeta::named(format!("ws-{id}"));
    meta.labels
        .insert(WORKSPACE_ID_LABEL.to_string(), id.to_string());
    meta.labels
        .insert(OWNER_LABEL.to_string(), "user-1".to_string());
    let mut pod = PodTask::new(meta);
    pod.status.phase = phase;
    pod.spec.node_name = Some("node-1".to_string());
    pod.status.host_ip = Some("127.0.0.1".to_string());
    pod
}

pub fn pvc_workspace_pod(id: &str, class: &str) -> PodTask {
    let mut pod = workspace_pod(id, PodPhase::Running);
    pod.metadata
        .labels
        .insert(PVC_FEATURE_LABEL.to_string(), "true".to_string());
    pod.metadata
        .labels
        .insert(WORKSPACE_CLASS_LABEL.to_string(), class.to_string());
    pod
}

pub fn stopping(mut pod: PodTask) -> PodTask {
    pod.metadata.deletion_timestamp = Some(chrono::Utc::now());
    pod
}

pub fn manager_config() -> ManagerConfig {
    let mut workspace_classes = HashMap::new();
    workspace_classes.insert(
        "default".to_string(),
        WorkspaceClassConfig {
            pvc: PvcConfig {
                snapshot_class: Some("csi-snapclass".to_string()),
            },
        },
    );
    ManagerConfig {
        snapshot: SnapshotConfig {
            ready_timeout_secs: 2,
            poll_interval_ms: 10,
            max_poll_interval_ms: 50,
        },
        mark_retries: 5,
        workspace_classes,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonCall {
    TakeSnapshot { id: String, return_immediately: bool },
    Backup { id: String },
}

/// Stands in for the node daemons. Records the pod of every connection and
/// every call.
#[derive(Default)]
pub struct FakeDaemons {
    connects: Mutex<Vec<String>>,
    calls: Arc<Mutex<Vec<DaemonCall>>>,
    failure: Mutex<Option<DaemonError>>,
    unreachable: Mutex<bool>,
    delay: Mutex<Option<Duration>>,
}

impl FakeDaemons {
    pub fn connects(&self) -> Vec<String> {
        self.connects.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<DaemonCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_with(&self, err: DaemonError) {
        *self.failure.lock().unwrap() = Some(err);
    }

    pub fn set_unreachable(&self) {
        *self.unreachable.lock().unwrap() = true;
    }

    /// Make every call hang for `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl DaemonConnector for FakeDaemons {
    async fn connect(&self, pod: &PodTask) -> Result<Box<dyn DaemonConnection>, WsError> {
        self.connects
            .lock()
            .unwrap()
            .push(pod.metadata.name.clone());
        if *self.unreachable.lock().unwrap() {
            return Err(WsError::Unavailable(
                "cannot connect to workspace daemon".to_string(),
            ));
        }
        Ok(Box::new(FakeConnection {
            calls: self.calls.clone(),
            failure: self.failure.lock().unwrap().clone(),
            delay: *self.delay.lock().unwrap(),
        }))
    }
}

struct FakeConnection {
    calls: Arc<Mutex<Vec<DaemonCall>>>,
    failure: Option<DaemonError>,
    delay: Option<Duration>,
}

impl FakeConnection {
    async fn answer(&self, call: DaemonCall, url: String) -> Result<String, WsError> {
        self.calls.lock().unwrap().push(call);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.failure {
            Some(err) => Err(WsError::Remote(err.clone())),
            None => Ok(url),
        }
    }
}

#[async_trait]
impl DaemonConnection for FakeConnection {
    async fn take_snapshot(
        &self,
        workspace_id: &str,
        return_immediately: bool,
    ) -> Result<String, WsError> {
        let call = DaemonCall::TakeSnapshot {
            id: workspace_id.to_string(),
            return_immediately,
        };
        self.answer(call, format!("backup://{workspace_id}/1")).await
    }

    async fn backup(&self, workspace_id: &str) -> Result<String, WsError> {
        let call = DaemonCall::Backup {
            id: workspace_id.to_string(),
        };
        self.answer(call, format!("backup://{workspace_id}/full"))
            .await
    }
}

/// Store whose next `collisions` volume snapshot creates find the name
/// already taken. Every attempted name is recorded.
pub struct CollidingStore {
    inner: Arc<MemoryStore>,
    collisions: Mutex<usize>,
    attempts: Mutex<Vec<String>>,
}

impl CollidingStore {
    pub fn new(inner: Arc<MemoryStore>, collisions: usize) -> Self {
        Self {
            inner,
            collisions: Mutex::new(collisions),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for CollidingStore {
    async fn list_pods(&self) -> Result<Vec<PodTask>, StoreError> {
        self.inner.list_pods().await
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Versioned<PodTask>>, StoreError> {
        self.inner.get_pod(name).await
    }

    async fn update_pod(&self, pod: &PodTask, revision: i64) -> Result<bool, StoreError> {
        self.inner.update_pod(pod, revision).await
    }

    async fn create_volume_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<(), StoreError> {
        let name = snapshot.metadata.name.clone();
        self.attempts.lock().unwrap().push(name.clone());
        {
            let mut collisions = self.collisions.lock().unwrap();
            if *collisions > 0 {
                *collisions -= 1;
                return Err(StoreError::AlreadyExists(name));
            }
        }
        self.inner.create_volume_snapshot(snapshot).await
    }

    async fn get_volume_snapshot(
        &self,
        name: &str,
    ) -> Result<Option<VolumeSnapshot>, StoreError> {
        self.inner.get_volume_snapshot(name).await
    }

    async fn watch_pods(&self) -> Result<PodEventStream, StoreError> {
        self.inner.watch_pods().await
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub daemons: Arc<FakeDaemons>,
    pub manager: Arc<Manager>,
}

pub fn harness() -> Harness {
    harness_with(manager_config())
}

pub fn harness_with(config: ManagerConfig) -> Harness {
    init_logging();
    let store = Arc::new(MemoryStore::new());
    let daemons = Arc::new(FakeDaemons::default());
    let manager = Arc::new(Manager::new(config, store.clone(), daemons.clone()));
    Harness {
        store,
        daemons,
        manager,
    }
}
