use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use common::{ObjectMeta, VolumeSnapshot, VolumeSnapshotSource, VolumeSnapshotSpec};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::{SnapshotConfig, WorkspaceClassConfig};
use crate::daemon::DaemonConnector;
use crate::error::{Result, WsError};
use crate::store::{ObjectStore, StoreError};
use crate::workspace::WorkspaceObjects;

// attempts at finding a free snapshot name before giving up
const NAME_ATTEMPTS: i64 = 8;

/// Claim-backed workspaces are snapshotted through a volume snapshot object,
/// all others by the daemon on their node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotStrategy {
    /// Snapshot the workspace's claim, with `class` naming the snapshot class
    /// or `None` for the cluster default.
    VolumeSnapshot { class: Option<String> },
    Daemon,
}

impl SnapshotStrategy {
    pub fn resolve(
        objects: &WorkspaceObjects,
        classes: &HashMap<String, WorkspaceClassConfig>,
    ) -> Self {
        if !objects.pvc_feature_enabled() {
            return SnapshotStrategy::Daemon;
        }
        let class = objects
            .workspace_class()
            .and_then(|name| classes.get(name))
            .and_then(|cfg| cfg.pvc.snapshot_class.clone())
            .filter(|class| !class.is_empty());
        SnapshotStrategy::VolumeSnapshot { class }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotResult {
    /// Snapshot name for volume snapshots, backup location for daemon backups.
    pub url: String,
    pub ready: bool,
}

/// Readiness of a volume snapshot as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSnapshotInfo {
    pub id: String,
    pub ready: bool,
}

pub fn snapshot_name(workspace_id: &str, nanos: i64) -> String {
    format!("snapshot-{workspace_id}-{nanos}")
}

pub struct SnapshotCoordinator {
    store: Arc<dyn ObjectStore>,
    daemons: Arc<dyn DaemonConnector>,
    classes: HashMap<String, WorkspaceClassConfig>,
    config: SnapshotConfig,
}

impl SnapshotCoordinator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        daemons: Arc<dyn DaemonConnector>,
        classes: HashMap<String, WorkspaceClassConfig>,
        config: SnapshotConfig,
    ) -> Self {
        Self {
            store,
            daemons,
            classes,
            config,
        }
    }

    pub async fn take_snapshot(
        &self,
        objects: &WorkspaceObjects,
        return_immediately: bool,
    ) -> Result<SnapshotResult> {
        match SnapshotStrategy::resolve(objects, &self.classes) {
            SnapshotStrategy::VolumeSnapshot { class } => {
                let name = self.create_volume_snapshot(objects, class).await?;
                if return_immediately {
                    return Ok(SnapshotResult {
                        url: name,
                        ready: false,
                    });
                }
                self.wait_for_volume_snapshot_ready(&name).await?;
                Ok(SnapshotResult {
                    url: name,
                    ready: true,
                })
            }
            SnapshotStrategy::Daemon => {
                let conn = self.daemons.connect(objects.pod()).await?;
                let url = conn
                    .take_snapshot(objects.workspace_id(), return_immediately)
                    .await?;
                Ok(SnapshotResult {
                    url,
                    ready: !return_immediately,
                })
            }
        }
    }

    async fn create_volume_snapshot(
        &self,
        objects: &WorkspaceObjects,
        class: Option<String>,
    ) -> Result<String> {
        let pod = objects.pod();
        let mut meta = ObjectMeta::named(String::new());
        meta.namespace = pod.metadata.namespace.clone();
        meta.labels = pod.metadata.labels.clone();
        let mut snapshot = VolumeSnapshot::new(
            meta,
            VolumeSnapshotSpec {
                // claims are named after the workspace pod
                source: VolumeSnapshotSource {
                    persistent_volume_claim_name: pod.metadata.name.clone(),
                },
                volume_snapshot_class_name: class,
            },
        );

        let now = Utc::now().timestamp_nanos_opt().ok_or_else(|| {
            WsError::internal(
                "TakeSnapshot",
                "cannot create volume snapshot from pvc",
                "clock out of range",
            )
        })?;
        for attempt in 0..NAME_ATTEMPTS {
            snapshot.metadata.name = snapshot_name(objects.workspace_id(), now + attempt);
            match self.store.create_volume_snapshot(&snapshot).await {
                Ok(()) => {
                    info!(
                        "[TakeSnapshot] created volume snapshot {} for workspace {}",
                        snapshot.metadata.name,
                        objects.workspace_id()
                    );
                    return Ok(snapshot.metadata.name);
                }
                Err(StoreError::AlreadyExists(name)) => {
                    debug!("[TakeSnapshot] snapshot name {name} taken, retrying");
                }
                Err(e) => {
                    return Err(WsError::internal(
                        "TakeSnapshot",
                        "cannot create volume snapshot from pvc",
                        e,
                    ));
                }
            }
        }
        Err(WsError::internal(
            "TakeSnapshot",
            "cannot create volume snapshot from pvc",
            "no free snapshot name",
        ))
    }

    async fn fetch_volume_snapshot(&self, op: &str, id: &str) -> Result<VolumeSnapshot> {
        match self.store.get_volume_snapshot(id).await {
            Ok(Some(snapshot)) => Ok(snapshot),
            Ok(None) => Err(WsError::NotFound(format!(
                "volume snapshot {id} does not exist"
            ))),
            Err(e) => Err(WsError::internal(op, "cannot get volume snapshot", e)),
        }
    }

    pub async fn check_volume_snapshot_ready(&self, id: &str) -> Result<bool> {
        let snapshot = self.fetch_volume_snapshot("GetVolumeSnapshot", id).await?;
        Ok(snapshot.is_ready())
    }

    pub async fn get_volume_snapshot(&self, id: &str) -> Result<VolumeSnapshotInfo> {
        let ready = self.check_volume_snapshot_ready(id).await?;
        Ok(VolumeSnapshotInfo {
            id: id.to_string(),
            ready,
        })
    }

    /// Poll until the snapshot is ready, backing off between reads. Gives up
    /// after the configured ready timeout.
    pub async fn wait_for_volume_snapshot_ready(&self, id: &str) -> Result<()> {
        let poll = async {
            let mut delay = self.config.poll_interval();
            loop {
                let snapshot = self.fetch_volume_snapshot("TakeSnapshot", id).await?;
                if snapshot.is_ready() {
                    return Ok(());
                }
                if let Some(err) = snapshot.status.as_ref().and_then(|s| s.error.as_ref()) {
                    return Err(WsError::internal(
                        "TakeSnapshot",
                        "volume snapshot failed",
                        err,
                    ));
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(self.config.max_poll_interval());
            }
        };

        match tokio::time::timeout(self.config.ready_timeout(), poll).await {
            Ok(res) => res,
            Err(_) => Err(WsError::internal(
                "TakeSnapshot",
                "volume snapshot is not ready",
                format!("{id} not ready after {:?}", self.config.ready_timeout()),
            )),
        }
    }
}
