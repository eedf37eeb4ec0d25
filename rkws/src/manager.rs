use std::sync::Arc;

use futures::StreamExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::admission::AdmissionController;
use crate::config::ManagerConfig;
use crate::daemon::DaemonConnector;
use crate::error::{Result, WsError, or_cancelled};
use crate::snapshot::{SnapshotCoordinator, SnapshotResult, VolumeSnapshotInfo};
use crate::store::{ObjectStore, PodEvent};
use crate::workspace::{
    WorkspaceObjects, WorkspacePhase, WorkspaceStatus, find_workspace_pod, read_error,
};

// events buffered per subscriber before the producer waits for the reader
const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceStatusEvent {
    pub workspace_id: String,
    pub status: WorkspaceStatus,
}

pub type StatusReceiver = mpsc::Receiver<Result<WorkspaceStatusEvent>>;

pub struct Manager {
    store: Arc<dyn ObjectStore>,
    daemons: Arc<dyn DaemonConnector>,
    snapshots: SnapshotCoordinator,
    admission: AdmissionController,
}

impl Manager {
    pub fn new(
        config: ManagerConfig,
        store: Arc<dyn ObjectStore>,
        daemons: Arc<dyn DaemonConnector>,
    ) -> Self {
        let snapshots = SnapshotCoordinator::new(
            store.clone(),
            daemons.clone(),
            config.workspace_classes,
            config.snapshot,
        );
        let admission = AdmissionController::new(store.clone(), config.mark_retries);
        Self {
            store,
            daemons,
            snapshots,
            admission,
        }
    }

    async fn workspace(&self, op: &str, workspace_id: &str) -> Result<WorkspaceObjects> {
        let pod = find_workspace_pod(self.store.as_ref(), workspace_id)
            .await
            .map_err(|e| read_error(op, e))?;
        WorkspaceObjects::from_pod(pod).map_err(|e| read_error(op, e))
    }

    fn status(op: &str, objects: &WorkspaceObjects) -> Result<WorkspaceStatus> {
        objects.status().map_err(|e| read_error(op, e))
    }

    pub async fn take_snapshot(
        &self,
        workspace_id: &str,
        return_immediately: bool,
        cancel: &CancellationToken,
    ) -> Result<SnapshotResult> {
        debug!("[TakeSnapshot] workspace {workspace_id}, return_immediately={return_immediately}");
        or_cancelled(cancel, async {
            let objects = self.workspace("TakeSnapshot", workspace_id).await?;
            let status = Self::status("TakeSnapshot", &objects)?;
            if status.phase != WorkspacePhase::Running {
                return Err(WsError::FailedPrecondition(
                    "can only take snapshots of running workspaces".to_string(),
                ));
            }
            let result = self
                .snapshots
                .take_snapshot(&objects, return_immediately)
                .await?;
            info!("[TakeSnapshot] workspace {workspace_id} snapshot at {}", result.url);
            Ok(result)
        })
        .await
    }

    pub async fn get_volume_snapshot(
        &self,
        snapshot_id: &str,
        cancel: &CancellationToken,
    ) -> Result<VolumeSnapshotInfo> {
        debug!("[GetVolumeSnapshot] snapshot {snapshot_id}");
        or_cancelled(cancel, self.snapshots.get_volume_snapshot(snapshot_id)).await
    }

    pub async fn control_admission(
        &self,
        workspace_id: &str,
        level: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        debug!("[ControlAdmission] workspace {workspace_id}, level {level}");
        or_cancelled(cancel, async {
            let objects = self.workspace("ControlAdmission", workspace_id).await?;
            let status = Self::status("ControlAdmission", &objects)?;
            self.admission
                .control_admission(&objects.pod().metadata.name, &status, level)
                .await
        })
        .await
    }

    pub async fn set_timeout(
        &self,
        workspace_id: &str,
        duration: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        debug!("[SetTimeout] workspace {workspace_id}, duration {duration}");
        or_cancelled(cancel, self.admission.set_timeout(workspace_id, duration)).await
    }

    /// Back up the workspace through its node daemon, whatever phase the
    /// workspace appears to be in. Only the workspace id label is needed to
    /// find the pod.
    pub async fn backup_workspace(
        &self,
        workspace_id: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        debug!("[BackupWorkspace] workspace {workspace_id}");
        or_cancelled(cancel, async {
            let pod = find_workspace_pod(self.store.as_ref(), workspace_id)
                .await
                .map_err(|e| read_error("BackupWorkspace", e))?;
            let conn = self.daemons.connect(&pod).await?;
            let url = conn.backup(workspace_id).await?;
            info!("[BackupWorkspace] workspace {workspace_id} backed up to {url}");
            Ok(url)
        })
        .await
    }

    /// Stream status changes of all workspaces, or only of `workspace_id`.
    ///
    /// Every subscriber gets its own store watch. The watch is released when
    /// `cancel` fires or the receiver is dropped.
    pub async fn subscribe(
        &self,
        workspace_id: Option<String>,
        cancel: CancellationToken,
    ) -> Result<StatusReceiver> {
        let filter = workspace_id.filter(|id| !id.is_empty());
        let mut events = or_cancelled(&cancel, async {
            self.store
                .watch_pods()
                .await
                .map_err(|e| WsError::internal("Subscribe", "cannot watch workspaces", e))
        })
        .await?;

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    ev = events.next() => ev,
                };
                let event = match item {
                    Some(Ok(ev)) => match project(ev, filter.as_deref()) {
                        Some(event) => Ok(event),
                        None => continue,
                    },
                    Some(Err(e)) => {
                        error!("[Subscribe] pod watch failed: {e}");
                        Err(WsError::Internal("workspace watch failed".to_string()))
                    }
                    None => {
                        warn!("[Subscribe] pod watch ended");
                        Err(WsError::Unavailable("workspace watch ended".to_string()))
                    }
                };
                let last = event.is_err();
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = tx.send(event) => if sent.is_err() { break },
                }
                if last {
                    break;
                }
            }
            debug!("[Subscribe] subscriber released");
        });
        Ok(rx)
    }
}

fn project(event: PodEvent, filter: Option<&str>) -> Option<WorkspaceStatusEvent> {
    let (pod, deleted) = match event {
        PodEvent::Put(pod) => (pod, false),
        PodEvent::Deleted(pod) => (pod, true),
    };
    let name = pod.metadata.name.clone();
    let objects = WorkspaceObjects::from_pod(pod).ok()?;
    if filter.is_some_and(|id| id != objects.workspace_id()) {
        return None;
    }
    let mut status = match objects.status() {
        Ok(status) => status,
        Err(e) => {
            warn!("[Subscribe] skipping pod {name}: {e}");
            return None;
        }
    };
    if deleted {
        status.phase = WorkspacePhase::Stopped;
    }
    Some(WorkspaceStatusEvent {
        workspace_id: status.id.clone(),
        status,
    })
}
