use common::{PodPhase, PodTask};
use serde::{Deserialize, Serialize};

use crate::error::WsError;
use crate::store::{ObjectStore, StoreError};

pub const WORKSPACE_ID_LABEL: &str = "workspaceID";
pub const OWNER_LABEL: &str = "owner";
pub const ORGANIZATION_LABEL: &str = "organizationID";
pub const CONFIGURATION_LABEL: &str = "configurationID";
pub const WORKSPACE_CLASS_LABEL: &str = "rk8s.io/workspace-class";
/// Present on pods whose content lives on a persistent volume claim.
pub const PVC_FEATURE_LABEL: &str = "feature/pvc";

pub const ADMISSION_ANNOTATION: &str = "rk8s.io/admission";
pub const CUSTOM_TIMEOUT_ANNOTATION: &str = "rk8s.io/custom-timeout";

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("workspace {0} does not exist")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("pod {pod}: {reason}")]
    Malformed { pod: String, reason: String },
}

/// Map a failed workspace read to the error reported for `op`.
pub(crate) fn read_error(op: &str, e: ReadError) -> WsError {
    match e {
        ReadError::NotFound(id) => WsError::NotFound(format!("workspace {id} does not exist")),
        ReadError::Store(e) => WsError::internal(op, "cannot get workspace", e),
        e @ ReadError::Malformed { .. } => {
            WsError::internal(op, "cannot get workspace status", e)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkspacePhase {
    /// Waiting to be bound to a node.
    Pending,
    Creating,
    Running,
    Stopping,
    Stopped,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceStatus {
    pub id: String,
    pub owner: String,
    pub organization_id: Option<String>,
    pub configuration_id: Option<String>,
    pub phase: WorkspacePhase,
    pub node_name: Option<String>,
    pub workspace_class: Option<String>,
    pub admission: Option<String>,
    pub timeout: Option<String>,
}

/// Point-in-time view of the objects backing one workspace, built fresh
/// for every request.
#[derive(Debug, Clone)]
pub struct WorkspaceObjects {
    pod: PodTask,
}

impl WorkspaceObjects {
    pub fn from_pod(pod: PodTask) -> Result<Self, ReadError> {
        for label in [WORKSPACE_ID_LABEL, OWNER_LABEL] {
            if !pod.metadata.labels.contains_key(label) {
                return Err(ReadError::Malformed {
                    pod: pod.metadata.name.clone(),
                    reason: format!("missing label {label}"),
                });
            }
        }
        Ok(Self { pod })
    }

    pub fn pod(&self) -> &PodTask {
        &self.pod
    }

    pub fn workspace_id(&self) -> &str {
        self.label(WORKSPACE_ID_LABEL).unwrap_or_default()
    }

    pub fn owner(&self) -> &str {
        self.label(OWNER_LABEL).unwrap_or_default()
    }

    pub fn workspace_class(&self) -> Option<&str> {
        self.label(WORKSPACE_CLASS_LABEL)
    }

    pub fn pvc_feature_enabled(&self) -> bool {
        self.pod.metadata.labels.contains_key(PVC_FEATURE_LABEL)
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.pod.metadata.labels.get(key).map(String::as_str)
    }

    fn annotation(&self, key: &str) -> Option<String> {
        self.pod.metadata.annotations.get(key).cloned()
    }

    pub fn status(&self) -> Result<WorkspaceStatus, ReadError> {
        let meta = &self.pod.metadata;
        let node_name = self.pod.spec.node_name.clone().filter(|n| !n.is_empty());

        let phase = match self.pod.status.phase {
            PodPhase::Succeeded | PodPhase::Failed => WorkspacePhase::Stopped,
            _ if meta.deletion_timestamp.is_some() => WorkspacePhase::Stopping,
            PodPhase::Pending if node_name.is_none() => WorkspacePhase::Pending,
            PodPhase::Pending => WorkspacePhase::Creating,
            PodPhase::Running if node_name.is_none() => {
                return Err(ReadError::Malformed {
                    pod: meta.name.clone(),
                    reason: "running but not bound to a node".to_string(),
                });
            }
            PodPhase::Running => WorkspacePhase::Running,
            PodPhase::Unknown => WorkspacePhase::Unknown,
        };

        Ok(WorkspaceStatus {
            id: self.workspace_id().to_string(),
            owner: self.owner().to_string(),
            organization_id: self.label(ORGANIZATION_LABEL).map(str::to_string),
            configuration_id: self.label(CONFIGURATION_LABEL).map(str::to_string),
            phase,
            node_name,
            workspace_class: self.workspace_class().map(str::to_string),
            admission: self.annotation(ADMISSION_ANNOTATION),
            timeout: self.annotation(CUSTOM_TIMEOUT_ANNOTATION),
        })
    }
}

/// Locate the pod labelled with `workspace_id`.
pub async fn find_workspace_pod(
    store: &dyn ObjectStore,
    workspace_id: &str,
) -> Result<PodTask, ReadError> {
    let pods = store.list_pods().await?;
    pods.into_iter()
        .find(|pod| {
            pod.metadata.labels.get(WORKSPACE_ID_LABEL).map(String::as_str) == Some(workspace_id)
        })
        .ok_or_else(|| ReadError::NotFound(workspace_id.to_string()))
}
