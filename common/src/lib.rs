use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    // set once deletion of the object has been requested
    #[serde(
        rename = "deletionTimestamp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: default_namespace(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            deletion_timestamp: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct PodSpec {
    //if pod is distributed to a node ,then this field should be filled with node-id
    #[serde(rename = "nodeName", default)]
    pub node_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,
    // IP of the node the pod runs on, reported by rkl
    #[serde(rename = "hostIP", default)]
    pub host_ip: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PodTask {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    #[serde(rename = "kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

impl PodTask {
    pub fn new(metadata: ObjectMeta) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            metadata,
            spec: PodSpec::default(),
            status: PodStatus::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct VolumeSnapshotSource {
    #[serde(rename = "persistentVolumeClaimName")]
    pub persistent_volume_claim_name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct VolumeSnapshotSpec {
    pub source: VolumeSnapshotSource,
    /// Empty means the cluster default snapshot class.
    #[serde(
        rename = "volumeSnapshotClassName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub volume_snapshot_class_name: Option<String>,
}

/// Filled in by the snapshot controller once the copy has been cut.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct VolumeSnapshotStatus {
    #[serde(rename = "readyToUse", default)]
    pub ready_to_use: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct VolumeSnapshot {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    #[serde(rename = "kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: VolumeSnapshotSpec,
    #[serde(default)]
    pub status: Option<VolumeSnapshotStatus>,
}

impl VolumeSnapshot {
    pub fn new(metadata: ObjectMeta, spec: VolumeSnapshotSpec) -> Self {
        Self {
            api_version: "snapshot.storage.k8s.io/v1".to_string(),
            kind: "VolumeSnapshot".to_string(),
            metadata,
            spec,
            status: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.ready_to_use)
    }
}
