//! QUIC control-plane API.
//!
//! Every request travels on its own bi-directional stream as
//! length-delimited bincode frames. Unary requests get exactly one
//! response frame. A `Subscribe` request is acknowledged with `Ack` once
//! the watch is in place and then receives `Status` frames until the client
//! finishes its send side or stops reading.

pub mod client;
pub mod server;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::error::WsError;
use crate::manager::WorkspaceStatusEvent;
use crate::snapshot::{SnapshotResult, VolumeSnapshotInfo};

pub use client::{ManagerClient, StatusSubscription};
pub use server::{make_server_endpoint, serve, serve_endpoint};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagerRequest {
    TakeSnapshot {
        workspace_id: String,
        return_immediately: bool,
    },
    GetVolumeSnapshot {
        snapshot_id: String,
    },
    ControlAdmission {
        workspace_id: String,
        level: String,
    },
    SetTimeout {
        workspace_id: String,
        duration: String,
    },
    BackupWorkspace {
        workspace_id: String,
    },
    /// `None` or an empty id subscribes to every workspace.
    Subscribe {
        workspace_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagerResponse {
    Snapshot(SnapshotResult),
    VolumeSnapshot(VolumeSnapshotInfo),
    Backup { url: String },
    Ack,
    Status(WorkspaceStatusEvent),
    Error(WsError),
}

impl ManagerRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ManagerRequest::TakeSnapshot { .. } => "TakeSnapshot",
            ManagerRequest::GetVolumeSnapshot { .. } => "GetVolumeSnapshot",
            ManagerRequest::ControlAdmission { .. } => "ControlAdmission",
            ManagerRequest::SetTimeout { .. } => "SetTimeout",
            ManagerRequest::BackupWorkspace { .. } => "BackupWorkspace",
            ManagerRequest::Subscribe { .. } => "Subscribe",
        }
    }
}

pub(crate) fn encode<T: Serialize>(msg: &T) -> bincode::Result<Bytes> {
    bincode::serialize(msg).map(Bytes::from)
}

pub(crate) fn decode<T: DeserializeOwned>(frame: &[u8]) -> bincode::Result<T> {
    bincode::deserialize(frame)
}
