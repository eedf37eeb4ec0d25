use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use log::debug;
use quinn::{Connection, Endpoint, RecvStream, SendStream};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use super::{ManagerRequest, ManagerResponse, decode, encode};
use crate::error::{Result, WsError};
use crate::manager::WorkspaceStatusEvent;
use crate::snapshot::{SnapshotResult, VolumeSnapshotInfo};
use crate::tls::insecure_client_config;

type Reader = FramedRead<RecvStream, LengthDelimitedCodec>;
type Writer = FramedWrite<SendStream, LengthDelimitedCodec>;

pub struct ManagerClient {
    // kept alive for as long as the connection is in use
    _endpoint: Endpoint,
    connection: Connection,
}

impl ManagerClient {
    pub async fn connect(server_addr: SocketAddr) -> anyhow::Result<Self> {
        let mut endpoint = Endpoint::client("0.0.0.0:0".parse()?)?;
        endpoint.set_default_client_config(insecure_client_config()?);
        let connection = endpoint.connect(server_addr, "localhost")?.await?;
        debug!("[client] connected to {server_addr}");
        Ok(Self {
            _endpoint: endpoint,
            connection,
        })
    }

    pub async fn take_snapshot(
        &self,
        workspace_id: &str,
        return_immediately: bool,
    ) -> Result<SnapshotResult> {
        let request = ManagerRequest::TakeSnapshot {
            workspace_id: workspace_id.to_string(),
            return_immediately,
        };
        match self.call(request).await? {
            ManagerResponse::Snapshot(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_volume_snapshot(&self, snapshot_id: &str) -> Result<VolumeSnapshotInfo> {
        let request = ManagerRequest::GetVolumeSnapshot {
            snapshot_id: snapshot_id.to_string(),
        };
        match self.call(request).await? {
            ManagerResponse::VolumeSnapshot(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    pub async fn control_admission(&self, workspace_id: &str, level: &str) -> Result<()> {
        let request = ManagerRequest::ControlAdmission {
            workspace_id: workspace_id.to_string(),
            level: level.to_string(),
        };
        match self.call(request).await? {
            ManagerResponse::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn set_timeout(&self, workspace_id: &str, duration: &str) -> Result<()> {
        let request = ManagerRequest::SetTimeout {
            workspace_id: workspace_id.to_string(),
            duration: duration.to_string(),
        };
        match self.call(request).await? {
            ManagerResponse::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn backup_workspace(&self, workspace_id: &str) -> Result<String> {
        let request = ManagerRequest::BackupWorkspace {
            workspace_id: workspace_id.to_string(),
        };
        match self.call(request).await? {
            ManagerResponse::Backup { url } => Ok(url),
            other => Err(unexpected(other)),
        }
    }

    /// Subscribe to status events. Returns once the server has the watch in
    /// place, so no change made afterwards is missed.
    pub async fn subscribe(&self, workspace_id: Option<&str>) -> Result<StatusSubscription> {
        let request = ManagerRequest::Subscribe {
            workspace_id: workspace_id.map(str::to_string),
        };
        let (mut reader, writer) = self.open(&request).await?;
        match read_response(&mut reader).await? {
            ManagerResponse::Ack => Ok(StatusSubscription { reader, writer }),
            ManagerResponse::Error(e) => Err(e),
            other => Err(unexpected(other)),
        }
    }

    pub fn close(&self) {
        self.connection.close(quinn::VarInt::from_u32(0), b"done");
    }

    async fn open(&self, request: &ManagerRequest) -> Result<(Reader, Writer)> {
        let (send, recv) = self.connection.open_bi().await.map_err(transport)?;
        let mut writer = FramedWrite::new(send, LengthDelimitedCodec::new());
        let frame = encode(request).map_err(transport)?;
        writer.send(frame).await.map_err(transport)?;
        Ok((FramedRead::new(recv, LengthDelimitedCodec::new()), writer))
    }

    async fn call(&self, request: ManagerRequest) -> Result<ManagerResponse> {
        let (mut reader, mut writer) = self.open(&request).await?;
        let response = read_response(&mut reader).await;
        // the server treats a finished send side as the caller giving up,
        // so only finish once the answer is in
        let _ = writer.get_mut().finish();
        match response? {
            ManagerResponse::Error(e) => Err(e),
            other => Ok(other),
        }
    }
}

/// Live status stream. Dropping it, or calling [`StatusSubscription::cancel`],
/// releases the subscription on the server.
pub struct StatusSubscription {
    reader: Reader,
    writer: Writer,
}

impl StatusSubscription {
    /// Next status event; `None` once the server closed the stream.
    pub async fn next(&mut self) -> Option<Result<WorkspaceStatusEvent>> {
        let frame = match self.reader.next().await? {
            Ok(frame) => frame,
            Err(e) => return Some(Err(transport(e))),
        };
        Some(match decode(&frame) {
            Ok(ManagerResponse::Status(event)) => Ok(event),
            Ok(ManagerResponse::Error(e)) => Err(e),
            Ok(other) => Err(unexpected(other)),
            Err(e) => Err(transport(e)),
        })
    }

    pub fn cancel(mut self) {
        let _ = self.writer.get_mut().finish();
    }
}

async fn read_response(reader: &mut Reader) -> Result<ManagerResponse> {
    match reader.next().await {
        Some(Ok(frame)) => decode(&frame).map_err(transport),
        Some(Err(e)) => Err(transport(e)),
        None => Err(WsError::Unavailable(
            "server closed the stream without answering".to_string(),
        )),
    }
}

fn transport<E: std::fmt::Display>(e: E) -> WsError {
    WsError::Unavailable(format!("manager request failed: {e}"))
}

fn unexpected(response: ManagerResponse) -> WsError {
    WsError::Unavailable(format!("unexpected response from manager: {response:?}"))
}
