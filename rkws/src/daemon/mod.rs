pub mod server;

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use common::PodTask;
use log::{debug, warn};
use quinn::Endpoint;
use serde::{Deserialize, Serialize};

use crate::config::DaemonConfig;
use crate::error::{DaemonError, WsError};
use crate::tls::insecure_client_config;

pub use server::{DaemonServer, WorkspaceDaemon};

/// Upper bound for a single daemon message.
pub(crate) const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Messages exchanged with a node daemon, one request and one response per
/// bi-directional stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DaemonMessage {
    //request
    TakeSnapshot { id: String, return_immediately: bool },
    BackupWorkspace { id: String },

    //response
    SnapshotTaken { url: String },
    BackupTaken { url: String },
    Error(DaemonError),
}

#[async_trait]
pub trait DaemonConnection: Send + Sync {
    async fn take_snapshot(
        &self,
        workspace_id: &str,
        return_immediately: bool,
    ) -> Result<String, WsError>;

    async fn backup(&self, workspace_id: &str) -> Result<String, WsError>;
}

/// Opens connections to the daemon on the node running `pod`. One
/// connection per operation, never pooled.
#[async_trait]
pub trait DaemonConnector: Send + Sync {
    async fn connect(&self, pod: &PodTask) -> Result<Box<dyn DaemonConnection>, WsError>;
}

pub struct QuicDaemonConnector {
    endpoint: Endpoint,
    port: u16,
    server_name: String,
    connect_timeout: Duration,
}

impl QuicDaemonConnector {
    pub fn new(cfg: &DaemonConfig) -> anyhow::Result<Self> {
        let mut endpoint = Endpoint::client("0.0.0.0:0".parse()?)?;
        endpoint.set_default_client_config(insecure_client_config()?);
        Ok(Self {
            endpoint,
            port: cfg.port,
            server_name: cfg.server_name.clone(),
            connect_timeout: cfg.connect_timeout(),
        })
    }

    fn daemon_addr(&self, pod: &PodTask) -> Result<SocketAddr, WsError> {
        let host_ip = pod
            .status
            .host_ip
            .as_deref()
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| {
                WsError::Unavailable(format!(
                    "pod {} is not running on a node yet",
                    pod.metadata.name
                ))
            })?;
        let ip = host_ip.parse().map_err(|e| {
            WsError::Unavailable(format!("invalid host IP {host_ip} for workspace pod: {e}"))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[async_trait]
impl DaemonConnector for QuicDaemonConnector {
    async fn connect(&self, pod: &PodTask) -> Result<Box<dyn DaemonConnection>, WsError> {
        let addr = self.daemon_addr(pod)?;
        let connecting = self
            .endpoint
            .connect(addr, &self.server_name)
            .map_err(|e| WsError::Unavailable(format!("cannot connect to workspace daemon: {e}")))?;

        let connection = match tokio::time::timeout(self.connect_timeout, connecting).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                return Err(WsError::Unavailable(format!(
                    "cannot connect to workspace daemon: {e}"
                )));
            }
            Err(_) => {
                return Err(WsError::Unavailable(format!(
                    "cannot connect to workspace daemon at {addr}: timed out"
                )));
            }
        };
        debug!("[daemon] connected to {addr} for pod {}", pod.metadata.name);
        Ok(Box::new(QuicDaemonConnection { connection }))
    }
}

pub struct QuicDaemonConnection {
    connection: quinn::Connection,
}

impl QuicDaemonConnection {
    async fn request(&self, msg: &DaemonMessage) -> Result<DaemonMessage, WsError> {
        let (mut send, mut recv) = self.connection.open_bi().await.map_err(unavailable)?;
        let payload = bincode::serialize(msg).map_err(unavailable)?;
        send.write_all(&payload).await.map_err(unavailable)?;
        send.finish().map_err(unavailable)?;

        let buf = recv
            .read_to_end(MAX_MESSAGE_SIZE)
            .await
            .map_err(unavailable)?;
        bincode::deserialize(&buf).map_err(unavailable)
    }
}

impl Drop for QuicDaemonConnection {
    fn drop(&mut self) {
        self.connection.close(quinn::VarInt::from_u32(0), b"done");
    }
}

fn unavailable<E: std::fmt::Display>(e: E) -> WsError {
    WsError::Unavailable(format!("workspace daemon request failed: {e}"))
}

fn unexpected(response: DaemonMessage) -> WsError {
    warn!("[daemon] unexpected response: {response:?}");
    WsError::Unavailable("unexpected response from workspace daemon".to_string())
}

#[async_trait]
impl DaemonConnection for QuicDaemonConnection {
    async fn take_snapshot(
        &self,
        workspace_id: &str,
        return_immediately: bool,
    ) -> Result<String, WsError> {
        let msg = DaemonMessage::TakeSnapshot {
            id: workspace_id.to_string(),
            return_immediately,
        };
        match self.request(&msg).await? {
            DaemonMessage::SnapshotTaken { url } => Ok(url),
            DaemonMessage::Error(e) => Err(WsError::Remote(e)),
            other => Err(unexpected(other)),
        }
    }

    async fn backup(&self, workspace_id: &str) -> Result<String, WsError> {
        let msg = DaemonMessage::BackupWorkspace {
            id: workspace_id.to_string(),
        };
        match self.request(&msg).await? {
            DaemonMessage::BackupTaken { url } => Ok(url),
            DaemonMessage::Error(e) => Err(WsError::Remote(e)),
            other => Err(unexpected(other)),
        }
    }
}
