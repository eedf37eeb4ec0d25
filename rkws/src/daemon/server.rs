use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use quinn::{Connection, Endpoint, RecvStream, SendStream};

use super::{DaemonMessage, MAX_MESSAGE_SIZE};
use crate::error::{Code, DaemonError};
use crate::tls::self_signed_server_config;

/// Node side of the daemon contract. The backup machinery itself lives with
/// the node daemon; [`DaemonServer`] only decodes requests and hands them over.
#[async_trait]
pub trait WorkspaceDaemon: Send + Sync {
    /// Back up the workspace content and return the location of the backup.
    /// With `return_immediately` the daemon may answer before the upload
    /// has finished.
    async fn take_snapshot(
        &self,
        workspace_id: &str,
        return_immediately: bool,
    ) -> Result<String, DaemonError>;

    async fn backup_workspace(&self, workspace_id: &str) -> Result<String, DaemonError>;
}

pub struct DaemonServer<T> {
    endpoint: Endpoint,
    handler: Arc<T>,
}

impl<T> DaemonServer<T>
where
    T: WorkspaceDaemon + 'static,
{
    pub fn new(addr: SocketAddr, handler: Arc<T>) -> Result<Self> {
        let endpoint = Endpoint::server(self_signed_server_config()?, addr)?;
        info!("[daemon] listening on {}", endpoint.local_addr()?);
        Ok(Self { endpoint, handler })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Accept connections until the endpoint is closed.
    pub async fn serve(&self) -> Result<()> {
        while let Some(incoming) = self.endpoint.accept().await {
            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => {
                        let remote = conn.remote_address();
                        debug!("[daemon] connection accepted: addr={remote}");
                        if let Err(e) = handle_connection(conn, handler).await {
                            warn!("[daemon] connection {remote} error: {e}");
                        }
                    }
                    Err(e) => warn!("[daemon] failed to establish connection: {e}"),
                }
            });
        }
        Ok(())
    }
}

async fn handle_connection<T: WorkspaceDaemon + 'static>(
    conn: Connection,
    handler: Arc<T>,
) -> Result<()> {
    loop {
        let (send, recv) = match conn.accept_bi().await {
            Ok(stream) => stream,
            Err(quinn::ConnectionError::ApplicationClosed(_))
            | Err(quinn::ConnectionError::LocallyClosed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            if let Err(e) = handle_stream(send, recv, handler.as_ref()).await {
                warn!("[daemon] stream error: {e}");
            }
        });
    }
}

async fn handle_stream<T: WorkspaceDaemon>(
    mut send: SendStream,
    mut recv: RecvStream,
    handler: &T,
) -> Result<()> {
    let buf = recv.read_to_end(MAX_MESSAGE_SIZE).await?;
    let response = match bincode::deserialize::<DaemonMessage>(&buf) {
        Ok(request) => dispatch(handler, request).await,
        Err(e) => DaemonMessage::Error(DaemonError::new(
            Code::InvalidArgument,
            format!("malformed request: {e}"),
        )),
    };

    let payload = bincode::serialize(&response)?;
    send.write_all(&payload).await?;
    send.finish()?;
    Ok(())
}

async fn dispatch<T: WorkspaceDaemon>(handler: &T, request: DaemonMessage) -> DaemonMessage {
    match request {
        DaemonMessage::TakeSnapshot {
            id,
            return_immediately,
        } => {
            debug!("[daemon] TakeSnapshot for workspace {id}");
            match handler.take_snapshot(&id, return_immediately).await {
                Ok(url) => DaemonMessage::SnapshotTaken { url },
                Err(e) => DaemonMessage::Error(e),
            }
        }
        DaemonMessage::BackupWorkspace { id } => {
            debug!("[daemon] BackupWorkspace for workspace {id}");
            match handler.backup_workspace(&id).await {
                Ok(url) => DaemonMessage::BackupTaken { url },
                Err(e) => DaemonMessage::Error(e),
            }
        }
        other => {
            warn!("[daemon] unexpected message received as request: {other:?}");
            DaemonMessage::Error(DaemonError::new(
                Code::InvalidArgument,
                "unexpected message",
            ))
        }
    }
}
