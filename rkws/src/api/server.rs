use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use quinn::{Connection, Endpoint, RecvStream, SendStream};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use super::{ManagerRequest, ManagerResponse, decode, encode};
use crate::error::WsError;
use crate::manager::Manager;
use crate::tls::self_signed_server_config;

type Reader = FramedRead<RecvStream, LengthDelimitedCodec>;
type Writer = FramedWrite<SendStream, LengthDelimitedCodec>;

/// Serve the manager API on `addr` until `cancel` fires.
pub async fn serve(addr: String, manager: Arc<Manager>, cancel: CancellationToken) -> Result<()> {
    let endpoint = make_server_endpoint(addr.parse()?)?;
    info!("[server] listening on {}", endpoint.local_addr()?);
    serve_endpoint(endpoint, manager, cancel).await
}

/// creates a QUIC server endpoint with a self-signed certificate
pub fn make_server_endpoint(bind_addr: SocketAddr) -> Result<Endpoint> {
    let server_config = self_signed_server_config()?;
    let endpoint = Endpoint::server(server_config, bind_addr)?;
    Ok(endpoint)
}

pub async fn serve_endpoint(
    endpoint: Endpoint,
    manager: Arc<Manager>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let incoming = tokio::select! {
            _ = cancel.cancelled() => break,
            incoming = endpoint.accept() => incoming,
        };
        let Some(incoming) = incoming else {
            break;
        };

        let manager = manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match incoming.await {
                Ok(conn) => {
                    let remote_addr = conn.remote_address();
                    debug!("[server] connection accepted: addr={remote_addr}");
                    if let Err(e) = handle_connection(conn, manager, cancel).await {
                        warn!("[server] connection {remote_addr} error: {e}");
                    }
                }
                Err(e) => warn!("[server] failed to establish connection: {e}"),
            }
        });
    }

    endpoint.close(quinn::VarInt::from_u32(0), b"shutdown");
    info!("[server] stopped");
    Ok(())
}

async fn handle_connection(
    conn: Connection,
    manager: Arc<Manager>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let (send, recv) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            stream = conn.accept_bi() => match stream {
                Ok(stream) => stream,
                Err(quinn::ConnectionError::ApplicationClosed(_))
                | Err(quinn::ConnectionError::LocallyClosed) => return Ok(()),
                Err(e) => return Err(e.into()),
            },
        };

        let manager = manager.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(send, recv, manager, cancel).await {
                warn!("[server] stream error: {e}");
            }
        });
    }
}

async fn handle_stream(
    send: SendStream,
    recv: RecvStream,
    manager: Arc<Manager>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut reader = FramedRead::new(recv, LengthDelimitedCodec::new());
    let mut writer = FramedWrite::new(send, LengthDelimitedCodec::new());

    let Some(frame) = reader.next().await else {
        return Ok(());
    };
    let request: ManagerRequest = match decode(&frame?) {
        Ok(request) => request,
        Err(e) => {
            let err = WsError::InvalidArgument(format!("malformed request: {e}"));
            respond(&mut writer, &ManagerResponse::Error(err)).await?;
            writer.get_mut().finish()?;
            return Ok(());
        }
    };
    debug!("[server] {} request received", request.name());

    if let ManagerRequest::Subscribe { workspace_id } = request {
        return stream_status(reader, writer, &manager, workspace_id, cancel).await;
    }

    let response = tokio::select! {
        response = dispatch(&manager, request, &cancel) => response,
        _ = client_gone(&mut reader) => {
            cancel.cancel();
            debug!("[server] client went away, request cancelled");
            return Ok(());
        }
    };
    respond(&mut writer, &response).await?;
    writer.get_mut().finish()?;
    Ok(())
}

async fn dispatch(
    manager: &Manager,
    request: ManagerRequest,
    cancel: &CancellationToken,
) -> ManagerResponse {
    let result = match request {
        ManagerRequest::TakeSnapshot {
            workspace_id,
            return_immediately,
        } => manager
            .take_snapshot(&workspace_id, return_immediately, cancel)
            .await
            .map(ManagerResponse::Snapshot),
        ManagerRequest::GetVolumeSnapshot { snapshot_id } => manager
            .get_volume_snapshot(&snapshot_id, cancel)
            .await
            .map(ManagerResponse::VolumeSnapshot),
        ManagerRequest::ControlAdmission {
            workspace_id,
            level,
        } => manager
            .control_admission(&workspace_id, &level, cancel)
            .await
            .map(|_| ManagerResponse::Ack),
        ManagerRequest::SetTimeout {
            workspace_id,
            duration,
        } => manager
            .set_timeout(&workspace_id, &duration, cancel)
            .await
            .map(|_| ManagerResponse::Ack),
        ManagerRequest::BackupWorkspace { workspace_id } => manager
            .backup_workspace(&workspace_id, cancel)
            .await
            .map(|url| ManagerResponse::Backup { url }),
        ManagerRequest::Subscribe { .. } => Err(WsError::InvalidArgument(
            "subscriptions need their own stream".to_string(),
        )),
    };
    result.unwrap_or_else(ManagerResponse::Error)
}

async fn stream_status(
    mut reader: Reader,
    mut writer: Writer,
    manager: &Manager,
    workspace_id: Option<String>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut events = match manager.subscribe(workspace_id, cancel.clone()).await {
        Ok(events) => events,
        Err(e) => {
            respond(&mut writer, &ManagerResponse::Error(e)).await?;
            writer.get_mut().finish()?;
            return Ok(());
        }
    };
    respond(&mut writer, &ManagerResponse::Ack).await?;

    loop {
        tokio::select! {
            _ = client_gone(&mut reader) => break,
            event = events.recv() => match event {
                Some(Ok(event)) => {
                    if let Err(e) = respond(&mut writer, &ManagerResponse::Status(event)).await {
                        debug!("[server] subscriber stopped reading: {e}");
                        break;
                    }
                }
                Some(Err(e)) => {
                    error!("[server] status stream failed: {e}");
                    let _ = respond(&mut writer, &ManagerResponse::Error(e)).await;
                    break;
                }
                None => break,
            },
        }
    }

    // releases the store watch behind this subscription
    cancel.cancel();
    let _ = writer.get_mut().finish();
    debug!("[server] subscription closed");
    Ok(())
}

async fn respond(writer: &mut Writer, response: &ManagerResponse) -> Result<()> {
    writer.send(encode(response)?).await?;
    Ok(())
}

// Resolves once the client has finished or reset its side of the stream.
async fn client_gone(reader: &mut Reader) {
    while let Some(frame) = reader.next().await {
        if frame.is_err() {
            return;
        }
    }
}
