mod support;

use std::net::SocketAddr;
use std::time::Duration;

use common::PodPhase;
use rkws::api::{ManagerClient, make_server_endpoint, serve_endpoint};
use rkws::workspace::{ADMISSION_ANNOTATION, WorkspacePhase};
use rkws::{Code, WsError};
use support::{Harness, harness, pvc_workspace_pod, workspace_pod};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

async fn start_server(h: &Harness) -> (SocketAddr, CancellationToken) {
    let endpoint = make_server_endpoint("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = endpoint.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(serve_endpoint(endpoint, h.manager.clone(), cancel.clone()));
    (addr, cancel)
}

#[tokio::test]
async fn unary_operations_over_quic() {
    let h = harness();
    h.store.insert_pod(workspace_pod("w1", PodPhase::Running)).await;
    h.store.insert_pod(pvc_workspace_pod("p1", "default")).await;
    let (addr, _cancel) = start_server(&h).await;
    let client = ManagerClient::connect(addr).await.unwrap();

    let result = client.take_snapshot("w1", true).await.unwrap();
    assert_eq!(result.url, "backup://w1/1");

    let snapshot = client.take_snapshot("p1", true).await.unwrap();
    let info = client.get_volume_snapshot(&snapshot.url).await.unwrap();
    assert_eq!(info.id, snapshot.url);
    assert!(!info.ready);

    client.control_admission("w1", "Everyone").await.unwrap();
    let pod = h.store.pod("ws-w1").await.unwrap();
    assert_eq!(pod.metadata.annotations[ADMISSION_ANNOTATION], "everyone");

    client.set_timeout("w1", "90m").await.unwrap();
    assert_eq!(client.backup_workspace("w1").await.unwrap(), "backup://w1/full");
    client.close();
}

#[tokio::test]
async fn error_classification_survives_the_wire() {
    let h = harness();
    h.store.insert_pod(workspace_pod("w1", PodPhase::Pending)).await;
    let (addr, _cancel) = start_server(&h).await;
    let client = ManagerClient::connect(addr).await.unwrap();

    let err = client.backup_workspace("w2").await.unwrap_err();
    assert_eq!(err, WsError::NotFound("workspace w2 does not exist".to_string()));
    assert!(h.daemons.connects().is_empty());

    let err = client.control_admission("w1", "nobody").await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let err = client.set_timeout("w1", "not-a-duration").await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let err = client.take_snapshot("w1", true).await.unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);

    let err = client.get_volume_snapshot("snapshot-w1-1").await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
    assert_eq!(h.store.pod_writes().await, 0);
}

#[tokio::test]
async fn status_subscription_over_quic() {
    let h = harness();
    let (addr, _cancel) = start_server(&h).await;
    let client = ManagerClient::connect(addr).await.unwrap();

    let mut sub = client.subscribe(Some("a")).await.unwrap();
    h.store.insert_pod(workspace_pod("b", PodPhase::Running)).await;
    h.store.insert_pod(workspace_pod("a", PodPhase::Running)).await;

    let event = timeout(Duration::from_secs(5), sub.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(event.workspace_id, "a");
    assert_eq!(event.status.phase, WorkspacePhase::Running);
    sub.cancel();

    // other subscribers are unaffected by the cancelled one
    let mut all = client.subscribe(None).await.unwrap();
    h.store.delete_pod("ws-b").await;
    let event = timeout(Duration::from_secs(5), all.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(event.workspace_id, "b");
    assert_eq!(event.status.phase, WorkspacePhase::Stopped);
}

#[tokio::test]
async fn server_stops_on_cancel() {
    let h = harness();
    let endpoint = make_server_endpoint("127.0.0.1:0".parse().unwrap()).unwrap();
    let cancel = CancellationToken::new();
    let server = tokio::spawn(serve_endpoint(endpoint, h.manager.clone(), cancel.clone()));

    cancel.cancel();
    let res = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    assert!(res.is_ok());
}
