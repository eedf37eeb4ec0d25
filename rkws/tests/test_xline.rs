// Needs a live Xline: set TEST_CONFIG_PATH or edit tests/config.yaml, then
// run with `--ignored`.

use std::time::Duration;

use common::{ObjectMeta, PodTask, VolumeSnapshot, VolumeSnapshotSource, VolumeSnapshotSpec};
use futures::StreamExt;
use rkws::config::load_config;
use rkws::store::{ObjectStore, PodEvent, StoreError, XlineStore};
use tokio::time::timeout;

async fn load_store() -> XlineStore {
    let config_path = std::env::var("TEST_CONFIG_PATH").unwrap_or_else(|_| {
        format!(
            "{}/tests/config.yaml",
            std::env::var("CARGO_MANIFEST_DIR").unwrap()
        )
    });
    let config = load_config(&config_path).expect("Failed to load config");
    XlineStore::new(&config.xline_config)
        .await
        .expect("Failed to connect Xline")
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", chrono::Utc::now().timestamp_nanos_opt().unwrap())
}

#[tokio::test]
#[ignore = "requires a running Xline"]
async fn test_conditional_pod_update() {
    let store = load_store().await;
    let name = unique("rkws-pod");
    store.insert_pod(&PodTask::new(ObjectMeta::named(&name))).await.unwrap();

    let read = store.get_pod(&name).await.unwrap().expect("pod missing");
    let mut pod = read.object.clone();
    pod.metadata
        .annotations
        .insert("rk8s.io/admission".to_string(), "owner".to_string());

    assert!(store.update_pod(&pod, read.revision).await.unwrap());
    assert!(!store.update_pod(&pod, read.revision).await.unwrap());

    let stored = store.get_pod(&name).await.unwrap().unwrap();
    assert_eq!(stored.object.metadata.annotations["rk8s.io/admission"], "owner");
    assert!(store.list_pods().await.unwrap().iter().any(|p| p.metadata.name == name));

    store.delete_pod(&name).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running Xline"]
async fn test_volume_snapshot_create_if_absent() {
    let store = load_store().await;
    let name = unique("snapshot-rkws");
    let snapshot = VolumeSnapshot::new(
        ObjectMeta::named(&name),
        VolumeSnapshotSpec {
            source: VolumeSnapshotSource {
                persistent_volume_claim_name: "ws-rkws".to_string(),
            },
            volume_snapshot_class_name: None,
        },
    );

    store.create_volume_snapshot(&snapshot).await.unwrap();
    let err = store.create_volume_snapshot(&snapshot).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists(_)));

    let fetched = store.get_volume_snapshot(&name).await.unwrap().unwrap();
    assert_eq!(fetched, snapshot);

    store.delete_volume_snapshot(&name).await.unwrap();
    assert!(store.get_volume_snapshot(&name).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires a running Xline"]
async fn test_watch_pods_put_and_delete() {
    let store = load_store().await;
    let mut events = store.watch_pods().await.unwrap();
    let name = unique("rkws-watch");

    store.insert_pod(&PodTask::new(ObjectMeta::named(&name))).await.unwrap();
    store.delete_pod(&name).await.unwrap();

    let mut seen = Vec::new();
    while seen.len() < 2 {
        let ev = timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match ev {
            PodEvent::Put(pod) if pod.metadata.name == name => seen.push("put"),
            PodEvent::Deleted(pod) if pod.metadata.name == name => seen.push("delete"),
            _ => {}
        }
    }
    assert_eq!(seen, vec!["put", "delete"]);
}
