use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use common::{PodTask, VolumeSnapshot};
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, Event, EventType, GetOptions, PutOptions, Txn,
    TxnOp, WatchOptions,
};
use log::warn;
use tokio::sync::RwLock;

use super::{
    ObjectStore, POD_PREFIX, PodEvent, PodEventStream, StoreError, Versioned, pod_key,
    volume_snapshot_key,
};
use crate::config::XlineConfig;

/// like etcd, k:/registry/pods/pod_name v:yaml file of pod
/// k:/registry/volumesnapshots/snapshot_name v:yaml file of volume snapshot
#[derive(Clone)]
pub struct XlineStore {
    client: Arc<RwLock<Client>>,
}

impl XlineStore {
    pub async fn new(cfg: &XlineConfig) -> Result<Self, StoreError> {
        let options = match (&cfg.username, &cfg.password) {
            (Some(user), Some(password)) => {
                Some(ConnectOptions::new().with_user(user.clone(), password.clone()))
            }
            _ => None,
        };
        let client = Client::connect(&cfg.endpoints, options).await?;
        Ok(Self {
            client: Arc::new(RwLock::new(client)),
        })
    }

    /// Clone of the underlying client; clones share one channel, so
    /// concurrent requests do not serialize behind a lock.
    async fn client(&self) -> Client {
        self.client.read().await.clone()
    }

    pub async fn insert_pod(&self, pod: &PodTask) -> Result<(), StoreError> {
        let yaml = serde_yaml::to_string(pod)?;
        self.client()
            .await
            .put(pod_key(&pod.metadata.name), yaml, Some(PutOptions::new()))
            .await?;
        Ok(())
    }

    pub async fn delete_pod(&self, pod_name: &str) -> Result<(), StoreError> {
        self.client().await.delete(pod_key(pod_name), None).await?;
        Ok(())
    }

    pub async fn delete_volume_snapshot(&self, name: &str) -> Result<(), StoreError> {
        self.client()
            .await
            .delete(volume_snapshot_key(name), None)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for XlineStore {
    async fn list_pods(&self) -> Result<Vec<PodTask>, StoreError> {
        let resp = self
            .client()
            .await
            .get(POD_PREFIX, Some(GetOptions::new().with_prefix()))
            .await?;

        let mut pods = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match serde_yaml::from_slice::<PodTask>(kv.value()) {
                Ok(pod) => pods.push(pod),
                Err(e) => warn!(
                    "Ignoring bad pod object {}: {e}",
                    String::from_utf8_lossy(kv.key())
                ),
            }
        }
        Ok(pods)
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Versioned<PodTask>>, StoreError> {
        let resp = self.client().await.get(pod_key(name), None).await?;
        let Some(kv) = resp.kvs().first() else {
            return Ok(None);
        };
        let pod: PodTask = serde_yaml::from_slice(kv.value())?;
        Ok(Some(Versioned {
            object: pod,
            revision: kv.mod_revision(),
        }))
    }

    async fn update_pod(&self, pod: &PodTask, revision: i64) -> Result<bool, StoreError> {
        let key = pod_key(&pod.metadata.name);
        let yaml = serde_yaml::to_string(pod)?;

        let cmp = Compare::mod_revision(key.clone(), CompareOp::Equal, revision);
        let put_op = TxnOp::put(key, yaml, Some(PutOptions::new()));
        let txn = Txn::new().when([cmp]).and_then([put_op]);

        let resp = self.client().await.txn(txn).await?;
        Ok(resp.succeeded())
    }

    async fn create_volume_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<(), StoreError> {
        let key = volume_snapshot_key(&snapshot.metadata.name);
        let yaml = serde_yaml::to_string(snapshot)?;

        let cmp = Compare::version(key.clone(), CompareOp::Equal, 0);
        let put_op = TxnOp::put(key, yaml, Some(PutOptions::new()));
        let txn = Txn::new().when([cmp]).and_then([put_op]);

        let resp = self.client().await.txn(txn).await?;
        if !resp.succeeded() {
            return Err(StoreError::AlreadyExists(snapshot.metadata.name.clone()));
        }
        Ok(())
    }

    async fn get_volume_snapshot(
        &self,
        name: &str,
    ) -> Result<Option<VolumeSnapshot>, StoreError> {
        let resp = self
            .client()
            .await
            .get(volume_snapshot_key(name), None)
            .await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(serde_yaml::from_slice(kv.value())?)),
            None => Ok(None),
        }
    }

    async fn watch_pods(&self) -> Result<PodEventStream, StoreError> {
        let opts = WatchOptions::new().with_prefix().with_prev_key();
        let (watcher, stream) = self.client().await.watch(POD_PREFIX, Some(opts)).await?;

        // the watcher travels with the stream: dropping either ends the watch
        let events = futures::stream::unfold(
            (watcher, stream, VecDeque::new()),
            |(watcher, mut stream, mut pending)| async move {
                loop {
                    if let Some(ev) = pending.pop_front() {
                        return Some((Ok(ev), (watcher, stream, pending)));
                    }
                    match stream.message().await {
                        Ok(Some(resp)) => {
                            if resp.canceled() {
                                warn!("xline pod watch canceled: {}", resp.cancel_reason());
                                return None;
                            }
                            pending.extend(resp.events().iter().filter_map(decode_pod_event));
                        }
                        Ok(None) => return None,
                        Err(e) => {
                            let err = StoreError::WatchClosed(e.to_string());
                            return Some((Err(err), (watcher, stream, pending)));
                        }
                    }
                }
            },
        );
        Ok(Box::pin(events))
    }
}

fn decode_pod_event(event: &Event) -> Option<PodEvent> {
    let (kv, deleted) = match event.event_type() {
        EventType::Put => (event.kv()?, false),
        EventType::Delete => (event.prev_kv()?, true),
    };
    match serde_yaml::from_slice::<PodTask>(kv.value()) {
        Ok(pod) if deleted => Some(PodEvent::Deleted(pod)),
        Ok(pod) => Some(PodEvent::Put(pod)),
        Err(e) => {
            warn!(
                "Ignoring undecodable pod event for {}: {e}",
                String::from_utf8_lossy(kv.key())
            );
            None
        }
    }
}
