pub mod memory;
pub mod xline;

use std::pin::Pin;

use async_trait::async_trait;
use common::{PodTask, VolumeSnapshot};
use futures::Stream;

pub use memory::MemoryStore;
pub use xline::XlineStore;

// keyed the way rks keys them
pub const POD_PREFIX: &str = "/registry/pods/";
pub const VOLUME_SNAPSHOT_PREFIX: &str = "/registry/volumesnapshots/";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object {0} already exists")]
    AlreadyExists(String),
    #[error(transparent)]
    Xline(#[from] Box<etcd_client::Error>),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("watch stream closed: {0}")]
    WatchClosed(String),
}

impl From<etcd_client::Error> for StoreError {
    fn from(e: etcd_client::Error) -> Self {
        StoreError::Xline(Box::new(e))
    }
}

/// An object together with the revision it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub object: T,
    pub revision: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PodEvent {
    Put(PodTask),
    /// Carries the last version of the pod before it was removed.
    Deleted(PodTask),
}

pub type PodEventStream = Pin<Box<dyn Stream<Item = Result<PodEvent, StoreError>> + Send>>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_pods(&self) -> Result<Vec<PodTask>, StoreError>;

    async fn get_pod(&self, name: &str) -> Result<Option<Versioned<PodTask>>, StoreError>;

    /// Write `pod` only if its key is still at `revision`.
    ///
    /// Returns `false` when another writer got there first.
    async fn update_pod(&self, pod: &PodTask, revision: i64) -> Result<bool, StoreError>;

    /// Create a volume snapshot object; fails with
    /// [`StoreError::AlreadyExists`] if the name is taken.
    async fn create_volume_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<(), StoreError>;

    async fn get_volume_snapshot(&self, name: &str)
    -> Result<Option<VolumeSnapshot>, StoreError>;

    /// Subscribe to pod changes made after this call. Dropping the stream
    /// cancels the underlying watch.
    async fn watch_pods(&self) -> Result<PodEventStream, StoreError>;
}

pub(crate) fn pod_key(name: &str) -> String {
    format!("{POD_PREFIX}{name}")
}

pub(crate) fn volume_snapshot_key(name: &str) -> String {
    format!("{VOLUME_SNAPSHOT_PREFIX}{name}")
}
