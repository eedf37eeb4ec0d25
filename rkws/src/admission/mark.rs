use std::collections::HashMap;

use log::{debug, warn};

use crate::store::{ObjectStore, StoreError};

/// Annotation set on a workspace pod. Marks only ever add or overwrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mark {
    pub key: String,
    pub value: String,
}

impl Mark {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MarkError {
    #[error("pod {0} does not exist")]
    NotFound(String),
    #[error("write conflict on pod {pod} after {attempts} attempts")]
    Conflict { pod: String, attempts: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Merge `marks` into the annotations of `pod_name`, writing back only if
/// the pod did not change since it was read. Lost races are retried from a
/// fresh read.
///
/// Returns `false` when the annotations already had the requested values
/// and nothing was written.
pub async fn mark_workspace(
    store: &dyn ObjectStore,
    pod_name: &str,
    marks: &[Mark],
    max_attempts: u32,
) -> Result<bool, MarkError> {
    let max_attempts = max_attempts.max(1);

    for attempt in 1..=max_attempts {
        let Some(current) = store.get_pod(pod_name).await? else {
            return Err(MarkError::NotFound(pod_name.to_string()));
        };

        let mut pod = current.object;
        if !apply(&mut pod.metadata.annotations, marks) {
            debug!("[mark] pod {pod_name} already carries the requested annotations");
            return Ok(false);
        }

        if store.update_pod(&pod, current.revision).await? {
            debug!("[mark] updated annotations of pod {pod_name}");
            return Ok(true);
        }
        warn!("[mark] write conflict on pod {pod_name} (attempt {attempt}/{max_attempts})");
    }

    Err(MarkError::Conflict {
        pod: pod_name.to_string(),
        attempts: max_attempts,
    })
}

// Returns whether anything changed.
fn apply(annotations: &mut HashMap<String, String>, marks: &[Mark]) -> bool {
    let mut changed = false;
    for Mark { key, value } in marks {
        if annotations.get(key) != Some(value) {
            annotations.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use common::{ObjectMeta, PodTask};

    async fn store_with_pod(name: &str) -> MemoryStore {
        let store = MemoryStore::new();
        let mut meta = ObjectMeta::named(name);
        meta.annotations
            .insert("keep".to_string(), "me".to_string());
        store.insert_pod(PodTask::new(meta)).await;
        store
    }

    #[tokio::test]
    async fn merges_without_touching_other_annotations() {
        let store = store_with_pod("ws-a").await;
        let changed = mark_workspace(&store, "ws-a", &[Mark::new("k", "v")], 5)
            .await
            .unwrap();
        assert!(changed);

        let pod = store.pod("ws-a").await.unwrap();
        assert_eq!(pod.metadata.annotations["k"], "v");
        assert_eq!(pod.metadata.annotations["keep"], "me");
    }

    #[tokio::test]
    async fn unchanged_values_are_not_written() {
        let store = store_with_pod("ws-a").await;
        mark_workspace(&store, "ws-a", &[Mark::new("k", "v")], 5)
            .await
            .unwrap();
        let changed = mark_workspace(&store, "ws-a", &[Mark::new("k", "v")], 5)
            .await
            .unwrap();
        assert!(!changed);
        assert_eq!(store.pod_writes().await, 1);

        let changed = mark_workspace(&store, "ws-a", &[Mark::new("k", "w")], 5)
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(store.pod("ws-a").await.unwrap().metadata.annotations["k"], "w");
    }

    #[tokio::test]
    async fn mark_reads_the_pod_directly() {
        let store = store_with_pod("ws-a").await;
        mark_workspace(&store, "ws-a", &[Mark::new("k", "v")], 5)
            .await
            .unwrap();
        assert_eq!(store.pod_lists().await, 0);
    }

    #[tokio::test]
    async fn conflicts_are_retried() {
        let store = store_with_pod("ws-a").await;
        store.force_conflicts(2).await;
        let changed = mark_workspace(&store, "ws-a", &[Mark::new("k", "v")], 3)
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(store.pod_writes().await, 1);
    }

    #[tokio::test]
    async fn persistent_conflicts_give_up() {
        let store = store_with_pod("ws-a").await;
        store.force_conflicts(10).await;
        let err = mark_workspace(&store, "ws-a", &[Mark::new("k", "v")], 3)
            .await
            .unwrap_err();
        assert!(matches!(err, MarkError::Conflict { attempts: 3, .. }));
        assert_eq!(store.pod_writes().await, 0);
    }

    #[tokio::test]
    async fn vanished_pod_is_not_found() {
        let store = store_with_pod("ws-a").await;
        store.delete_pod("ws-a").await;
        let err = mark_workspace(&store, "ws-a", &[Mark::new("k", "v")], 3)
            .await
            .unwrap_err();
        assert!(matches!(err, MarkError::NotFound(name) if name == "ws-a"));
        assert_eq!(store.pod_writes().await, 0);
    }
}
