//! Bucket purge: delete every object, including abandoned large uploads

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use shroud_core::ShroudResult;
use shroud_storage::ObjectStore;
use tracing::{debug, info};

use crate::stats::{ProgressFn, SyncPhase};

const PROGRESS_EVERY: u64 = 100;

/// Delete everything in the bucket with up to `concurrency` deletes in
/// flight. Returns the number of objects deleted.
pub async fn purge_bucket(
    store: Arc<dyn ObjectStore>,
    concurrency: usize,
    progress: Option<ProgressFn>,
) -> ShroudResult<u64> {
    let mut targets = store.list_objects().await?;
    targets.extend(store.list_incomplete_large().await?);
    info!(bucket = store.bucket(), objects = targets.len(), "purging bucket");

    let mut results = stream::iter(targets)
        .map(|obj| {
            let store = store.clone();
            async move {
                match store.delete(&obj.name, &obj.id).await {
                    Ok(()) => Ok(Some(obj.name)),
                    Err(e) if e.is_not_found() => Ok(None),
                    Err(e) => Err(e),
                }
            }
        })
        .buffer_unordered(concurrency.max(1));

    let mut deleted = 0u64;
    while let Some(result) = results.next().await {
        let Some(name) = result? else { continue };
        deleted += 1;
        debug!(object = %name, "deleted");
        if deleted % PROGRESS_EVERY == 0 {
            info!(deleted, "purge progress");
            if let Some(cb) = &progress {
                cb(SyncPhase::Deleting, deleted, &name);
            }
        }
    }

    info!(bucket = store.bucket(), deleted, "purge complete");
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shroud_storage::{Fields, MemoryStore};

    #[tokio::test]
    async fn deletes_everything() {
        let store = MemoryStore::default();
        for i in 0..250 {
            store.seed(&format!("obj-{i}"), vec![0; 4], Fields::new());
        }
        store.begin_incomplete_large("pending", Fields::new());

        let deleted = purge_bucket(Arc::new(store.clone()), 8, None).await.unwrap();
        assert_eq!(deleted, 251);
        assert!(store.is_empty());
        assert!(store.incomplete_names().is_empty());
    }

    #[tokio::test]
    async fn progress_reported_every_hundred() {
        let store = MemoryStore::default();
        for i in 0..205 {
            store.seed(&format!("obj-{i}"), vec![], Fields::new());
        }
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: ProgressFn = Arc::new(move |_, n, _| sink.lock().unwrap().push(n));

        purge_bucket(Arc::new(store), 4, Some(cb)).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![100, 200]);
    }

    #[tokio::test]
    async fn empty_bucket() {
        let store = MemoryStore::default();
        assert_eq!(purge_bucket(Arc::new(store), 4, None).await.unwrap(), 0);
    }
}
