//! Bidirectional reconciliation against the remote authority.
//!
//! A sync pass for one collection:
//!
//! 1. Scan the local collection for records updated after the stored
//!    watermark and push each one to the remote.
//! 2. Pull the records the remote has updated since the same watermark.
//! 3. Reconcile per record with last-write-wins on `updated_at`: the
//!    remote version is applied when it is as new or newer; a strictly
//!    newer local version is pushed back to correct the remote's stale
//!    view.
//! 4. Only a fully successful pass advances the watermark. Any failure
//!    aborts the pass with the watermark untouched, so the next pass
//!    retries from the same point and no change is ever skipped.
//!
//! Conflict resolution is timestamp comparison only - no vector clocks,
//! no field merges. Callers needing stronger guarantees layer them on top.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::TillConfig;
use crate::error::TillResult;
use crate::storage::Storage;
use crate::transport::RemoteTransport;
use crate::types::{now_millis, Collection};

/// Events emitted around sync passes
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A sync pass started for the collection
    Started { collection: Collection },
    /// The pass completed; the watermark advanced to `watermark`
    Succeeded {
        collection: Collection,
        watermark: i64,
    },
    /// The pass aborted; the watermark is unchanged
    Failed {
        collection: Collection,
        message: String,
    },
}

impl SyncEvent {
    /// The collection this event belongs to
    pub fn collection(&self) -> Collection {
        match self {
            SyncEvent::Started { collection } => *collection,
            SyncEvent::Succeeded { collection, .. } => *collection,
            SyncEvent::Failed { collection, .. } => *collection,
        }
    }
}

struct Inner<T> {
    storage: Storage,
    transport: T,
    event_tx: broadcast::Sender<SyncEvent>,
}

/// Reconciles named collections between the local store and the remote
/// authority using per-record timestamps.
pub struct SyncEngine<T: RemoteTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: RemoteTransport> Clone for SyncEngine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: RemoteTransport> SyncEngine<T> {
    pub fn new(storage: Storage, transport: T, config: &TillConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity);
        Self {
            inner: Arc::new(Inner {
                storage,
                transport,
                event_tx,
            }),
        }
    }

    /// Subscribe to sync lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Run one reconciliation pass for a collection.
    ///
    /// Emits `Started`, then `Succeeded` or `Failed`. The error behind a
    /// `Failed` event is also returned to the caller.
    pub async fn sync_collection(&self, collection: Collection) -> TillResult<()> {
        let _ = self.inner.event_tx.send(SyncEvent::Started { collection });

        match self.run_pass(collection).await {
            Ok(watermark) => {
                info!(%collection, watermark, "sync pass completed");
                let _ = self.inner.event_tx.send(SyncEvent::Succeeded {
                    collection,
                    watermark,
                });
                Ok(())
            }
            Err(err) => {
                warn!(%collection, %err, "sync pass aborted");
                let _ = self.inner.event_tx.send(SyncEvent::Failed {
                    collection,
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn run_pass(&self, collection: Collection) -> TillResult<i64> {
        let since = self.inner.storage.watermark(collection)?;

        // 1. Local changes since the watermark, pushed one request each.
        let local_changes: Vec<_> = self
            .inner
            .storage
            .get_all(collection)?
            .into_iter()
            .filter(|record| record.updated_at > since)
            .collect();
        debug!(%collection, since, changed = local_changes.len(), "pushing local changes");
        for record in &local_changes {
            self.inner.transport.push(collection, record).await?;
        }

        // 2. Remote changes since the same watermark.
        let pulled = self.inner.transport.pull(collection, since).await?;
        debug!(%collection, pulled = pulled.len(), "reconciling remote changes");

        // 3. Last-write-wins per record.
        for remote in pulled {
            match self.inner.storage.get(collection, &remote.id)? {
                Some(local) if local.updated_at > remote.updated_at => {
                    // The remote holds a stale view of this record.
                    debug!(%collection, id = %local.id, "local newer, correcting remote");
                    self.inner.transport.push(collection, &local).await?;
                }
                _ => {
                    // Absent locally, or remote is as new or newer.
                    self.inner.storage.put(collection, &remote)?;
                }
            }
        }

        let now = now_millis();
        self.inner.storage.set_watermark(collection, now)?;
        Ok(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TillError;
    use crate::transport::MemoryTransport;
    use crate::types::Record;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    fn create_test_engine() -> (SyncEngine<Arc<MemoryTransport>>, Storage, Arc<MemoryTransport>, TempDir)
    {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path().join("test.redb")).unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let engine = SyncEngine::new(storage.clone(), transport.clone(), &TillConfig::default());
        (engine, storage, transport, temp_dir)
    }

    fn record_at(id: &str, updated_at: i64, note: &str) -> Record {
        let mut record = Record::new(id).with_field("note", json!(note));
        record.updated_at = updated_at;
        record
    }

    #[tokio::test]
    async fn test_uploads_local_changes() {
        let (engine, storage, transport, _temp) = create_test_engine();

        storage
            .put(Collection::Orders, &record_at("o1", now_millis(), "local"))
            .unwrap();

        engine.sync_collection(Collection::Orders).await.unwrap();

        assert!(transport.get(Collection::Orders, "o1").is_some());
        assert!(storage.watermark(Collection::Orders).unwrap() > 0);
    }

    #[tokio::test]
    async fn test_downloads_remote_updates() {
        let (engine, storage, transport, _temp) = create_test_engine();

        transport.seed(Collection::Orders, record_at("o2", now_millis(), "remote"));

        engine.sync_collection(Collection::Orders).await.unwrap();

        assert!(storage.get(Collection::Orders, "o2").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_records_are_not_reuploaded() {
        let (engine, storage, transport, _temp) = create_test_engine();

        storage
            .put(Collection::Orders, &record_at("o1", now_millis(), "synced"))
            .unwrap();
        engine.sync_collection(Collection::Orders).await.unwrap();
        assert_eq!(transport.count(Collection::Orders), 1);

        // Nothing changed locally; the next pass pushes nothing new.
        engine.sync_collection(Collection::Orders).await.unwrap();
        assert_eq!(transport.count(Collection::Orders), 1);
    }

    #[tokio::test]
    async fn test_remote_newer_wins() {
        let (engine, storage, transport, _temp) = create_test_engine();

        storage
            .put(Collection::Orders, &record_at("o1", 100, "old local"))
            .unwrap();
        transport.seed(Collection::Orders, record_at("o1", 200, "new remote"));

        engine.sync_collection(Collection::Orders).await.unwrap();

        let stored = storage.get(Collection::Orders, "o1").unwrap().unwrap();
        assert_eq!(stored.updated_at, 200);
        assert_eq!(stored.field("note"), Some(&json!("new remote")));
    }

    #[tokio::test]
    async fn test_local_newer_corrects_remote() {
        // A transport whose pull reports a view older than what the local
        // store holds (the server missed an earlier upload). Pushes are
        // recorded but never change what pull returns.
        struct StaleRemote {
            pushes: parking_lot::Mutex<Vec<Record>>,
        }

        impl RemoteTransport for StaleRemote {
            async fn push(&self, _c: Collection, record: &Record) -> TillResult<()> {
                self.pushes.lock().push(record.clone());
                Ok(())
            }
            async fn pull(&self, _c: Collection, _s: i64) -> TillResult<Vec<Record>> {
                Ok(vec![record_at("o1", 100, "stale remote")])
            }
        }

        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path().join("test.redb")).unwrap();
        let transport = Arc::new(StaleRemote {
            pushes: parking_lot::Mutex::new(Vec::new()),
        });
        let engine = SyncEngine::new(storage.clone(), transport.clone(), &TillConfig::default());

        // Watermark past the local record so the push phase skips it; only
        // the reconciliation step may touch it.
        storage.set_watermark(Collection::Orders, 250).unwrap();
        storage
            .put(Collection::Orders, &record_at("o1", 200, "new local"))
            .unwrap();

        engine.sync_collection(Collection::Orders).await.unwrap();

        // Local copy untouched; the newer local version was pushed back.
        let stored = storage.get(Collection::Orders, "o1").unwrap().unwrap();
        assert_eq!(stored.updated_at, 200);
        assert_eq!(stored.field("note"), Some(&json!("new local")));

        let pushes = transport.pushes.lock();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].updated_at, 200);
    }

    #[tokio::test]
    async fn test_lww_keeps_larger_timestamp_on_both_sides() {
        let (engine, storage, transport, _temp) = create_test_engine();

        storage
            .put(Collection::Orders, &record_at("o1", 500, "local wins"))
            .unwrap();
        transport.seed(Collection::Orders, record_at("o1", 100, "remote loses"));

        engine.sync_collection(Collection::Orders).await.unwrap();

        let stored = storage.get(Collection::Orders, "o1").unwrap().unwrap();
        let remote = transport.get(Collection::Orders, "o1").unwrap();
        assert_eq!(stored.updated_at, 500);
        assert_eq!(remote.updated_at, 500);
        assert_eq!(remote.field("note"), Some(&json!("local wins")));
    }

    #[tokio::test]
    async fn test_equal_timestamps_apply_remote() {
        let (engine, storage, transport, _temp) = create_test_engine();

        storage
            .put(Collection::Orders, &record_at("o1", 100, "local"))
            .unwrap();
        transport.seed(Collection::Orders, record_at("o1", 100, "remote"));

        engine.sync_collection(Collection::Orders).await.unwrap();

        let stored = storage.get(Collection::Orders, "o1").unwrap().unwrap();
        assert_eq!(stored.field("note"), Some(&json!("remote")));
    }

    #[tokio::test]
    async fn test_failed_pass_leaves_watermark_untouched() {
        struct BrokenTransport;

        impl RemoteTransport for BrokenTransport {
            async fn push(&self, _c: Collection, _r: &Record) -> TillResult<()> {
                Err(TillError::Network("connection reset".to_string()))
            }
            async fn pull(&self, _c: Collection, _s: i64) -> TillResult<Vec<Record>> {
                Err(TillError::Network("connection reset".to_string()))
            }
        }

        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path().join("test.redb")).unwrap();
        let engine = SyncEngine::new(storage.clone(), BrokenTransport, &TillConfig::default());

        storage
            .put(Collection::Orders, &record_at("o1", now_millis(), "unsynced"))
            .unwrap();

        let mut events = engine.subscribe();
        let result = engine.sync_collection(Collection::Orders).await;

        assert!(matches!(result, Err(TillError::Network(_))));
        assert_eq!(storage.watermark(Collection::Orders).unwrap(), 0);
        assert!(matches!(
            events.recv().await.unwrap(),
            SyncEvent::Started { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            SyncEvent::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_emits_start_and_success_events() {
        let (engine, _storage, _transport, _temp) = create_test_engine();

        let mut events = engine.subscribe();
        engine.sync_collection(Collection::Products).await.unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            SyncEvent::Started {
                collection: Collection::Products
            }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            SyncEvent::Succeeded {
                collection: Collection::Products,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_pull_failure_after_push_keeps_changes_for_next_pass() {
        struct PullBroken {
            pushed: AtomicBool,
        }

        impl RemoteTransport for PullBroken {
            async fn push(&self, _c: Collection, _r: &Record) -> TillResult<()> {
                self.pushed.store(true, Ordering::SeqCst);
                Ok(())
            }
            async fn pull(&self, _c: Collection, _s: i64) -> TillResult<Vec<Record>> {
                Err(TillError::Network("timeout".to_string()))
            }
        }

        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path().join("test.redb")).unwrap();
        let transport = Arc::new(PullBroken {
            pushed: AtomicBool::new(false),
        });
        let engine = SyncEngine::new(storage.clone(), transport.clone(), &TillConfig::default());

        storage
            .put(Collection::Orders, &record_at("o1", now_millis(), "pending"))
            .unwrap();

        assert!(engine.sync_collection(Collection::Orders).await.is_err());
        assert!(transport.pushed.load(Ordering::SeqCst));
        // Watermark unchanged: the record counts as a local change again
        // next pass, so the interrupted sync loses nothing.
        assert_eq!(storage.watermark(Collection::Orders).unwrap(), 0);
    }

    proptest! {
        #[test]
        fn prop_lww_stored_timestamp_is_max(t_local in 0i64..1_000_000, t_remote in 0i64..1_000_000) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let temp_dir = TempDir::new().unwrap();
                let storage = Storage::new(temp_dir.path().join("test.redb")).unwrap();
                let transport = Arc::new(MemoryTransport::new());
                let engine =
                    SyncEngine::new(storage.clone(), transport.clone(), &TillConfig::default());

                storage
                    .put(Collection::Orders, &record_at("o1", t_local, "local"))
                    .unwrap();
                transport.seed(Collection::Orders, record_at("o1", t_remote, "remote"));

                engine.sync_collection(Collection::Orders).await.unwrap();

                let stored = storage.get(Collection::Orders, "o1").unwrap().unwrap();
                assert_eq!(stored.updated_at, t_local.max(t_remote));
            });
        }
    }
}
