//! Remote transport port.
//!
//! The remote authority is abstracted behind [`RemoteTransport`]: push one
//! record, or pull the records updated since a timestamp. Wire format and
//! HTTP details live behind the implementation; every failure mode
//! (unreachable network, rejection, timeout, malformed response) surfaces
//! as [`TillError::Network`] and is treated uniformly as retryable by the
//! queue and sync layers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::TillResult;
use crate::types::{Collection, Record};

/// Port to the remote authority.
pub trait RemoteTransport: Send + Sync {
    /// Deliver one record to the remote authority (upsert by id).
    fn push(
        &self,
        collection: Collection,
        record: &Record,
    ) -> impl Future<Output = TillResult<()>> + Send;

    /// Fetch the records of a collection updated strictly after `since`.
    fn pull(
        &self,
        collection: Collection,
        since: i64,
    ) -> impl Future<Output = TillResult<Vec<Record>>> + Send;
}

impl<T: RemoteTransport> RemoteTransport for Arc<T> {
    fn push(
        &self,
        collection: Collection,
        record: &Record,
    ) -> impl Future<Output = TillResult<()>> + Send {
        (**self).push(collection, record)
    }

    fn pull(
        &self,
        collection: Collection,
        since: i64,
    ) -> impl Future<Output = TillResult<Vec<Record>>> + Send {
        (**self).pull(collection, since)
    }
}

/// In-process transport backed by a HashMap.
///
/// Stands in for the remote authority in the CLI and in tests. Pushes
/// apply last-write-wins the way the real authority does: an incoming
/// record replaces the stored one only when its `updated_at` is strictly
/// newer (the remote stays authoritative on ties). Pulls filter on
/// `updated_at`.
#[derive(Default)]
pub struct MemoryTransport {
    records: Mutex<HashMap<Collection, HashMap<String, Record>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a record on the remote side directly (simulates an update
    /// made by another client).
    pub fn seed(&self, collection: Collection, record: Record) {
        self.records
            .lock()
            .entry(collection)
            .or_default()
            .insert(record.id.clone(), record);
    }

    /// Remote-side view of a single record.
    pub fn get(&self, collection: Collection, id: &str) -> Option<Record> {
        self.records
            .lock()
            .get(&collection)
            .and_then(|m| m.get(id))
            .cloned()
    }

    /// Remote-side view of a whole collection.
    pub fn records(&self, collection: Collection) -> Vec<Record> {
        self.records
            .lock()
            .get(&collection)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of records the remote holds for a collection.
    pub fn count(&self, collection: Collection) -> usize {
        self.records
            .lock()
            .get(&collection)
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

impl RemoteTransport for MemoryTransport {
    async fn push(&self, collection: Collection, record: &Record) -> TillResult<()> {
        let mut records = self.records.lock();
        let stored = records.entry(collection).or_default();
        match stored.get(&record.id) {
            Some(existing) if existing.updated_at >= record.updated_at => {}
            _ => {
                stored.insert(record.id.clone(), record.clone());
            }
        }
        Ok(())
    }

    async fn pull(&self, collection: Collection, since: i64) -> TillResult<Vec<Record>> {
        Ok(self
            .records
            .lock()
            .get(&collection)
            .map(|m| {
                m.values()
                    .filter(|r| r.updated_at > since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_upserts_by_id() {
        let transport = MemoryTransport::new();
        let mut record = Record::new("o1");
        record.updated_at = 10;

        transport.push(Collection::Orders, &record).await.unwrap();
        record.updated_at = 20;
        transport.push(Collection::Orders, &record).await.unwrap();

        assert_eq!(transport.count(Collection::Orders), 1);
        assert_eq!(transport.get(Collection::Orders, "o1").unwrap().updated_at, 20);
    }

    #[tokio::test]
    async fn test_stale_push_does_not_clobber_newer_remote() {
        let transport = MemoryTransport::new();
        let mut record = Record::new("o1");
        record.updated_at = 20;
        transport.seed(Collection::Orders, record.clone());

        record.updated_at = 10;
        transport.push(Collection::Orders, &record).await.unwrap();

        assert_eq!(transport.get(Collection::Orders, "o1").unwrap().updated_at, 20);
    }

    #[tokio::test]
    async fn test_pull_filters_on_timestamp() {
        let transport = MemoryTransport::new();
        let mut old = Record::new("a");
        old.updated_at = 5;
        let mut new = Record::new("b");
        new.updated_at = 15;
        transport.seed(Collection::Products, old);
        transport.seed(Collection::Products, new);

        let pulled = transport.pull(Collection::Products, 10).await.unwrap();
        assert_eq!(pulled.len(), 1);
        assert_eq!(pulled[0].id, "b");

        // Boundary: records at exactly `since` are not re-delivered
        let pulled = transport.pull(Collection::Products, 15).await.unwrap();
        assert!(pulled.is_empty());
    }

    #[tokio::test]
    async fn test_pull_unknown_collection_is_empty() {
        let transport = MemoryTransport::new();
        let pulled = transport.pull(Collection::Orders, 0).await.unwrap();
        assert!(pulled.is_empty());
    }
}
