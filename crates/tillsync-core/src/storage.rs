//! Persistent local store using redb.
//!
//! This module provides ACID-compliant storage for:
//! - Keyed document collections (orders, products, print jobs)
//! - The offline write queue (durable across restarts)
//! - Per-collection sync watermarks
//!
//! All higher components go through this adapter; nothing else touches the
//! database handle. Each operation is a single redb transaction, so
//! concurrent callers never observe a partial write. After a successful
//! `put`/`delete` the registered change listeners for that collection are
//! invoked synchronously, enabling reactive consumers without polling.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use crate::error::{TillError, TillResult};
use crate::types::{Collection, Record, WriteEntry};

// Table definitions
const ORDERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("orders");
const PRODUCTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("products");
const PRINT_JOBS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("print_jobs");
const WRITE_QUEUE_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("write_queue");
const SYNC_META_TABLE: TableDefinition<&str, i64> = TableDefinition::new("sync_meta");

fn doc_table(collection: Collection) -> TableDefinition<'static, &'static str, &'static [u8]> {
    match collection {
        Collection::Orders => ORDERS_TABLE,
        Collection::Products => PRODUCTS_TABLE,
        Collection::PrintJobs => PRINT_JOBS_TABLE,
    }
}

/// Change notification delivered to listeners after a successful mutation.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    /// A record was inserted or replaced
    Put {
        collection: Collection,
        record: Record,
    },
    /// A record was removed
    Deleted { collection: Collection, id: String },
}

impl ChangeEvent {
    /// The collection this event belongs to
    pub fn collection(&self) -> Collection {
        match self {
            ChangeEvent::Put { collection, .. } => *collection,
            ChangeEvent::Deleted { collection, .. } => *collection,
        }
    }
}

type ChangeListener = Box<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
    listeners: Arc<RwLock<HashMap<Collection, Vec<ChangeListener>>>>,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file
    /// - Create all required tables
    ///
    /// Opening an existing database is a no-op for the schema, so
    /// initialization is idempotent; clones of the returned handle share
    /// one internally-serialized database.
    pub fn new(path: impl AsRef<Path>) -> TillResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(ORDERS_TABLE)?;
            let _ = write_txn.open_table(PRODUCTS_TABLE)?;
            let _ = write_txn.open_table(PRINT_JOBS_TABLE)?;
            let _ = write_txn.open_table(WRITE_QUEUE_TABLE)?;
            let _ = write_txn.open_table(SYNC_META_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
            listeners: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Document Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Load a single record by id.
    ///
    /// Returns `None` if no record with the given id exists.
    pub fn get(&self, collection: Collection, id: &str) -> TillResult<Option<Record>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(doc_table(collection))?;

        match table.get(id)? {
            Some(v) => {
                let record: Record = serde_json::from_slice(v.value())
                    .map_err(|e| TillError::Serialization(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Load all records of a collection.
    pub fn get_all(&self, collection: Collection) -> TillResult<Vec<Record>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(doc_table(collection))?;

        let mut records = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let record: Record = serde_json::from_slice(value.value())
                .map_err(|e| TillError::Serialization(e.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Upsert a record, replacing any existing record with the same id.
    ///
    /// Listeners registered for the collection are notified after the
    /// transaction commits.
    pub fn put(&self, collection: Collection, record: &Record) -> TillResult<()> {
        {
            let db = self.db.read();
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(doc_table(collection))?;
                let data = serde_json::to_vec(record)
                    .map_err(|e| TillError::Serialization(e.to_string()))?;
                table.insert(record.id.as_str(), data.as_slice())?;
            }
            write_txn.commit()?;
        }

        self.notify(&ChangeEvent::Put {
            collection,
            record: record.clone(),
        });
        Ok(())
    }

    /// Delete a record by id. Deleting an absent id is a no-op.
    pub fn delete(&self, collection: Collection, id: &str) -> TillResult<()> {
        {
            let db = self.db.read();
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(doc_table(collection))?;
                table.remove(id)?;
            }
            write_txn.commit()?;
        }

        self.notify(&ChangeEvent::Deleted {
            collection,
            id: id.to_string(),
        });
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Change Notification
    // ═══════════════════════════════════════════════════════════════════════

    /// Register a listener invoked synchronously after every successful
    /// mutation of the given collection.
    pub fn on_change(
        &self,
        collection: Collection,
        listener: impl Fn(&ChangeEvent) + Send + Sync + 'static,
    ) {
        let mut listeners = self.listeners.write();
        listeners
            .entry(collection)
            .or_default()
            .push(Box::new(listener));
    }

    fn notify(&self, event: &ChangeEvent) {
        let listeners = self.listeners.read();
        if let Some(callbacks) = listeners.get(&event.collection()) {
            for callback in callbacks {
                callback(event);
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Write Queue Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Append a write entry to the durable queue.
    ///
    /// Returns the sequence number assigned to the entry; sequence numbers
    /// preserve enqueue order across restarts.
    pub fn enqueue_write(&self, entry: &WriteEntry) -> TillResult<u64> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let seq = {
            let mut table = write_txn.open_table(WRITE_QUEUE_TABLE)?;
            let seq = match table.last()? {
                Some((key, _)) => key.value() + 1,
                None => 1,
            };
            let mut entry = entry.clone();
            entry.seq = seq;
            let data =
                serde_json::to_vec(&entry).map_err(|e| TillError::Serialization(e.to_string()))?;
            table.insert(seq, data.as_slice())?;
            seq
        };
        write_txn.commit()?;
        debug!(seq, collection = %entry.collection, "write entry persisted");
        Ok(seq)
    }

    /// Rewrite a queued entry in place (after a failed delivery attempt).
    pub fn update_queued_write(&self, entry: &WriteEntry) -> TillResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(WRITE_QUEUE_TABLE)?;
            let data =
                serde_json::to_vec(entry).map_err(|e| TillError::Serialization(e.to_string()))?;
            table.insert(entry.seq, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Remove a queued entry after successful delivery.
    pub fn delete_queued_write(&self, seq: u64) -> TillResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(WRITE_QUEUE_TABLE)?;
            table.remove(seq)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load all queued entries in enqueue order.
    pub fn load_write_queue(&self) -> TillResult<Vec<WriteEntry>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(WRITE_QUEUE_TABLE)?;

        let mut entries = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let mut parsed: WriteEntry = serde_json::from_slice(value.value())
                .map_err(|e| TillError::Serialization(e.to_string()))?;
            parsed.seq = key.value();
            entries.push(parsed);
        }
        Ok(entries)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync Watermark Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// The last timestamp through which the collection is known fully
    /// synchronized. A collection that has never synced reports 0.
    pub fn watermark(&self, collection: Collection) -> TillResult<i64> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SYNC_META_TABLE)?;

        Ok(table.get(collection.as_str())?.map(|v| v.value()).unwrap_or(0))
    }

    /// Advance the watermark for a collection.
    ///
    /// Watermarks never roll back; a timestamp at or below the stored one
    /// is ignored.
    pub fn set_watermark(&self, collection: Collection, timestamp: i64) -> TillResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SYNC_META_TABLE)?;
            let current = table.get(collection.as_str())?.map(|v| v.value()).unwrap_or(0);
            if timestamp > current {
                table.insert(collection.as_str(), timestamp)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_millis;
    use parking_lot::Mutex;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let storage = Storage::new(&db_path).unwrap();
        (storage, temp_dir)
    }

    #[test]
    fn test_storage_can_be_created() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let storage = Storage::new(&db_path);
        assert!(storage.is_ok());
    }

    #[test]
    fn test_storage_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested/path/to/test.redb");
        let storage = Storage::new(&db_path);
        assert!(storage.is_ok());
        assert!(db_path.exists());
    }

    #[test]
    fn test_put_and_get() {
        let (storage, _temp) = create_test_storage();

        let record = Record::new("p1").with_field("name", json!("Burger"));
        storage.put(Collection::Products, &record).unwrap();

        let loaded = storage.get(Collection::Products, "p1").unwrap();
        assert_eq!(loaded, Some(record));
    }

    #[test]
    fn test_get_nonexistent_record() {
        let (storage, _temp) = create_test_storage();
        assert!(storage.get(Collection::Orders, "missing").unwrap().is_none());
    }

    #[test]
    fn test_put_is_idempotent() {
        let (storage, _temp) = create_test_storage();

        let record = Record::new("o1").with_field("total", json!(10));
        storage.put(Collection::Orders, &record).unwrap();
        storage.put(Collection::Orders, &record).unwrap();

        let all = storage.get_all(Collection::Orders).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0], record);
    }

    #[test]
    fn test_put_replaces_by_id() {
        let (storage, _temp) = create_test_storage();

        storage
            .put(Collection::Orders, &Record::new("o1").with_field("total", json!(10)))
            .unwrap();
        storage
            .put(Collection::Orders, &Record::new("o1").with_field("total", json!(20)))
            .unwrap();

        let loaded = storage.get(Collection::Orders, "o1").unwrap().unwrap();
        assert_eq!(loaded.field("total"), Some(&json!(20)));
    }

    #[test]
    fn test_get_all() {
        let (storage, _temp) = create_test_storage();

        for id in ["p1", "p2", "p3"] {
            storage.put(Collection::Products, &Record::new(id)).unwrap();
        }

        let all = storage.get_all(Collection::Products).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_delete() {
        let (storage, _temp) = create_test_storage();

        storage.put(Collection::Products, &Record::new("p1")).unwrap();
        storage.delete(Collection::Products, "p1").unwrap();
        assert!(storage.get(Collection::Products, "p1").unwrap().is_none());
    }

    #[test]
    fn test_records_persist_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");

        {
            let storage = Storage::new(&db_path).unwrap();
            storage.put(Collection::Orders, &Record::new("o1")).unwrap();
        }

        {
            let storage = Storage::new(&db_path).unwrap();
            assert!(storage.get(Collection::Orders, "o1").unwrap().is_some());
        }
    }

    #[test]
    fn test_change_listener_fires_on_put_and_delete() {
        let (storage, _temp) = create_test_storage();

        let events: Arc<Mutex<Vec<ChangeEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        storage.on_change(Collection::Orders, move |event| {
            sink.lock().push(event.clone());
        });

        storage.put(Collection::Orders, &Record::new("o1")).unwrap();
        storage.delete(Collection::Orders, "o1").unwrap();
        // A different collection must not reach the listener
        storage.put(Collection::Products, &Record::new("p1")).unwrap();

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ChangeEvent::Put { record, .. } if record.id == "o1"));
        assert!(matches!(&events[1], ChangeEvent::Deleted { id, .. } if id == "o1"));
    }

    #[test]
    fn test_watermark_defaults_to_zero() {
        let (storage, _temp) = create_test_storage();
        assert_eq!(storage.watermark(Collection::Orders).unwrap(), 0);
    }

    #[test]
    fn test_watermark_never_rolls_back() {
        let (storage, _temp) = create_test_storage();

        storage.set_watermark(Collection::Orders, 100).unwrap();
        storage.set_watermark(Collection::Orders, 50).unwrap();
        assert_eq!(storage.watermark(Collection::Orders).unwrap(), 100);

        storage.set_watermark(Collection::Orders, 200).unwrap();
        assert_eq!(storage.watermark(Collection::Orders).unwrap(), 200);
    }

    #[test]
    fn test_watermark_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");

        {
            let storage = Storage::new(&db_path).unwrap();
            storage.set_watermark(Collection::Products, now_millis()).unwrap();
        }

        {
            let storage = Storage::new(&db_path).unwrap();
            assert!(storage.watermark(Collection::Products).unwrap() > 0);
        }
    }

    #[test]
    fn test_write_queue_preserves_enqueue_order() {
        let (storage, _temp) = create_test_storage();

        for id in ["w1", "w2", "w3"] {
            let entry = WriteEntry {
                collection: Collection::Orders,
                record: Record::new(id),
                try_count: 0,
                seq: 0,
            };
            storage.enqueue_write(&entry).unwrap();
        }

        let entries = storage.load_write_queue().unwrap();
        let ids: Vec<_> = entries.iter().map(|e| e.record.id.as_str()).collect();
        assert_eq!(ids, ["w1", "w2", "w3"]);
        assert!(entries.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn test_write_queue_delete_and_update() {
        let (storage, _temp) = create_test_storage();

        let entry = WriteEntry {
            collection: Collection::Orders,
            record: Record::new("w1"),
            try_count: 0,
            seq: 0,
        };
        let seq = storage.enqueue_write(&entry).unwrap();

        let mut updated = storage.load_write_queue().unwrap().remove(0);
        updated.try_count = 3;
        storage.update_queued_write(&updated).unwrap();
        assert_eq!(storage.load_write_queue().unwrap()[0].try_count, 3);

        storage.delete_queued_write(seq).unwrap();
        assert!(storage.load_write_queue().unwrap().is_empty());
    }

    #[test]
    fn test_write_queue_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");

        {
            let storage = Storage::new(&db_path).unwrap();
            let entry = WriteEntry {
                collection: Collection::Products,
                record: Record::new("p9"),
                try_count: 1,
                seq: 0,
            };
            storage.enqueue_write(&entry).unwrap();
        }

        {
            let storage = Storage::new(&db_path).unwrap();
            let entries = storage.load_write_queue().unwrap();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].record.id, "p9");
            assert_eq!(entries[0].try_count, 1);
        }
    }
}
