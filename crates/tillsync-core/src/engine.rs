//! Main Till engine - the primary entry point for tillsync
//!
//! `Till` wires the local store, offline write queue, sync engine, print
//! queue, and connectivity signal together under one data directory, and
//! exposes the order/catalog flows on top of them.
//!
//! # Example
//!
//! ```ignore
//! use tillsync_core::{Connectivity, ConsoleSink, MemoryTransport, Till, TillConfig};
//!
//! let connectivity = Connectivity::new(true);
//! let till = Till::new(
//!     "~/.tillsync/data",
//!     MemoryTransport::new(),
//!     ConsoleSink,
//!     connectivity.clone(),
//!     TillConfig::default(),
//! )
//! .await?;
//!
//! // Take an order; it is locally durable immediately and reaches the
//! // remote when connectivity allows.
//! let order = Order::new("o1").with_item(OrderItem::new("p1", "Burger", 5.99, 2));
//! till.place_order(order).await?;
//!
//! // Later, on reconnect, the engine flushes and syncs by itself.
//! connectivity.set_online();
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::TillConfig;
use crate::connectivity::Connectivity;
use crate::error::{TillError, TillResult};
use crate::print::PrintQueue;
use crate::queue::OfflineQueue;
use crate::sink::DeliverySink;
use crate::storage::Storage;
use crate::sync::SyncEngine;
use crate::transport::RemoteTransport;
use crate::types::{now_millis, Collection, Destination, Order, OrderStatus, Product, Record};

/// Main entry point for tillsync
///
/// Owns the storage layer and the three delivery disciplines built on it:
/// the offline write queue, the sync engine, and the print queue.
pub struct Till<T: RemoteTransport, S: DeliverySink> {
    storage: Storage,
    queue: OfflineQueue<Arc<T>>,
    sync: SyncEngine<Arc<T>>,
    printer: PrintQueue<S>,
    connectivity: Connectivity,
    data_dir: PathBuf,
    /// Background task watching the connectivity signal
    watcher: tokio::task::JoinHandle<()>,
}

impl<T: RemoteTransport, S: DeliverySink> Drop for Till<T, S> {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

impl<T, S> Till<T, S>
where
    T: RemoteTransport + 'static,
    S: DeliverySink + 'static,
{
    /// Create a new Till with the given data directory.
    ///
    /// This will:
    /// - Create the data directory if it doesn't exist
    /// - Initialize the storage database
    /// - Restore any persisted write-queue entries and unfinished print
    ///   jobs from a previous run
    /// - Start watching the connectivity signal
    pub async fn new(
        data_dir: impl AsRef<Path>,
        transport: T,
        sink: S,
        connectivity: Connectivity,
        config: TillConfig,
    ) -> TillResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        info!(?data_dir, "initializing till");

        std::fs::create_dir_all(&data_dir)?;
        let storage = Storage::new(data_dir.join("till.redb"))?;

        let transport = Arc::new(transport);
        let queue = OfflineQueue::new(storage.clone(), transport.clone(), &config)?;
        if !connectivity.is_online() {
            queue.set_offline();
        }
        let sync = SyncEngine::new(storage.clone(), transport, &config);
        let printer = PrintQueue::new(storage.clone(), sink, &config)?;

        let watcher = Self::watch_connectivity(&connectivity, queue.clone(), sync.clone());

        Ok(Self {
            storage,
            queue,
            sync,
            printer,
            connectivity,
            data_dir,
            watcher,
        })
    }

    /// React to connectivity transitions: going online drains the write
    /// queue and reconciles the synced collections; going offline routes
    /// new writes straight to the queue.
    fn watch_connectivity(
        connectivity: &Connectivity,
        queue: OfflineQueue<Arc<T>>,
        sync: SyncEngine<Arc<T>>,
    ) -> tokio::task::JoinHandle<()> {
        let mut rx = connectivity.subscribe();
        tokio::spawn(async move {
            let mut online = *rx.borrow();
            while rx.changed().await.is_ok() {
                let now_online = *rx.borrow_and_update();
                if now_online == online {
                    continue;
                }
                online = now_online;

                if now_online {
                    info!("connectivity restored");
                    if let Err(err) = queue.flush().await {
                        warn!(%err, "queue flush after reconnect failed");
                    }
                    for collection in Collection::SYNCED {
                        if let Err(err) = sync.sync_collection(collection).await {
                            warn!(%collection, %err, "sync after reconnect failed");
                        }
                    }
                } else {
                    info!("connectivity lost");
                    queue.set_offline();
                }
            }
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn queue(&self) -> &OfflineQueue<Arc<T>> {
        &self.queue
    }

    pub fn sync(&self) -> &SyncEngine<Arc<T>> {
        &self.sync
    }

    pub fn printer(&self) -> &PrintQueue<S> {
        &self.printer
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Order Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Accept an order.
    ///
    /// Rejects an order with no items before anything is persisted.
    /// Otherwise the order is stamped, routed through the offline queue
    /// (locally durable whatever the connectivity), a receipt print job is
    /// spooled, and an orders sync is kicked off in the background when
    /// online.
    pub async fn place_order(&self, mut order: Order) -> TillResult<String> {
        if order.items.is_empty() {
            return Err(TillError::EmptyOrder);
        }
        order.updated_at = now_millis();

        self.queue
            .queue_write(Collection::Orders, order.to_record()?)
            .await?;

        let payload = serde_json::to_value(&order)
            .map_err(|e| TillError::Serialization(e.to_string()))?;
        self.printer.add_job(Destination::Receipt, payload, 1)?;

        if self.connectivity.is_online() {
            let sync = self.sync.clone();
            tokio::spawn(async move {
                if let Err(err) = sync.sync_collection(Collection::Orders).await {
                    debug!(%err, "post-order sync failed");
                }
            });
        }

        info!(id = %order.id, total = order.total, "order placed");
        Ok(order.id)
    }

    /// Update the lifecycle status of a stored order.
    pub async fn update_order_status(&self, order_id: &str, status: OrderStatus) -> TillResult<()> {
        let record = self
            .storage
            .get(Collection::Orders, order_id)?
            .ok_or_else(|| TillError::OrderNotFound(order_id.to_string()))?;

        let mut order: Order = record.deserialize()?;
        order.status = status;
        order.updated_at = now_millis();
        self.queue
            .queue_write(Collection::Orders, order.to_record()?)
            .await
    }

    /// All locally stored orders
    pub fn orders(&self) -> TillResult<Vec<Order>> {
        self.storage
            .get_all(Collection::Orders)?
            .iter()
            .map(Record::deserialize)
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Catalog Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Upsert a catalog product through the offline queue.
    pub async fn upsert_product(&self, mut product: Product) -> TillResult<()> {
        product.updated_at = now_millis();
        self.queue
            .queue_write(Collection::Products, product.to_record()?)
            .await
    }

    /// All locally stored products
    pub fn products(&self) -> TillResult<Vec<Product>> {
        self.storage
            .get_all(Collection::Products)?
            .iter()
            .map(Record::deserialize)
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Reconcile every synced collection once.
    pub async fn sync_all(&self) -> TillResult<()> {
        for collection in Collection::SYNCED {
            self.sync.sync_collection(collection).await?;
        }
        Ok(())
    }
}
