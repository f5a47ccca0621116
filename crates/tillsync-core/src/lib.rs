//! Tillsync Core Library
//!
//! Offline-first point-of-sale data layer: a local replica that keeps
//! taking orders while disconnected, then reconciles with the remote
//! authority when connectivity returns.
//!
//! ## Overview
//!
//! Three delivery disciplines share one local store:
//!
//! - **Offline write queue**: every write lands in the local store first,
//!   then is delivered to the remote - immediately when online, or from a
//!   durable retry queue with exponential backoff after reconnect.
//! - **Sync engine**: bidirectional reconciliation per collection using
//!   per-record timestamps with last-write-wins conflict resolution,
//!   tracked by a watermark that only advances on fully successful passes.
//! - **Print queue**: serialized, priority-ordered delivery of print jobs
//!   with linear-backoff retries and bounded abandonment.
//!
//! ## Core Principles
//!
//! - **Local-first**: reads and writes work fully offline; the local
//!   store is the only source business logic reads from
//! - **At-least-once delivery**: queued writes and print jobs may be
//!   delivered more than once but are never lost - receivers upsert by id
//! - **Injected ports**: the remote transport, delivery sink, and
//!   connectivity signal are all traits/handles the host supplies, so the
//!   core is testable without a network stack or a printer
//!
//! ## Quick Start
//!
//! ```ignore
//! use tillsync_core::{
//!     Connectivity, ConsoleSink, MemoryTransport, Order, OrderItem, Till, TillConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connectivity = Connectivity::new(false);
//!     let till = Till::new(
//!         "~/.tillsync/data",
//!         MemoryTransport::new(),
//!         ConsoleSink,
//!         connectivity.clone(),
//!         TillConfig::default(),
//!     )
//!     .await?;
//!
//!     // Offline: the order is durable locally and queued for delivery.
//!     let order = Order::new("o1").with_item(OrderItem::new("p1", "Burger", 5.99, 2));
//!     till.place_order(order).await?;
//!
//!     // Back online: the queue flushes and collections reconcile.
//!     connectivity.set_online();
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod print;
pub mod queue;
pub mod sink;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod types;

// Re-exports
pub use config::TillConfig;
pub use connectivity::Connectivity;
pub use engine::Till;
pub use error::{TillError, TillResult};
pub use print::{PrintEvent, PrintQueue};
pub use queue::{OfflineQueue, QueueEvent};
pub use sink::{ConsoleSink, DeliverySink};
pub use storage::{ChangeEvent, Storage};
pub use sync::{SyncEngine, SyncEvent};
pub use transport::{MemoryTransport, RemoteTransport};
pub use types::*;
