//! Offline write queue.
//!
//! Every accepted write is persisted to the local store first, so readers
//! see it immediately regardless of connectivity. Delivery to the remote
//! authority is attempted inline when online; a failed or impossible
//! delivery lands in a durable retry queue that is drained on reconnect.
//!
//! ## Retry discipline
//!
//! A flush pass walks the queue snapshot taken at pass start: entries
//! delivered successfully are dropped, the rest carry an incremented try
//! count into the next generation. One shared backoff clock covers the
//! whole queue - it doubles after every pass that still has failures
//! (capped), and resets to the base delay as soon as a pass clears the
//! queue. A single persistently failing entry therefore throttles retry
//! speed for everything behind it; that trade of fairness for simplicity
//! is deliberate.
//!
//! Remote failures are never surfaced to the caller of
//! [`queue_write`](OfflineQueue::queue_write) - they are absorbed into the
//! queue. Only local storage faults propagate.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::TillConfig;
use crate::error::TillResult;
use crate::storage::Storage;
use crate::transport::RemoteTransport;
use crate::types::{Collection, Record, WriteEntry};

/// Events emitted by the offline queue
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A write could not be delivered and was queued for retry
    WriteQueued { collection: Collection, id: String },
    /// A flush pass started over `pending` entries
    FlushStarted { pending: usize },
    /// A flush pass finished; `retry_in` is set when failures remain
    FlushCompleted {
        failed: usize,
        retry_in: Option<Duration>,
    },
}

struct QueueState {
    entries: VecDeque<WriteEntry>,
    backoff: Duration,
    retry_scheduled: bool,
}

struct Inner<T> {
    storage: Storage,
    transport: T,
    online: AtomicBool,
    state: Mutex<QueueState>,
    event_tx: broadcast::Sender<QueueEvent>,
    base_backoff: Duration,
    max_backoff: Duration,
}

/// Buffers local writes and guarantees their eventual delivery to the
/// remote authority.
pub struct OfflineQueue<T: RemoteTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: RemoteTransport> Clone for OfflineQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

fn next_backoff(current: Duration, cap: Duration) -> Duration {
    (current * 2).min(cap)
}

impl<T: RemoteTransport + 'static> OfflineQueue<T> {
    /// Create a queue over the given store and transport, restoring any
    /// entries persisted by a previous process.
    pub fn new(storage: Storage, transport: T, config: &TillConfig) -> TillResult<Self> {
        let entries: VecDeque<WriteEntry> = storage.load_write_queue()?.into();
        if !entries.is_empty() {
            info!(count = entries.len(), "restored offline write queue");
        }

        let (event_tx, _) = broadcast::channel(config.event_capacity);
        Ok(Self {
            inner: Arc::new(Inner {
                storage,
                transport,
                online: AtomicBool::new(true),
                state: Mutex::new(QueueState {
                    entries,
                    backoff: config.base_backoff,
                    retry_scheduled: false,
                }),
                event_tx,
                base_backoff: config.base_backoff,
                max_backoff: config.max_backoff,
            }),
        })
    }

    /// Subscribe to queue lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Accept a write: persist it locally, then deliver or queue it.
    ///
    /// The record is durably visible to local readers when this returns,
    /// whatever the connectivity state. Remote delivery failures are
    /// absorbed into the retry queue; only local storage faults surface
    /// as errors.
    pub async fn queue_write(&self, collection: Collection, record: Record) -> TillResult<()> {
        self.inner.storage.put(collection, &record)?;

        if self.is_online() {
            match self.inner.transport.push(collection, &record).await {
                Ok(()) => {
                    debug!(%collection, id = %record.id, "write delivered immediately");
                    return Ok(());
                }
                Err(err) => {
                    warn!(%collection, id = %record.id, %err, "remote delivery failed, queueing write");
                }
            }
        }
        self.enqueue(collection, record)
    }

    fn enqueue(&self, collection: Collection, record: Record) -> TillResult<()> {
        let id = record.id.clone();
        let mut entry = WriteEntry {
            collection,
            record,
            try_count: 0,
            seq: 0,
        };
        entry.seq = self.inner.storage.enqueue_write(&entry)?;
        self.inner.state.lock().entries.push_back(entry);
        let _ = self
            .inner
            .event_tx
            .send(QueueEvent::WriteQueued { collection, id });
        Ok(())
    }

    /// Drain the queue once, retrying every entry against the remote.
    ///
    /// Marks the queue online. Entries enqueued while the pass runs are
    /// left for the next pass. If failures remain, the shared backoff
    /// doubles and another flush is scheduled after that delay; a clean
    /// pass resets the backoff and schedules nothing.
    ///
    /// Returns the number of entries still undelivered.
    pub async fn flush(&self) -> TillResult<usize> {
        self.inner.online.store(true, Ordering::SeqCst);

        let mut snapshot: VecDeque<WriteEntry> = {
            let mut state = self.inner.state.lock();
            std::mem::take(&mut state.entries)
        };
        let pending = snapshot.len();
        let _ = self
            .inner
            .event_tx
            .send(QueueEvent::FlushStarted { pending });
        if pending > 0 {
            info!(pending, "flushing offline write queue");
        }

        let mut failures: Vec<WriteEntry> = Vec::new();
        while let Some(mut entry) = snapshot.pop_front() {
            // Re-apply locally; same id overwrites, so replay is idempotent.
            if let Err(err) = self.inner.storage.put(entry.collection, &entry.record) {
                // Local storage fault is fatal: nothing may be dropped.
                snapshot.push_front(entry);
                self.restore(failures, snapshot);
                return Err(err);
            }

            match self.inner.transport.push(entry.collection, &entry.record).await {
                Ok(()) => {
                    if let Err(err) = self.inner.storage.delete_queued_write(entry.seq) {
                        warn!(seq = entry.seq, %err, "delivered entry not removed from durable queue");
                    }
                    debug!(collection = %entry.collection, id = %entry.record.id, "queued write delivered");
                }
                Err(err) => {
                    entry.try_count += 1;
                    debug!(
                        collection = %entry.collection,
                        id = %entry.record.id,
                        tries = entry.try_count,
                        %err,
                        "queued write still undeliverable"
                    );
                    if let Err(err) = self.inner.storage.update_queued_write(&entry) {
                        warn!(seq = entry.seq, %err, "retry count not persisted");
                    }
                    failures.push(entry);
                }
            }
        }

        let failed = failures.len();
        let retry_in = {
            let mut state = self.inner.state.lock();
            for entry in failures.into_iter().rev() {
                state.entries.push_front(entry);
            }
            if failed > 0 {
                state.backoff = next_backoff(state.backoff, self.inner.max_backoff);
                Some(state.backoff)
            } else {
                state.backoff = self.inner.base_backoff;
                None
            }
        };

        let _ = self
            .inner
            .event_tx
            .send(QueueEvent::FlushCompleted { failed, retry_in });
        if let Some(delay) = retry_in {
            self.schedule_retry(delay);
        }
        Ok(failed)
    }

    /// Put an aborted pass back in scan order: failures first, then the
    /// unprocessed tail, ahead of anything enqueued mid-pass.
    fn restore(&self, failures: Vec<WriteEntry>, rest: VecDeque<WriteEntry>) {
        let mut state = self.inner.state.lock();
        for entry in rest.into_iter().rev() {
            state.entries.push_front(entry);
        }
        for entry in failures.into_iter().rev() {
            state.entries.push_front(entry);
        }
    }

    fn schedule_retry(&self, delay: Duration) {
        {
            let mut state = self.inner.state.lock();
            if state.retry_scheduled {
                return;
            }
            state.retry_scheduled = true;
        }
        debug!(?delay, "scheduling queue retry");

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.inner.state.lock().retry_scheduled = false;
            if !queue.is_empty() {
                if let Err(err) = queue.flush().await {
                    warn!(%err, "scheduled flush aborted");
                }
            }
        });
    }

    /// Mark the remote as unreachable; subsequent writes queue directly.
    pub fn set_offline(&self) {
        self.inner.online.store(false, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Number of undelivered writes
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().entries.is_empty()
    }

    /// The delay the next scheduled flush pass will wait for
    pub fn current_backoff(&self) -> Duration {
        self.inner.state.lock().backoff
    }
}
