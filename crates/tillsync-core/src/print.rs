//! Priority print queue.
//!
//! Serializes delivery of side-effecting print jobs: highest priority
//! first (ties in insertion order), exactly one job in delivery at any
//! instant. Every job is persisted before it enters the active queue, so
//! a crash never loses accepted work - on startup all jobs not yet `done`
//! are reloaded and processing resumes.
//!
//! Failed deliveries retry with linear backoff (`tries x retry delay`),
//! re-entering at the front of the queue, until the retry budget is
//! exhausted; the job is then abandoned - dropped from the active queue
//! for good, its record left in `failed` status for audit.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::TillConfig;
use crate::error::TillResult;
use crate::sink::DeliverySink;
use crate::storage::Storage;
use crate::types::{Collection, Destination, JobId, Order, PrintJob, PrintStatus};

/// Job lifecycle notifications
#[derive(Debug, Clone)]
pub enum PrintEvent {
    /// Job accepted and persisted
    JobQueued { job: PrintJob },
    /// Delivery succeeded
    JobDone { job: PrintJob },
    /// Delivery failed; the job will retry unless its budget is spent
    JobFailed { job: PrintJob },
    /// Retry budget exhausted; the job will never be attempted again
    JobAbandoned { job: PrintJob },
}

type Template = Box<dyn Fn(&Value) -> String + Send + Sync>;

struct SpoolState {
    queue: VecDeque<PrintJob>,
    printing: bool,
}

struct Inner<S> {
    storage: Storage,
    sink: S,
    state: Mutex<SpoolState>,
    templates: RwLock<HashMap<Destination, Template>>,
    event_tx: broadcast::Sender<PrintEvent>,
    retry_delay: Duration,
    max_retries: u32,
}

/// Dispatches print jobs to a delivery sink, one at a time, highest
/// priority first.
pub struct PrintQueue<S: DeliverySink> {
    inner: Arc<Inner<S>>,
}

impl<S: DeliverySink> Clone for PrintQueue<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: DeliverySink + 'static> PrintQueue<S> {
    /// Create a queue over the given store and sink, reloading any jobs a
    /// previous process left unfinished and resuming processing.
    pub fn new(storage: Storage, sink: S, config: &TillConfig) -> TillResult<Self> {
        let mut restored: Vec<PrintJob> = storage
            .get_all(Collection::PrintJobs)?
            .iter()
            .filter_map(|record| match PrintJob::from_record(record) {
                Ok(job) => Some(job),
                Err(err) => {
                    warn!(id = %record.id, %err, "skipping unreadable print job");
                    None
                }
            })
            .filter(|job| job.status != PrintStatus::Done)
            .collect();
        restored.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        if !restored.is_empty() {
            info!(count = restored.len(), "restored unfinished print jobs");
        }

        let (event_tx, _) = broadcast::channel(config.event_capacity);
        let queue = Self {
            inner: Arc::new(Inner {
                storage,
                sink,
                state: Mutex::new(SpoolState {
                    queue: restored.into(),
                    printing: false,
                }),
                templates: RwLock::new(default_templates()),
                event_tx,
                retry_delay: config.print_retry_delay,
                max_retries: config.print_max_retries,
            }),
        };
        queue.kick();
        Ok(queue)
    }

    /// Subscribe to job lifecycle notifications
    pub fn subscribe(&self) -> broadcast::Receiver<PrintEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Queue a job for a destination.
    ///
    /// The job is persisted before it enters the active queue, inserted
    /// by descending priority (ties keep insertion order), and processing
    /// is kicked if idle.
    pub fn add_job(
        &self,
        destination: Destination,
        payload: Value,
        priority: u8,
    ) -> TillResult<JobId> {
        let job = PrintJob::new(destination, payload, priority);
        self.inner
            .storage
            .put(Collection::PrintJobs, &job.to_record()?)?;

        {
            let mut state = self.inner.state.lock();
            let pos = state
                .queue
                .iter()
                .position(|queued| queued.priority < job.priority)
                .unwrap_or(state.queue.len());
            state.queue.insert(pos, job.clone());
        }
        debug!(id = %job.id, destination = %job.destination, priority = job.priority, "print job queued");
        let _ = self
            .inner
            .event_tx
            .send(PrintEvent::JobQueued { job: job.clone() });

        self.kick();
        Ok(job.id)
    }

    /// Validate a destination name, then queue a job for it.
    ///
    /// An unknown name is rejected before anything is persisted.
    pub fn add_job_named(
        &self,
        destination: &str,
        payload: Value,
        priority: u8,
    ) -> TillResult<JobId> {
        self.add_job(destination.parse()?, payload, priority)
    }

    /// Replace the template used to render payloads for a destination.
    pub fn register_template(
        &self,
        destination: Destination,
        template: impl Fn(&Value) -> String + Send + Sync + 'static,
    ) {
        self.inner
            .templates
            .write()
            .insert(destination, Box::new(template));
    }

    /// Ids of the jobs waiting in the active queue, in dispatch order
    pub fn pending(&self) -> Vec<JobId> {
        self.inner
            .state
            .lock()
            .queue
            .iter()
            .map(|job| job.id.clone())
            .collect()
    }

    fn kick(&self) {
        let queue = self.clone();
        tokio::spawn(async move { queue.process().await });
    }

    /// Drain the queue one job at a time. The `printing` guard keeps a
    /// single delivery in flight across all concurrent kicks.
    async fn process(&self) {
        loop {
            let job = {
                let mut state = self.inner.state.lock();
                if state.printing {
                    return;
                }
                match state.queue.pop_front() {
                    Some(job) => {
                        state.printing = true;
                        job
                    }
                    None => return,
                }
            };

            self.deliver(job).await;
            self.inner.state.lock().printing = false;
        }
    }

    async fn deliver(&self, mut job: PrintJob) {
        let rendered = self.render(&job);

        match self.inner.sink.deliver(&rendered, job.destination).await {
            Ok(()) => {
                job.status = PrintStatus::Done;
                self.persist(&job);
                info!(id = %job.id, destination = %job.destination, order_id = %job.order_id, "print job succeeded");
                let _ = self.inner.event_tx.send(PrintEvent::JobDone { job });
            }
            Err(err) => {
                job.tries += 1;
                job.status = PrintStatus::Failed;
                self.persist(&job);
                warn!(id = %job.id, tries = job.tries, %err, "print job failed");
                let _ = self
                    .inner
                    .event_tx
                    .send(PrintEvent::JobFailed { job: job.clone() });

                if job.tries < self.inner.max_retries {
                    // Linear backoff, then back in at the front of the queue.
                    let delay = self.inner.retry_delay * job.tries;
                    let queue = self.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        queue.inner.state.lock().queue.push_front(job);
                        queue.kick();
                    });
                } else {
                    info!(id = %job.id, tries = job.tries, "print job abandoned after max retries");
                    let _ = self.inner.event_tx.send(PrintEvent::JobAbandoned { job });
                }
            }
        }
    }

    fn persist(&self, job: &PrintJob) {
        let result = job
            .to_record()
            .and_then(|record| self.inner.storage.put(Collection::PrintJobs, &record));
        if let Err(err) = result {
            warn!(id = %job.id, %err, "print job state not persisted");
        }
    }

    fn render(&self, job: &PrintJob) -> String {
        let templates = self.inner.templates.read();
        match templates.get(&job.destination) {
            Some(template) => template(&job.payload),
            None => fallback_render(&job.payload),
        }
    }
}

fn fallback_render(payload: &Value) -> String {
    serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string())
}

fn payload_order(payload: &Value) -> Option<Order> {
    serde_json::from_value(payload.clone()).ok()
}

fn receipt_template(payload: &Value) -> String {
    let Some(order) = payload_order(payload) else {
        return fallback_render(payload);
    };
    let mut out = format!("Receipt\nOrder: {}\n", order.id);
    for item in &order.items {
        out.push_str(&format!(
            "{}x {} - ${:.2}\n",
            item.qty,
            item.name,
            f64::from(item.qty) * item.price
        ));
    }
    out.push_str(&format!("\nTotal: ${:.2}\n", order.total));
    out
}

fn kitchen_template(payload: &Value) -> String {
    let Some(order) = payload_order(payload) else {
        return fallback_render(payload);
    };
    let mut out = format!("Kitchen Slip\nOrder: {}\n", order.id);
    for item in &order.items {
        match &item.customization {
            Some(customization) => {
                out.push_str(&format!("{}x {} - {}\n", item.qty, item.name, customization))
            }
            None => out.push_str(&format!("{}x {}\n", item.qty, item.name)),
        }
    }
    let special: Vec<&str> = order
        .items
        .iter()
        .filter_map(|item| item.special_request.as_deref())
        .collect();
    out.push_str(&format!("\nSpecial: {}\n", special.join("; ")));
    out
}

fn bar_template(payload: &Value) -> String {
    let Some(order) = payload_order(payload) else {
        return fallback_render(payload);
    };
    let mut out = format!("Bar Slip\nOrder: {}\n", order.id);
    for item in order
        .items
        .iter()
        .filter(|item| item.category.as_deref() == Some("Drink"))
    {
        out.push_str(&format!("{}x {}\n", item.qty, item.name));
    }
    out
}

fn default_templates() -> HashMap<Destination, Template> {
    let mut templates: HashMap<Destination, Template> = HashMap::new();
    templates.insert(Destination::Receipt, Box::new(receipt_template));
    templates.insert(Destination::Kitchen, Box::new(kitchen_template));
    templates.insert(Destination::Bar, Box::new(bar_template));
    templates
}
