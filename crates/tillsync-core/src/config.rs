//! Tuning knobs for the queue and print retry policies.

use std::time::Duration;

/// Configuration for a [`Till`](crate::Till) instance and its components.
///
/// The defaults reproduce the production retry discipline: offline-queue
/// flushes back off exponentially from 1s to a 30s cap, print jobs retry
/// with linear backoff (3s x tries) up to 5 attempts.
#[derive(Debug, Clone)]
pub struct TillConfig {
    /// Initial delay between offline-queue flush passes
    pub base_backoff: Duration,
    /// Upper bound for the flush backoff
    pub max_backoff: Duration,
    /// Base delay for print retries (scaled linearly by the try count)
    pub print_retry_delay: Duration,
    /// Delivery attempts before a print job is abandoned
    pub print_max_retries: u32,
    /// Capacity of the lifecycle event broadcast channels
    pub event_capacity: usize,
}

impl Default for TillConfig {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            print_retry_delay: Duration::from_secs(3),
            print_max_retries: 5,
            event_capacity: 256,
        }
    }
}
