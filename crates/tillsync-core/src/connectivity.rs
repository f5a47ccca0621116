//! Connectivity signal.
//!
//! Online/offline state is an injected port, not ambient global state:
//! the host application (or a test) flips it, and the engine reacts to
//! transitions by flushing the offline queue and triggering sync.

use std::sync::Arc;

use tokio::sync::watch;

/// Shared online/offline signal.
///
/// Cheap to clone; all clones observe the same state. Consumers either
/// poll [`is_online`](Connectivity::is_online) or subscribe to a watch
/// receiver for transitions.
#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    /// Create a signal with the given initial state.
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Signal that the remote authority is reachable again.
    pub fn set_online(&self) {
        self.tx.send_replace(true);
    }

    /// Signal loss of connectivity.
    pub fn set_offline(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Receiver for observing transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        assert!(Connectivity::new(true).is_online());
        assert!(!Connectivity::new(false).is_online());
    }

    #[test]
    fn test_clones_share_state() {
        let connectivity = Connectivity::new(true);
        let clone = connectivity.clone();

        connectivity.set_offline();
        assert!(!clone.is_online());

        clone.set_online();
        assert!(connectivity.is_online());
    }

    #[tokio::test]
    async fn test_subscribers_observe_transitions() {
        let connectivity = Connectivity::new(false);
        let mut rx = connectivity.subscribe();

        connectivity.set_online();
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
    }
}
