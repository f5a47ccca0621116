//! Delivery sink port.
//!
//! Rendered print output is handed to a [`DeliverySink`] per destination.
//! A production sink would encode to printer commands and talk to the
//! device; that encoding is outside this crate.

use std::future::Future;
use std::sync::Arc;

use tracing::info;

use crate::error::TillResult;
use crate::types::Destination;

/// Port to a physical or virtual print device.
pub trait DeliverySink: Send + Sync {
    /// Deliver rendered output to the named destination.
    fn deliver(
        &self,
        rendered: &str,
        destination: Destination,
    ) -> impl Future<Output = TillResult<()>> + Send;
}

impl<S: DeliverySink> DeliverySink for Arc<S> {
    fn deliver(
        &self,
        rendered: &str,
        destination: Destination,
    ) -> impl Future<Output = TillResult<()>> + Send {
        (**self).deliver(rendered, destination)
    }
}

/// Sink that writes rendered slips to stdout. Used by the CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

impl DeliverySink for ConsoleSink {
    async fn deliver(&self, rendered: &str, destination: Destination) -> TillResult<()> {
        info!(%destination, bytes = rendered.len(), "delivering print output");
        println!("── {} ──\n{}", destination, rendered);
        Ok(())
    }
}
