//! Downstream publishers and the fan-out that feeds them.

pub mod discord;
pub mod dispatcher;
pub mod latency;
pub mod redis;
pub mod router;
pub mod stdout;

use async_trait::async_trait;

use crate::config::TransformMode;
use crate::error::Result;
use crate::types::DomainEvent;

pub use dispatcher::Dispatcher;
pub use router::{EventRouter, PublishReport};

/// One downstream. Implementations own their retry and batching policy;
/// the router only sees the final outcome of `publish`.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, event: &DomainEvent) -> Result<()>;

    /// Delivers anything buffered internally. Called once at shutdown.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Per-sink view of an event.
pub fn transform(event: &DomainEvent, mode: TransformMode) -> DomainEvent {
    let mut out = event.clone();
    match mode {
        TransformMode::Raw => {}
        TransformMode::Full => out.raw = None,
        TransformMode::Compact => {
            out.raw = None;
            out.topic_key = None;
        }
    }
    out
}
