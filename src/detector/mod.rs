pub mod cooldown;
pub mod engine;
pub mod window;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::types::{DomainEvent, FeedEvent, TokenRegistry};

pub use engine::SignalEngine;

const DIAG_INTERVAL: Duration = Duration::from_secs(30);

/// Detector task: feeds ticks through the [`SignalEngine`] in arrival order
/// and hands emitted events to the dispatcher.
pub struct SignalDetector {
    engine: SignalEngine,
    feed_rx: mpsc::Receiver<FeedEvent>,
    registry_rx: watch::Receiver<Arc<TokenRegistry>>,
    events_tx: mpsc::Sender<DomainEvent>,
    expired_tx: mpsc::Sender<String>,
    shutdown: CancellationToken,
    events_processed: u64,
    last_diag_at: Instant,
}

impl SignalDetector {
    pub fn new(
        engine: SignalEngine,
        feed_rx: mpsc::Receiver<FeedEvent>,
        registry_rx: watch::Receiver<Arc<TokenRegistry>>,
        events_tx: mpsc::Sender<DomainEvent>,
        expired_tx: mpsc::Sender<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            engine,
            feed_rx,
            registry_rx,
            events_tx,
            expired_tx,
            shutdown,
            events_processed: 0,
            last_diag_at: Instant::now(),
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let initial = self.registry_rx.borrow_and_update().clone();
        self.engine.update_registry(initial);
        let mut registry_open = true;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                changed = self.registry_rx.changed(), if registry_open => {
                    if changed.is_err() {
                        registry_open = false;
                        continue;
                    }
                    let registry = self.registry_rx.borrow_and_update().clone();
                    self.engine.update_registry(registry);
                }
                event = self.feed_rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle(event).await?;
                }
            }
        }

        info!(
            processed = self.events_processed,
            signals = self.engine.signals_emitted(),
            "[DETECTOR] stopped"
        );
        Ok(())
    }

    async fn handle(&mut self, event: FeedEvent) -> Result<()> {
        self.events_processed += 1;
        for signal in self.engine.on_event(&event) {
            self.events_tx
                .send(signal)
                .await
                .map_err(|e| AppError::ChannelSend(format!("detector events: {e}")))?;
        }
        for token in self.engine.take_expired() {
            if let Err(e) = self.expired_tx.try_send(token) {
                warn!("expired-token channel full, dropping notice: {e}");
            }
        }
        self.maybe_log_diagnostics();
        Ok(())
    }

    fn maybe_log_diagnostics(&mut self) {
        if self.last_diag_at.elapsed() < DIAG_INTERVAL {
            return;
        }
        self.last_diag_at = Instant::now();
        info!(
            processed = self.events_processed,
            signals = self.engine.signals_emitted(),
            tokens = self.engine.tracked_tokens(),
            "[DETECTOR] 30s diag | events={} signals={} tokens={}",
            self.events_processed,
            self.engine.signals_emitted(),
            self.engine.tracked_tokens(),
        );
    }
}
