use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio::time::{interval_at, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SINK_QUEUE_CAPACITY;
use crate::error::Result;
use crate::sink::router::{EventRouter, SinkOutcome};
use crate::types::DomainEvent;

const LATENCY_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Counters reported when the dispatcher stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Events taken off the input channel.
    pub dispatched: u64,
    pub unrouted: u64,
    /// Per-sink deliveries that succeeded.
    pub delivered: u64,
    /// Per-sink deliveries that failed or timed out.
    pub failed: u64,
    /// Sink queues that could not take an event (full, stopped or missing sink).
    pub rejected: u64,
    pub dead_lettered: u64,
    /// Queued or in-flight deliveries abandoned when the drain grace ran out.
    pub dropped_on_shutdown: u64,
}

impl DispatchSummary {
    fn absorb(&mut self, worker: DispatchSummary) {
        self.delivered += worker.delivered;
        self.failed += worker.failed;
        self.dead_lettered += worker.dead_lettered;
        self.dropped_on_shutdown += worker.dropped_on_shutdown;
    }
}

fn dead_letter(event: &DomainEvent, sink: &str, reason: &str) {
    let payload = serde_json::to_string(event).unwrap_or_default();
    error!(
        target: "pme::dead_letter",
        event_id = %event.event_id,
        event_type = %event.event_type,
        sink = %sink,
        reason = reason,
        event = %payload,
        "required sink failed"
    );
}

/// Pulls events off the detection/discovery channel and hands each routed
/// sink its own copy through a bounded queue. One worker per sink publishes
/// in queue order, so a slow sink only ever delays itself.
pub struct Dispatcher {
    router: Arc<EventRouter>,
    events_rx: mpsc::Receiver<DomainEvent>,
    shutdown: CancellationToken,
    drain_grace: Duration,
    queue_capacity: usize,
    summary: DispatchSummary,
}

impl Dispatcher {
    pub fn new(
        router: Arc<EventRouter>,
        events_rx: mpsc::Receiver<DomainEvent>,
        shutdown: CancellationToken,
        drain_grace: Duration,
    ) -> Self {
        Self {
            router,
            events_rx,
            shutdown,
            drain_grace,
            queue_capacity: SINK_QUEUE_CAPACITY,
            summary: DispatchSummary::default(),
        }
    }

    #[cfg(test)]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub async fn run(mut self) -> Result<DispatchSummary> {
        // Cancelled only when the drain grace runs out.
        let stop = CancellationToken::new();
        let mut workers = JoinSet::new();
        let mut queues = HashMap::new();
        for name in self.router.sink_names() {
            let (tx, rx) = mpsc::channel(self.queue_capacity);
            let worker = SinkWorker {
                name: name.to_string(),
                router: Arc::clone(&self.router),
                queue: rx,
                stop: stop.clone(),
            };
            workers.spawn(worker.run());
            queues.insert(name.to_string(), tx);
        }

        let mut latency_tick = interval_at(Instant::now() + LATENCY_LOG_INTERVAL, LATENCY_LOG_INTERVAL);
        latency_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                event = self.events_rx.recv() => match event {
                    Some(event) => self.dispatch(&queues, &event),
                    None => break,
                },
                _ = latency_tick.tick() => self.router.latency().log_summary(),
            }
        }

        let deadline = Instant::now() + self.drain_grace;
        self.forward_remaining(&queues, deadline).await;
        // Closing the queues lets each worker finish its backlog and flush.
        drop(queues);

        loop {
            match timeout_at(deadline, workers.join_next()).await {
                Ok(Some(Ok(worker))) => self.summary.absorb(worker),
                Ok(Some(Err(e))) => error!("sink worker panicked: {e}"),
                Ok(None) => break,
                Err(_) => {
                    stop.cancel();
                    while let Some(joined) = workers.join_next().await {
                        match joined {
                            Ok(worker) => self.summary.absorb(worker),
                            Err(e) => error!("sink worker panicked: {e}"),
                        }
                    }
                    break;
                }
            }
        }
        if self.summary.dropped_on_shutdown > 0 {
            warn!(
                dropped = self.summary.dropped_on_shutdown,
                grace_sec = self.drain_grace.as_secs_f64(),
                "[SINK] drain grace elapsed with deliveries still pending"
            );
        }

        self.router.latency().log_summary();
        info!(
            dispatched = self.summary.dispatched,
            delivered = self.summary.delivered,
            failed = self.summary.failed,
            rejected = self.summary.rejected,
            dead_lettered = self.summary.dead_lettered,
            unrouted = self.summary.unrouted,
            dropped = self.summary.dropped_on_shutdown,
            "[SINK] dispatcher stopped"
        );
        Ok(self.summary)
    }

    /// Enqueues `event` for every routed sink without waiting on any of them.
    fn dispatch(&mut self, queues: &HashMap<String, mpsc::Sender<DomainEvent>>, event: &DomainEvent) {
        self.summary.dispatched += 1;
        let Some(targets) = self.router.targets(event.event_type) else {
            self.summary.unrouted += 1;
            return;
        };
        for name in targets {
            let reason = match queues.get(name) {
                None => "sink not attached",
                Some(queue) => match queue.try_send(event.clone()) {
                    Ok(()) => continue,
                    Err(TrySendError::Full(_)) => "sink queue full",
                    Err(TrySendError::Closed(_)) => "sink worker stopped",
                },
            };
            self.summary.rejected += 1;
            let required = self.router.is_required(name);
            warn!(sink = %name, required, event_id = %event.event_id, "event not queued: {reason}");
            if required {
                self.summary.dead_lettered += 1;
                dead_letter(event, name, reason);
            }
        }
    }

    /// Moves whatever is already on the input channel into the sink queues.
    async fn forward_remaining(&mut self, queues: &HashMap<String, mpsc::Sender<DomainEvent>>, deadline: Instant) {
        self.events_rx.close();
        loop {
            match timeout_at(deadline, self.events_rx.recv()).await {
                Ok(Some(event)) => self.dispatch(queues, &event),
                Ok(None) => return,
                Err(_) => break,
            }
        }
        while self.events_rx.try_recv().is_ok() {
            self.summary.dispatched += 1;
            self.summary.dropped_on_shutdown += 1;
        }
    }
}

/// Drains one sink's queue in order until the queue closes or `stop` fires.
struct SinkWorker {
    name: String,
    router: Arc<EventRouter>,
    queue: mpsc::Receiver<DomainEvent>,
    stop: CancellationToken,
}

impl SinkWorker {
    async fn run(mut self) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        loop {
            let event = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                event = self.queue.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    summary.dropped_on_shutdown += 1;
                    break;
                }
                outcome = self.router.deliver(&self.name, &event) => record(&mut summary, &event, &outcome),
            }
        }

        if self.stop.is_cancelled() {
            self.queue.close();
            while self.queue.try_recv().is_ok() {
                summary.dropped_on_shutdown += 1;
            }
            return summary;
        }

        tokio::select! {
            biased;
            _ = self.stop.cancelled() => warn!(sink = %self.name, "flush abandoned at drain deadline"),
            _ = self.router.flush(&self.name) => {}
        }
        summary
    }
}

fn record(summary: &mut DispatchSummary, event: &DomainEvent, outcome: &SinkOutcome) {
    let Some(reason) = &outcome.error else {
        summary.delivered += 1;
        return;
    };
    summary.failed += 1;
    if outcome.required {
        summary.dead_lettered += 1;
        dead_letter(event, &outcome.sink, reason);
    }
}
