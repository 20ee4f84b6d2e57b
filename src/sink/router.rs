use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::config::{DeliveryMode, SinksConfig, TransformMode};
use crate::error::Result;
use crate::sink::latency::DispatchLatency;
use crate::sink::{transform, Sink};
use crate::types::{DomainEvent, EventType};

/// Outcome of one sink's delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkOutcome {
    pub sink: String,
    pub required: bool,
    /// `None` on success.
    pub error: Option<String>,
}

/// Per-sink outcomes for one event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub event_id: String,
    pub outcomes: Vec<SinkOutcome>,
    /// No route for the event type; nothing was attempted.
    pub unrouted: bool,
}

impl PublishReport {
    /// False only when a required sink failed.
    pub fn is_ok(&self) -> bool {
        self.required_failures().next().is_none()
    }

    pub fn required_failures(&self) -> impl Iterator<Item = &SinkOutcome> {
        self.outcomes.iter().filter(|o| o.required && o.error.is_some())
    }

    pub fn delivered(&self) -> impl Iterator<Item = &str> {
        self.outcomes.iter().filter(|o| o.error.is_none()).map(|o| o.sink.as_str())
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_some()).count()
    }
}

/// Routing table plus the attached sinks.
///
/// Each sink gets its own transformed copy and its own timeout. `publish`
/// fans one event out and waits for every sink; the dispatcher instead calls
/// `deliver` from one worker per sink so sinks never wait on each other.
pub struct EventRouter {
    sinks: HashMap<String, Arc<dyn Sink>>,
    routes: HashMap<EventType, Vec<String>>,
    transforms: HashMap<String, TransformMode>,
    default_transform: TransformMode,
    required: HashSet<String>,
    mode: DeliveryMode,
    timeout: Duration,
    latency: Arc<DispatchLatency>,
}

impl EventRouter {
    pub fn new(routes: HashMap<EventType, Vec<String>>, timeout: Duration) -> Self {
        Self {
            sinks: HashMap::new(),
            routes,
            transforms: HashMap::new(),
            default_transform: TransformMode::Full,
            required: HashSet::new(),
            mode: DeliveryMode::BestEffort,
            timeout,
            latency: Arc::new(DispatchLatency::new()),
        }
    }

    /// Router configured from the `sinks` section; sinks are attached separately.
    pub fn from_config(cfg: &SinksConfig) -> Result<Self> {
        let mut router = Self::new(cfg.parsed_routes()?, Duration::from_secs(cfg.publish_timeout_sec));
        router.default_transform = cfg.transform;
        router.mode = cfg.mode;
        router.required = cfg.required_sinks.iter().map(|s| s.trim().to_lowercase()).collect();
        for name in cfg.enabled_sinks() {
            router.transforms.insert(name.to_string(), cfg.transform_for(name));
        }
        Ok(router)
    }

    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.insert(sink.name().to_string(), sink);
        self
    }

    pub fn with_required(mut self, names: &[&str]) -> Self {
        self.required.extend(names.iter().map(|s| s.to_string()));
        self
    }

    pub fn with_mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_transform(mut self, sink: &str, mode: TransformMode) -> Self {
        self.transforms.insert(sink.to_string(), mode);
        self
    }

    pub fn latency(&self) -> Arc<DispatchLatency> {
        self.latency.clone()
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.keys().map(String::as_str).collect()
    }

    pub fn is_required(&self, sink: &str) -> bool {
        self.mode == DeliveryMode::AllRequired || self.required.contains(sink)
    }

    /// Sink names routed for `event_type`; `None` when nothing is routed.
    pub fn targets(&self, event_type: EventType) -> Option<&[String]> {
        self.routes.get(&event_type).map(Vec::as_slice).filter(|t| !t.is_empty())
    }

    /// Publishes to every routed sink concurrently and waits for all of them.
    pub async fn publish(&self, event: &DomainEvent) -> PublishReport {
        let mut report = PublishReport { event_id: event.event_id.clone(), ..PublishReport::default() };

        let Some(targets) = self.targets(event.event_type) else {
            debug!(event_type = %event.event_type, event_id = %event.event_id, "no route, event dropped");
            report.unrouted = true;
            return report;
        };

        report.outcomes = join_all(targets.iter().map(|name| self.deliver(name, event))).await;
        report
    }

    /// One delivery attempt to one sink, bounded by the publish timeout.
    pub async fn deliver(&self, name: &str, event: &DomainEvent) -> SinkOutcome {
        let required = self.is_required(name);
        let Some(sink) = self.sinks.get(name) else {
            return SinkOutcome { sink: name.to_string(), required, error: Some("sink not attached".into()) };
        };
        let mode = self.transforms.get(name).copied().unwrap_or(self.default_transform);
        let payload = transform(event, mode);

        let started = Instant::now();
        let result = tokio::time::timeout(self.timeout, sink.publish(&payload)).await;
        self.latency.record(name, started.elapsed());

        let error = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("timed out after {:?}", self.timeout)),
        };
        if let Some(err) = &error {
            warn!(sink = %name, required, event_id = %event.event_id, "sink publish failed: {err}");
        }
        SinkOutcome { sink: name.to_string(), required, error }
    }

    /// Flushes one attached sink, logging failures.
    pub async fn flush(&self, name: &str) {
        let Some(sink) = self.sinks.get(name) else {
            return;
        };
        if let Err(e) = sink.flush().await {
            warn!(sink = %name, "sink flush failed: {e}");
        }
    }
}
