use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::catalog::{fetch_all_markets, resolve_tag_ids, CatalogGateway};
use crate::clock::Clock;
use crate::config::{AppConfig, SignalsConfig, DISCOVERY_DEGRADED_AFTER};
use crate::detector::cooldown::{CooldownKey, Cooldowns};
use crate::error::{AppError, Result};
use crate::selection::{MarketSelector, Selection};
use crate::subscription::SubscriptionController;
use crate::types::{DomainEvent, EventType, Market, MarketFilter, SignalKind};

/// Volume samples for markets without an order book, polled once per cycle.
struct WebVolumeTracker {
    window_ms: i64,
    threshold_per_min: f64,
    /// market_id → (volume_24h, sampled_at_ms)
    samples: HashMap<String, (f64, i64)>,
    cooldowns: Cooldowns,
}

impl WebVolumeTracker {
    fn new(cfg: &SignalsConfig) -> Self {
        Self {
            window_ms: (cfg.web_volume_window_sec.max(1) as i64) * 1000,
            threshold_per_min: cfg.big_volume_1m_usd,
            samples: HashMap::new(),
            cooldowns: Cooldowns::new(cfg.cooldown_sec),
        }
    }

    /// Compares each market against the sample taken at least one window ago;
    /// the threshold scales with the elapsed time.
    fn observe(&mut self, markets: &[Market], now_ms: i64) -> Vec<DomainEvent> {
        let mut out = Vec::new();
        for market in markets {
            let Some(volume) = market.volume_24h else { continue };
            let Some(&(prev, sampled_at)) = self.samples.get(&market.id) else {
                self.samples.insert(market.id.clone(), (volume, now_ms));
                continue;
            };
            let elapsed_ms = now_ms - sampled_at;
            if elapsed_ms < self.window_ms {
                continue;
            }
            self.samples.insert(market.id.clone(), (volume, now_ms));

            let delta = (volume - prev).max(0.0);
            let window_sec = (elapsed_ms / 1000).max(1);
            let threshold = self.threshold_per_min * window_sec as f64 / 60.0;
            if delta < threshold {
                continue;
            }
            let key = CooldownKey {
                market_id: market.id.clone(),
                token_id: String::new(),
                signal: SignalKind::WebVolumeSpike,
            };
            if !self.cooldowns.try_fire(key, now_ms) {
                continue;
            }
            out.push(
                DomainEvent::signal(SignalKind::WebVolumeSpike, now_ms)
                    .for_market(market)
                    .metric("delta_volume", (delta * 10_000.0).round() / 10_000.0)
                    .metric("volume_24h", volume)
                    .metric("window_sec", window_sec)
                    .metric("threshold", threshold)
                    .metric("source", "gamma"),
            );
        }
        let live: HashSet<&str> = markets.iter().map(|m| m.id.as_str()).collect();
        self.samples.retain(|id, _| live.contains(id.as_str()));
        out
    }
}

/// Periodic discovery: catalog → selection → subscription reconcile, plus
/// the discovery-side events.
pub struct MarketDiscovery {
    categories: Vec<String>,
    refresh_interval: Duration,
    page_size: usize,
    web_volume_enabled: bool,
    catalog: Arc<dyn CatalogGateway>,
    selector: MarketSelector,
    controller: SubscriptionController,
    clock: Arc<dyn Clock>,
    events_tx: mpsc::Sender<DomainEvent>,
    expired_rx: mpsc::Receiver<String>,
    shutdown: CancellationToken,

    /// Raw records per category from the last cycle that fetched them.
    last_raw: BTreeMap<String, Vec<Market>>,
    /// Candidates plus unsubscribable markets seen last cycle, by id.
    known: HashMap<String, Market>,
    cycles_ok: u64,
    status_sent: bool,
    consecutive_failures: u32,
    web_volume: WebVolumeTracker,
}

impl MarketDiscovery {
    pub fn new(
        cfg: &AppConfig,
        catalog: Arc<dyn CatalogGateway>,
        controller: SubscriptionController,
        clock: Arc<dyn Clock>,
        events_tx: mpsc::Sender<DomainEvent>,
        expired_rx: mpsc::Receiver<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            categories: cfg.categories(),
            refresh_interval: Duration::from_secs(cfg.app.refresh_interval_sec),
            page_size: cfg.gamma.page_size,
            web_volume_enabled: cfg.signals.web_volume_enabled,
            catalog,
            selector: MarketSelector::new(cfg.filters.clone(), cfg.rolling.clone()),
            controller,
            clock,
            events_tx,
            expired_rx,
            shutdown,
            last_raw: BTreeMap::new(),
            known: HashMap::new(),
            cycles_ok: 0,
            status_sent: false,
            consecutive_failures: 0,
            web_volume: WebVolumeTracker::new(&cfg.signals),
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut ticker = interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(token) = self.expired_rx.recv() => self.controller.mark_expired(token),
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        result = self.run_cycle() => result?,
                    }
                }
            }
        }
        info!(cycles_ok = self.cycles_ok, "[DISCOVERY] stopped");
        Ok(())
    }

    /// One discovery cycle. Upstream failures are absorbed and counted; only
    /// a closed event or command channel is returned as an error.
    pub async fn run_cycle(&mut self) -> Result<()> {
        let started_ms = self.clock.now_ms();
        match self.fetch_raw().await {
            Ok(raw) => self.apply(raw, started_ms).await,
            Err(e) => self.record_failure(e).await,
        }
    }

    async fn fetch_raw(&mut self) -> Result<BTreeMap<String, Vec<Market>>> {
        let tags = self.catalog.list_tags().await?;
        let resolved = resolve_tag_ids(&tags, &self.categories);

        let mut raw = BTreeMap::new();
        let mut attempted = 0usize;
        let mut failed = 0usize;
        for (category, tag_id) in resolved {
            let Some(tag_id) = tag_id else {
                warn!(category = %category, "[DISCOVERY] no tag matches category");
                raw.insert(category, Vec::new());
                continue;
            };
            attempted += 1;
            let filter = MarketFilter { tag_id: Some(tag_id), active: true, closed: false };
            let outcome = fetch_all_markets(self.catalog.as_ref(), &filter, self.page_size).await;
            if outcome.is_failed() {
                failed += 1;
                let kept = self.last_raw.get(&category).cloned().unwrap_or_default();
                warn!(category = %category, kept = kept.len(), "[DISCOVERY] category fetch failed, keeping previous markets");
                raw.insert(category, kept);
                continue;
            }
            if outcome.is_partial() {
                warn!(
                    category = %category,
                    pages = outcome.pages,
                    markets = outcome.markets.len(),
                    "[DISCOVERY] partial category fetch"
                );
            }
            raw.insert(category, outcome.markets);
        }

        if attempted > 0 && failed == attempted {
            return Err(AppError::Catalog(format!("all {attempted} category fetches failed")));
        }
        Ok(raw)
    }

    async fn apply(&mut self, raw: BTreeMap<String, Vec<Market>>, started_ms: i64) -> Result<()> {
        self.last_raw = raw.clone();
        let now_ms = self.clock.now_ms();
        let selection = self.selector.refresh(raw, now_ms);

        if self.cycles_ok > 0 {
            self.emit_lifecycle_diff(&selection, now_ms).await?;
        }
        for rollover in &selection.rollovers {
            let mut event = DomainEvent::new(EventType::MarketLifecycle, now_ms)
                .category(rollover.category.clone())
                .metric("action", "primary_changed")
                .metric("previous_market_id", rollover.previous_market_id.clone());
            event.market_id = Some(rollover.market_id.clone());
            event.topic_key = Some(rollover.topic_key.clone());
            event.title = selection.markets().find(|m| m.id == rollover.market_id).map(|m| m.question.clone());
            self.emit(event).await?;
        }

        let (_, changed) = self.controller.reconcile(&selection, now_ms).await?;
        if let Some(event) = changed {
            self.emit(event).await?;
        }

        for (category, markets) in &selection.candidates {
            let listing: Vec<_> = markets
                .iter()
                .map(|m| {
                    json!({
                        "market_id": m.id,
                        "question": m.question,
                        "liquidity": m.liquidity,
                        "volume_24h": m.volume_24h,
                        "end_ts": m.end_ts_ms,
                        "token_ids": m.token_ids().collect::<Vec<_>>(),
                    })
                })
                .collect();
            let event = DomainEvent::new(EventType::CandidateSelected, now_ms)
                .category(category.clone())
                .metric("market_count", markets.len())
                .raw(json!({ "markets": listing }));
            self.emit(event).await?;
        }

        if self.web_volume_enabled {
            for event in self.web_volume.observe(&selection.unsubscribable, now_ms) {
                self.emit(event).await?;
            }
        }

        if !self.status_sent {
            self.emit(monitoring_status(&selection, self.controller.active_count(), now_ms)).await?;
            self.status_sent = true;
        }

        let duration_ms = self.clock.now_ms() - started_ms;
        if self.consecutive_failures >= DISCOVERY_DEGRADED_AFTER {
            let event = DomainEvent::new(EventType::HealthEvent, now_ms)
                .metric("status", "refresh_ok")
                .metric("component", "discovery")
                .metric("duration_ms", duration_ms)
                .metric("failed_cycles", i64::from(self.consecutive_failures));
            self.emit(event).await?;
        }
        self.consecutive_failures = 0;
        self.cycles_ok += 1;
        info!(
            markets = selection.market_count(),
            unsubscribable = selection.unsubscribable.len(),
            tokens = self.controller.active_count(),
            rollovers = selection.rollovers.len(),
            duration_ms,
            "[DISCOVERY] cycle complete"
        );

        self.known = selection
            .markets()
            .chain(selection.unsubscribable.iter())
            .map(|m| (m.id.clone(), m.clone()))
            .collect();
        Ok(())
    }

    async fn emit_lifecycle_diff(&self, selection: &Selection, now_ms: i64) -> Result<()> {
        let current: HashMap<&str, &Market> = selection
            .markets()
            .chain(selection.unsubscribable.iter())
            .map(|m| (m.id.as_str(), m))
            .collect();

        let mut removed: Vec<&Market> = self.known.values().filter(|m| !current.contains_key(m.id.as_str())).collect();
        removed.sort_by(|a, b| a.id.cmp(&b.id));
        let mut added: Vec<&Market> = current.values().copied().filter(|m| !self.known.contains_key(&m.id)).collect();
        added.sort_by(|a, b| a.id.cmp(&b.id));

        let events: Vec<DomainEvent> = removed
            .into_iter()
            .map(|m| (m, "removed"))
            .chain(added.into_iter().map(|m| (m, "new")))
            .map(|(m, action)| {
                DomainEvent::new(EventType::MarketLifecycle, now_ms)
                    .for_market(m)
                    .metric("action", action)
                    .metric("end_ts", m.end_ts_ms.unwrap_or(0))
            })
            .collect();
        for event in events {
            self.emit(event).await?;
        }
        Ok(())
    }

    async fn record_failure(&mut self, e: AppError) -> Result<()> {
        self.consecutive_failures += 1;
        warn!(failures = self.consecutive_failures, "[DISCOVERY] cycle failed: {e}");
        if self.consecutive_failures == DISCOVERY_DEGRADED_AFTER {
            error!(failures = self.consecutive_failures, "[DISCOVERY] degraded");
            let event = DomainEvent::new(EventType::HealthEvent, self.clock.now_ms())
                .metric("status", "discovery_degraded")
                .metric("component", "discovery")
                .metric("failed_cycles", i64::from(self.consecutive_failures))
                .metric("reason", e.to_string());
            self.emit(event).await?;
        }
        Ok(())
    }

    async fn emit(&self, event: DomainEvent) -> Result<()> {
        self.events_tx
            .send(event)
            .await
            .map_err(|e| AppError::ChannelSend(format!("discovery events: {e}")))
    }
}

fn market_listing<'a>(markets: impl Iterator<Item = &'a Market>) -> Vec<serde_json::Value> {
    markets
        .map(|m| {
            json!({
                "market_id": m.id,
                "title": m.question,
                "category": m.category,
                "end_ts": m.end_ts_ms,
            })
        })
        .collect()
}

fn monitoring_status(selection: &Selection, token_count: usize, now_ms: i64) -> DomainEvent {
    let subscribed = market_listing(selection.markets());
    let unsubscribable = market_listing(selection.unsubscribable.iter());
    DomainEvent::new(EventType::MonitoringStatus, now_ms)
        .metric("status", "connected")
        .metric("market_count", selection.market_count())
        .metric("token_count", token_count)
        .metric("category_count", selection.candidates.len())
        .metric("unsubscribable_count", selection.unsubscribable.len())
        .raw(json!({
            "subscribed_markets": subscribed,
            "unsubscribable_markets": unsubscribable,
        }))
}

#[cfg(test)]
mod tests {
    use tokio::sync::watch;

    use super::*;
    use crate::catalog::test_support::market;
    use crate::catalog::StaticCatalog;
    use crate::clock::ManualClock;
    use crate::subscription::FeedCommand;
    use crate::types::{Tag, TokenRegistry};

    struct Harness {
        discovery: MarketDiscovery,
        catalog: Arc<StaticCatalog>,
        clock: Arc<ManualClock>,
        events: mpsc::Receiver<DomainEvent>,
        commands: mpsc::Receiver<FeedCommand>,
        _registry: watch::Receiver<Arc<TokenRegistry>>,
        _expired: mpsc::Sender<String>,
    }

    impl Harness {
        fn new(cfg: AppConfig) -> Self {
            let catalog = Arc::new(StaticCatalog::new(vec![
                Tag { id: "t-fin".into(), slug: Some("finance".into()), name: Some("Finance".into()) },
                Tag { id: "t-geo".into(), slug: Some("geopolitics".into()), name: Some("Geopolitics".into()) },
            ]));
            let clock = Arc::new(ManualClock::new(1_000_000));
            let (cmd_tx, commands) = mpsc::channel(64);
            let (reg_tx, registry) = watch::channel(Arc::new(TokenRegistry::new()));
            let (events_tx, events) = mpsc::channel(256);
            let (expired_tx, expired_rx) = mpsc::channel(8);
            let discovery = MarketDiscovery::new(
                &cfg,
                catalog.clone(),
                SubscriptionController::new(cmd_tx, reg_tx),
                clock.clone(),
                events_tx,
                expired_rx,
                CancellationToken::new(),
            );
            Self { discovery, catalog, clock, events, commands, _registry: registry, _expired: expired_tx }
        }

        fn drain(&mut self) -> Vec<DomainEvent> {
            let mut out = Vec::new();
            while let Ok(ev) = self.events.try_recv() {
                out.push(ev);
            }
            out
        }
    }

    fn of_type(events: &[DomainEvent], t: EventType) -> Vec<&DomainEvent> {
        events.iter().filter(|e| e.event_type == t).collect()
    }

    fn no_book(mut m: Market) -> Market {
        m.enable_orderbook = Some(false);
        m
    }

    #[tokio::test]
    async fn first_cycle_subscribes_and_reports() {
        let mut h = Harness::new(AppConfig::default());
        h.catalog.set_markets("t-fin", vec![market("f1", 10.0, 10.0), no_book(market("f2", 5.0, 5.0))]);
        h.catalog.set_markets("t-geo", vec![market("g1", 10.0, 10.0)]);

        h.discovery.run_cycle().await.unwrap();
        let events = h.drain();

        assert!(of_type(&events, EventType::MarketLifecycle).is_empty());
        assert_eq!(of_type(&events, EventType::SubscriptionChanged).len(), 1);
        let candidates = of_type(&events, EventType::CandidateSelected);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].category.as_deref(), Some("finance"));
        assert_eq!(candidates[0].metric_f64("market_count"), Some(1.0));
        let status = of_type(&events, EventType::MonitoringStatus);
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].metric_f64("token_count"), Some(4.0));
        assert_eq!(status[0].metric_f64("unsubscribable_count"), Some(1.0));
        assert!(matches!(h.commands.try_recv().unwrap(), FeedCommand::Subscribe(t) if t.len() == 4));

        h.discovery.run_cycle().await.unwrap();
        let events = h.drain();
        assert!(of_type(&events, EventType::MonitoringStatus).is_empty());
        assert!(of_type(&events, EventType::SubscriptionChanged).is_empty());
        assert!(h.commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn lifecycle_new_and_removed_after_first_cycle() {
        let mut h = Harness::new(AppConfig::default());
        h.catalog.set_markets("t-fin", vec![market("a", 10.0, 10.0), market("b", 10.0, 10.0)]);
        h.discovery.run_cycle().await.unwrap();
        h.drain();

        h.catalog.set_markets("t-fin", vec![market("b", 10.0, 10.0), market("c", 10.0, 10.0)]);
        h.discovery.run_cycle().await.unwrap();
        let events = h.drain();
        let lifecycle: Vec<(String, String)> = of_type(&events, EventType::MarketLifecycle)
            .iter()
            .map(|e| (e.market_id.clone().unwrap(), e.metrics["action"].to_string()))
            .collect();
        assert_eq!(lifecycle, vec![("a".into(), "removed".into()), ("c".into(), "new".into())]);
        let changed = of_type(&events, EventType::SubscriptionChanged);
        assert_eq!(changed[0].metric_f64("added_count"), Some(2.0));
        assert_eq!(changed[0].metric_f64("removed_count"), Some(2.0));
    }

    #[tokio::test]
    async fn rollover_emits_primary_changed() {
        let mut h = Harness::new(AppConfig::default());
        let mut old = market("old", 200.0, 10.0);
        let mut next = market("next", 100.0, 10.0);
        old.topic_key = "btc daily".into();
        next.topic_key = "btc daily".into();
        h.catalog.set_markets("t-fin", vec![old.clone(), next.clone()]);
        h.discovery.run_cycle().await.unwrap();
        h.drain();

        old.closed = true;
        h.catalog.set_markets("t-fin", vec![old, next]);
        h.discovery.run_cycle().await.unwrap();
        let events = h.drain();
        let rolled: Vec<&DomainEvent> = of_type(&events, EventType::MarketLifecycle)
            .into_iter()
            .filter(|e| e.metrics["action"].as_str() == Some("primary_changed"))
            .collect();
        assert_eq!(rolled.len(), 1);
        assert_eq!(rolled[0].market_id.as_deref(), Some("next"));
        assert_eq!(rolled[0].metrics["previous_market_id"].as_str(), Some("old"));
        assert_eq!(rolled[0].topic_key.as_deref(), Some("btc daily"));
    }

    #[tokio::test]
    async fn three_failed_cycles_degrade_then_recover() {
        let mut h = Harness::new(AppConfig::default());
        h.catalog.set_markets("t-fin", vec![market("a", 10.0, 10.0)]);
        h.catalog.set_fail_tags(true);
        for _ in 0..4 {
            h.discovery.run_cycle().await.unwrap();
        }
        let events = h.drain();
        let health = of_type(&events, EventType::HealthEvent);
        assert_eq!(health.len(), 1, "degradation is reported once");
        assert_eq!(health[0].metrics["status"].as_str(), Some("discovery_degraded"));
        assert!(of_type(&events, EventType::SubscriptionChanged).is_empty());

        h.catalog.set_fail_tags(false);
        h.discovery.run_cycle().await.unwrap();
        let events = h.drain();
        let health = of_type(&events, EventType::HealthEvent);
        assert_eq!(health.len(), 1);
        assert_eq!(health[0].metrics["status"].as_str(), Some("refresh_ok"));
        assert_eq!(health[0].metric_f64("failed_cycles"), Some(4.0));
    }

    #[tokio::test]
    async fn failed_category_keeps_previous_markets() {
        let mut h = Harness::new(AppConfig::default());
        h.catalog.set_markets("t-fin", vec![market("f1", 10.0, 10.0)]);
        h.catalog.set_markets("t-geo", vec![market("g1", 10.0, 10.0)]);
        h.discovery.run_cycle().await.unwrap();
        h.drain();
        while h.commands.try_recv().is_ok() {}

        // Cycle one used calls 0 and 1; call 2 is the next finance page.
        h.catalog.fail_pages.lock().unwrap().push(2);
        h.discovery.run_cycle().await.unwrap();
        let events = h.drain();
        assert!(of_type(&events, EventType::SubscriptionChanged).is_empty());
        assert!(of_type(&events, EventType::MarketLifecycle).is_empty());
        assert!(h.commands.try_recv().is_err(), "nothing unsubscribed");
    }

    #[tokio::test]
    async fn web_volume_spike_for_markets_without_book() {
        let mut cfg = AppConfig::default();
        cfg.signals.big_volume_1m_usd = 1_000.0;
        cfg.signals.web_volume_window_sec = 60;
        let mut h = Harness::new(cfg);

        let mut grey = no_book(market("grey", 10.0, 5_000.0));
        h.catalog.set_markets("t-fin", vec![grey.clone()]);
        h.discovery.run_cycle().await.unwrap();
        h.drain();

        // Not yet a full window since the first sample.
        h.clock.advance(30_000);
        grey.volume_24h = Some(9_000.0);
        h.catalog.set_markets("t-fin", vec![grey.clone()]);
        h.discovery.run_cycle().await.unwrap();
        assert!(h.drain().iter().all(|e| e.signal_name() != Some("web_volume_spike")));

        h.clock.advance(90_000);
        h.discovery.run_cycle().await.unwrap();
        let events = h.drain();
        let spikes: Vec<&DomainEvent> = events.iter().filter(|e| e.signal_name() == Some("web_volume_spike")).collect();
        assert_eq!(spikes.len(), 1);
        assert_eq!(spikes[0].event_type, EventType::TradeSignal);
        assert_eq!(spikes[0].metric_f64("delta_volume"), Some(4_000.0));
        assert_eq!(spikes[0].metric_f64("window_sec"), Some(120.0));
        assert_eq!(spikes[0].market_id.as_deref(), Some("grey"));
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let h = Harness::new(AppConfig::default());
        let shutdown = h.discovery.shutdown.clone();
        let task = tokio::spawn(h.discovery.run());
        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
