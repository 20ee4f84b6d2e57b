use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::{MajorChangeSource, SignalsConfig};
use crate::detector::cooldown::{CooldownKey, Cooldowns};
use crate::detector::window::{PriceHistory, SlidingWindow};
use crate::types::{
    BookLevel, BookUpdate, DomainEvent, EventType, FeedEvent, LifecycleNotice, QuoteUpdate, SignalKind, Tick,
    TokenMeta, TokenRegistry, TradeTick,
};

/// Float slack for threshold comparisons on cent-sized moves (0.03 - 0.02 < 0.01 in f64).
const EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PriceSource {
    Trade,
    Book,
}

impl PriceSource {
    fn as_str(&self) -> &'static str {
        match self {
            PriceSource::Trade => "trade",
            PriceSource::Book => "book",
        }
    }
}

struct PriceMove {
    price: f64,
    ts_ms: i64,
    notional: Option<f64>,
    source: PriceSource,
    /// Quote carried by the same update, preferred over the cached one.
    quote: Option<(f64, f64)>,
}

/// Per-token rolling state and detection rules.
///
/// Owned by the detector task alone; no locking. Window and cooldown time is
/// the tick's own timestamp, so replays evaluate the same way live ticks do.
pub struct SignalEngine {
    cfg: SignalsConfig,
    clock: Arc<dyn Clock>,
    registry: Arc<TokenRegistry>,
    windows: HashMap<String, SlidingWindow>,
    prices: HashMap<String, PriceHistory>,
    /// token_id → (best_bid, best_ask)
    quotes: HashMap<String, (f64, f64)>,
    cooldowns: Cooldowns,
    /// Tokens already reported expired, so each is reported once.
    expired: HashSet<String>,
    pending_expired: Vec<String>,
    signals_emitted: u64,
}

impl SignalEngine {
    pub fn new(cfg: SignalsConfig, clock: Arc<dyn Clock>) -> Self {
        let cooldowns = Cooldowns::new(cfg.cooldown_sec);
        Self {
            cfg,
            clock,
            registry: Arc::new(TokenRegistry::new()),
            windows: HashMap::new(),
            prices: HashMap::new(),
            quotes: HashMap::new(),
            cooldowns,
            expired: HashSet::new(),
            pending_expired: Vec::new(),
            signals_emitted: 0,
        }
    }

    /// Swaps in new token metadata and drops state for tokens that left it.
    pub fn update_registry(&mut self, registry: Arc<TokenRegistry>) {
        self.windows.retain(|t, _| registry.contains_key(t));
        self.prices.retain(|t, _| registry.contains_key(t));
        self.quotes.retain(|t, _| registry.contains_key(t));
        self.expired.retain(|t| registry.contains_key(t));
        self.cooldowns.retain_tokens(|t| registry.contains_key(t));
        debug!(tokens = registry.len(), "detector registry updated");
        self.registry = registry;
    }

    pub fn tracked_tokens(&self) -> usize {
        self.registry.len()
    }

    pub fn signals_emitted(&self) -> u64 {
        self.signals_emitted
    }

    /// Tokens found expired since the last call.
    pub fn take_expired(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_expired)
    }

    pub fn on_event(&mut self, event: &FeedEvent) -> Vec<DomainEvent> {
        match event {
            FeedEvent::Tick(tick) => self.on_tick(tick),
            FeedEvent::Baseline(tick) => {
                self.seed(tick);
                Vec::new()
            }
            FeedEvent::Lifecycle(notice) => self.on_lifecycle(notice).into_iter().collect(),
        }
    }

    pub fn on_tick(&mut self, tick: &Tick) -> Vec<DomainEvent> {
        let registry = self.registry.clone();
        let Some(meta) = registry.get(tick.token_id()) else {
            return Vec::new();
        };
        if self.is_expired(meta) {
            return Vec::new();
        }
        match tick {
            Tick::Trade(trade) => self.on_trade(meta, trade),
            Tick::Book(book) => self.on_book(meta, book),
            Tick::Quote(quote) => self.on_quote(meta, quote),
        }
    }

    fn is_expired(&mut self, meta: &TokenMeta) -> bool {
        let now = self.clock.now_ms();
        if !meta.end_ts_ms.is_some_and(|end| end <= now) {
            return false;
        }
        if self.expired.insert(meta.token_id.clone()) {
            info!(token_id = %meta.token_id, market_id = %meta.market_id, "market expired, flagging token");
            self.pending_expired.push(meta.token_id.clone());
        }
        true
    }

    /// Snapshot-burst data: state only, no rules.
    fn seed(&mut self, tick: &Tick) {
        if !self.registry.contains_key(tick.token_id()) {
            return;
        }
        let history_ms = self.major_window_ms();
        match tick {
            Tick::Trade(t) => {
                self.window(&t.token_id).push(t.ts_ms, t.notional);
                self.prices
                    .entry(t.token_id.clone())
                    .or_insert_with(|| PriceHistory::new(history_ms))
                    .push(t.ts_ms, t.price);
            }
            Tick::Book(b) => {
                if let Some((bid, ask)) = self.set_quote(&b.token_id, b.best_bid(), b.best_ask()) {
                    self.prices
                        .entry(b.token_id.clone())
                        .or_insert_with(|| PriceHistory::new(history_ms))
                        .push(b.ts_ms, (bid + ask) / 2.0);
                }
            }
            Tick::Quote(q) => {
                if let Some((bid, ask)) = self.set_quote(&q.token_id, q.best_bid, q.best_ask) {
                    self.prices
                        .entry(q.token_id.clone())
                        .or_insert_with(|| PriceHistory::new(history_ms))
                        .push(q.ts_ms, (bid + ask) / 2.0);
                }
            }
        }
    }

    fn on_trade(&mut self, meta: &TokenMeta, trade: &TradeTick) -> Vec<DomainEvent> {
        let mut out = Vec::new();
        let window = self.window(&trade.token_id);
        window.push(trade.ts_ms, trade.notional);
        let vol = window.total(trade.ts_ms);

        if self.source_enabled(PriceSource::Trade) {
            let mv = PriceMove {
                price: trade.price,
                ts_ms: trade.ts_ms,
                notional: Some(trade.notional),
                source: PriceSource::Trade,
                quote: None,
            };
            out.extend(self.major_change(meta, mv));
        }

        let is_big_trade = trade.notional >= self.cfg.big_trade_usd;
        let is_spike = vol >= self.cfg.big_volume_1m_usd;

        if is_big_trade {
            // A trade that alone crosses the line also explains the spike: one event.
            let fired = self.emit(meta, SignalKind::BigTrade, trade.ts_ms, |e| {
                let e = e
                    .metric("notional", trade.notional)
                    .metric("price", trade.price)
                    .metric("size", trade.size);
                if is_spike {
                    e.metric("vol_1m", vol)
                } else {
                    e
                }
            });
            out.extend(fired);
            if is_spike {
                return out;
            }
        }

        if is_spike {
            out.extend(self.emit(meta, SignalKind::VolumeSpike, trade.ts_ms, |e| {
                e.metric("vol_1m", vol).metric("price", trade.price).metric("size", trade.size)
            }));
        }
        out
    }

    fn on_book(&mut self, meta: &TokenMeta, book: &BookUpdate) -> Vec<DomainEvent> {
        let mut out = Vec::new();
        let quote = self.set_quote(&book.token_id, book.best_bid(), book.best_ask());

        if let (Some((bid, ask)), true) = (quote, self.source_enabled(PriceSource::Book)) {
            let mv = PriceMove {
                price: (bid + ask) / 2.0,
                ts_ms: book.ts_ms,
                notional: None,
                source: PriceSource::Book,
                quote,
            };
            out.extend(self.major_change(meta, mv));
        }

        if let Some(threshold) = self.cfg.big_wall_size {
            let levels = self.cfg.big_wall_levels;
            let bid_wall = depth(&book.bids, levels);
            let ask_wall = depth(&book.asks, levels);
            let (side, wall) = if bid_wall >= ask_wall { ("bid", bid_wall) } else { ("ask", ask_wall) };
            if wall >= threshold {
                out.extend(self.emit(meta, SignalKind::BigWall, book.ts_ms, |e| {
                    e.metric("side", side)
                        .metric("wall_size", wall)
                        .metric("levels", levels)
                        .metric("threshold", threshold)
                }));
            }
        }
        out
    }

    fn on_quote(&mut self, meta: &TokenMeta, quote: &QuoteUpdate) -> Vec<DomainEvent> {
        let Some((bid, ask)) = self.set_quote(&quote.token_id, quote.best_bid, quote.best_ask) else {
            return Vec::new();
        };
        if !self.source_enabled(PriceSource::Book) {
            return Vec::new();
        }
        let mv = PriceMove {
            price: (bid + ask) / 2.0,
            ts_ms: quote.ts_ms,
            notional: None,
            source: PriceSource::Book,
            quote: Some((bid, ask)),
        };
        self.major_change(meta, mv).into_iter().collect()
    }

    fn on_lifecycle(&mut self, notice: &LifecycleNotice) -> Option<DomainEvent> {
        let now = self.clock.now_ms();
        let meta = notice.token_ids.iter().find_map(|t| self.registry.get(t)).cloned();

        if notice.action == "market_resolved" {
            for token in notice.token_ids.iter().filter(|t| self.registry.contains_key(*t)) {
                if self.expired.insert(token.clone()) {
                    self.pending_expired.push(token.clone());
                }
            }
        }

        let mut event = DomainEvent::new(EventType::MarketLifecycle, now)
            .metric("action", notice.action.as_str())
            .metric("origin", "feed")
            .raw(notice.raw.clone());
        if let Some(meta) = &meta {
            event = event.for_token(meta);
            event.side = None;
        }
        if notice.market_id.is_some() {
            event.market_id = notice.market_id.clone();
        }
        if event.title.is_none() {
            event.title = notice.title.clone();
        }
        if event.token_id.is_none() {
            event.token_id = notice.token_ids.first().cloned();
        }
        info!(action = %notice.action, market_id = ?event.market_id, "feed lifecycle notice");
        Some(event)
    }

    fn major_change(&mut self, meta: &TokenMeta, mv: PriceMove) -> Option<DomainEvent> {
        let history_ms = self.major_window_ms();
        let history = self
            .prices
            .entry(meta.token_id.clone())
            .or_insert_with(|| PriceHistory::new(history_ms));
        let reference = history.reference(mv.ts_ms);
        history.push(mv.ts_ms, mv.price);
        let (_, prev_price) = reference?;
        if prev_price <= 0.0 || mv.price <= 0.0 {
            return None;
        }

        let delta = mv.price - prev_price;
        let abs_delta = delta.abs();

        let k = self.cfg.major_change_spread_gate_k;
        if k > 0.0 {
            let spread = mv
                .quote
                .or_else(|| self.quotes.get(&meta.token_id).copied())
                .map(|(bid, ask)| (ask - bid).max(0.0));
            if let Some(spread) = spread.filter(|s| *s > 0.0) {
                if abs_delta + EPS < k * spread {
                    debug!(token_id = %meta.token_id, spread, delta = abs_delta, "major change suppressed: spread gate");
                    return None;
                }
            }
        }

        let pct_signed = delta / prev_price * 100.0;
        let pct = pct_signed.abs();
        if self.in_low_price_zone(prev_price, mv.price) {
            if abs_delta + EPS < self.cfg.major_change_low_price_abs {
                return None;
            }
        } else if self.cfg.major_change_pct <= 0.0 || pct < self.cfg.major_change_pct {
            return None;
        }

        // Book updates carry no notional; the gate only applies to trades.
        if mv.source == PriceSource::Trade && self.cfg.major_change_min_notional > 0.0 {
            let notional = mv.notional.unwrap_or(0.0);
            if notional < self.cfg.major_change_min_notional {
                return None;
            }
        }

        let window_sec = self.cfg.major_change_window_sec as i64;
        let event = self.emit(meta, SignalKind::MajorChange, mv.ts_ms, |e| {
            e.metric("pct_change", round4(pct))
                .metric("pct_change_signed", round4(pct_signed))
                .metric("direction", if pct_signed > 0.0 { "up" } else { "down" })
                .metric("price", mv.price)
                .metric("prev_price", prev_price)
                .metric("window_sec", window_sec)
                .metric("notional", mv.notional.unwrap_or(0.0))
                .metric("source", mv.source.as_str())
        });
        if event.is_some() {
            if let Some(history) = self.prices.get_mut(&meta.token_id) {
                history.rebase(mv.ts_ms, mv.price);
            }
        }
        event
    }

    fn in_low_price_zone(&self, prev: f64, price: f64) -> bool {
        self.cfg.major_change_low_price_abs > 0.0
            && self.cfg.major_change_low_price_max > 0.0
            && prev.min(price) <= self.cfg.major_change_low_price_max
    }

    fn source_enabled(&self, source: PriceSource) -> bool {
        match self.cfg.major_change_source {
            MajorChangeSource::Any => true,
            MajorChangeSource::Trade => source == PriceSource::Trade,
            MajorChangeSource::Book => source == PriceSource::Book,
        }
    }

    fn emit<F>(&mut self, meta: &TokenMeta, kind: SignalKind, ts_ms: i64, build: F) -> Option<DomainEvent>
    where
        F: FnOnce(DomainEvent) -> DomainEvent,
    {
        let key = CooldownKey {
            market_id: meta.market_id.clone(),
            token_id: meta.token_id.clone(),
            signal: kind,
        };
        if !self.cooldowns.try_fire(key, ts_ms) {
            debug!(signal = %kind, token_id = %meta.token_id, "signal suppressed: cooldown");
            return None;
        }
        self.signals_emitted += 1;
        let event = build(DomainEvent::signal(kind, self.clock.now_ms()).for_token(meta));
        info!(
            signal = %kind,
            event_type = %event.event_type,
            market_id = %meta.market_id,
            token_id = %meta.token_id,
            "signal emitted"
        );
        Some(event)
    }

    fn window(&mut self, token_id: &str) -> &mut SlidingWindow {
        let window_ms = (self.cfg.volume_window_sec as i64) * 1000;
        self.windows
            .entry(token_id.to_string())
            .or_insert_with(|| SlidingWindow::new(window_ms))
    }

    /// Caches a two-sided quote; one-sided quotes clear it.
    fn set_quote(&mut self, token_id: &str, bid: Option<f64>, ask: Option<f64>) -> Option<(f64, f64)> {
        match (bid, ask) {
            (Some(bid), Some(ask)) => {
                self.quotes.insert(token_id.to_string(), (bid, ask));
                Some((bid, ask))
            }
            _ => {
                self.quotes.remove(token_id);
                None
            }
        }
    }

    fn major_window_ms(&self) -> i64 {
        (self.cfg.major_change_window_sec as i64) * 1000
    }
}

fn depth(levels: &[BookLevel], n: usize) -> f64 {
    levels.iter().take(n).map(|l| l.size).sum()
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const TOKEN: &str = "tok-yes";

    fn meta(end_ts_ms: Option<i64>) -> TokenMeta {
        TokenMeta {
            token_id: TOKEN.into(),
            market_id: "m1".into(),
            title: "Will it happen?".into(),
            category: "finance".into(),
            topic_key: "it".into(),
            side: Some("yes".into()),
            end_ts_ms,
        }
    }

    fn quiet() -> SignalsConfig {
        SignalsConfig {
            big_trade_usd: 1e12,
            big_volume_1m_usd: 1e12,
            major_change_pct: 0.0,
            major_change_low_price_abs: 0.0,
            ..SignalsConfig::default()
        }
    }

    fn engine(cfg: SignalsConfig) -> SignalEngine {
        let mut e = SignalEngine::new(cfg, Arc::new(ManualClock::new(0)));
        e.update_registry(Arc::new(TokenRegistry::from([(TOKEN.to_string(), meta(None))])));
        e
    }

    fn trade(ts_sec: i64, price: f64, size: f64) -> FeedEvent {
        FeedEvent::Tick(Tick::Trade(TradeTick {
            token_id: TOKEN.into(),
            price,
            size,
            notional: price * size,
            ts_ms: ts_sec * 1000,
            seq: None,
        }))
    }

    fn quote(ts_sec: i64, bid: f64, ask: f64) -> FeedEvent {
        FeedEvent::Tick(Tick::Quote(QuoteUpdate {
            token_id: TOKEN.into(),
            best_bid: Some(bid),
            best_ask: Some(ask),
            ts_ms: ts_sec * 1000,
        }))
    }

    fn signals(events: &[DomainEvent]) -> Vec<&str> {
        events.iter().filter_map(|e| e.signal_name()).collect()
    }

    #[test]
    fn volume_spike_fires_once_when_window_crosses() {
        let mut e = engine(SignalsConfig { big_volume_1m_usd: 10_000.0, ..quiet() });
        assert!(e.on_event(&trade(0, 0.5, 8_000.0)).is_empty());
        assert!(e.on_event(&trade(30, 0.5, 8_000.0)).is_empty(), "$8k < $10k");
        let fired = e.on_event(&trade(50, 0.5, 8_000.0));
        assert_eq!(signals(&fired), vec!["volume_spike_1m"]);
        assert_eq!(fired[0].event_type, EventType::TradeSignal);
        assert_eq!(fired[0].metric_f64("vol_1m"), Some(12_000.0));
        assert_eq!(fired[0].side.as_deref(), Some("YES"));
    }

    #[test]
    fn big_trade_cooldown() {
        let mut e = engine(SignalsConfig { big_trade_usd: 1_000.0, cooldown_sec: 300, ..quiet() });
        assert_eq!(signals(&e.on_event(&trade(0, 0.5, 4_000.0))), vec!["big_trade"]);
        assert!(e.on_event(&trade(100, 0.5, 4_000.0)).is_empty());
        assert_eq!(signals(&e.on_event(&trade(305, 0.5, 4_000.0))), vec!["big_trade"]);
    }

    #[test]
    fn big_trade_absorbs_simultaneous_spike() {
        let mut e = engine(SignalsConfig { big_trade_usd: 1_000.0, big_volume_1m_usd: 1_500.0, ..quiet() });
        let fired = e.on_event(&trade(0, 0.5, 4_000.0));
        assert_eq!(signals(&fired), vec!["big_trade"]);
        assert_eq!(fired[0].metric_f64("vol_1m"), Some(2_000.0));
    }

    #[test]
    fn low_price_zone_uses_absolute_move() {
        let cfg = SignalsConfig {
            major_change_pct: 5.0,
            major_change_low_price_max: 0.05,
            major_change_low_price_abs: 0.01,
            major_change_spread_gate_k: 1.0,
            ..quiet()
        };
        let mut e = engine(cfg);
        assert!(e.on_event(&trade(0, 0.02, 100.0)).is_empty());
        let fired = e.on_event(&trade(10, 0.03, 100.0));
        assert_eq!(signals(&fired), vec!["major_change"]);
        assert_eq!(fired[0].event_type, EventType::PriceSignal);
        assert_eq!(fired[0].metric_f64("pct_change"), Some(50.0));
        assert_eq!(fired[0].metrics["direction"].as_str(), Some("up"));
        assert_eq!(fired[0].metrics["source"].as_str(), Some("trade"));
    }

    #[test]
    fn low_price_zone_ignores_sub_cent_moves() {
        let cfg = SignalsConfig { major_change_pct: 5.0, major_change_low_price_abs: 0.01, ..quiet() };
        let mut e = engine(cfg);
        e.on_event(&trade(0, 0.020, 100.0));
        assert!(e.on_event(&trade(10, 0.025, 100.0)).is_empty(), "25% but only half a cent");
    }

    #[test]
    fn spread_gate_suppresses_bounce() {
        let cfg = SignalsConfig { major_change_pct: 5.0, major_change_spread_gate_k: 1.0, ..quiet() };
        let mut e = engine(SignalsConfig { major_change_source: MajorChangeSource::Trade, ..cfg.clone() });
        e.on_event(&quote(0, 0.40, 0.50));
        e.on_event(&trade(1, 0.45, 10.0));
        assert!(e.on_event(&trade(2, 0.50, 10.0)).is_empty(), "11% move inside a 10c spread");

        let mut e = engine(SignalsConfig { major_change_source: MajorChangeSource::Trade, ..cfg });
        e.on_event(&quote(0, 0.49, 0.50));
        e.on_event(&trade(1, 0.45, 10.0));
        assert_eq!(signals(&e.on_event(&trade(2, 0.50, 10.0))), vec!["major_change"]);
    }

    #[test]
    fn percentage_threshold_outside_low_zone() {
        let mut e = engine(SignalsConfig { major_change_pct: 5.0, major_change_spread_gate_k: 0.0, ..quiet() });
        e.on_event(&trade(0, 0.50, 10.0));
        assert!(e.on_event(&trade(5, 0.51, 10.0)).is_empty());
        let fired = e.on_event(&trade(6, 0.55, 10.0));
        assert_eq!(signals(&fired), vec!["major_change"]);
        // Reference moves to the emitted price.
        assert!(e.on_event(&trade(7, 0.56, 10.0)).is_empty());
    }

    #[test]
    fn moves_outside_the_window_do_not_count() {
        let mut e = engine(SignalsConfig {
            major_change_pct: 5.0,
            major_change_window_sec: 60,
            major_change_spread_gate_k: 0.0,
            ..quiet()
        });
        e.on_event(&trade(0, 0.50, 10.0));
        e.on_event(&trade(61, 0.54, 10.0));
        assert!(e.on_event(&trade(62, 0.56, 10.0)).is_empty(), "0.54 -> 0.56 is under 5%");
    }

    #[test]
    fn min_notional_gates_trades_not_books() {
        let cfg = SignalsConfig {
            major_change_pct: 5.0,
            major_change_min_notional: 1_000.0,
            major_change_spread_gate_k: 0.0,
            ..quiet()
        };
        let mut e = engine(cfg.clone());
        e.on_event(&trade(0, 0.50, 10.0));
        assert!(e.on_event(&trade(1, 0.60, 10.0)).is_empty());

        let mut e = engine(SignalsConfig { major_change_source: MajorChangeSource::Book, ..cfg });
        e.on_event(&quote(0, 0.49, 0.51));
        let fired = e.on_event(&quote(1, 0.59, 0.61));
        assert_eq!(signals(&fired), vec!["major_change"]);
        assert_eq!(fired[0].metrics["source"].as_str(), Some("book"));
    }

    #[test]
    fn big_wall_sums_top_levels() {
        let mut e = engine(SignalsConfig { big_wall_size: Some(1_000.0), big_wall_levels: 2, ..quiet() });
        let book = |bids: Vec<BookLevel>| {
            FeedEvent::Tick(Tick::Book(BookUpdate {
                token_id: TOKEN.into(),
                bids,
                asks: vec![BookLevel { price: 0.6, size: 10.0 }],
                ts_ms: 0,
                seq: None,
            }))
        };
        let lvl = |price, size| BookLevel { price, size };
        assert!(e
            .on_event(&book(vec![lvl(0.5, 400.0), lvl(0.49, 400.0), lvl(0.48, 900.0)]))
            .is_empty());
        let fired = e.on_event(&book(vec![lvl(0.5, 600.0), lvl(0.49, 500.0)]));
        assert_eq!(signals(&fired), vec!["big_wall"]);
        assert_eq!(fired[0].event_type, EventType::BookSignal);
        assert_eq!(fired[0].metrics["side"].as_str(), Some("bid"));
        assert_eq!(fired[0].metric_f64("wall_size"), Some(1_100.0));
    }

    #[test]
    fn baseline_ticks_seed_without_firing() {
        let mut e = engine(SignalsConfig { big_trade_usd: 1.0, major_change_pct: 5.0, ..quiet() });
        let FeedEvent::Tick(tick) = trade(0, 0.50, 100.0) else { unreachable!() };
        assert!(e.on_event(&FeedEvent::Baseline(tick)).is_empty());
        // The seeded price is the reference for the next live move.
        let fired = e.on_event(&trade(1, 0.60, 1.0));
        assert!(signals(&fired).contains(&"major_change"));
    }

    #[test]
    fn expired_market_is_skipped_and_flagged_once() {
        let clock = Arc::new(ManualClock::new(10_000));
        let mut e = SignalEngine::new(SignalsConfig { big_trade_usd: 1.0, ..quiet() }, clock);
        e.update_registry(Arc::new(TokenRegistry::from([(TOKEN.to_string(), meta(Some(5_000)))])));
        assert!(e.on_event(&trade(20, 0.5, 100.0)).is_empty());
        assert!(e.on_event(&trade(21, 0.5, 100.0)).is_empty());
        assert_eq!(e.take_expired(), vec![TOKEN.to_string()]);
        assert!(e.take_expired().is_empty());
    }

    #[test]
    fn unknown_tokens_are_ignored() {
        let mut e = engine(SignalsConfig { big_trade_usd: 1.0, ..quiet() });
        let ev = FeedEvent::Tick(Tick::Trade(TradeTick {
            token_id: "other".into(),
            price: 0.5,
            size: 1e6,
            notional: 5e5,
            ts_ms: 0,
            seq: None,
        }));
        assert!(e.on_event(&ev).is_empty());
    }

    #[test]
    fn registry_update_drops_state() {
        let mut e = engine(SignalsConfig { big_volume_1m_usd: 10_000.0, ..quiet() });
        e.on_event(&trade(0, 0.5, 15_000.0));
        e.update_registry(Arc::new(TokenRegistry::new()));
        e.update_registry(Arc::new(TokenRegistry::from([(TOKEN.to_string(), meta(None))])));
        assert!(e.on_event(&trade(1, 0.5, 15_000.0)).is_empty(), "window restarted empty");
    }

    #[test]
    fn resolved_notice_maps_to_lifecycle_and_flags_tokens() {
        let mut e = engine(quiet());
        let notice = LifecycleNotice {
            action: "market_resolved".into(),
            market_id: Some("m1".into()),
            token_ids: vec![TOKEN.into()],
            title: None,
            ts_ms: 5,
            raw: serde_json::json!({"event_type": "market_resolved"}),
        };
        let out = e.on_event(&FeedEvent::Lifecycle(notice));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event_type, EventType::MarketLifecycle);
        assert_eq!(out[0].metrics["action"].as_str(), Some("market_resolved"));
        assert_eq!(out[0].category.as_deref(), Some("finance"));
        assert_eq!(e.take_expired(), vec![TOKEN.to_string()]);
    }
}
