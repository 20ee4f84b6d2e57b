use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const EVENT_SOURCE: &str = "polymarket";

// ---------------------------------------------------------------------------
// Catalog records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub id: String,
    pub slug: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeToken {
    pub token_id: String,
    /// Outcome label as published by the venue ("Yes", "No", "Trump", ...).
    pub side: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    pub question: String,
    /// Continuity key shared by successive markets on the same subject.
    pub topic_key: String,
    /// Category the market was discovered under. Assigned by discovery.
    pub category: String,
    pub active: bool,
    pub closed: bool,
    pub resolved: bool,
    /// `None` means the venue did not say; only an explicit `false` disables the book.
    pub enable_orderbook: Option<bool>,
    pub end_ts_ms: Option<i64>,
    pub liquidity: Option<f64>,
    pub volume_24h: Option<f64>,
    pub outcomes: Vec<OutcomeToken>,
}

impl Market {
    pub fn has_orderbook(&self) -> bool {
        self.enable_orderbook != Some(false)
    }

    pub fn is_tradable(&self) -> bool {
        self.active && !self.closed && !self.resolved
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.end_ts_ms, Some(end) if end <= now_ms)
    }

    pub fn token_ids(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .map(|o| o.token_id.as_str())
            .filter(|id| !id.is_empty())
    }
}

/// Query passed to the catalog when listing markets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketFilter {
    pub tag_id: Option<String>,
    pub active: bool,
    pub closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

/// Metadata the detector needs to label events for a subscribed token.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenMeta {
    pub token_id: String,
    pub market_id: String,
    pub title: String,
    pub category: String,
    pub topic_key: String,
    pub side: Option<String>,
    pub end_ts_ms: Option<i64>,
}

pub type TokenRegistry = HashMap<String, TokenMeta>;

/// Normalizes outcome labels: yes/no in any case become YES/NO, anything else passes through.
pub fn normalize_side(side: Option<&str>) -> Option<String> {
    let s = side?.trim();
    if s.is_empty() {
        return None;
    }
    if s.eq_ignore_ascii_case("yes") {
        Some("YES".to_string())
    } else if s.eq_ignore_ascii_case("no") {
        Some("NO".to_string())
    } else {
        Some(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Normalized feed ticks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct TradeTick {
    pub token_id: String,
    pub price: f64,
    pub size: f64,
    pub notional: f64,
    pub ts_ms: i64,
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

/// Book state for one token after applying a snapshot or delta.
/// Bids are best-first (descending), asks best-first (ascending).
#[derive(Debug, Clone, PartialEq)]
pub struct BookUpdate {
    pub token_id: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub ts_ms: i64,
    pub seq: Option<u64>,
}

impl BookUpdate {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }
}

/// Top-of-book quote without depth (`best_bid_ask` frames, or a delta on a book
/// we have no snapshot for).
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteUpdate {
    pub token_id: String,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    Trade(TradeTick),
    Book(BookUpdate),
    Quote(QuoteUpdate),
}

impl Tick {
    pub fn token_id(&self) -> &str {
        match self {
            Tick::Trade(t) => &t.token_id,
            Tick::Book(b) => &b.token_id,
            Tick::Quote(q) => &q.token_id,
        }
    }

    pub fn ts_ms(&self) -> i64 {
        match self {
            Tick::Trade(t) => t.ts_ms,
            Tick::Book(b) => b.ts_ms,
            Tick::Quote(q) => q.ts_ms,
        }
    }
}

/// Venue-side market lifecycle notice carried on the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleNotice {
    /// `new_market` or `market_resolved`.
    pub action: String,
    pub market_id: Option<String>,
    pub token_ids: Vec<String>,
    pub title: Option<String>,
    pub ts_ms: i64,
    pub raw: serde_json::Value,
}

/// Everything the feed session hands to the signal engine, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Tick(Tick),
    /// Snapshot-burst data: seeds baselines, never evaluated for signals.
    Baseline(Tick),
    Lifecycle(LifecycleNotice),
}

// ---------------------------------------------------------------------------
// DomainEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    CandidateSelected,
    SubscriptionChanged,
    MonitoringStatus,
    TradeSignal,
    BookSignal,
    PriceSignal,
    MarketLifecycle,
    HealthEvent,
}

impl EventType {
    pub const ALL: [EventType; 8] = [
        EventType::CandidateSelected,
        EventType::SubscriptionChanged,
        EventType::MonitoringStatus,
        EventType::TradeSignal,
        EventType::BookSignal,
        EventType::PriceSignal,
        EventType::MarketLifecycle,
        EventType::HealthEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::CandidateSelected => "CandidateSelected",
            EventType::SubscriptionChanged => "SubscriptionChanged",
            EventType::MonitoringStatus => "MonitoringStatus",
            EventType::TradeSignal => "TradeSignal",
            EventType::BookSignal => "BookSignal",
            EventType::PriceSignal => "PriceSignal",
            EventType::MarketLifecycle => "MarketLifecycle",
            EventType::HealthEvent => "HealthEvent",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    // Case-insensitive: config keys may arrive lowercased.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown event type `{s}`"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    MajorChange,
    BigTrade,
    VolumeSpike,
    BigWall,
    WebVolumeSpike,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::MajorChange => "major_change",
            SignalKind::BigTrade => "big_trade",
            SignalKind::VolumeSpike => "volume_spike_1m",
            SignalKind::BigWall => "big_wall",
            SignalKind::WebVolumeSpike => "web_volume_spike",
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            SignalKind::MajorChange => EventType::PriceSignal,
            SignalKind::BigTrade | SignalKind::VolumeSpike | SignalKind::WebVolumeSpike => {
                EventType::TradeSignal
            }
            SignalKind::BigWall => EventType::BookSignal,
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Int(v) => Some(*v as f64),
            MetricValue::Float(v) => Some(*v),
            MetricValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetricValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricValue::Int(v) => write!(f, "{v}"),
            MetricValue::Float(v) => write!(f, "{v}"),
            MetricValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Int(v)
    }
}

impl From<usize> for MetricValue {
    fn from(v: usize) -> Self {
        MetricValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::Text(v)
    }
}

/// The normalized output unit. Immutable once handed to the router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: String,
    pub ts_ms: i64,
    pub source: String,
    pub category: Option<String>,
    pub event_type: EventType,
    pub market_id: Option<String>,
    pub token_id: Option<String>,
    pub side: Option<String>,
    pub title: Option<String>,
    pub topic_key: Option<String>,
    pub metrics: BTreeMap<String, MetricValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl DomainEvent {
    /// New event with a fresh v4 `event_id`.
    pub fn new(event_type: EventType, ts_ms: i64) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            ts_ms,
            source: EVENT_SOURCE.to_string(),
            category: None,
            event_type,
            market_id: None,
            token_id: None,
            side: None,
            title: None,
            topic_key: None,
            metrics: BTreeMap::new(),
            raw: None,
        }
    }

    pub fn signal(kind: SignalKind, ts_ms: i64) -> Self {
        Self::new(kind.event_type(), ts_ms).metric("signal", kind.as_str())
    }

    pub fn for_token(mut self, meta: &TokenMeta) -> Self {
        self.market_id = Some(meta.market_id.clone());
        self.token_id = Some(meta.token_id.clone());
        self.side = normalize_side(meta.side.as_deref());
        self.title = Some(meta.title.clone());
        self.category = Some(meta.category.clone());
        self.topic_key = Some(meta.topic_key.clone());
        self
    }

    pub fn for_market(mut self, market: &Market) -> Self {
        self.market_id = Some(market.id.clone());
        self.title = Some(market.question.clone());
        self.category = Some(market.category.clone());
        self.topic_key = Some(market.topic_key.clone());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn metric(mut self, key: &str, value: impl Into<MetricValue>) -> Self {
        self.metrics.insert(key.to_string(), value.into());
        self
    }

    pub fn raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn signal_name(&self) -> Option<&str> {
        self.metrics.get("signal").and_then(MetricValue::as_str)
    }

    pub fn metric_f64(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).and_then(MetricValue::as_f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_ids_are_unique() {
        let a = DomainEvent::new(EventType::HealthEvent, 1);
        let b = DomainEvent::new(EventType::HealthEvent, 1);
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(a.source, "polymarket");
    }

    #[test]
    fn event_type_parses_case_insensitively() {
        assert_eq!("tradesignal".parse::<EventType>().unwrap(), EventType::TradeSignal);
        assert_eq!("HealthEvent".parse::<EventType>().unwrap(), EventType::HealthEvent);
        assert!("nope".parse::<EventType>().is_err());
    }

    #[test]
    fn side_normalization() {
        assert_eq!(normalize_side(Some("yes")).as_deref(), Some("YES"));
        assert_eq!(normalize_side(Some("No")).as_deref(), Some("NO"));
        assert_eq!(normalize_side(Some("Trump")).as_deref(), Some("Trump"));
        assert_eq!(normalize_side(Some("  ")), None);
        assert_eq!(normalize_side(None), None);
    }

    #[test]
    fn serializes_metrics_untagged_and_omits_empty_raw() {
        let ev = DomainEvent::signal(SignalKind::BigTrade, 5)
            .metric("notional", 12_000.0)
            .metric("count", 3usize);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event_type"], "TradeSignal");
        assert_eq!(json["metrics"]["signal"], "big_trade");
        assert_eq!(json["metrics"]["count"], 3);
        assert!(json.get("raw").is_none());

        let back: DomainEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.metrics.get("count"), Some(&MetricValue::Int(3)));
    }
}
