//! Discord webhook sink.
//!
//! Every event becomes one embed. Multi-outcome signals (sides other than
//! YES/NO) are buffered per (market, signal) for `aggregate_window_sec` and
//! posted as a single summary embed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{DiscordSinkConfig, SINK_DISCORD};
use crate::error::{AppError, Result};
use crate::sink::Sink;
use crate::types::{DomainEvent, EventType};

const COLOR_YES: u32 = 0x2ECC71;
const COLOR_NO: u32 = 0xE74C3C;
const COLOR_VOLUME: u32 = 0xF1C40F;
const COLOR_WEB_VOLUME: u32 = 0x1ABC9C;
const COLOR_TRADE: u32 = 0xF39C12;
const COLOR_INFO: u32 = 0x3498DB;
const COLOR_GREY: u32 = 0x95A5A6;
const COLOR_LIFECYCLE: u32 = 0x9B59B6;
const COLOR_MIXED: u32 = 0xE67E22;

const MARKET_URL_BASE: &str = "https://polymarket.com/market/";
const FIELD_MAX_CHARS: usize = 1024;
const BACKOFF_BASE_SECS: f64 = 0.5;
const BACKOFF_JITTER_SECS: f64 = 0.25;
const BACKOFF_MAX_SECS: f64 = 30.0;
const MIN_AGGREGATE_WINDOW: Duration = Duration::from_millis(200);

const AGGREGATED_SIGNALS: [&str; 3] = ["major_change", "big_trade", "volume_spike_1m"];

type AggregateKey = (String, String);

pub struct DiscordSink {
    inner: Arc<Inner>,
}

struct Inner {
    client: reqwest::Client,
    webhook_url: String,
    max_retries: u32,
    aggregate: bool,
    window: Duration,
    max_items: usize,
    pending: DashMap<AggregateKey, Vec<DomainEvent>>,
}

impl DiscordSink {
    pub fn new(cfg: &DiscordSinkConfig) -> Result<Self> {
        let webhook_url = cfg
            .webhook_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| AppError::Config("sinks.discord.webhook_url is not set".into()))?
            .to_string();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_sec))
            .build()?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                webhook_url,
                max_retries: cfg.max_retries,
                aggregate: cfg.aggregate_multi_outcome,
                window: Duration::from_secs_f64(cfg.aggregate_window_sec.max(0.0)).max(MIN_AGGREGATE_WINDOW),
                max_items: cfg.aggregate_max_items.max(1),
                pending: DashMap::new(),
            }),
        })
    }
}

#[async_trait]
impl Sink for DiscordSink {
    fn name(&self) -> &str {
        SINK_DISCORD
    }

    async fn publish(&self, event: &DomainEvent) -> Result<()> {
        if self.inner.aggregate && should_aggregate(event) {
            if let Some(key) = self.inner.buffer(event) {
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(inner.window).await;
                    if let Err(e) = inner.flush_key(&key).await {
                        warn!(market_id = %key.0, signal = %key.1, "[DISCORD] aggregate post failed: {e}");
                    }
                });
            }
            return Ok(());
        }
        self.inner.post(&json!({ "embeds": [build_embed(event)] })).await
    }

    async fn flush(&self) -> Result<()> {
        let keys: Vec<AggregateKey> = self.inner.pending.iter().map(|e| e.key().clone()).collect();
        let mut first_err = None;
        for key in keys {
            if let Err(e) = self.inner.flush_key(&key).await {
                warn!(market_id = %key.0, signal = %key.1, "[DISCORD] aggregate flush failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Inner {
    /// Buffers `event`; returns its key when it opened a new window.
    fn buffer(&self, event: &DomainEvent) -> Option<AggregateKey> {
        let key = (
            event.market_id.clone().unwrap_or_else(|| "n/a".into()),
            event.signal_name().unwrap_or("signal").to_string(),
        );
        let mut entry = self.pending.entry(key.clone()).or_default();
        entry.push(event.clone());
        (entry.len() == 1).then_some(key)
    }

    async fn flush_key(&self, key: &AggregateKey) -> Result<()> {
        let Some((_, events)) = self.pending.remove(key) else {
            return Ok(());
        };
        let Some(embed) = aggregate_embed(&events, self.max_items) else {
            return Ok(());
        };
        debug!(market_id = %key.0, signal = %key.1, count = events.len(), "[DISCORD] posting aggregate");
        self.post(&json!({ "embeds": [embed] })).await
    }

    async fn post(&self, payload: &Value) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            let delay = match self.client.post(&self.webhook_url).json(payload).send().await {
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(AppError::sink(SINK_DISCORD, format!("request failed: {e}")));
                    }
                    backoff_delay(attempt)
                }
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(());
                    }
                    if status != StatusCode::TOO_MANY_REQUESTS && !status.is_server_error() {
                        return Err(AppError::sink(SINK_DISCORD, format!("HTTP {status}")));
                    }
                    if attempt >= self.max_retries {
                        return Err(AppError::sink(SINK_DISCORD, format!("HTTP {status} after {attempt} retries")));
                    }
                    let header = resp
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let body = resp.text().await.unwrap_or_default();
                    retry_after(&body, header.as_deref()).unwrap_or_else(|| backoff_delay(attempt))
                }
            };
            debug!(attempt, delay_ms = delay.as_millis() as u64, "[DISCORD] retrying webhook post");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn should_aggregate(event: &DomainEvent) -> bool {
    let Some(signal) = event.signal_name() else { return false };
    if !AGGREGATED_SIGNALS.contains(&signal) || event.market_id.is_none() {
        return false;
    }
    event
        .side
        .as_deref()
        .is_some_and(|s| !s.eq_ignore_ascii_case("yes") && !s.eq_ignore_ascii_case("no"))
}

/// Seconds from the JSON body's `retry_after`, else the `Retry-After` header.
fn retry_after(body: &str, header: Option<&str>) -> Option<Duration> {
    let from_body = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("retry_after").and_then(Value::as_f64));
    let secs = from_body.or_else(|| header.and_then(|h| h.trim().parse::<f64>().ok()))?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_SECS * 2f64.powi(attempt.min(16) as i32);
    let jitter = rand::thread_rng().gen::<f64>() * BACKOFF_JITTER_SECS;
    Duration::from_secs_f64((exp + jitter).min(BACKOFF_MAX_SECS))
}

// ---------------------------------------------------------------------------
// Embeds
// ---------------------------------------------------------------------------

fn field(name: &str, value: impl Into<String>, inline: bool) -> Value {
    let mut value: String = value.into();
    if value.is_empty() {
        value = "n/a".into();
    }
    if value.chars().count() > FIELD_MAX_CHARS {
        value = value.chars().take(FIELD_MAX_CHARS - 3).collect::<String>() + "...";
    }
    json!({ "name": name, "value": value, "inline": inline })
}

fn market_label(event: &DomainEvent) -> String {
    event
        .title
        .clone()
        .or_else(|| event.topic_key.clone())
        .unwrap_or_else(|| "(unknown market)".into())
}

fn metric_text(event: &DomainEvent, key: &str) -> String {
    event.metrics.get(key).map_or_else(|| "n/a".into(), |v| v.to_string())
}

fn iso_timestamp(ts_ms: i64) -> Option<String> {
    chrono::DateTime::from_timestamp_millis(ts_ms).map(|t| t.to_rfc3339())
}

fn finish(mut embed: Value, event: &DomainEvent, market: &str) -> Value {
    if let Some(ts) = iso_timestamp(event.ts_ms) {
        embed["timestamp"] = json!(ts);
    }
    if let Some(url) = market_url(event.market_id.as_deref(), market) {
        embed["url"] = json!(url);
    }
    embed
}

fn with_market_id(mut fields: Vec<Value>, event: &DomainEvent) -> Vec<Value> {
    if let Some(id) = &event.market_id {
        fields.push(field("Market ID", id.clone(), false));
    }
    fields
}

pub(crate) fn build_embed(event: &DomainEvent) -> Value {
    let market = market_label(event);
    let category = event.category.clone().unwrap_or_else(|| "n/a".into());
    let side = event.side.as_deref();

    match event.event_type {
        EventType::MonitoringStatus => {
            let raw = event.raw.as_ref();
            let embed = json!({
                "title": "Monitoring started",
                "color": COLOR_YES,
                "fields": [
                    field("Status", metric_text(event, "status"), true),
                    field(
                        "Counts",
                        format!(
                            "markets: {} | tokens: {} | no order book: {}",
                            metric_text(event, "market_count"),
                            metric_text(event, "token_count"),
                            metric_text(event, "unsubscribable_count"),
                        ),
                        true,
                    ),
                    field("Subscribed markets", format_market_list(raw.and_then(|r| r.get("subscribed_markets")), 12), false),
                    field("No order book", format_market_list(raw.and_then(|r| r.get("unsubscribable_markets")), 8), false),
                ],
            });
            return finish(embed, event, &market);
        }
        EventType::HealthEvent => {
            let status = metric_text(event, "status");
            let ok = matches!(status.as_str(), "refresh_ok" | "feed_recovered");
            let mut fields = vec![field("Status", status.clone(), true)];
            for (key, label) in [("component", "Component"), ("duration_ms", "Duration (ms)"), ("attempts", "Attempts"), ("reason", "Reason")] {
                if event.metrics.contains_key(key) {
                    fields.push(field(label, metric_text(event, key), true));
                }
            }
            let color = if ok { COLOR_INFO } else { COLOR_GREY };
            let embed = json!({
                "title": "Health check",
                "color": color,
                "fields": fields,
            });
            return finish(embed, event, &market);
        }
        EventType::MarketLifecycle => {
            let action = metric_text(event, "action");
            let fields = with_market_id(
                vec![field("Action", action.clone(), true), field("Category", category, true)],
                event,
            );
            let embed = json!({
                "title": format!("Market {action}"),
                "color": COLOR_LIFECYCLE,
                "description": market,
                "fields": fields,
            });
            return finish(embed, event, &market);
        }
        _ => {}
    }

    let signal = event.signal_name().unwrap_or("signal").to_string();
    let (title, color, fields) = match signal.as_str() {
        "major_change" => {
            let window = metric_text(event, "window_sec");
            let source = metric_text(event, "source");
            let summary = format!(
                "{market} | move {} / {window}s | side: {} | source: {source}",
                fmt_pct(event.metric_f64("pct_change")),
                fmt_side(side),
            );
            let fields = vec![
                field("Summary", summary, false),
                field(
                    "Price",
                    format!("{} → {}", fmt_price(event.metric_f64("prev_price")), fmt_price(event.metric_f64("price"))),
                    true,
                ),
                field("Window", format!("{window}s"), true),
                field("Source", source, true),
                field("Side", fmt_side(side), true),
                field("Category", category, true),
            ];
            ("Major price move".to_string(), color_for_side(side).unwrap_or(COLOR_NO), fields)
        }
        "big_trade" => {
            let notional = event.metric_f64("notional");
            let fields = vec![
                field("Summary", format!("{market} | trade {} | side: {}", fmt_money(notional), fmt_side(side)), false),
                field("Price", fmt_price(event.metric_f64("price")), true),
                field("Size", fmt_float(event.metric_f64("size")), true),
                field("Notional", fmt_money(notional), true),
                field("Side", fmt_side(side), true),
                field("Category", category, true),
            ];
            ("Big trade".to_string(), color_for_side(side).unwrap_or(COLOR_TRADE), fields)
        }
        "volume_spike_1m" => {
            let vol = event.metric_f64("vol_1m");
            let fields = vec![
                field("Summary", format!("{market} | 1m volume {}", fmt_money(vol)), false),
                field("Volume", fmt_money(vol), true),
                field("Category", category, true),
            ];
            ("Volume spike (1m)".to_string(), COLOR_VOLUME, fields)
        }
        "web_volume_spike" => {
            let delta = event.metric_f64("delta_volume");
            let window = metric_text(event, "window_sec");
            let fields = vec![
                field("Summary", format!("{market} | volume {} / {window}s", fmt_money(delta)), false),
                field("Interval volume", fmt_money(delta), true),
                field("24h volume", fmt_money(event.metric_f64("volume_24h")), true),
                field("Window", format!("{window}s"), true),
                field("Category", category, true),
            ];
            ("Volume spike (no order book)".to_string(), COLOR_WEB_VOLUME, fields)
        }
        "big_wall" => {
            let wall_side = metric_text(event, "side");
            let fields = vec![
                field(
                    "Summary",
                    format!("{market} | {wall_side} wall {} over top {} levels", fmt_float(event.metric_f64("wall_size")), metric_text(event, "levels")),
                    false,
                ),
                field("Book side", wall_side, true),
                field("Threshold", fmt_float(event.metric_f64("threshold")), true),
                field("Outcome", fmt_side(side), true),
                field("Category", category, true),
            ];
            ("Order book wall".to_string(), COLOR_INFO, fields)
        }
        _ => {
            let label = event.signal_name().unwrap_or(event.event_type.as_str()).to_string();
            let fields = vec![
                field("Summary", format!("{market} | {label}"), false),
                field("Category", category, true),
            ];
            (label, COLOR_INFO, fields)
        }
    };

    let embed = json!({
        "title": title,
        "color": color,
        "description": market,
        "fields": with_market_id(fields, event),
    });
    finish(embed, event, &market)
}

fn aggregate_magnitude(event: &DomainEvent, signal: &str) -> f64 {
    let value = match signal {
        "major_change" => event
            .metric_f64("pct_change_signed")
            .or_else(|| event.metric_f64("pct_change"))
            .map(f64::abs),
        "big_trade" => event.metric_f64("notional"),
        "volume_spike_1m" => event.metric_f64("vol_1m"),
        _ => None,
    };
    value.unwrap_or(0.0)
}

fn aggregate_lines(events: &[DomainEvent], signal: &str, max_items: usize) -> Vec<String> {
    let mut sorted: Vec<&DomainEvent> = events.iter().collect();
    sorted.sort_by(|a, b| aggregate_magnitude(b, signal).total_cmp(&aggregate_magnitude(a, signal)));

    let mut lines: Vec<String> = sorted
        .iter()
        .take(max_items)
        .map(|e| {
            let name = e.side.as_deref().unwrap_or("?");
            let price = fmt_price(e.metric_f64("price"));
            match signal {
                "major_change" => {
                    let pct = e.metric_f64("pct_change_signed").unwrap_or(0.0);
                    let arrow = if pct > 0.0 { "↑" } else if pct < 0.0 { "↓" } else { "→" };
                    format!("{name}: {arrow}{:.2}% → {price}", pct.abs())
                }
                "big_trade" => format!("{name}: trade {} @ {price}", fmt_money(e.metric_f64("notional"))),
                "volume_spike_1m" => format!("{name}: 1m volume {}", fmt_money(e.metric_f64("vol_1m"))),
                _ => name.to_string(),
            }
        })
        .collect();
    if sorted.len() > max_items {
        lines.push(format!("... and {} more", sorted.len() - max_items));
    }
    lines
}

fn aggregate_color(events: &[DomainEvent], signal: &str) -> u32 {
    if signal != "major_change" {
        return COLOR_INFO;
    }
    let directions: Vec<f64> = events.iter().filter_map(|e| e.metric_f64("pct_change_signed")).collect();
    if directions.is_empty() {
        COLOR_MIXED
    } else if directions.iter().all(|d| *d > 0.0) {
        COLOR_YES
    } else if directions.iter().all(|d| *d < 0.0) {
        COLOR_NO
    } else {
        COLOR_MIXED
    }
}

fn aggregate_embed(events: &[DomainEvent], max_items: usize) -> Option<Value> {
    let first = events.first()?;
    let latest_ts = events.iter().map(|e| e.ts_ms).max().unwrap_or(first.ts_ms);
    let market = market_label(first);
    let signal = first.signal_name().unwrap_or("signal").to_string();
    let title = match signal.as_str() {
        "major_change" => "Multi-outcome price moves",
        "big_trade" => "Multi-outcome big trades",
        "volume_spike_1m" => "Multi-outcome volume spikes",
        _ => "Multi-outcome alerts",
    };

    let mut fields = vec![
        field("Summary", format!("{market} | {signal} | {} outcomes triggered", events.len()), false),
        field("Details", aggregate_lines(events, &signal, max_items).join("\n"), false),
        field("Category", first.category.clone().unwrap_or_else(|| "n/a".into()), true),
    ];
    if first.metrics.contains_key("window_sec") {
        fields.push(field("Window", format!("{}s", metric_text(first, "window_sec")), true));
    }
    if first.metrics.contains_key("source") {
        fields.push(field("Source", metric_text(first, "source"), true));
    }

    let mut embed = json!({
        "title": title,
        "color": aggregate_color(events, &signal),
        "description": market,
        "fields": with_market_id(fields, first),
    });
    if let Some(ts) = iso_timestamp(latest_ts) {
        embed["timestamp"] = json!(ts);
    }
    if let Some(url) = market_url(first.market_id.as_deref(), &market) {
        embed["url"] = json!(url);
    }
    Some(embed)
}

fn format_market_list(list: Option<&Value>, limit: usize) -> String {
    let Some(items) = list.and_then(Value::as_array).filter(|l| !l.is_empty()) else {
        return "none".into();
    };
    let mut lines: Vec<String> = items
        .iter()
        .take(limit)
        .filter_map(Value::as_object)
        .map(|item| {
            let title = item.get("title").and_then(Value::as_str).unwrap_or("(unknown)");
            let category = item.get("category").and_then(Value::as_str).unwrap_or("n/a");
            format!("• [{category}] {title}")
        })
        .collect();
    if lines.is_empty() {
        return "none".into();
    }
    if items.len() > limit {
        lines.push(format!("... and {} more", items.len() - limit));
    }
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

fn color_for_side(side: Option<&str>) -> Option<u32> {
    match side?.to_ascii_uppercase().as_str() {
        "YES" => Some(COLOR_YES),
        "NO" => Some(COLOR_NO),
        _ => None,
    }
}

fn fmt_side(side: Option<&str>) -> String {
    side.unwrap_or("unknown").to_string()
}

fn fmt_pct(v: Option<f64>) -> String {
    v.map_or_else(|| "n/a".into(), |v| format!("{v:.2}%"))
}

fn fmt_price(v: Option<f64>) -> String {
    v.map_or_else(|| "n/a".into(), |v| format!("{:.1}¢", v * 100.0))
}

fn fmt_float(v: Option<f64>) -> String {
    let Some(v) = v else { return "n/a".into() };
    let s = format!("{v:.4}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

fn fmt_money(v: Option<f64>) -> String {
    let Some(v) = v else { return "n/a".into() };
    let fixed = format!("{:.2}", v.abs());
    let (int, frac) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));
    let mut grouped = String::with_capacity(int.len() + int.len() / 3);
    for (i, ch) in int.chars().enumerate() {
        if i > 0 && (int.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let sign = if v < 0.0 { "-" } else { "" };
    format!("{sign}${grouped}.{frac}")
}

fn slugify(text: &str) -> String {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() || c == '-' { c } else { ' ' })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join("-")
}

fn market_url(market_id: Option<&str>, market: &str) -> Option<String> {
    market_id?;
    let slug = slugify(market);
    (!slug.is_empty()).then(|| format!("{MARKET_URL_BASE}{slug}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalKind;

    fn sink(aggregate: bool) -> DiscordSink {
        DiscordSink::new(&DiscordSinkConfig {
            enabled: true,
            webhook_url: Some("http://127.0.0.1:1/hook".into()),
            aggregate_multi_outcome: aggregate,
            ..DiscordSinkConfig::default()
        })
        .unwrap()
    }

    fn outcome_move(side: &str, pct_signed: f64) -> DomainEvent {
        let mut ev = DomainEvent::signal(SignalKind::MajorChange, 1_700_000_000_000)
            .metric("pct_change", pct_signed.abs())
            .metric("pct_change_signed", pct_signed)
            .metric("price", 0.42);
        ev.market_id = Some("m1".into());
        ev.title = Some("Who wins the election?".into());
        ev.side = Some(side.into());
        ev
    }

    #[test]
    fn money_and_price_formatting() {
        assert_eq!(fmt_money(Some(12_345.0)), "$12,345.00");
        assert_eq!(fmt_money(Some(999.5)), "$999.50");
        assert_eq!(fmt_money(Some(1_234_567.891)), "$1,234,567.89");
        assert_eq!(fmt_money(None), "n/a");
        assert_eq!(fmt_price(Some(0.123)), "12.3¢");
        assert_eq!(fmt_float(Some(2.5)), "2.5");
        assert_eq!(fmt_float(Some(3.0)), "3");
    }

    #[test]
    fn slug_links() {
        assert_eq!(slugify("Will BTC hit $100k in 2025?"), "will-btc-hit-100k-in-2025");
        assert_eq!(
            market_url(Some("m1"), "Fed rate cut - March").as_deref(),
            Some("https://polymarket.com/market/fed-rate-cut---march")
        );
        assert!(market_url(None, "Anything").is_none());
        assert!(market_url(Some("m1"), "???").is_none());
    }

    #[test]
    fn retry_after_prefers_body_then_header() {
        assert_eq!(retry_after(r#"{"retry_after": 1.5}"#, Some("9")), Some(Duration::from_millis(1500)));
        assert_eq!(retry_after("not json", Some("2")), Some(Duration::from_secs(2)));
        assert_eq!(retry_after("", None), None);
    }

    #[test]
    fn backoff_is_capped() {
        assert!(backoff_delay(0) < Duration::from_millis(760));
        assert!(backoff_delay(0) >= Duration::from_millis(500));
        assert_eq!(backoff_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn big_trade_embed_uses_side_color_and_link() {
        let mut ev = DomainEvent::signal(SignalKind::BigTrade, 1_700_000_000_000)
            .metric("notional", 12_345.0)
            .metric("price", 0.61)
            .metric("size", 20_237.7);
        ev.market_id = Some("m1".into());
        ev.title = Some("Fed cuts in March?".into());
        ev.side = Some("YES".into());
        ev.category = Some("finance".into());

        let embed = build_embed(&ev);
        assert_eq!(embed["title"], "Big trade");
        assert_eq!(embed["color"], COLOR_YES);
        assert_eq!(embed["description"], "Fed cuts in March?");
        assert_eq!(embed["url"], "https://polymarket.com/market/fed-cuts-in-march");
        assert!(embed["timestamp"].as_str().unwrap().starts_with("2023-11-14T22:13:20"));
        let fields = embed["fields"].as_array().unwrap();
        assert!(fields.iter().any(|f| f["name"] == "Notional" && f["value"] == "$12,345.00"));
        assert!(fields.iter().any(|f| f["name"] == "Price" && f["value"] == "61.0¢"));
        assert!(fields.iter().any(|f| f["name"] == "Market ID" && f["value"] == "m1"));
    }

    #[test]
    fn health_and_status_embeds() {
        let degraded = DomainEvent::new(EventType::HealthEvent, 0)
            .metric("status", "feed_degraded")
            .metric("attempts", 5i64);
        let embed = build_embed(&degraded);
        assert_eq!(embed["color"], COLOR_GREY);
        assert_eq!(embed["fields"][1]["name"], "Attempts");

        let ok = DomainEvent::new(EventType::HealthEvent, 0).metric("status", "refresh_ok");
        assert_eq!(build_embed(&ok)["color"], COLOR_INFO);

        let status = DomainEvent::new(EventType::MonitoringStatus, 0)
            .metric("status", "connected")
            .metric("market_count", 3usize)
            .raw(json!({
                "subscribed_markets": [{"title": "A", "category": "finance"}],
                "unsubscribable_markets": []
            }));
        let embed = build_embed(&status);
        assert_eq!(embed["fields"][2]["value"], "• [finance] A");
        assert_eq!(embed["fields"][3]["value"], "none");
    }

    #[test]
    fn only_multi_outcome_signals_aggregate() {
        assert!(should_aggregate(&outcome_move("Trump", 6.0)));
        assert!(!should_aggregate(&outcome_move("yes", 6.0)));
        let mut no_market = outcome_move("Trump", 6.0);
        no_market.market_id = None;
        assert!(!should_aggregate(&no_market));
        let mut wall = DomainEvent::signal(SignalKind::BigWall, 0);
        wall.market_id = Some("m1".into());
        wall.side = Some("Trump".into());
        assert!(!should_aggregate(&wall));
    }

    #[test]
    fn aggregate_lines_sorted_by_magnitude_and_truncated() {
        let events = vec![
            outcome_move("A", 5.0),
            outcome_move("B", -12.5),
            outcome_move("C", 7.25),
        ];
        let lines = aggregate_lines(&events, "major_change", 2);
        assert_eq!(lines, vec!["B: ↓12.50% → 42.0¢", "C: ↑7.25% → 42.0¢", "... and 1 more"]);
        assert_eq!(aggregate_color(&events, "major_change"), COLOR_MIXED);
        assert_eq!(aggregate_color(&events[..1], "major_change"), COLOR_YES);

        let embed = aggregate_embed(&events, 5).unwrap();
        assert_eq!(embed["title"], "Multi-outcome price moves");
        assert!(embed["fields"][0]["value"].as_str().unwrap().contains("3 outcomes triggered"));
    }

    #[tokio::test]
    async fn buffer_opens_one_window_per_market_signal() {
        let sink = sink(true);
        assert!(sink.inner.buffer(&outcome_move("A", 6.0)).is_some());
        assert!(sink.inner.buffer(&outcome_move("B", 7.0)).is_none());
        let mut other = outcome_move("A", 6.0);
        other.market_id = Some("m2".into());
        assert!(sink.inner.buffer(&other).is_some());
        assert_eq!(sink.inner.pending.get(&("m1".to_string(), "major_change".to_string())).unwrap().len(), 2);
    }

    #[test]
    fn missing_webhook_is_a_config_error() {
        let cfg = DiscordSinkConfig { enabled: true, webhook_url: Some("  ".into()), ..DiscordSinkConfig::default() };
        assert!(matches!(DiscordSink::new(&cfg), Err(AppError::Config(_))));
    }
}
