use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::catalog::{normalize_topic, CatalogGateway, MarketPage};
use crate::config::GammaConfig;
use crate::error::{AppError, Result};
use crate::types::{Market, MarketFilter, OutcomeToken, Page, Tag};

/// Upper bound on a server-supplied `Retry-After`.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Gamma REST catalog with request spacing and retry on 429/5xx.
pub struct GammaCatalog {
    client: reqwest::Client,
    base_url: String,
    request_interval: Duration,
    retry_max_attempts: u32,
    retry_backoff: Duration,
    page_size: usize,
    last_request: Mutex<Option<Instant>>,
}

impl GammaCatalog {
    pub fn new(cfg: &GammaConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_sec))
            .build()?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            request_interval: Duration::from_millis(cfg.request_interval_ms),
            retry_max_attempts: cfg.retry_max_attempts.max(1),
            retry_backoff: Duration::from_millis(cfg.retry_backoff_ms),
            page_size: cfg.page_size,
            last_request: Mutex::new(None),
        })
    }

    /// Sleeps until `request_interval` has passed since the previous request.
    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.request_interval {
                tokio::time::sleep(self.request_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_error = String::new();

        for attempt in 0..self.retry_max_attempts {
            self.pace().await;
            let backoff = self.retry_backoff * 2u32.saturating_pow(attempt);

            match self.client.get(&url).query(query).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        let wait = retry_after(&resp).unwrap_or(backoff).min(MAX_RETRY_AFTER);
                        warn!(
                            path,
                            status = status.as_u16(),
                            attempt = attempt + 1,
                            wait_ms = wait.as_millis() as u64,
                            "Gamma request throttled or failed, backing off"
                        );
                        last_error = format!("HTTP {status}");
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    let body = resp.error_for_status()?.json::<serde_json::Value>().await?;
                    return Ok(body);
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    warn!(path, attempt = attempt + 1, "Gamma request error: {e}");
                    last_error = e.to_string();
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(AppError::Catalog(format!(
            "{path}: gave up after {} attempts ({last_error})",
            self.retry_max_attempts
        )))
    }
}

#[async_trait]
impl CatalogGateway for GammaCatalog {
    async fn list_tags(&self) -> Result<Vec<Tag>> {
        let mut tags = Vec::new();
        let mut offset = 0usize;
        loop {
            let query = [("limit", self.page_size.to_string()), ("offset", offset.to_string())];
            let body = self.get_json("/tags", &query).await?;
            let items = extract_items(&body);
            let fetched = items.len();
            tags.extend(items.iter().filter_map(parse_gamma_tag));
            if fetched < self.page_size {
                break;
            }
            offset += fetched;
        }
        info!(count = tags.len(), "Gamma tags loaded");
        Ok(tags)
    }

    async fn list_markets(&self, filter: &MarketFilter, page: Page) -> Result<MarketPage> {
        let mut query = vec![
            ("active", filter.active.to_string()),
            ("closed", filter.closed.to_string()),
            ("limit", page.limit.to_string()),
            ("offset", page.offset.to_string()),
        ];
        if let Some(tag_id) = &filter.tag_id {
            query.push(("tag_id", tag_id.clone()));
        }

        let body = self.get_json("/markets", &query).await?;
        let items = extract_items(&body);
        let raw_count = items.len();
        let mut rejected = 0usize;
        let markets: Vec<Market> = items
            .iter()
            .filter_map(|v| {
                let parsed = parse_gamma_market(v);
                if parsed.is_none() {
                    rejected += 1;
                }
                parsed
            })
            .collect();
        debug!(
            tag_id = ?filter.tag_id,
            offset = page.offset,
            parsed = markets.len(),
            rejected,
            "Gamma markets page"
        );
        Ok(MarketPage { markets, raw_count, has_more: raw_count >= page.limit })
    }
}

fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    let value = resp.headers().get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse::<f64>().ok().map(Duration::from_secs_f64)
}

/// Gamma answers with a bare array; some endpoints wrap it in `data`/`results`.
fn extract_items(body: &serde_json::Value) -> Vec<serde_json::Value> {
    match body {
        serde_json::Value::Array(items) => items.clone(),
        serde_json::Value::Object(obj) => obj
            .get("data")
            .or_else(|| obj.get("results"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Record parsing
// ---------------------------------------------------------------------------

fn as_string(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_f64(v: &serde_json::Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

fn first_f64(v: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| v.get(*k).and_then(as_f64))
}

/// Some Gamma list fields are JSON arrays encoded as strings.
fn string_list(v: Option<&serde_json::Value>) -> Vec<String> {
    match v {
        Some(serde_json::Value::String(s)) => serde_json::from_str(s).unwrap_or_default(),
        Some(serde_json::Value::Array(items)) => items.iter().filter_map(as_string).collect(),
        _ => Vec::new(),
    }
}

pub fn parse_gamma_tag(v: &serde_json::Value) -> Option<Tag> {
    let id = v.get("id").or_else(|| v.get("tag_id")).and_then(as_string)?;
    Some(Tag {
        id,
        slug: v.get("slug").and_then(|s| s.as_str()).map(str::to_string),
        name: v
            .get("label")
            .or_else(|| v.get("name"))
            .and_then(|s| s.as_str())
            .map(str::to_string),
    })
}

/// Parse one Gamma market object. Returns None only when the record has no id.
pub fn parse_gamma_market(v: &serde_json::Value) -> Option<Market> {
    let id = ["id", "market_id", "conditionId"]
        .iter()
        .find_map(|k| v.get(*k).and_then(as_string))?;

    let question = v
        .get("question")
        .or_else(|| v.get("title"))
        .and_then(|q| q.as_str())
        .unwrap_or("")
        .to_string();

    let end_ts_ms = ["endDate", "endDateIso", "end_ts"]
        .iter()
        .find_map(|k| v.get(*k).and_then(parse_end_ts));

    let topic_key = series_slug(v)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| normalize_topic(&question));

    let resolved = v.get("resolved").and_then(|r| r.as_bool()).unwrap_or(false)
        || v
            .get("umaResolutionStatus")
            .and_then(|s| s.as_str())
            .is_some_and(|s| s.eq_ignore_ascii_case("resolved"));

    Some(Market {
        id,
        question,
        topic_key,
        category: String::new(),
        active: v.get("active").and_then(|b| b.as_bool()).unwrap_or(true),
        closed: v.get("closed").and_then(|b| b.as_bool()).unwrap_or(false),
        resolved,
        enable_orderbook: v.get("enableOrderBook").and_then(|b| b.as_bool()),
        end_ts_ms,
        liquidity: first_f64(v, &["liquidityNum", "liquidity", "liquidityClob"]),
        volume_24h: first_f64(v, &["volume24hr", "volume_24h", "volume24hrClob"]),
        outcomes: parse_outcomes(v),
    })
}

/// Recurring markets share a series; its slug keeps a topic stable across rollovers.
fn series_slug(v: &serde_json::Value) -> Option<String> {
    let event = v.get("events")?.as_array()?.first()?;
    event
        .get("series")
        .and_then(|s| s.as_array())
        .and_then(|a| a.first())
        .and_then(|s| s.get("slug"))
        .or_else(|| event.get("seriesSlug"))
        .and_then(|s| s.as_str())
        .map(str::to_string)
}

fn parse_outcomes(v: &serde_json::Value) -> Vec<OutcomeToken> {
    if let Some(tokens) = v.get("tokens").and_then(|t| t.as_array()) {
        let parsed: Vec<OutcomeToken> = tokens
            .iter()
            .filter_map(|t| {
                let token_id = ["token_id", "tokenId", "asset_id"]
                    .iter()
                    .find_map(|k| t.get(*k).and_then(as_string))?;
                let side = t
                    .get("outcome")
                    .or_else(|| t.get("name"))
                    .and_then(|s| s.as_str())
                    .map(str::to_string);
                Some(OutcomeToken { token_id, side })
            })
            .collect();
        if !parsed.is_empty() {
            return parsed;
        }
    }

    let token_ids = string_list(v.get("clobTokenIds"));
    let labels = string_list(v.get("outcomes"));
    token_ids
        .into_iter()
        .enumerate()
        .map(|(i, token_id)| OutcomeToken { token_id, side: labels.get(i).cloned() })
        .collect()
}

/// Accepts unix seconds or milliseconds, RFC 3339, or a bare `YYYY-MM-DD` date.
fn parse_end_ts(v: &serde_json::Value) -> Option<i64> {
    if let Some(n) = v.as_f64() {
        return Some(epoch_to_ms(n));
    }
    let s = v.as_str()?.trim();
    if let Ok(n) = s.parse::<f64>() {
        return Some(epoch_to_ms(n));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}

fn epoch_to_ms(n: f64) -> i64 {
    if n < 1e12 {
        (n * 1000.0) as i64
    } else {
        n as i64
    }
}
