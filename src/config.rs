use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::types::EventType;

pub const WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";
pub const GAMMA_API_URL: &str = "https://gamma-api.polymarket.com";
pub const REDIS_URL: &str = "redis://localhost:6379/0";
pub const REDIS_CHANNEL: &str = "polymarket.events";

/// Environment overrides look like `PME__CLOB__WS_URL=...`.
pub const ENV_PREFIX: &str = "PME";
pub const ENV_SEPARATOR: &str = "__";
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Channel capacity for internal message routing.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Per-sink delivery queue; a full queue rejects instead of waiting.
pub const SINK_QUEUE_CAPACITY: usize = 256;

/// Consecutive failed discovery cycles before a degraded health event.
pub const DISCOVERY_DEGRADED_AFTER: u32 = 3;

pub const SINK_STDOUT: &str = "stdout";
pub const SINK_REDIS: &str = "redis";
pub const SINK_DISCORD: &str = "discord";

const LIST_KEYS: &[&str] = &[
    "app.categories",
    "filters.hot_sort",
    "filters.focus_keywords",
    "filters.keyword_allow",
    "filters.keyword_block",
    "rolling.primary_selection_priority",
    "sinks.required_sinks",
];

// ---------------------------------------------------------------------------
// Enumerated settings
// ---------------------------------------------------------------------------

/// Market attributes usable for ranking and primary selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    Liquidity,
    #[serde(rename = "volume_24h", alias = "volume24h", alias = "volume")]
    Volume24h,
    EndTs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MajorChangeSource {
    Trade,
    Book,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Only sinks named in `required_sinks` can fail a publish.
    BestEffort,
    /// Every routed sink is treated as required.
    AllRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformMode {
    /// Normalized fields minus `raw`, `topic_key` and empty optionals.
    Compact,
    /// Every normalized field, `raw` stripped.
    Full,
    /// Every normalized field plus the upstream payload.
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub categories: Vec<String>,
    pub refresh_interval_sec: u64,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            categories: vec!["finance".to_string(), "geopolitics".to_string()],
            refresh_interval_sec: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FiltersConfig {
    /// 0 keeps every eligible market.
    pub top_k_per_category: usize,
    pub hot_sort: Vec<SortKey>,
    pub min_liquidity: Option<f64>,
    pub focus_keywords: Vec<String>,
    pub keyword_allow: Vec<String>,
    pub keyword_block: Vec<String>,
    pub drop_expired_markets: bool,
}

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            top_k_per_category: 10,
            hot_sort: vec![SortKey::Volume24h, SortKey::Liquidity],
            min_liquidity: None,
            focus_keywords: Vec::new(),
            keyword_allow: Vec::new(),
            keyword_block: Vec::new(),
            drop_expired_markets: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalsConfig {
    pub big_trade_usd: f64,
    pub big_volume_1m_usd: f64,
    pub volume_window_sec: u64,
    pub big_wall_size: Option<f64>,
    pub big_wall_levels: usize,
    pub cooldown_sec: u64,
    pub major_change_pct: f64,
    pub major_change_window_sec: u64,
    pub major_change_min_notional: f64,
    pub major_change_source: MajorChangeSource,
    pub major_change_low_price_max: f64,
    pub major_change_low_price_abs: f64,
    pub major_change_spread_gate_k: f64,
    pub web_volume_enabled: bool,
    pub web_volume_window_sec: u64,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            big_trade_usd: 10_000.0,
            big_volume_1m_usd: 25_000.0,
            volume_window_sec: 60,
            big_wall_size: None,
            big_wall_levels: 5,
            cooldown_sec: 120,
            major_change_pct: 5.0,
            major_change_window_sec: 60,
            major_change_min_notional: 0.0,
            major_change_source: MajorChangeSource::Any,
            major_change_low_price_max: 0.05,
            major_change_low_price_abs: 0.01,
            major_change_spread_gate_k: 1.0,
            web_volume_enabled: true,
            web_volume_window_sec: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollingConfig {
    pub enabled: bool,
    pub primary_selection_priority: Vec<SortKey>,
    pub max_markets_per_topic: usize,
}

impl Default for RollingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            primary_selection_priority: vec![SortKey::Liquidity, SortKey::Volume24h, SortKey::EndTs],
            max_markets_per_topic: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GammaConfig {
    pub base_url: String,
    pub timeout_sec: u64,
    pub page_size: usize,
    /// Minimum spacing between consecutive requests.
    pub request_interval_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for GammaConfig {
    fn default() -> Self {
        Self {
            base_url: GAMMA_API_URL.to_string(),
            timeout_sec: 10,
            page_size: 200,
            request_interval_ms: 200,
            retry_max_attempts: 3,
            retry_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClobConfig {
    pub ws_url: String,
    pub channel: String,
    pub custom_feature_enabled: bool,
    pub initial_dump: bool,
    pub max_frame_bytes: usize,
    /// `None` disables the application-level ping.
    pub ping_interval_sec: Option<u64>,
    pub ping_message: String,
    pub pong_message: String,
    pub heartbeat_timeout_sec: u64,
    pub reconnect_backoff_sec: u64,
    pub reconnect_max_sec: u64,
    /// Failed attempts in a row before a health event is raised.
    pub reconnect_escalate_after: u32,
    pub resync_on_gap: bool,
    pub resync_min_interval_sec: u64,
    pub seq_gap_tolerance: u64,
    /// Quiet period that ends the initial snapshot burst.
    pub snapshot_timeout_sec: u64,
}

impl Default for ClobConfig {
    fn default() -> Self {
        Self {
            ws_url: WS_URL.to_string(),
            channel: "market".to_string(),
            custom_feature_enabled: false,
            initial_dump: true,
            max_frame_bytes: 32 * 1024,
            ping_interval_sec: Some(10),
            ping_message: "PING".to_string(),
            pong_message: "PONG".to_string(),
            heartbeat_timeout_sec: 30,
            reconnect_backoff_sec: 1,
            reconnect_max_sec: 60,
            reconnect_escalate_after: 5,
            resync_on_gap: true,
            resync_min_interval_sec: 30,
            seq_gap_tolerance: 0,
            snapshot_timeout_sec: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StdoutSinkConfig {
    pub enabled: bool,
    pub transform: Option<TransformMode>,
}

impl Default for StdoutSinkConfig {
    fn default() -> Self {
        Self { enabled: true, transform: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSinkConfig {
    pub enabled: bool,
    pub url: String,
    pub channel: String,
    pub transform: Option<TransformMode>,
}

impl Default for RedisSinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: REDIS_URL.to_string(),
            channel: REDIS_CHANNEL.to_string(),
            transform: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordSinkConfig {
    pub enabled: bool,
    pub webhook_url: Option<String>,
    pub max_retries: u32,
    pub timeout_sec: u64,
    pub aggregate_multi_outcome: bool,
    pub aggregate_window_sec: f64,
    pub aggregate_max_items: usize,
    pub transform: Option<TransformMode>,
}

impl Default for DiscordSinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: None,
            max_retries: 3,
            timeout_sec: 10,
            aggregate_multi_outcome: true,
            aggregate_window_sec: 2.0,
            aggregate_max_items: 5,
            // Embeds render the market lists carried in `raw`.
            transform: Some(TransformMode::Raw),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinksConfig {
    pub mode: DeliveryMode,
    pub required_sinks: Vec<String>,
    /// Event type name → ordered sink names. Unrouted event types are dropped.
    pub routes: BTreeMap<String, Vec<String>>,
    pub transform: TransformMode,
    pub publish_timeout_sec: u64,
    pub drain_grace_sec: u64,
    pub stdout: StdoutSinkConfig,
    pub redis: RedisSinkConfig,
    pub discord: DiscordSinkConfig,
}

impl Default for SinksConfig {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::BestEffort,
            required_sinks: Vec::new(),
            routes: default_routes(),
            transform: TransformMode::Full,
            publish_timeout_sec: 5,
            drain_grace_sec: 5,
            stdout: StdoutSinkConfig::default(),
            redis: RedisSinkConfig::default(),
            discord: DiscordSinkConfig::default(),
        }
    }
}

impl SinksConfig {
    pub fn enabled_sinks(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.stdout.enabled {
            names.push(SINK_STDOUT);
        }
        if self.redis.enabled {
            names.push(SINK_REDIS);
        }
        if self.discord.enabled {
            names.push(SINK_DISCORD);
        }
        names
    }

    pub fn transform_for(&self, sink: &str) -> TransformMode {
        let specific = match sink {
            SINK_STDOUT => self.stdout.transform,
            SINK_REDIS => self.redis.transform,
            SINK_DISCORD => self.discord.transform,
            _ => None,
        };
        specific.unwrap_or(self.transform)
    }

    /// Routes keyed by parsed event type, restricted to enabled sinks.
    pub fn parsed_routes(&self) -> Result<HashMap<EventType, Vec<String>>> {
        let enabled = self.enabled_sinks();
        let mut out = HashMap::new();
        for (key, sinks) in &self.routes {
            let event_type = key.parse::<EventType>().map_err(AppError::Config)?;
            let targets: Vec<String> = sinks
                .iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| enabled.contains(&s.as_str()))
                .collect();
            out.insert(event_type, targets);
        }
        Ok(out)
    }
}

/// Every event type goes to stdout and redis; signals, health and status also
/// go to discord (ignored unless discord is enabled).
fn default_routes() -> BTreeMap<String, Vec<String>> {
    EventType::ALL
        .iter()
        .map(|t| {
            let mut sinks = vec![SINK_STDOUT.to_string(), SINK_REDIS.to_string()];
            if matches!(
                t,
                EventType::TradeSignal
                    | EventType::BookSignal
                    | EventType::PriceSignal
                    | EventType::HealthEvent
                    | EventType::MonitoringStatus
            ) {
                sinks.push(SINK_DISCORD.to_string());
            }
            (t.as_str().to_string(), sinks)
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty }
    }
}

// ---------------------------------------------------------------------------
// AppConfig
// ---------------------------------------------------------------------------

/// Fully resolved, immutable configuration for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub filters: FiltersConfig,
    pub signals: SignalsConfig,
    pub rolling: RollingConfig,
    pub gamma: GammaConfig,
    pub clob: ClobConfig,
    pub sinks: SinksConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Loads the file layer (if any) and the process environment, then validates.
    ///
    /// An explicit `path` must exist; without one, `config/default.toml` is used
    /// when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Same as [`AppConfig::load`], with an injectable environment map for tests.
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self> {
        let mut builder = config::Config::builder();
        builder = match path {
            Some(p) => builder.add_source(config::File::from(p).required(true)),
            None => builder.add_source(config::File::with_name(DEFAULT_CONFIG_PATH).required(false)),
        };

        let mut environment = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .list_separator(",")
            .try_parsing(true)
            .source(env);
        for key in LIST_KEYS {
            environment = environment.with_list_parse_key(key);
        }

        let cfg: AppConfig = builder.add_source(environment).build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(AppError::Config(msg));

        if self.app.categories.iter().all(|c| c.trim().is_empty()) {
            return fail("app.categories must name at least one category".into());
        }
        if self.app.refresh_interval_sec == 0 {
            return fail("app.refresh_interval_sec must be > 0".into());
        }
        if self.gamma.page_size == 0 {
            return fail("gamma.page_size must be > 0".into());
        }
        if self.gamma.retry_max_attempts == 0 {
            return fail("gamma.retry_max_attempts must be >= 1".into());
        }
        if self.clob.reconnect_backoff_sec == 0 {
            return fail("clob.reconnect_backoff_sec must be > 0".into());
        }
        if self.clob.reconnect_max_sec < self.clob.reconnect_backoff_sec {
            return fail(format!(
                "clob.reconnect_max_sec ({}) must be >= clob.reconnect_backoff_sec ({})",
                self.clob.reconnect_max_sec, self.clob.reconnect_backoff_sec
            ));
        }
        if self.clob.max_frame_bytes < 256 {
            return fail("clob.max_frame_bytes must be >= 256".into());
        }
        if self.clob.ping_interval_sec == Some(0) {
            return fail("clob.ping_interval_sec must be > 0 (omit it to disable pings)".into());
        }
        if let Some(ping) = self.clob.ping_interval_sec {
            if self.clob.heartbeat_timeout_sec <= ping {
                return fail("clob.heartbeat_timeout_sec must exceed clob.ping_interval_sec".into());
            }
        }
        if self.signals.volume_window_sec == 0 || self.signals.major_change_window_sec == 0 {
            return fail("signal windows must be > 0 seconds".into());
        }
        if self.signals.major_change_pct <= 0.0 {
            return fail("signals.major_change_pct must be > 0".into());
        }
        if self.signals.big_wall_size.is_some() && self.signals.big_wall_levels == 0 {
            return fail("signals.big_wall_levels must be > 0 when big_wall_size is set".into());
        }
        if self.signals.big_wall_levels > crate::state::BOOK_UPDATE_DEPTH {
            return fail(format!(
                "signals.big_wall_levels must be <= {}",
                crate::state::BOOK_UPDATE_DEPTH
            ));
        }
        if self.rolling.enabled && self.rolling.max_markets_per_topic == 0 {
            return fail("rolling.max_markets_per_topic must be >= 1".into());
        }
        if self.sinks.publish_timeout_sec == 0 {
            return fail("sinks.publish_timeout_sec must be > 0".into());
        }

        let enabled = self.sinks.enabled_sinks();
        if enabled.is_empty() {
            return fail("at least one sink must be enabled".into());
        }
        for required in &self.sinks.required_sinks {
            if !enabled.contains(&required.as_str()) {
                return fail(format!("required sink `{required}` is unknown or disabled"));
            }
        }
        for (event_type, sinks) in &self.sinks.routes {
            event_type.parse::<EventType>().map_err(AppError::Config)?;
            for sink in sinks {
                let name = sink.trim().to_lowercase();
                if ![SINK_STDOUT, SINK_REDIS, SINK_DISCORD].contains(&name.as_str()) {
                    return fail(format!("route `{event_type}` names unknown sink `{sink}`"));
                }
            }
        }
        if self.sinks.discord.enabled
            && self.sinks.discord.webhook_url.as_deref().map_or(true, |u| u.trim().is_empty())
        {
            return fail("sinks.discord.webhook_url is required when discord is enabled".into());
        }
        if self.sinks.discord.aggregate_window_sec < 0.0 {
            return fail("sinks.discord.aggregate_window_sec must be >= 0".into());
        }
        Ok(())
    }

    /// Categories with surrounding whitespace trimmed and empties dropped.
    pub fn categories(&self) -> Vec<String> {
        self.app
            .categories
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.app.categories, vec!["finance", "geopolitics"]);
        assert_eq!(cfg.filters.hot_sort, vec![SortKey::Volume24h, SortKey::Liquidity]);
        assert_eq!(cfg.sinks.redis.channel, "polymarket.events");
        assert_eq!(cfg.clob.channel, "market");
    }

    #[test]
    fn env_overrides_nested_values_and_lists() {
        let cfg = AppConfig::load_with_env(
            None,
            env(&[
                ("PME__CLOB__WS_URL", "wss://example.test/ws"),
                ("PME__APP__CATEGORIES", "crypto,sports"),
                ("PME__SIGNALS__BIG_TRADE_USD", "5000"),
                ("PME__SINKS__REDIS__ENABLED", "false"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.clob.ws_url, "wss://example.test/ws");
        assert_eq!(cfg.app.categories, vec!["crypto", "sports"]);
        assert_eq!(cfg.signals.big_trade_usd, 5000.0);
        assert!(!cfg.sinks.redis.enabled);
    }

    #[test]
    fn file_layer_is_read_and_env_wins() {
        let dir = std::env::temp_dir().join(format!("pme-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("pme.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "[filters]\ntop_k_per_category = 3\nhot_sort = [\"liquidity\"]\n\n[clob]\nping_interval_sec = 5\nheartbeat_timeout_sec = 20"
        )
        .unwrap();

        let cfg = AppConfig::load_with_env(
            Some(&path),
            env(&[("PME__FILTERS__TOP_K_PER_CATEGORY", "7")]),
        )
        .unwrap();
        assert_eq!(cfg.filters.top_k_per_category, 7);
        assert_eq!(cfg.filters.hot_sort, vec![SortKey::Liquidity]);
        assert_eq!(cfg.clob.ping_interval_sec, Some(5));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_explicit_file_is_fatal() {
        let path = std::env::temp_dir().join("pme-definitely-missing.toml");
        assert!(AppConfig::load_with_env(Some(&path), env(&[])).is_err());
    }

    #[test]
    fn rejects_inverted_backoff() {
        let mut cfg = AppConfig::default();
        cfg.clob.reconnect_backoff_sec = 30;
        cfg.clob.reconnect_max_sec = 10;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("reconnect_max_sec"), "{err}");
    }

    #[test]
    fn rejects_unknown_or_disabled_sinks() {
        let mut cfg = AppConfig::default();
        cfg.sinks.required_sinks = vec!["discord".into()];
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.sinks.routes.insert("TradeSignal".into(), vec!["kafka".into()]);
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.sinks.routes.insert("NotAnEvent".into(), vec!["stdout".into()]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn discord_requires_webhook() {
        let mut cfg = AppConfig::default();
        cfg.sinks.discord.enabled = true;
        assert!(cfg.validate().is_err());
        cfg.sinks.discord.webhook_url = Some("https://discord.test/hook".into());
        cfg.validate().unwrap();
    }

    #[test]
    fn parsed_routes_keep_only_enabled_sinks() {
        let cfg = AppConfig::default();
        let routes = cfg.sinks.parsed_routes().unwrap();
        assert_eq!(routes[&EventType::TradeSignal], vec!["stdout", "redis"]);
        assert_eq!(routes.len(), EventType::ALL.len());
    }

    #[test]
    fn per_sink_transform_overrides_default() {
        let mut cfg = AppConfig::default();
        cfg.sinks.transform = TransformMode::Compact;
        cfg.sinks.redis.transform = Some(TransformMode::Raw);
        assert_eq!(cfg.sinks.transform_for(SINK_REDIS), TransformMode::Raw);
        assert_eq!(cfg.sinks.transform_for(SINK_STDOUT), TransformMode::Compact);
    }
}
