use serde::Deserialize;
use serde_json::Value;

use crate::types::BookLevel;

/// Which side of the book a level change touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    Bid,
    Ask,
}

impl BookSide {
    /// "BUY" = bid side, "SELL" = ask side.
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" | "BID" => Some(BookSide::Bid),
            "SELL" | "ASK" => Some(BookSide::Ask),
            _ => None,
        }
    }
}

/// One level change inside a `price_change` message.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelChange {
    pub token_id: String,
    pub side: BookSide,
    pub price: f64,
    pub size: f64,
    /// Server-computed top of book after the change, when provided.
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
}

/// Parsed market-channel message, before order-book application.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Book {
        token_id: String,
        bids: Vec<BookLevel>,
        asks: Vec<BookLevel>,
        ts_ms: Option<i64>,
        seq: Option<u64>,
    },
    PriceChange {
        changes: Vec<LevelChange>,
        ts_ms: Option<i64>,
        seq: Option<u64>,
    },
    Trade {
        token_id: String,
        price: f64,
        size: f64,
        ts_ms: Option<i64>,
        seq: Option<u64>,
    },
    BestBidAsk {
        token_id: String,
        best_bid: Option<f64>,
        best_ask: Option<f64>,
        ts_ms: Option<i64>,
    },
    Lifecycle {
        action: String,
        market_id: Option<String>,
        token_ids: Vec<String>,
        title: Option<String>,
        ts_ms: Option<i64>,
        raw: Value,
    },
}

#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub messages: Vec<FeedMessage>,
    /// Objects that could not be decoded or lacked required fields.
    pub malformed: usize,
    /// Well-formed objects of a kind this engine does not consume.
    pub ignored: usize,
}

/// Raw deserializable shape covering all market-channel messages.
/// Fields are optional because different event types carry different subsets;
/// numerics arrive as strings or numbers.
#[derive(Debug, Deserialize)]
struct RawMsg {
    event_type: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    asset_id: Option<String>,
    market: Option<String>,
    bids: Option<Vec<RawLevel>>,
    asks: Option<Vec<RawLevel>>,
    /// Older book payloads name the sides buys/sells.
    buys: Option<Vec<RawLevel>>,
    sells: Option<Vec<RawLevel>>,
    /// Current `price_change` shape: per-asset entries.
    price_changes: Option<Vec<RawChange>>,
    /// Legacy `price_change` shape: one asset, `asset_id` at top level.
    changes: Option<Vec<RawChange>>,
    price: Option<Value>,
    size: Option<Value>,
    best_bid: Option<Value>,
    best_ask: Option<Value>,
    timestamp: Option<Value>,
    seq: Option<Value>,
    sequence: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawLevel {
    price: Value,
    size: Value,
}

#[derive(Debug, Deserialize)]
struct RawChange {
    asset_id: Option<String>,
    price: Value,
    size: Value,
    side: String,
    best_bid: Option<Value>,
    best_ask: Option<Value>,
}

enum Kind {
    Book,
    PriceChange,
    Trade,
    BestBidAsk,
    Lifecycle(&'static str),
    Ignored,
}

fn detect_kind(name: &str) -> Kind {
    match name.to_ascii_lowercase().as_str() {
        "book" | "orderbook" => Kind::Book,
        "price_change" => Kind::PriceChange,
        "last_trade_price" | "trade" | "last_trade" | "fill" => Kind::Trade,
        "best_bid_ask" => Kind::BestBidAsk,
        "new_market" => Kind::Lifecycle("new_market"),
        "market_resolved" => Kind::Lifecycle("market_resolved"),
        _ => Kind::Ignored,
    }
}

fn num(v: &Value) -> Option<f64> {
    let parsed: Option<f64> = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|f| f.is_finite())
}

fn opt_num(v: &Option<Value>) -> Option<f64> {
    v.as_ref().and_then(num)
}

fn opt_u64(v: &Option<Value>) -> Option<u64> {
    match v.as_ref()? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn levels(raw: Option<Vec<RawLevel>>) -> Option<Vec<BookLevel>> {
    raw.map(|ls| {
        ls.iter()
            .filter_map(|l| Some(BookLevel { price: num(&l.price)?, size: num(&l.size)? }))
            .collect()
    })
}

/// Parse a raw WebSocket text frame into zero or more messages.
///
/// Frames arrive as a single JSON object or an array of objects. A
/// `price_change` carrying a `price_changes` array is the current shape;
/// one carrying `changes` with a top-level `asset_id` is the legacy shape.
pub fn parse_frame(raw: &str) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();
    let values: Vec<Value> = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => items,
        Ok(v @ Value::Object(_)) => vec![v],
        _ => {
            outcome.malformed += 1;
            return outcome;
        }
    };

    for value in values {
        let kind_name = value
            .get("event_type")
            .or_else(|| value.get("type"))
            .and_then(|k| k.as_str())
            .map(str::to_string);
        let Some(kind_name) = kind_name else {
            outcome.malformed += 1;
            continue;
        };
        let kind = detect_kind(&kind_name);
        if let Kind::Ignored = kind {
            outcome.ignored += 1;
            continue;
        }
        let raw_value = match kind {
            Kind::Lifecycle(_) => Some(value.clone()),
            _ => None,
        };
        let msg: RawMsg = match serde_json::from_value(value) {
            Ok(m) => m,
            Err(_) => {
                outcome.malformed += 1;
                continue;
            }
        };
        match expand(kind, msg, raw_value) {
            Some(m) => outcome.messages.push(m),
            None => outcome.malformed += 1,
        }
    }
    outcome
}

fn expand(kind: Kind, msg: RawMsg, raw_value: Option<Value>) -> Option<FeedMessage> {
    let ts_ms = opt_u64(&msg.timestamp).and_then(|t| i64::try_from(t).ok());
    let seq = opt_u64(&msg.seq).or_else(|| opt_u64(&msg.sequence));

    match kind {
        Kind::Book => {
            let token_id = msg.asset_id?;
            let bids = levels(msg.bids).or_else(|| levels(msg.buys)).unwrap_or_default();
            let asks = levels(msg.asks).or_else(|| levels(msg.sells)).unwrap_or_default();
            Some(FeedMessage::Book { token_id, bids, asks, ts_ms, seq })
        }
        Kind::PriceChange => {
            let changes = if let Some(entries) = msg.price_changes {
                entries
                    .into_iter()
                    .filter_map(|c| change(c, None))
                    .collect::<Vec<_>>()
            } else {
                let asset = msg.asset_id?;
                msg.changes?
                    .into_iter()
                    .filter_map(|c| change(c, Some(&asset)))
                    .collect()
            };
            if changes.is_empty() {
                return None;
            }
            Some(FeedMessage::PriceChange { changes, ts_ms, seq })
        }
        Kind::Trade => Some(FeedMessage::Trade {
            token_id: msg.asset_id?,
            price: opt_num(&msg.price)?,
            size: opt_num(&msg.size).unwrap_or(0.0),
            ts_ms,
            seq,
        }),
        Kind::BestBidAsk => {
            let best_bid = opt_num(&msg.best_bid);
            let best_ask = opt_num(&msg.best_ask);
            if best_bid.is_none() && best_ask.is_none() {
                return None;
            }
            Some(FeedMessage::BestBidAsk { token_id: msg.asset_id?, best_bid, best_ask, ts_ms })
        }
        Kind::Lifecycle(action) => {
            let raw = raw_value.unwrap_or(Value::Null);
            let market_id = msg
                .market
                .or_else(|| raw.get("id").and_then(|v| v.as_str()).map(str::to_string));
            let mut token_ids: Vec<String> = ["assets_ids", "asset_ids", "clob_token_ids"]
                .iter()
                .find_map(|k| raw.get(*k).and_then(|v| v.as_array()))
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            if token_ids.is_empty() {
                token_ids.extend(msg.asset_id);
            }
            let title = raw.get("question").and_then(|v| v.as_str()).map(str::to_string);
            Some(FeedMessage::Lifecycle {
                action: action.to_string(),
                market_id,
                token_ids,
                title,
                ts_ms,
                raw,
            })
        }
        Kind::Ignored => None,
    }
}

fn change(c: RawChange, asset: Option<&str>) -> Option<LevelChange> {
    let token_id = c.asset_id.or_else(|| asset.map(str::to_string))?;
    Some(LevelChange {
        token_id,
        side: BookSide::parse(&c.side)?,
        price: num(&c.price)?,
        size: num(&c.size)?,
        best_bid: opt_num(&c.best_bid),
        best_ask: opt_num(&c.best_ask),
    })
}
