//! Outbound market-channel frames.
//!
//! Field order is part of the wire contract, so frames are serialized from
//! structs rather than `json!` maps (which sort keys).

use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Subscribe,
    Unsubscribe,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Subscribe => f.write_str("subscribe"),
            Operation::Unsubscribe => f.write_str("unsubscribe"),
        }
    }
}

#[derive(Serialize)]
struct InitialFrame<'a> {
    #[serde(rename = "type")]
    channel: &'a str,
    assets_ids: &'a [String],
    custom_feature_enabled: bool,
    initial_dump: bool,
}

#[derive(Serialize)]
struct OperationFrame<'a> {
    assets_ids: &'a [String],
    operation: Operation,
}

/// Handshake subscribe for the full token set, split so no frame exceeds `max_bytes`.
pub fn initial_subscribe_frames(
    channel: &str,
    tokens: &[String],
    custom_feature_enabled: bool,
    initial_dump: bool,
    max_bytes: usize,
) -> Vec<String> {
    fragment(tokens, max_bytes, |ids| {
        serde_json::to_string(&InitialFrame {
            channel,
            assets_ids: ids,
            custom_feature_enabled,
            initial_dump,
        })
    })
}

/// Incremental subscribe/unsubscribe, split the same way.
pub fn operation_frames(operation: Operation, tokens: &[String], max_bytes: usize) -> Vec<String> {
    fragment(tokens, max_bytes, |ids| {
        serde_json::to_string(&OperationFrame { assets_ids: ids, operation })
    })
}

/// Greedy packing: each id costs its JSON-encoded length plus a comma.
/// An id too large to fit even alone is sent in a frame of its own.
fn fragment<F>(tokens: &[String], max_bytes: usize, render: F) -> Vec<String>
where
    F: Fn(&[String]) -> serde_json::Result<String>,
{
    if tokens.is_empty() {
        return Vec::new();
    }
    let base = match render(&[]) {
        Ok(s) => s.len(),
        Err(e) => {
            warn!("frame render failed: {e}");
            return Vec::new();
        }
    };

    let mut frames = Vec::new();
    let mut start = 0usize;
    let mut size = base;
    for (i, token) in tokens.iter().enumerate() {
        let cost = token.len() + 2 + usize::from(i > start);
        if i > start && size + cost > max_bytes {
            frames.extend(render(&tokens[start..i]).ok());
            start = i;
            size = base + token.len() + 2;
        } else {
            size += cost;
        }
    }
    frames.extend(render(&tokens[start..]).ok());
    frames
}
