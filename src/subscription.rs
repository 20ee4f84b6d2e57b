use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::selection::Selection;
use crate::types::{DomainEvent, EventType, TokenMeta, TokenRegistry};

/// Incremental subscription change handed to the feed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TokenDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl TokenDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Keeps the feed's token set equal to the candidate set.
///
/// The controller mirrors what it has asked the session to subscribe; the
/// session replays that set in full whenever it reconnects.
pub struct SubscriptionController {
    active: BTreeSet<String>,
    /// Tokens reported expired by the detector; excluded until they leave the candidate set.
    expired: HashSet<String>,
    command_tx: mpsc::Sender<FeedCommand>,
    registry_tx: watch::Sender<Arc<TokenRegistry>>,
}

impl SubscriptionController {
    pub fn new(
        command_tx: mpsc::Sender<FeedCommand>,
        registry_tx: watch::Sender<Arc<TokenRegistry>>,
    ) -> Self {
        Self {
            active: BTreeSet::new(),
            expired: HashSet::new(),
            command_tx,
            registry_tx,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn mark_expired(&mut self, token_id: String) {
        if self.active.contains(&token_id) {
            debug!(token_id = %token_id, "token flagged expired");
            self.expired.insert(token_id);
        }
    }

    /// Desired tokens and their metadata for every order-book market in the selection.
    pub fn desired(&self, selection: &Selection) -> (BTreeSet<String>, TokenRegistry) {
        let mut tokens = BTreeSet::new();
        let mut registry = TokenRegistry::new();
        for market in selection.markets().filter(|m| m.has_orderbook()) {
            for outcome in market.outcomes.iter().filter(|o| !o.token_id.is_empty()) {
                if self.expired.contains(&outcome.token_id) {
                    continue;
                }
                tokens.insert(outcome.token_id.clone());
                registry.insert(
                    outcome.token_id.clone(),
                    TokenMeta {
                        token_id: outcome.token_id.clone(),
                        market_id: market.id.clone(),
                        title: market.question.clone(),
                        category: market.category.clone(),
                        topic_key: market.topic_key.clone(),
                        side: outcome.side.clone(),
                        end_ts_ms: market.end_ts_ms,
                    },
                );
            }
        }
        (tokens, registry)
    }

    /// Diffs the desired set against the active set and pushes the change to the
    /// feed: metadata first, then adds, then removes. Returns the diff and, when
    /// it is non-empty, a `SubscriptionChanged` event.
    pub async fn reconcile(
        &mut self,
        selection: &Selection,
        now_ms: i64,
    ) -> Result<(TokenDiff, Option<DomainEvent>)> {
        let (desired, registry) = self.desired(selection);
        let diff = TokenDiff {
            added: desired.difference(&self.active).cloned().collect(),
            removed: self.active.difference(&desired).cloned().collect(),
        };

        let candidate_tokens: HashSet<&str> = selection.markets().flat_map(|m| m.token_ids()).collect();
        self.expired.retain(|t| candidate_tokens.contains(t.as_str()));
        self.registry_tx.send_replace(Arc::new(registry));

        if diff.is_empty() {
            return Ok((diff, None));
        }

        if !diff.added.is_empty() {
            self.command_tx
                .send(FeedCommand::Subscribe(diff.added.clone()))
                .await
                .map_err(|e| AppError::ChannelSend(format!("feed command: {e}")))?;
        }
        if !diff.removed.is_empty() {
            self.command_tx
                .send(FeedCommand::Unsubscribe(diff.removed.clone()))
                .await
                .map_err(|e| AppError::ChannelSend(format!("feed command: {e}")))?;
        }
        self.active = desired;

        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            active = self.active.len(),
            "subscription reconciled"
        );

        let event = DomainEvent::new(EventType::SubscriptionChanged, now_ms)
            .metric("token_count", self.active.len())
            .metric("added_count", diff.added.len())
            .metric("removed_count", diff.removed.len())
            .raw(json!({ "added": diff.added, "removed": diff.removed }));
        Ok((diff, Some(event)))
    }
}
