//! Candidate selection: turns catalog records into a bounded, ranked set of
//! markets per category and keeps one primary market per topic.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info};

use crate::config::{FiltersConfig, RollingConfig, SortKey};
use crate::types::Market;

/// Topic → market index rebuilt every cycle. Markets carry `topic_key`; the
/// topic only refers back to them by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub topic_key: String,
    pub category: String,
    pub primary_market_id: String,
    pub member_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rollover {
    pub topic_key: String,
    pub category: String,
    pub previous_market_id: String,
    pub market_id: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SelectionStats {
    pub input: usize,
    pub rejected_inactive: usize,
    pub rejected_expired: usize,
    pub rejected_focus: usize,
    pub rejected_filters: usize,
    pub rejected_topic: usize,
    pub rejected_rank: usize,
    pub unsubscribable: usize,
    pub selected: usize,
}

#[derive(Debug, Default, Clone)]
pub struct Selection {
    /// category → ranked candidates, best first.
    pub candidates: BTreeMap<String, Vec<Market>>,
    /// Eligible markets without an order book: reported, never subscribed.
    pub unsubscribable: Vec<Market>,
    pub topics: HashMap<String, Topic>,
    pub rollovers: Vec<Rollover>,
    pub stats: SelectionStats,
}

impl Selection {
    pub fn market_count(&self) -> usize {
        self.candidates.values().map(Vec::len).sum()
    }

    pub fn markets(&self) -> impl Iterator<Item = &Market> {
        self.candidates.values().flatten()
    }
}

pub struct MarketSelector {
    filters: FiltersConfig,
    rolling: RollingConfig,
    /// topic_key → primary market id from the previous cycle.
    previous_primaries: HashMap<String, String>,
}

impl MarketSelector {
    pub fn new(filters: FiltersConfig, rolling: RollingConfig) -> Self {
        Self { filters, rolling, previous_primaries: HashMap::new() }
    }

    /// Runs one selection cycle over raw records grouped by category.
    pub fn refresh(&mut self, raw: BTreeMap<String, Vec<Market>>, now_ms: i64) -> Selection {
        let mut selection = Selection::default();
        let mut primaries: HashMap<String, String> = HashMap::new();

        for (category, markets) in raw {
            let mut stats = SelectionStats { input: markets.len(), ..Default::default() };
            let mut orderbook_markets = Vec::new();

            for mut market in markets {
                market.category = category.clone();
                if !market.is_tradable() {
                    stats.rejected_inactive += 1;
                } else if self.filters.drop_expired_markets && market.is_expired(now_ms) {
                    stats.rejected_expired += 1;
                } else if !self.matches_focus(&market) {
                    stats.rejected_focus += 1;
                } else if !market.has_orderbook() {
                    stats.unsubscribable += 1;
                    selection.unsubscribable.push(market);
                } else {
                    orderbook_markets.push(market);
                }
            }

            let eligible = if self.rolling.enabled {
                let before = orderbook_markets.len();
                let (kept, topics) = self.select_primaries(orderbook_markets);
                stats.rejected_topic = before - kept.len();
                for topic in topics {
                    primaries.insert(topic.topic_key.clone(), topic.primary_market_id.clone());
                    selection.topics.insert(topic.topic_key.clone(), topic);
                }
                kept
            } else {
                orderbook_markets
            };

            let before = eligible.len();
            let filtered: Vec<Market> = eligible.into_iter().filter(|m| self.passes_filters(m)).collect();
            stats.rejected_filters = before - filtered.len();

            let ranked = rank(filtered, &self.filters.hot_sort);
            let ranked_len = ranked.len();
            let top: Vec<Market> = match self.filters.top_k_per_category {
                0 => ranked,
                k => ranked.into_iter().take(k).collect(),
            };
            stats.rejected_rank = ranked_len - top.len();
            stats.selected = top.len();

            info!(
                category = %category,
                input = stats.input,
                selected = stats.selected,
                unsubscribable = stats.unsubscribable,
                inactive = stats.rejected_inactive,
                expired = stats.rejected_expired,
                focus = stats.rejected_focus,
                filtered = stats.rejected_filters,
                topic = stats.rejected_topic,
                rank = stats.rejected_rank,
                "category selection"
            );
            accumulate(&mut selection.stats, &stats);
            selection.candidates.insert(category, top);
        }

        for (topic_key, market_id) in &primaries {
            if let Some(previous) = self.previous_primaries.get(topic_key) {
                if previous != market_id {
                    let category = selection
                        .topics
                        .get(topic_key)
                        .map(|t| t.category.clone())
                        .unwrap_or_default();
                    info!(
                        topic = %topic_key,
                        from = %previous,
                        to = %market_id,
                        "primary market rolled over"
                    );
                    selection.rollovers.push(Rollover {
                        topic_key: topic_key.clone(),
                        category,
                        previous_market_id: previous.clone(),
                        market_id: market_id.clone(),
                    });
                }
            }
        }
        selection.rollovers.sort_by(|a, b| a.topic_key.cmp(&b.topic_key));
        self.previous_primaries = primaries;
        selection
    }

    /// Groups by topic and keeps the best `max_markets_per_topic` members by the
    /// configured priority; the first criterion that separates two markets decides.
    fn select_primaries(&self, markets: Vec<Market>) -> (Vec<Market>, Vec<Topic>) {
        let mut groups: BTreeMap<String, Vec<Market>> = BTreeMap::new();
        for market in markets {
            let key = if market.topic_key.is_empty() { market.id.clone() } else { market.topic_key.clone() };
            groups.entry(key).or_default().push(market);
        }

        let mut kept = Vec::new();
        let mut topics = Vec::new();
        for (topic_key, group) in groups {
            let member_ids: Vec<String> = group.iter().map(|m| m.id.clone()).collect();
            let ranked = rank(group, &self.rolling.primary_selection_priority);
            let Some(primary) = ranked.first() else { continue };
            if member_ids.len() > 1 {
                debug!(topic = %topic_key, primary = %primary.id, members = member_ids.len(), "topic primary");
            }
            topics.push(Topic {
                topic_key,
                category: primary.category.clone(),
                primary_market_id: primary.id.clone(),
                member_ids,
            });
            kept.extend(ranked.into_iter().take(self.rolling.max_markets_per_topic.max(1)));
        }
        (kept, topics)
    }

    fn matches_focus(&self, market: &Market) -> bool {
        if self.filters.focus_keywords.is_empty() {
            return true;
        }
        let q = market.question.to_lowercase();
        self.filters
            .focus_keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .any(|k| q.contains(&k))
    }

    fn passes_filters(&self, market: &Market) -> bool {
        if let Some(min) = self.filters.min_liquidity {
            if market.liquidity.unwrap_or(0.0) < min {
                return false;
            }
        }
        let q = market.question.to_lowercase();
        let allow = &self.filters.keyword_allow;
        if !allow.is_empty() && !allow.iter().any(|k| q.contains(&k.to_lowercase())) {
            return false;
        }
        !self.filters.keyword_block.iter().any(|k| q.contains(&k.to_lowercase()))
    }
}

fn accumulate(total: &mut SelectionStats, s: &SelectionStats) {
    total.input += s.input;
    total.rejected_inactive += s.rejected_inactive;
    total.rejected_expired += s.rejected_expired;
    total.rejected_focus += s.rejected_focus;
    total.rejected_filters += s.rejected_filters;
    total.rejected_topic += s.rejected_topic;
    total.rejected_rank += s.rejected_rank;
    total.unsubscribable += s.unsubscribable;
    total.selected += s.selected;
}

/// Stable sort by the key list, best first, ties broken by market id.
pub fn rank(mut markets: Vec<Market>, keys: &[SortKey]) -> Vec<Market> {
    markets.sort_by(|a, b| {
        keys.iter()
            .map(|k| compare_by(a, b, *k))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| a.id.cmp(&b.id))
    });
    markets
}

/// `Less` means `a` ranks ahead of `b`.
fn compare_by(a: &Market, b: &Market, key: SortKey) -> Ordering {
    match key {
        SortKey::Liquidity => desc(a.liquidity, b.liquidity),
        SortKey::Volume24h => desc(a.volume_24h, b.volume_24h),
        // Soonest end first; unknown end times last.
        SortKey::EndTs => match (a.end_ts_ms, b.end_ts_ms) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        },
    }
}

fn desc(a: Option<f64>, b: Option<f64>) -> Ordering {
    let a = a.unwrap_or(0.0);
    let b = b.unwrap_or(0.0);
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}
