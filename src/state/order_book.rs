use std::collections::{BTreeMap, HashMap};

use crate::types::{BookLevel, BookUpdate};
use crate::ws::messages::{BookSide, LevelChange};

/// Levels per side included in each emitted [`BookUpdate`].
pub const BOOK_UPDATE_DEPTH: usize = 20;

// ---------------------------------------------------------------------------
// OrderBook
// ---------------------------------------------------------------------------

/// Per-token order book. Prices are stored as integer keys: `(price * 10_000).round() as u32`.
/// This avoids floating-point map keys while supporting 4 decimal places of precision.
///
/// For asks, `BTreeMap::iter()` yields the minimum (best ask) first.
/// For bids, `BTreeMap::iter().rev()` yields the maximum (best bid) first.
#[derive(Debug, Default)]
struct OrderBook {
    /// price_key → size. Sorted ascending; minimum key = best ask.
    asks: BTreeMap<u32, f64>,
    /// price_key → size. Sorted ascending; maximum key = best bid.
    bids: BTreeMap<u32, f64>,
}

impl OrderBook {
    #[inline]
    fn price_key(price: f64) -> u32 {
        (price * 10_000.0).round() as u32
    }

    #[inline]
    fn key_to_price(key: u32) -> f64 {
        key as f64 / 10_000.0
    }

    fn apply_snapshot(&mut self, bids: &[BookLevel], asks: &[BookLevel]) {
        self.asks.clear();
        for level in asks.iter().filter(|l| l.size > 0.0) {
            self.asks.insert(Self::price_key(level.price), level.size);
        }
        self.bids.clear();
        for level in bids.iter().filter(|l| l.size > 0.0) {
            self.bids.insert(Self::price_key(level.price), level.size);
        }
    }

    /// Size 0 removes the level.
    fn apply_change(&mut self, side: BookSide, price: f64, size: f64) {
        let key = Self::price_key(price);
        let map = match side {
            BookSide::Ask => &mut self.asks,
            BookSide::Bid => &mut self.bids,
        };
        if size <= 0.0 {
            map.remove(&key);
        } else {
            map.insert(key, size);
        }
    }

    fn top_bids(&self, depth: usize) -> Vec<BookLevel> {
        self.bids
            .iter()
            .rev()
            .take(depth)
            .map(|(&k, &size)| BookLevel { price: Self::key_to_price(k), size })
            .collect()
    }

    fn top_asks(&self, depth: usize) -> Vec<BookLevel> {
        self.asks
            .iter()
            .take(depth)
            .map(|(&k, &size)| BookLevel { price: Self::key_to_price(k), size })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// OrderBooks
// ---------------------------------------------------------------------------

/// Books for every token on the feed, owned by the feed session.
/// A book exists only once a snapshot has been applied.
#[derive(Debug, Default)]
pub struct OrderBooks {
    books: HashMap<String, OrderBook>,
}

impl OrderBooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_snapshot(
        &mut self,
        token_id: &str,
        bids: &[BookLevel],
        asks: &[BookLevel],
        ts_ms: i64,
        seq: Option<u64>,
    ) -> BookUpdate {
        let book = self.books.entry(token_id.to_string()).or_default();
        book.apply_snapshot(bids, asks);
        BookUpdate {
            token_id: token_id.to_string(),
            bids: book.top_bids(BOOK_UPDATE_DEPTH),
            asks: book.top_asks(BOOK_UPDATE_DEPTH),
            ts_ms,
            seq,
        }
    }

    /// Applies a level change. Returns None when no snapshot has been seen for
    /// the token, since a delta alone cannot describe the book.
    pub fn apply_change(&mut self, change: &LevelChange, ts_ms: i64, seq: Option<u64>) -> Option<BookUpdate> {
        let book = self.books.get_mut(&change.token_id)?;
        book.apply_change(change.side, change.price, change.size);
        Some(BookUpdate {
            token_id: change.token_id.clone(),
            bids: book.top_bids(BOOK_UPDATE_DEPTH),
            asks: book.top_asks(BOOK_UPDATE_DEPTH),
            ts_ms,
            seq,
        })
    }

    pub fn has_book(&self, token_id: &str) -> bool {
        self.books.contains_key(token_id)
    }

    /// Drops a token's book; deltas are ignored until the next snapshot.
    pub fn invalidate(&mut self, token_id: &str) {
        self.books.remove(token_id);
    }

    pub fn clear(&mut self) {
        self.books.clear();
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lvl(price: f64, size: f64) -> BookLevel {
        BookLevel { price, size }
    }

    fn change(side: BookSide, price: f64, size: f64) -> LevelChange {
        LevelChange { token_id: "t".into(), side, price, size, best_bid: None, best_ask: None }
    }

    #[test]
    fn snapshot_orders_levels_best_first() {
        let mut books = OrderBooks::new();
        let update = books.apply_snapshot(
            "t",
            &[lvl(0.40, 10.0), lvl(0.45, 5.0), lvl(0.30, 0.0)],
            &[lvl(0.60, 1.0), lvl(0.55, 2.0)],
            1,
            None,
        );
        assert_eq!(update.best_bid(), Some(0.45));
        assert_eq!(update.best_ask(), Some(0.55));
        assert_eq!(update.bids.len(), 2, "zero-size level skipped");
    }

    #[test]
    fn changes_update_and_remove_levels() {
        let mut books = OrderBooks::new();
        books.apply_snapshot("t", &[lvl(0.40, 10.0)], &[lvl(0.60, 1.0)], 1, None);

        let u = books.apply_change(&change(BookSide::Bid, 0.42, 3.0), 2, None).unwrap();
        assert_eq!(u.best_bid(), Some(0.42));

        let u = books.apply_change(&change(BookSide::Bid, 0.42, 0.0), 3, None).unwrap();
        assert_eq!(u.best_bid(), Some(0.40));

        let u = books.apply_change(&change(BookSide::Ask, 0.60, 0.0), 4, None).unwrap();
        assert_eq!(u.best_ask(), None);
    }

    #[test]
    fn change_without_snapshot_is_ignored() {
        let mut books = OrderBooks::new();
        assert!(books.apply_change(&change(BookSide::Bid, 0.5, 1.0), 1, None).is_none());
        assert!(!books.has_book("t"));
    }

    #[test]
    fn invalidate_requires_new_snapshot() {
        let mut books = OrderBooks::new();
        books.apply_snapshot("t", &[lvl(0.40, 10.0)], &[], 1, None);
        books.invalidate("t");
        assert!(books.apply_change(&change(BookSide::Bid, 0.41, 1.0), 2, None).is_none());
    }

    #[test]
    fn depth_is_capped() {
        let mut books = OrderBooks::new();
        let bids: Vec<BookLevel> = (1..=40).map(|i| lvl(i as f64 / 100.0, 1.0)).collect();
        let u = books.apply_snapshot("t", &bids, &[], 1, None);
        assert_eq!(u.bids.len(), BOOK_UPDATE_DEPTH);
        assert_eq!(u.best_bid(), Some(0.40));
    }
}
