pub mod gamma;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{AppError, Result};
use crate::types::{Market, MarketFilter, Page, Tag};

pub use gamma::GammaCatalog;

/// Read-only access to the venue's discovery API.
#[async_trait]
pub trait CatalogGateway: Send + Sync {
    async fn list_tags(&self) -> Result<Vec<Tag>>;

    async fn list_markets(&self, filter: &MarketFilter, page: Page) -> Result<MarketPage>;
}

/// One page of markets. `raw_count` counts every record the venue returned,
/// including ones that failed to parse, and is what the next offset steps by.
#[derive(Debug, Default)]
pub struct MarketPage {
    pub markets: Vec<Market>,
    pub raw_count: usize,
    pub has_more: bool,
}

/// Markets gathered across pages. `error` is set when a page failed after
/// earlier pages had already been collected.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub markets: Vec<Market>,
    pub pages: usize,
    pub error: Option<AppError>,
}

impl FetchOutcome {
    pub fn is_partial(&self) -> bool {
        self.error.is_some() && !self.markets.is_empty()
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some() && self.markets.is_empty()
    }
}

/// Walks limit+offset pages until the gateway reports no more. A failing page
/// stops the walk but keeps what was already fetched.
pub async fn fetch_all_markets(
    gateway: &dyn CatalogGateway,
    filter: &MarketFilter,
    page_size: usize,
) -> FetchOutcome {
    let mut outcome = FetchOutcome::default();
    let mut offset = 0usize;

    loop {
        let page = Page { limit: page_size, offset };
        match gateway.list_markets(filter, page).await {
            Ok(page) => {
                outcome.pages += 1;
                outcome.markets.extend(page.markets);
                if !page.has_more || page.raw_count == 0 {
                    break;
                }
                offset += page.raw_count;
            }
            Err(e) => {
                warn!(
                    tag_id = ?filter.tag_id,
                    offset,
                    kept = outcome.markets.len(),
                    "market page fetch failed: {e}"
                );
                outcome.error = Some(e);
                break;
            }
        }
    }
    outcome
}

/// Maps each category to a tag id: an exact slug/name match wins, otherwise the
/// first tag whose slug or name contains the category.
pub fn resolve_tag_ids(tags: &[Tag], categories: &[String]) -> Vec<(String, Option<String>)> {
    categories
        .iter()
        .map(|category| {
            let wanted = category.to_lowercase();
            let fields = |t: &Tag| {
                [t.slug.as_deref(), t.name.as_deref()]
                    .into_iter()
                    .flatten()
                    .map(str::to_lowercase)
                    .collect::<Vec<_>>()
            };
            let exact = tags.iter().find(|t| fields(t).iter().any(|f| *f == wanted));
            let fuzzy = || tags.iter().find(|t| fields(t).iter().any(|f| f.contains(&wanted)));
            let id = exact.or_else(fuzzy).map(|t| t.id.clone());
            (category.clone(), id)
        })
        .collect()
}

/// Lowercase, non-alphanumerics to spaces, whitespace collapsed.
pub fn normalize_topic(text: &str) -> String {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
pub use fake::StaticCatalog;



#[cfg(test)]
mod tests {
    use super::test_support::market;
    use super::*;

    fn tag(id: &str, slug: &str, name: &str) -> Tag {
        Tag { id: id.into(), slug: Some(slug.into()), name: Some(name.into()) }
    }

    #[test]
    fn normalize_topic_collapses_punctuation() {
        assert_eq!(normalize_topic("  Will BTC hit $100k?? (2025) "), "will btc hit 100k 2025");
        assert_eq!(normalize_topic("---"), "");
    }

    #[test]
    fn resolve_prefers_exact_over_fuzzy() {
        let tags = vec![tag("1", "finance-news", "Finance News"), tag("2", "finance", "Finance")];
        let resolved = resolve_tag_ids(&tags, &["finance".into(), "Geo".into(), "crypto".into()]);
        assert_eq!(resolved[0], ("finance".into(), Some("2".into())));
        assert_eq!(resolved[1].1, None);
        assert_eq!(resolved[2].1, None);

        let tags = vec![tag("9", "world-geopolitics", "World Geopolitics")];
        let resolved = resolve_tag_ids(&tags, &["geopolitics".into()]);
        assert_eq!(resolved[0].1.as_deref(), Some("9"));
    }

    #[tokio::test]
    async fn fetch_all_walks_pages() {
        let catalog = StaticCatalog::new(vec![]);
        catalog.set_markets("t", (0..5).map(|i| market(&format!("m{i}"), 1.0, 1.0)).collect());
        let filter = MarketFilter { tag_id: Some("t".into()), active: true, closed: false };
        let outcome = fetch_all_markets(&catalog, &filter, 2).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.markets.len(), 5);
        assert_eq!(outcome.pages, 3);
    }

    #[tokio::test]
    async fn offset_steps_past_unparseable_records() {
        let catalog = StaticCatalog::new(vec![]);
        catalog.set_markets("t", (0..5).map(|i| market(&format!("m{i}"), 1.0, 1.0)).collect());
        // The whole first page fails to parse; the walk must not stop or overlap.
        *catalog.unparseable.lock().unwrap() = vec!["m0".into(), "m1".into(), "m3".into()];
        let filter = MarketFilter { tag_id: Some("t".into()), active: true, closed: false };
        let outcome = fetch_all_markets(&catalog, &filter, 2).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.pages, 3);
        let ids: Vec<&str> = outcome.markets.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m4"]);
    }

    #[tokio::test]
    async fn failing_page_keeps_earlier_pages() {
        let catalog = StaticCatalog::new(vec![]);
        catalog.set_markets("t", (0..5).map(|i| market(&format!("m{i}"), 1.0, 1.0)).collect());
        catalog.fail_pages.lock().unwrap().push(1);
        let filter = MarketFilter { tag_id: Some("t".into()), active: true, closed: false };
        let outcome = fetch_all_markets(&catalog, &filter, 2).await;
        assert!(outcome.is_partial());
        assert_eq!(outcome.markets.len(), 2);
    }
}
