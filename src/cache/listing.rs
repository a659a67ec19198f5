//! Listing and statistics projections over cache tiers

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::artifact::CacheTier;
use super::key::{guess_artifact_type, CacheKey};

/// Default page size for item listings
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// One row of a cache listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheItem {
    pub key: String,
    pub artifact_type: String,
    pub artifact_path: String,
    /// Fastest tier holding the key
    pub tier: CacheTier,
    pub size: u64,
    /// Only known without re-hashing for L1 entries
    pub checksum: Option<String>,
    pub hit_count: u64,
    pub last_accessed: Option<DateTime<Utc>>,
    pub cached_at: Option<DateTime<Utc>>,
    /// Remaining TTL in seconds, when the tier tracks one
    pub ttl_secs: Option<u64>,
}

impl CacheItem {
    /// Start a row for `key`, deriving its path and artifact type
    pub fn for_key(key: &str, tier: CacheTier, size: u64) -> Self {
        let (declared, path) = match CacheKey::parse(key) {
            Ok(parsed) => (Some(parsed.artifact_type().to_string()), parsed.path().to_string()),
            Err(_) => (None, key.to_string()),
        };
        let artifact_type = match guess_artifact_type(&path) {
            "unknown" => declared.unwrap_or_else(|| "unknown".to_string()),
            guessed => guessed.to_string(),
        };
        Self {
            key: key.to_string(),
            artifact_type,
            artifact_path: path,
            tier,
            size,
            checksum: None,
            hit_count: 0,
            last_accessed: None,
            cached_at: None,
            ttl_secs: None,
        }
    }

    fn matches(&self, query: &ListQuery) -> bool {
        if let Some(ty) = query.artifact_type.as_deref().filter(|t| !t.is_empty()) {
            if !self.artifact_type.eq_ignore_ascii_case(ty) {
                return false;
            }
        }
        if let Some(term) = query.search.as_deref().filter(|t| !t.is_empty()) {
            if !self.key.to_lowercase().contains(&term.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

/// Listing filter and page
#[derive(Debug, Clone)]
pub struct ListQuery {
    pub offset: usize,
    /// Zero means no limit
    pub limit: usize,
    pub artifact_type: Option<String>,
    pub search: Option<String>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_PAGE_SIZE,
            artifact_type: None,
            search: None,
        }
    }
}

/// A page of listing results
#[derive(Debug, Clone, Serialize)]
pub struct ListPage {
    pub items: Vec<CacheItem>,
    /// Matching items before pagination
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

/// Filter, sort by key, then paginate
pub(crate) fn paginate(mut items: Vec<CacheItem>, query: &ListQuery) -> ListPage {
    items.retain(|item| item.matches(query));
    items.sort_by(|a, b| a.key.cmp(&b.key));
    let total = items.len();

    let page: Vec<CacheItem> = items
        .into_iter()
        .skip(query.offset)
        .take(if query.limit == 0 { usize::MAX } else { query.limit })
        .collect();

    ListPage {
        items: page,
        total,
        offset: query.offset,
        limit: query.limit,
    }
}

/// Item count and bytes for one tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub items: u64,
    pub bytes: u64,
}

/// Per-tier totals, computed by enumerating tier contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub l1: TierStats,
    pub l2: TierStats,
    /// `None` when the cold tier is disabled
    pub l3: Option<TierStats>,
    pub total_items: u64,
    pub total_bytes: u64,
}

impl CacheStats {
    pub(crate) fn new(l1: TierStats, l2: TierStats, l3: Option<TierStats>) -> Self {
        let cold = l3.unwrap_or_default();
        Self {
            total_items: l1.items + l2.items + cold.items,
            total_bytes: l1.bytes + l2.bytes + cold.bytes,
            l1,
            l2,
            l3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items() -> Vec<CacheItem> {
        vec![
            CacheItem::for_key("npm:lodash/-/lodash-4.17.21.tgz", CacheTier::L1, 10),
            CacheItem::for_key("maven:org/x/x-1.0.jar", CacheTier::L2, 20),
            CacheItem::for_key("pypi:requests-2.31.0-py3-none-any.whl", CacheTier::L2, 30),
            CacheItem::for_key("docker:library/nginx/manifests/latest", CacheTier::L1, 40),
        ]
    }

    #[test]
    fn test_type_derived_from_path() {
        let item = CacheItem::for_key("generic:charts/nginx-1.0.0.tgz", CacheTier::L2, 1);
        assert_eq!(item.artifact_type, "helm");
        assert_eq!(item.artifact_path, "charts/nginx-1.0.0.tgz");

        let item = CacheItem::for_key("go:golang.org/x/text/@v/list", CacheTier::L1, 1);
        assert_eq!(item.artifact_type, "go");

        let item = CacheItem::for_key("no-separator", CacheTier::L1, 1);
        assert_eq!(item.artifact_type, "unknown");
    }

    #[test]
    fn test_filter_by_type_and_search() {
        let page = paginate(
            items(),
            &ListQuery {
                artifact_type: Some("NPM".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].key, "npm:lodash/-/lodash-4.17.21.tgz");

        let page = paginate(
            items(),
            &ListQuery {
                search: Some("NGINX".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].artifact_type, "docker");
    }

    #[test]
    fn test_pagination_after_filter() {
        let page = paginate(
            items(),
            &ListQuery {
                offset: 1,
                limit: 2,
                ..Default::default()
            },
        );
        assert_eq!(page.total, 4);
        let keys: Vec<&str> = page.items.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["maven:org/x/x-1.0.jar", "npm:lodash/-/lodash-4.17.21.tgz"]);

        let all = paginate(
            items(),
            &ListQuery {
                limit: 0,
                ..Default::default()
            },
        );
        assert_eq!(all.items.len(), 4);
    }

    #[test]
    fn test_stats_totals() {
        let stats = CacheStats::new(
            TierStats { items: 2, bytes: 10 },
            TierStats { items: 3, bytes: 100 },
            None,
        );
        assert_eq!(stats.total_items, 5);
        assert_eq!(stats.total_bytes, 110);
    }
}
