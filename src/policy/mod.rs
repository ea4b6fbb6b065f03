//! Robots-derived URL policy consumed by the page handlers.
//!
//! Mirrors the storefront's crawl rules: operational and account surfaces
//! are off limits, filtered collection views are noise, and tracking
//! parameters are stripped before URLs are deduplicated or enqueued.

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use url::Url;

/// Outcome of evaluating a URL against the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(&'static str),
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }
}

/// Path prefixes that are never crawled.
static DENIED_PATHS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/(admin|cart|checkout|account|orders|password|login|signup)(/|$)")
        .expect("denied path pattern is valid")
});

/// Query parameters that only exist for analytics attribution.
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "gclid",
    "fbclid",
    "mc_cid",
    "mc_eid",
    "ref",
];

/// Collection query parameters that produce filtered views of the same
/// products (tag/sort/view permutations). Crawling them multiplies work
/// without discovering anything new.
const FILTER_PARAMS: &[&str] = &["filter", "sort_by", "view", "tag", "page_size"];

/// Crawler identifiers that get a longer minimum delay.
const SLOW_AGENTS: &[&str] = &["AhrefsBot", "SemrushBot", "MJ12bot", "BLEXBot"];

/// Default minimum delay between requests to one domain.
const DEFAULT_CRAWL_DELAY: Duration = Duration::from_secs(2);

/// Minimum delay applied to the heavyweight crawler identifiers.
const SLOW_CRAWL_DELAY: Duration = Duration::from_secs(10);

/// Decide whether a URL may be fetched.
///
/// Callers are expected to [`normalize`] first; a URL still carrying
/// tracking parameters at evaluation time is denied.
pub fn evaluate(url: &Url) -> PolicyDecision {
    if DENIED_PATHS.is_match(url.path()) {
        return PolicyDecision::Deny("operational or account path");
    }

    let has_tracking = url
        .query_pairs()
        .any(|(key, _)| TRACKING_PARAMS.contains(&key.as_ref()));
    if has_tracking {
        return PolicyDecision::Deny("tracking parameters present");
    }

    let is_collection = url.path().starts_with("/collections");
    if is_collection {
        let filtered = url.query_pairs().any(|(key, _)| {
            FILTER_PARAMS.contains(&key.as_ref()) || key.starts_with("filter.")
        });
        if filtered {
            return PolicyDecision::Deny("filtered collection view");
        }
    }

    PolicyDecision::Allow
}

/// Strip tracking parameters, producing the canonical form used for
/// deduplication and enqueueing.
pub fn normalize(url: &Url) -> Url {
    let mut normalized = url.clone();

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !TRACKING_PARAMS.contains(&key.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        normalized.set_query(None);
    } else {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &kept {
            serializer.append_pair(k, v);
        }
        normalized.set_query(Some(&serializer.finish()));
    }

    normalized.set_fragment(None);
    normalized
}

/// Minimum request delay for a given user agent.
pub fn crawl_delay(user_agent: &str) -> Duration {
    if SLOW_AGENTS.iter().any(|agent| user_agent.contains(agent)) {
        SLOW_CRAWL_DELAY
    } else {
        DEFAULT_CRAWL_DELAY
    }
}
