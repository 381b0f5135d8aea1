// src/core/pagedb/page.rs

//! Page entry types and the field-level merge policy.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Load state as reported by the page observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PageStatus {
    #[default]
    Loading,
    Complete,
    Failed,
    #[serde(other)]
    Unknown,
}

/// Search-result context for pages reached from a SERP. `depth` counts the
/// clicks from the result page: `0` is the SERP itself, `1` a direct
/// landing, which is the publicly indexable case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchInfo {
    pub category: String,
    pub query: String,
    pub depth: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Aggregator {
    pub first_seen_at: u64,
    pub last_seen_at: u64,
    /// `None` marks the entry dirty (never written, or changed since).
    pub last_written_at: Option<u64>,
    /// Normalized interaction level in `[0, 1]`.
    pub activity: f64,
}

/// One aggregated page. Persisted under the key `"<createdAt>:<url>"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageEntry {
    /// Normalized: the fragment is stripped before the entry is created.
    pub url: String,
    #[serde(default)]
    pub status: PageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_load_method: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<SearchInfo>,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirects: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_doublefetch: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    pub last_updated_at: u64,
    #[serde(default)]
    pub aggregator: Aggregator,
}

impl PageEntry {
    /// A page that declared itself unindexable must never be reported.
    pub fn is_noindex(&self) -> bool {
        let Some(pre) = &self.pre_doublefetch else {
            return false;
        };
        pre.get("noindex").and_then(Value::as_bool).unwrap_or(false)
            || pre
                .pointer("/meta/noindex")
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }

    /// The SERP itself, as opposed to a landing reached from one.
    pub fn is_search_results_page(&self) -> bool {
        self.search.as_ref().is_some_and(|s| s.depth == 0)
    }
}

/// Strips the fragment; everything else is preserved. Unparseable inputs
/// fall back to cutting at the first `#`.
pub fn normalize_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => raw.split('#').next().unwrap_or(raw).to_string(),
    }
}

/// Folds several observations of the same URL into one entry.
///
/// Entries are applied oldest-first, so for most fields the newest
/// observation wins. `search` is the exception: a `depth == 1` landing
/// stays, because public indexability is the property the pipeline cares
/// about. The aggregator tracks the envelope of all observations and the
/// merged entry is always dirty (`last_written_at = None`).
pub fn merge_pages(mut entries: Vec<PageEntry>) -> Option<PageEntry> {
    if entries.is_empty() {
        return None;
    }
    entries.sort_by_key(|e| e.last_updated_at);
    let mut iter = entries.into_iter();
    let mut merged = iter.next()?;

    for newer in iter {
        let keep_search = matches!(&merged.search, Some(s) if s.depth == 1)
            && !matches!(&newer.search, Some(s) if s.depth == 1);
        let search = if keep_search {
            merged.search.clone()
        } else {
            newer.search.clone().or_else(|| merged.search.clone())
        };

        let aggregator = Aggregator {
            first_seen_at: non_zero_min(
                merged.aggregator.first_seen_at,
                newer.aggregator.first_seen_at,
            ),
            last_seen_at: merged.aggregator.last_seen_at.max(newer.aggregator.last_seen_at),
            last_written_at: None,
            activity: merged.aggregator.activity.max(newer.aggregator.activity),
        };

        merged = PageEntry {
            url: newer.url,
            status: newer.status,
            page_load_method: newer.page_load_method.or(merged.page_load_method),
            title: if newer.title.is_empty() {
                merged.title
            } else {
                newer.title
            },
            search,
            referrer: newer.referrer.or(merged.referrer),
            redirects: newer.redirects.or(merged.redirects),
            pre_doublefetch: newer.pre_doublefetch.or(merged.pre_doublefetch),
            lang: newer.lang.or(merged.lang),
            last_updated_at: newer.last_updated_at.max(merged.last_updated_at),
            aggregator,
        };
    }
    merged.aggregator.last_written_at = None;
    Some(merged)
}

fn non_zero_min(a: u64, b: u64) -> u64 {
    match (a, b) {
        (0, b) => b,
        (a, 0) => a,
        (a, b) => a.min(b),
    }
}
