// src/core/analyzer.rs

//! Search-engine recognition. A priority-ordered matcher table classifies a
//! URL into a search category, extracts the query, and builds the URL for
//! the cookie-free doublefetch. More specific matchers (image/video/news
//! verticals) are declared before their general siblings, so declaration
//! order is the tie-breaker.

use crate::core::patterns::{DoublefetchRequest, Patterns};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use url::Url;

struct SearchEngineMatcher {
    category: &'static str,
    pattern: Regex,
    /// Path-and-query prefix of the doublefetch URL; the re-encoded query is appended.
    doublefetch_path: &'static str,
    /// Query parameter holding the search terms.
    query_param: &'static str,
    /// Overrides the host of the doublefetch URL; defaults to the matched host.
    doublefetch_host: Option<&'static str>,
}

impl SearchEngineMatcher {
    fn new(
        category: &'static str,
        pattern: &str,
        doublefetch_path: &'static str,
    ) -> Self {
        Self {
            category,
            pattern: Regex::new(pattern).unwrap(),
            doublefetch_path,
            query_param: "q",
            doublefetch_host: None,
        }
    }

    fn query_param(mut self, param: &'static str) -> Self {
        self.query_param = param;
        self
    }

    fn doublefetch_host(mut self, host: &'static str) -> Self {
        self.doublefetch_host = Some(host);
        self
    }
}

static MATCHERS: Lazy<Vec<SearchEngineMatcher>> = Lazy::new(|| {
    vec![
        SearchEngineMatcher::new(
            "search-gos",
            r"^https://www\.google\.[a-z.]{2,8}/search\?.*[?&#;]?tbm=shop",
            "search?tbm=shop&q=",
        ),
        SearchEngineMatcher::new(
            "search-goi",
            r"^https://www\.google\.[a-z.]{2,8}/search\?.*(tbm=isch|udm=2)",
            "search?tbm=isch&q=",
        ),
        SearchEngineMatcher::new(
            "search-gov",
            r"^https://www\.google\.[a-z.]{2,8}/search\?.*(tbm=vid|udm=7)",
            "search?tbm=vid&q=",
        ),
        SearchEngineMatcher::new(
            "search-go",
            r"^https://www\.google\.[a-z.]{2,8}/search\?",
            "search?q=",
        ),
        SearchEngineMatcher::new(
            "search-ya",
            r"^https://([a-z]{2,3}\.)?search\.yahoo\.com/search",
            "search?p=",
        )
        .query_param("p")
        .doublefetch_host("search.yahoo.com"),
        SearchEngineMatcher::new(
            "search-bii",
            r"^https://www\.bing\.com/images/search\?",
            "images/search?q=",
        ),
        SearchEngineMatcher::new(
            "search-bi",
            r"^https://www\.bing\.com/search\?",
            "search?q=",
        ),
        SearchEngineMatcher::new(
            "search-am",
            r"^https://www\.amazon\.[a-z.]{2,8}/s[?/]",
            "s?k=",
        )
        .query_param("k"),
        SearchEngineMatcher::new("search-dd", r"^https://duckduckgo\.com/(\?|html)", "?q="),
        SearchEngineMatcher::new(
            "search-ghi",
            r"^https://ghosterysearch\.com/images\?",
            "images?q=",
        ),
        SearchEngineMatcher::new(
            "search-ghv",
            r"^https://ghosterysearch\.com/videos\?",
            "videos?q=",
        ),
        SearchEngineMatcher::new(
            "search-gh",
            r"^https://ghosterysearch\.com/search\?",
            "search?q=",
        ),
        SearchEngineMatcher::new(
            "search-bri",
            r"^https://search\.brave\.com/images\?",
            "images?q=",
        ),
        SearchEngineMatcher::new(
            "search-brn",
            r"^https://search\.brave\.com/news\?",
            "news?q=",
        ),
        SearchEngineMatcher::new(
            "search-brv",
            r"^https://search\.brave\.com/videos\?",
            "videos?q=",
        ),
        SearchEngineMatcher::new(
            "search-br",
            r"^https://search\.brave\.com/search\?",
            "search?q=",
        ),
        SearchEngineMatcher::new(
            "search-ec",
            r"^https://www\.ecosia\.org/search\?",
            "search?q=",
        ),
    ]
});

/// Outcome of `analyze`.
#[derive(Debug, Clone, PartialEq)]
pub enum UrlAnalysis {
    NotSupported {
        category: Option<String>,
        query: Option<String>,
    },
    Supported {
        category: String,
        query: String,
        doublefetch_request: DoublefetchRequest,
    },
}

impl UrlAnalysis {
    pub fn is_supported(&self) -> bool {
        matches!(self, UrlAnalysis::Supported { .. })
    }

    pub fn category(&self) -> Option<&str> {
        match self {
            UrlAnalysis::NotSupported { category, .. } => category.as_deref(),
            UrlAnalysis::Supported { category, .. } => Some(category),
        }
    }

    pub fn query(&self) -> Option<&str> {
        match self {
            UrlAnalysis::NotSupported { query, .. } => query.as_deref(),
            UrlAnalysis::Supported { query, .. } => Some(query),
        }
    }
}

pub struct UrlAnalyzer {
    patterns: Arc<Patterns>,
}

impl UrlAnalyzer {
    pub fn new(patterns: Arc<Patterns>) -> Self {
        Self { patterns }
    }

    /// Classifies `raw_url` and, when the pattern data supplies a
    /// doublefetch section for the category, builds the doublefetch request.
    pub fn analyze(&self, raw_url: &str) -> UrlAnalysis {
        let Some(matcher) = MATCHERS.iter().find(|m| m.pattern.is_match(raw_url)) else {
            return UrlAnalysis::NotSupported {
                category: None,
                query: None,
            };
        };

        // A literal '+' in a query means a space to the search engine; make
        // the distinction survive URL parsing by re-encoding spaces first.
        let normalized = raw_url.replace('+', "%20");
        let parsed = match Url::parse(&normalized) {
            Ok(parsed) => parsed,
            Err(_) => {
                return UrlAnalysis::NotSupported {
                    category: None,
                    query: None,
                };
            }
        };

        let query = parsed
            .query_pairs()
            .find(|(k, _)| k == matcher.query_param)
            .map(|(_, v)| v.into_owned())
            .filter(|q| !q.trim().is_empty());
        let Some(query) = query else {
            return UrlAnalysis::NotSupported {
                category: None,
                query: None,
            };
        };

        let encoded_query = urlencoding::encode(&query).replace("%20", "+");
        let host = matcher
            .doublefetch_host
            .or_else(|| parsed.host_str())
            .unwrap_or_default();
        let doublefetch_url = format!("https://{host}/{}{encoded_query}", matcher.doublefetch_path);

        match self
            .patterns
            .create_doublefetch_request(matcher.category, &doublefetch_url)
        {
            Some(doublefetch_request) => UrlAnalysis::Supported {
                category: matcher.category.to_string(),
                query,
                doublefetch_request,
            },
            None => UrlAnalysis::NotSupported {
                category: Some(matcher.category.to_string()),
                query: Some(query),
            },
        }
    }
}
