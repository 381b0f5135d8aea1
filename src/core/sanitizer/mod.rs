// src/core/sanitizer/mod.rs

//! URL redaction. `sanitize_url` classifies a URL as safe, truncated or
//! dropped. Hard violations (bad scheme, credentials, IP hosts, odd ports,
//! malformed hostnames, onion services) drop the URL entirely; content
//! heuristics (geo coordinates, long opaque tokens, login pages, embedded
//! email addresses) truncate it to its origin, or to its first path segment
//! when the caller asks for path preservation and the segment is clean.
//! Strict mode promotes the truncating categories to drops.

pub mod query;

pub use query::{QueryCheck, check_suspicious_query};

use once_cell::sync::Lazy;
use regex::Regex;
use std::net::IpAddr;
use url::{Host, Url};

/// Literal marker appended to truncated URLs.
pub const PROTECTED_MARKER: &str = " (PROTECTED)";

const MAX_HOSTNAME_LEN: usize = 253;
const MAX_HOST_LABELS: usize = 10;
const MAX_LABEL_LEN: usize = 63;

/// Latitude/longitude pairs with at least two decimals, as map URLs embed them.
static GEO_COORDINATES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-?\d{1,3}\.\d{2,}\s*,\s*-?\d{1,3}\.\d{2,}").unwrap());

/// Opaque tokens: base64-ish runs long enough to be identifiers, not words.
static LONG_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9+/=_-]{22,}").unwrap());

/// Long unbroken digit runs (order numbers, phone numbers, tracking ids).
static LONG_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{9,}").unwrap());

static LOGIN_SIGNATURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(^|[/?&#_-])(login|log-in|signin|sign-in|logout|password|passwd|auth)($|[/?&=#_-])")
        .unwrap()
});

static EMAIL_IN_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+(@|%40)[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanitizeResult {
    Safe,
    Truncated,
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlSanitization {
    pub result: SanitizeResult,
    pub safe_url: Option<String>,
    pub reason: Option<String>,
}

impl UrlSanitization {
    fn safe(url: String) -> Self {
        Self {
            result: SanitizeResult::Safe,
            safe_url: Some(url),
            reason: None,
        }
    }

    fn truncated(url: String, reason: impl Into<String>) -> Self {
        Self {
            result: SanitizeResult::Truncated,
            safe_url: Some(url),
            reason: Some(reason.into()),
        }
    }

    fn dropped(reason: impl Into<String>) -> Self {
        Self {
            result: SanitizeResult::Dropped,
            safe_url: None,
            reason: Some(reason.into()),
        }
    }

    pub fn is_dropped(&self) -> bool {
        self.result == SanitizeResult::Dropped
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SanitizeOptions {
    /// Promote truncations to drops.
    pub strict: bool,
    /// Keep the first path segment when it is itself clean.
    pub try_preserve_path: bool,
}

/// Checks the hard-drop categories. Returns a reason when the URL must not
/// be reported in any form.
fn hard_drop_reason(url: &Url) -> Option<String> {
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        if scheme.contains("extension") {
            return Some("extension scheme".to_string());
        }
        return Some(format!("non-http scheme '{scheme}'"));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Some("embedded credentials".to_string());
    }
    match url.host() {
        None => return Some("missing host".to_string()),
        Some(Host::Ipv4(_)) | Some(Host::Ipv6(_)) => {
            // All IP-literal hosts are dropped; private and loopback ranges
            // are just the most obviously identifying ones.
            return Some("ip address as hostname".to_string());
        }
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.');
            if domain.eq_ignore_ascii_case("localhost") {
                return Some("localhost".to_string());
            }
            if domain.parse::<IpAddr>().is_ok() {
                return Some("ip address as hostname".to_string());
            }
            if domain.len() > MAX_HOSTNAME_LEN {
                return Some("hostname too long".to_string());
            }
            let labels: Vec<&str> = domain.split('.').collect();
            if labels.len() < 2 {
                return Some("single-label hostname".to_string());
            }
            if labels.len() > MAX_HOST_LABELS {
                return Some("too many hostname labels".to_string());
            }
            if labels.iter().any(|l| l.is_empty() || l.len() > MAX_LABEL_LEN) {
                return Some("malformed hostname label".to_string());
            }
            if labels.last().is_some_and(|l| l.eq_ignore_ascii_case("onion")) {
                return Some("onion service".to_string());
            }
        }
    }
    if let Some(port) = url.port()
        && port != 80
        && port != 443
    {
        return Some(format!("non-standard port {port}"));
    }
    None
}

/// Checks the truncating heuristics against a decoded path+query string.
fn heuristic_reason(content: &str) -> Option<String> {
    if GEO_COORDINATES.is_match(content) {
        return Some("geo coordinates".to_string());
    }
    if EMAIL_IN_URL.is_match(content) {
        return Some("email address in url".to_string());
    }
    if LOGIN_SIGNATURE.is_match(content) {
        return Some("login page signature".to_string());
    }
    if LONG_NUMBER.is_match(content) {
        return Some("long numeric identifier".to_string());
    }
    if let Some(token) = LONG_TOKEN.find(content) {
        let t = token.as_str();
        let has_digit = t.bytes().any(|b| b.is_ascii_digit());
        let has_alpha = t.bytes().any(|b| b.is_ascii_alphabetic());
        if (has_digit && has_alpha) || t.len() >= 40 {
            return Some("long opaque token".to_string());
        }
    }
    None
}

fn origin_of(url: &Url) -> String {
    // Ports other than the defaults never get here; hard drops run first.
    format!("{}://{}/", url.scheme(), url.host_str().unwrap_or_default())
}

fn decoded_path_and_query(url: &Url) -> String {
    let mut content = url.path().to_string();
    if let Some(query) = url.query() {
        content.push('?');
        content.push_str(query);
    }
    urlencoding::decode(&content)
        .map(|c| c.into_owned())
        .unwrap_or(content)
}

/// Classifies `raw_url` and produces a shareable form when one exists.
pub fn sanitize_url(raw_url: &str, opts: SanitizeOptions) -> UrlSanitization {
    // Already-truncated inputs pass through unchanged, which makes the
    // sanitizer idempotent over its own output.
    if let Some(prefix) = raw_url.strip_suffix(PROTECTED_MARKER) {
        return match Url::parse(prefix.trim_end()) {
            Ok(url) => match hard_drop_reason(&url) {
                Some(reason) => UrlSanitization::dropped(reason),
                None => UrlSanitization::truncated(raw_url.to_string(), "already truncated"),
            },
            Err(e) => UrlSanitization::dropped(format!("unparseable truncated url: {e}")),
        };
    }

    let url = match Url::parse(raw_url) {
        Ok(url) => url,
        Err(e) => return UrlSanitization::dropped(format!("unparseable url: {e}")),
    };

    if let Some(reason) = hard_drop_reason(&url) {
        return UrlSanitization::dropped(reason);
    }

    let content = decoded_path_and_query(&url);
    let Some(reason) = heuristic_reason(&content) else {
        return UrlSanitization::safe(url.to_string());
    };

    if opts.strict {
        return UrlSanitization::dropped(reason);
    }

    if opts.try_preserve_path {
        let first_segment = url
            .path_segments()
            .and_then(|mut segments| segments.next())
            .unwrap_or_default();
        if !first_segment.is_empty() && heuristic_reason(first_segment).is_none() {
            let truncated = format!(
                "{}{}{}",
                origin_of(&url),
                first_segment,
                PROTECTED_MARKER
            );
            return UrlSanitization::truncated(truncated, reason);
        }
    }

    UrlSanitization::truncated(format!("{}{}", origin_of(&url), PROTECTED_MARKER), reason)
}
