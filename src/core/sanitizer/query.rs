// src/core/sanitizer/query.rs

//! Heuristics that decide whether a search query is safe to share.
//!
//! The checks are conservative: anything that looks like contact data,
//! credentials or an identifying number rejects the whole query. Product
//! numbers with valid checksums (EAN-13, ISSN) are the deliberate
//! exception; people search for those.

use once_cell::sync::Lazy;
use regex::Regex;

/// Total query cap in UTF-8 bytes.
const MAX_QUERY_BYTES: usize = 120;
/// No single whitespace-separated word may exceed this many bytes.
const MAX_WORD_BYTES: usize = 45;
/// Tighter total cap (in characters) for dense scripts, where far more
/// meaning fits into far fewer code points.
const MAX_DENSE_QUERY_CHARS: usize = 50;

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap());

static HTTP_USERINFO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)https?://[^/\s@]+:[^/\s@]+@").unwrap());

/// Candidate digit groups: at least seven digits, possibly broken up by
/// common phone-number separators.
static NUMERIC_CANDIDATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[0-9][0-9 \-()./]{5,}[0-9]").unwrap());

static ISSN_SHAPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}-?\d{3}[\dXx]$").unwrap());

/// Verdict of `check_suspicious_query`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCheck {
    pub accept: bool,
    pub reason: Option<&'static str>,
}

impl QueryCheck {
    fn accepted() -> Self {
        Self {
            accept: true,
            reason: None,
        }
    }

    fn rejected(reason: &'static str) -> Self {
        Self {
            accept: false,
            reason: Some(reason),
        }
    }
}

fn is_dense_script(c: char) -> bool {
    matches!(c,
        '\u{1100}'..='\u{11FF}'   // Hangul Jamo
        | '\u{3040}'..='\u{30FF}' // Hiragana, Katakana
        | '\u{3400}'..='\u{4DBF}' // CJK extension A
        | '\u{4E00}'..='\u{9FFF}' // CJK unified
        | '\u{AC00}'..='\u{D7AF}' // Hangul syllables
        | '\u{0E00}'..='\u{0E7F}' // Thai
    )
}

fn ean13_checksum_valid(digits: &str) -> bool {
    if digits.len() != 13 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let sum: u32 = digits
        .bytes()
        .take(12)
        .enumerate()
        .map(|(i, b)| {
            let d = (b - b'0') as u32;
            if i % 2 == 0 { d } else { d * 3 }
        })
        .sum();
    let check = (10 - sum % 10) % 10;
    check == (digits.as_bytes()[12] - b'0') as u32
}

fn issn_checksum_valid(token: &str) -> bool {
    if !ISSN_SHAPE.is_match(token) {
        return false;
    }
    let chars: Vec<char> = token.chars().filter(|c| *c != '-').collect();
    let sum: u32 = chars
        .iter()
        .take(7)
        .enumerate()
        .map(|(i, c)| c.to_digit(10).unwrap_or(0) * (8 - i as u32))
        .sum();
    let check = (11 - sum % 11) % 11;
    let expected = chars[7];
    if check == 10 {
        expected == 'X' || expected == 'x'
    } else {
        expected.to_digit(10) == Some(check)
    }
}

/// Decides whether a query may be reported.
pub fn check_suspicious_query(query: &str) -> QueryCheck {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return QueryCheck::rejected("empty query");
    }

    if trimmed.chars().any(is_dense_script) {
        if trimmed.chars().count() > MAX_DENSE_QUERY_CHARS {
            return QueryCheck::rejected("dense-script query too long");
        }
    } else if trimmed.len() > MAX_QUERY_BYTES {
        return QueryCheck::rejected("query too long");
    }

    if trimmed
        .split_whitespace()
        .any(|word| word.len() > MAX_WORD_BYTES)
    {
        return QueryCheck::rejected("word too long");
    }

    if EMAIL.is_match(trimmed) {
        return QueryCheck::rejected("email address");
    }
    if HTTP_USERINFO.is_match(trimmed) {
        return QueryCheck::rejected("URL credentials");
    }

    // ISSNs end in a possible 'X' check character, which the digit-run scan
    // below cannot see. Validate them first and mask valid ones out.
    let mut scrubbed = trimmed.to_string();
    for token in trimmed.split_whitespace() {
        if ISSN_SHAPE.is_match(token) {
            if issn_checksum_valid(token) {
                scrubbed = scrubbed.replace(token, "");
            } else {
                return QueryCheck::rejected("phone-like numeric sequence");
            }
        }
    }

    for candidate in NUMERIC_CANDIDATE.find_iter(&scrubbed) {
        let digits: String = candidate
            .as_str()
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect();
        if ean13_checksum_valid(&digits) {
            continue;
        }
        if digits.len() >= 7 {
            return QueryCheck::rejected("phone-like numeric sequence");
        }
    }

    QueryCheck::accepted()
}
