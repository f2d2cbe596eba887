//! Case-insensitive header storage and raw header block parsing.
//!
//! # Header Blocks
//!
//! The transfer engine hands over every header line it receives, including the
//! blocks of intermediate redirect hops and informational responses:
//!
//! ```text
//! HTTP/1.1 301 Moved Permanently
//! Location: /b
//!
//! HTTP/1.1 200 OK
//! Content-Type: text/plain
//! ```
//!
//! [`authoritative_block`] picks the last block that starts with `HTTP/`, and
//! [`parse_header_block`] turns it into a [`HeaderMap`] whose first entry is a
//! synthetic first-line key (`Status-Line` or `Request-Line`).
//!
//! # Examples
//!
//! ```
//! use transfer_http::protocol::headers::{authoritative_block, parse_header_block, STATUS_LINE};
//!
//! let raw = "HTTP/1.1 302 Found\r\nLocation: /next\r\n\r\nHTTP/1.1 200 OK\r\nX-A: 1\r\nx-a: 2\r\n\r\n";
//! let headers = parse_header_block(authoritative_block(raw), STATUS_LINE);
//! assert_eq!(headers.get(STATUS_LINE), Some("HTTP/1.1 200 OK"));
//! assert_eq!(headers.get("X-A"), Some("1,2"));
//! ```

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

/// Synthetic key holding the status line of a response block.
pub const STATUS_LINE: &str = "Status-Line";
/// Synthetic key holding the request line of an echoed request block.
pub const REQUEST_LINE: &str = "Request-Line";

/// `Content-Type` header name.
pub const CONTENT_TYPE: &str = "Content-Type";
/// `Content-Length` header name.
pub const CONTENT_LENGTH: &str = "Content-Length";
/// `Cookie` header name.
pub const COOKIE: &str = "Cookie";
/// `User-Agent` header name.
pub const USER_AGENT: &str = "User-Agent";
/// `Authorization` header name.
pub const AUTHORIZATION: &str = "Authorization";
/// `Location` header name.
pub const LOCATION: &str = "Location";

static BLOCK_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\r?\n\r?\n").expect("static block separator regex"));

/// Ordered header map with case-insensitive keys.
///
/// Lookup folds the key to lowercase, while iteration and serialization use the
/// casing of the most recent insert and the order of the first insert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: IndexMap<String, (String, String)>,
}

impl HeaderMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name` to `value`, replacing any value stored under another casing.
    ///
    /// Returns the previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let name = name.into();
        let value = value.into();
        self.entries
            .insert(name.to_ascii_lowercase(), (name, value))
            .map(|(_, old)| old)
    }

    /// Add `value` to `name`, joining with `,` if the header already exists.
    pub fn append(&mut self, name: impl Into<String>, value: impl AsRef<str>) {
        let name = name.into();
        let value = value.as_ref();
        match self.entries.get_mut(&name.to_ascii_lowercase()) {
            Some((_, existing)) => {
                existing.push(',');
                existing.push_str(value);
            }
            None => {
                self.insert(name, value);
            }
        }
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(|(_, value)| value.as_str())
    }

    /// Whether a header exists under any casing.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    /// Remove a header, keeping the order of the remaining entries.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries
            .shift_remove(&name.to_ascii_lowercase())
            .map(|(_, value)| value)
    }

    /// Number of distinct headers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no header is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(name, value)` pairs in insertion order with original casing.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .values()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Copy entries from `other` whose names are not present yet.
    pub fn merge_missing(&mut self, other: &HeaderMap) {
        for (name, value) in other.iter() {
            if !self.contains(name) {
                self.insert(name, value);
            }
        }
    }

    /// Serialize as `Key:Value` lines (no space after the colon).
    pub fn to_wire_lines(&self) -> Vec<String> {
        self.iter()
            .map(|(name, value)| format!("{}:{}", name, value))
            .collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = HeaderMap::new();
        for (name, value) in iter {
            map.insert(name, value);
        }
        map
    }
}

/// Split a raw header buffer into its blank-line separated blocks.
pub fn split_header_blocks(raw: &str) -> Vec<&str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    BLOCK_SEPARATOR
        .split(trimmed)
        .map(|block| block.trim_start_matches(['\r', '\n']))
        .collect()
}

/// Select the last block whose first line starts with `HTTP/`.
///
/// Scans from the end backward and stops at the first match. Returns an empty
/// string when no block qualifies.
pub fn authoritative_block(raw: &str) -> &str {
    split_header_blocks(raw)
        .into_iter()
        .rev()
        .find(|block| starts_with_http(block))
        .unwrap_or("")
}

fn starts_with_http(block: &str) -> bool {
    block
        .get(..5)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("HTTP/"))
}

/// Parse one header block.
///
/// The first line is stored verbatim under `first_line_key`. Every other line
/// is split at its first colon; repeated keys are joined with `,` in encounter
/// order. Lines without a colon are ignored.
pub fn parse_header_block(block: &str, first_line_key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let mut lines = block.lines().filter(|line| !line.trim().is_empty());

    headers.insert(first_line_key, lines.next().map(str::trim_end).unwrap_or(""));

    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            headers.append(key.trim(), value.trim());
        }
    }

    headers
}

/// Numeric status code from a status line such as `HTTP/1.1 404 Not Found`.
pub fn status_code_from_line(status_line: &str) -> Option<u16> {
    status_line.split_whitespace().nth(1)?.parse().ok()
}
