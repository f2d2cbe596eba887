//! Cookie character policy and the cookie codec.
//!
//! Two fixed character sets decide which bytes of a cookie may travel verbatim:
//!
//! | Part | Allowed characters | Source |
//! |------|--------------------|--------|
//! | Name | token: letters, digits and the punctuation of [`COOKIE_NAME_ENCODE_SET`]'s complement | RFC 2616 section 2.2 |
//! | Value | cookie-octet: `0x21`, `0x23-0x2B`, `0x2D-0x3A`, `0x3C-0x5B`, `0x5D-0x7E` | RFC 6265 section 4.1.1 |
//!
//! Every other byte is percent-encoded. `%` is allowed in both sets, so running
//! an already-safe string through the encoder returns it unchanged.
//!
//! # Examples
//!
//! ```
//! use transfer_http::protocol::charset::{decode_set_cookie, encode_cookie_name, encode_cookie_value};
//!
//! assert_eq!(encode_cookie_name("session id"), "session%20id");
//! assert_eq!(encode_cookie_value("a;b"), "a%3Bb");
//! assert_eq!(
//!     decode_set_cookie("Set-Cookie: token=abc; Path=/"),
//!     Some(("token".to_string(), "abc".to_string()))
//! );
//! ```

use once_cell::sync::Lazy;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use regex::Regex;

/// Bytes that must be encoded in a cookie name (RFC 2616 separators and CTLs).
pub const COOKIE_NAME_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'(')
    .add(b')')
    .add(b',')
    .add(b'/')
    .add(b':')
    .add(b';')
    .add(b'<')
    .add(b'=')
    .add(b'>')
    .add(b'?')
    .add(b'@')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'{')
    .add(b'}');

/// Bytes that must be encoded in a cookie value (RFC 6265 non cookie-octets).
pub const COOKIE_VALUE_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b',')
    .add(b';')
    .add(b'\\');

static SET_COOKIE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?mi)^Set-Cookie:\s*([^=\r\n]+)=([^;\r\n]+)").expect("static set-cookie regex")
});

/// Percent-encode every byte of `raw` outside the cookie-name token set.
pub fn encode_cookie_name(raw: &str) -> String {
    utf8_percent_encode(raw, COOKIE_NAME_ENCODE_SET).to_string()
}

/// Percent-encode every byte of `raw` outside the cookie-octet set.
pub fn encode_cookie_value(raw: &str) -> String {
    utf8_percent_encode(raw, COOKIE_VALUE_ENCODE_SET).to_string()
}

/// Whether `name` only contains cookie-name characters.
pub fn is_safe_cookie_name(name: &str) -> bool {
    encode_cookie_name(name) == name
}

/// Whether `value` only contains cookie-octet characters.
pub fn is_safe_cookie_value(value: &str) -> bool {
    encode_cookie_value(value) == value
}

fn trim_cookie_part(part: &str) -> &str {
    part.trim_matches(|c: char| c.is_whitespace() || c.is_control())
}

/// Extract `(name, value)` from a `Set-Cookie: name=value; ...` line.
///
/// The value ends at the first `;` or at the end of the line. Lines that do
/// not match yield `None`.
pub fn decode_set_cookie(line: &str) -> Option<(String, String)> {
    SET_COOKIE.captures(line).and_then(|caps| cookie_from_captures(&caps))
}

/// Extract every `Set-Cookie` pair of a multi-line header text, in order.
pub fn scan_set_cookies(block: &str) -> Vec<(String, String)> {
    SET_COOKIE
        .captures_iter(block)
        .filter_map(|caps| cookie_from_captures(&caps))
        .collect()
}

fn cookie_from_captures(caps: &regex::Captures<'_>) -> Option<(String, String)> {
    let name = trim_cookie_part(caps.get(1)?.as_str());
    let value = trim_cookie_part(caps.get(2)?.as_str());
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.to_string()))
}

/// Serialize encoded cookies into a `Cookie` request header value.
pub fn format_cookie_header<'a, I>(cookies: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    cookies
        .into_iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("; ")
}
