//! Content-type driven response body decoding.
//!
//! A response's `Content-Type` is matched against an ordered table of
//! patterns; the first match picks the decoder slot:
//!
//! | Order | Kind | Pattern (case-insensitive) | Built-in decoder |
//! |-------|------|----------------------------|------------------|
//! | 1 | JSON | `^(?:application\|text)/(?:[a-z]+(?:[.-][0-9a-z]+)*[+.]\|x-)?json(?:-[a-z]+)?` | `serde_json` |
//! | 2 | XML | `^(?:text/\|application/(?:atom\+\|rss\+)?)xml` | [`xml::parse_xml`] |
//! | - | other | anything else | none (raw body) |
//!
//! Decoders are plain `Arc<dyn Fn>` values and can be replaced per request or
//! per dispatcher. A decoder returning `None` leaves the raw body in place.
//!
//! # Examples
//!
//! ```
//! use transfer_http::codec::{ContentKind, Decoders};
//! use bytes::Bytes;
//!
//! assert_eq!(ContentKind::classify(Some("application/vnd.api+json")), ContentKind::Json);
//! assert_eq!(ContentKind::classify(Some("application/atom+xml")), ContentKind::Xml);
//!
//! let decoded = Decoders::default().decode(Some("application/json"), &Bytes::from_static(b"{\"a\":1}"));
//! assert_eq!(decoded.as_json().unwrap()["a"], 1);
//! ```

pub mod xml;

use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

pub use xml::{parse_xml, XmlElement, XmlError, XmlNode};

/// Pattern for the JSON family of content types.
pub const JSON_PATTERN: &str =
    r"(?i)^(?:application|text)/(?:[a-z]+(?:[.-][0-9a-z]+)*[+.]|x-)?json(?:-[a-z]+)?";

/// Pattern for the XML family of content types.
pub const XML_PATTERN: &str = r"(?i)^(?:text/|application/(?:atom\+|rss\+)?)xml";

static CONTENT_PATTERNS: Lazy<Vec<(ContentKind, Regex)>> = Lazy::new(|| {
    vec![
        (ContentKind::Json, Regex::new(JSON_PATTERN).expect("static json pattern")),
        (ContentKind::Xml, Regex::new(XML_PATTERN).expect("static xml pattern")),
    ]
});

/// Family a content type belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// JSON and JSON-derived media types.
    Json,
    /// XML, Atom and RSS.
    Xml,
    /// Anything else, including a missing content type.
    Other,
}

impl ContentKind {
    /// Match a content type against the pattern table in order.
    pub fn classify(content_type: Option<&str>) -> Self {
        let Some(content_type) = content_type else {
            return ContentKind::Other;
        };
        let content_type = content_type.trim();
        CONTENT_PATTERNS
            .iter()
            .find(|(_, pattern)| pattern.is_match(content_type))
            .map(|(kind, _)| *kind)
            .unwrap_or(ContentKind::Other)
    }
}

/// Whether `content_type` belongs to the JSON family.
pub fn is_json(content_type: Option<&str>) -> bool {
    ContentKind::classify(content_type) == ContentKind::Json
}

/// A decoded response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Body left as received.
    Raw(Bytes),
    /// Body decoded as text.
    Text(String),
    /// Body decoded as JSON.
    Json(Value),
    /// Body decoded as an XML element tree.
    Xml(XmlElement),
}

impl Decoded {
    /// The JSON value, if the body was decoded as JSON.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Decoded::Json(value) => Some(value),
            _ => None,
        }
    }

    /// The XML root element, if the body was decoded as XML.
    pub fn as_xml(&self) -> Option<&XmlElement> {
        match self {
            Decoded::Xml(element) => Some(element),
            _ => None,
        }
    }

    /// The text, if the body was decoded as text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Decoded::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Whether no decoder produced a value.
    pub fn is_raw(&self) -> bool {
        matches!(self, Decoded::Raw(_))
    }
}

/// A replaceable body decoder. `None` signals a decode failure.
pub type Decoder = Arc<dyn Fn(&[u8]) -> Option<Decoded> + Send + Sync>;

/// Built-in JSON decoder.
pub fn json_decoder() -> Decoder {
    Arc::new(|raw: &[u8]| serde_json::from_slice::<Value>(raw).ok().map(Decoded::Json))
}

/// Built-in XML decoder.
pub fn xml_decoder() -> Decoder {
    Arc::new(|raw: &[u8]| {
        let text = std::str::from_utf8(raw).ok()?;
        parse_xml(text).ok().map(Decoded::Xml)
    })
}

/// UTF-8 text decoder, handy for the default slot.
pub fn text_decoder() -> Decoder {
    Arc::new(|raw: &[u8]| String::from_utf8(raw.to_vec()).ok().map(Decoded::Text))
}

/// Decoder slots of a request or dispatcher.
///
/// Empty JSON and XML slots fall back to the built-in decoders at decode time;
/// an empty default slot keeps non-matching bodies raw.
#[derive(Clone, Default)]
pub struct Decoders {
    /// Decoder for the JSON family.
    pub json: Option<Decoder>,
    /// Decoder for the XML family.
    pub xml: Option<Decoder>,
    /// Decoder for every other content type.
    pub default: Option<Decoder>,
}

impl fmt::Debug for Decoders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decoders")
            .field("json", &self.json.is_some())
            .field("xml", &self.xml.is_some())
            .field("default", &self.default.is_some())
            .finish()
    }
}

impl Decoders {
    /// Fill empty slots from `other`, keeping slots that are already set.
    pub fn fill_missing(&mut self, other: &Decoders) {
        if self.json.is_none() {
            self.json = other.json.clone();
        }
        if self.xml.is_none() {
            self.xml = other.xml.clone();
        }
        if self.default.is_none() {
            self.default = other.default.clone();
        }
    }

    /// Decoder selected for `content_type`.
    pub fn select(&self, content_type: Option<&str>) -> Option<Decoder> {
        match ContentKind::classify(content_type) {
            ContentKind::Json => Some(self.json.clone().unwrap_or_else(json_decoder)),
            ContentKind::Xml => Some(self.xml.clone().unwrap_or_else(xml_decoder)),
            ContentKind::Other => self.default.clone(),
        }
    }

    /// Decode `raw`, falling back to [`Decoded::Raw`] when no decoder applies
    /// or the decoder fails.
    pub fn decode(&self, content_type: Option<&str>, raw: &Bytes) -> Decoded {
        let Some(decoder) = self.select(content_type) else {
            return Decoded::Raw(raw.clone());
        };
        match decoder(raw.as_ref()) {
            Some(decoded) => decoded,
            None => {
                tracing::debug!(
                    content_type = content_type.unwrap_or(""),
                    "body decoder failed, keeping raw body"
                );
                Decoded::Raw(raw.clone())
            }
        }
    }
}
