//! Request payload model and body encoding.
//!
//! # Encoding Rules
//!
//! [`encode_body`] picks exactly one branch, in this order:
//!
//! 1. **JSON** - the request `Content-Type` is in the JSON family and the
//!    payload is a map or list: serialized with `serde_json`.
//! 2. **Bracket form** - the payload holds a non-empty nested container:
//!    `a[b]=1&a[c]=2`, `a[]=1&a[]=2`, and `a=` for an empty container.
//! 3. **Flat form** - `application/x-www-form-urlencoded`, unless a file
//!    reference (an explicit [`Field::File`] or an `@/existing/path` string)
//!    forces multipart transmission.
//!
//! # Examples
//!
//! ```
//! use transfer_http::protocol::form::{encode_body, Body, Field, WireBody};
//! use transfer_http::protocol::headers::HeaderMap;
//!
//! let payload = Field::map([("a", Field::map([("b", 1), ("c", 2)]))]);
//! let encoded = encode_body(&Body::Fields(payload), &HeaderMap::new()).unwrap();
//! assert_eq!(encoded.body, WireBody::from("a[b]=1&a[c]=2"));
//! ```

use crate::codec;
use crate::error::Result;
use crate::protocol::headers::{HeaderMap, CONTENT_TYPE};
use bytes::Bytes;
use indexmap::IndexMap;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use url::form_urlencoded;

/// RFC 3986 unreserved characters stay verbatim, everything else is encoded.
const RAW_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// A file to upload as one multipart part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    /// Path of the file on disk.
    pub path: PathBuf,
    /// MIME type announced for the part.
    pub mime: Option<String>,
    /// File name announced for the part, defaults to the path's file name.
    pub filename: Option<String>,
}

impl FileRef {
    /// Reference the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileRef {
            path: path.into(),
            mime: None,
            filename: None,
        }
    }

    /// Set the announced MIME type.
    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    /// Set the announced file name.
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Name announced for the part.
    pub fn display_name(&self) -> String {
        self.filename.clone().unwrap_or_else(|| {
            self.path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
    }
}

/// A structured payload value.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    /// Absent value; skipped by form encodings.
    Null,
    /// Boolean, form-encoded as `1` / `0`.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Text.
    Text(String),
    /// File upload reference.
    File(FileRef),
    /// Sequence.
    List(Vec<Field>),
    /// String-keyed map, insertion ordered.
    Map(IndexMap<String, Field>),
}

impl Field {
    /// Build a [`Field::Map`] from key/value pairs.
    pub fn map<K, V, I>(entries: I) -> Field
    where
        K: Into<String>,
        V: Into<Field>,
        I: IntoIterator<Item = (K, V)>,
    {
        Field::Map(
            entries
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }

    /// Build a [`Field::List`].
    pub fn list<V, I>(items: I) -> Field
    where
        V: Into<Field>,
        I: IntoIterator<Item = V>,
    {
        Field::List(items.into_iter().map(Into::into).collect())
    }

    /// Whether this is a map or list.
    pub fn is_container(&self) -> bool {
        matches!(self, Field::List(_) | Field::Map(_))
    }

    fn is_empty_container(&self) -> bool {
        match self {
            Field::List(items) => items.is_empty(),
            Field::Map(entries) => entries.is_empty(),
            _ => false,
        }
    }

    /// Text form of a scalar, `None` for null and containers.
    pub fn scalar_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Field::Bool(true) => Some(Cow::Borrowed("1")),
            Field::Bool(false) => Some(Cow::Borrowed("0")),
            Field::Int(value) => Some(Cow::Owned(value.to_string())),
            Field::Float(value) => Some(Cow::Owned(value.to_string())),
            Field::Text(text) => Some(Cow::Borrowed(text)),
            Field::File(file) => Some(file.path.to_string_lossy()),
            Field::Null | Field::List(_) | Field::Map(_) => None,
        }
    }

    /// Entries of a container with list indices as keys.
    fn entries(&self) -> Vec<(Cow<'_, str>, &Field)> {
        match self {
            Field::Map(entries) => entries
                .iter()
                .map(|(key, value)| (Cow::Borrowed(key.as_str()), value))
                .collect(),
            Field::List(items) => items
                .iter()
                .enumerate()
                .map(|(index, value)| (Cow::Owned(index.to_string()), value))
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl Serialize for Field {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Field::Null => serializer.serialize_unit(),
            Field::Bool(value) => serializer.serialize_bool(*value),
            Field::Int(value) => serializer.serialize_i64(*value),
            Field::Float(value) => serializer.serialize_f64(*value),
            Field::Text(text) => serializer.serialize_str(text),
            Field::File(file) => serializer.serialize_str(&file.path.to_string_lossy()),
            Field::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Field::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

impl From<&str> for Field {
    fn from(value: &str) -> Self {
        Field::Text(value.to_string())
    }
}

impl From<String> for Field {
    fn from(value: String) -> Self {
        Field::Text(value)
    }
}

impl From<bool> for Field {
    fn from(value: bool) -> Self {
        Field::Bool(value)
    }
}

impl From<i32> for Field {
    fn from(value: i32) -> Self {
        Field::Int(value.into())
    }
}

impl From<i64> for Field {
    fn from(value: i64) -> Self {
        Field::Int(value)
    }
}

impl From<u32> for Field {
    fn from(value: u32) -> Self {
        Field::Int(value.into())
    }
}

impl From<f64> for Field {
    fn from(value: f64) -> Self {
        Field::Float(value)
    }
}

impl From<FileRef> for Field {
    fn from(value: FileRef) -> Self {
        Field::File(value)
    }
}

impl<V: Into<Field>> From<Vec<V>> for Field {
    fn from(items: Vec<V>) -> Self {
        Field::list(items)
    }
}

impl From<serde_json::Value> for Field {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Field::Null,
            Value::Bool(value) => Field::Bool(value),
            Value::Number(number) => match number.as_i64() {
                Some(int) => Field::Int(int),
                None => Field::Float(number.as_f64().unwrap_or_default()),
            },
            Value::String(text) => Field::Text(text),
            Value::Array(items) => Field::list(items),
            Value::Object(entries) => Field::map(entries),
        }
    }
}

/// Request body before encoding.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Body {
    /// No body.
    #[default]
    Empty,
    /// Bytes sent verbatim.
    Raw(Bytes),
    /// Structured payload encoded by [`encode_body`].
    Fields(Field),
}

impl From<&str> for Body {
    fn from(value: &str) -> Self {
        Body::Raw(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Body::Raw(Bytes::from(value))
    }
}

impl From<Bytes> for Body {
    fn from(value: Bytes) -> Self {
        Body::Raw(value)
    }
}

impl From<Field> for Body {
    fn from(value: Field) -> Self {
        Body::Fields(value)
    }
}

/// One part of a multipart body.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    /// Plain form value.
    Text(String),
    /// File upload.
    File(FileRef),
}

/// Body in the form handed to the transfer engine.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum WireBody {
    /// No body.
    #[default]
    Empty,
    /// Bytes sent as-is.
    Bytes(Bytes),
    /// Multipart form holding at least one file part.
    Multipart(IndexMap<String, Part>),
}

impl WireBody {
    /// Length in bytes when known before sending.
    pub fn len(&self) -> Option<usize> {
        match self {
            WireBody::Empty => Some(0),
            WireBody::Bytes(bytes) => Some(bytes.len()),
            WireBody::Multipart(_) => None,
        }
    }

    /// Whether there is nothing to send.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Whether the body must be sent as multipart.
    pub fn is_multipart(&self) -> bool {
        matches!(self, WireBody::Multipart(_))
    }
}

impl From<&str> for WireBody {
    fn from(value: &str) -> Self {
        WireBody::Bytes(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for WireBody {
    fn from(value: String) -> Self {
        WireBody::Bytes(Bytes::from(value))
    }
}

/// Result of [`encode_body`].
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedBody {
    /// Body to transmit.
    pub body: WireBody,
    /// The engine computes the length itself, so `Content-Length` must not be sent.
    pub drop_content_length: bool,
}

impl EncodedBody {
    fn plain(body: WireBody) -> Self {
        EncodedBody {
            body,
            drop_content_length: false,
        }
    }
}

/// Encode a request body according to the request headers.
pub fn encode_body(body: &Body, headers: &HeaderMap) -> Result<EncodedBody> {
    let field = match body {
        Body::Empty => return Ok(EncodedBody::plain(WireBody::Empty)),
        Body::Raw(bytes) => return Ok(EncodedBody::plain(WireBody::Bytes(bytes.clone()))),
        Body::Fields(field) => field,
    };

    if !field.is_container() {
        let text = field.scalar_text().unwrap_or_default();
        return Ok(EncodedBody::plain(WireBody::from(text.into_owned())));
    }

    if codec::is_json(headers.get(CONTENT_TYPE)) {
        let json = serde_json::to_vec(field)?;
        return Ok(EncodedBody::plain(WireBody::Bytes(Bytes::from(json))));
    }

    if is_nested(field) {
        return Ok(EncodedBody::plain(WireBody::from(build_nested_query(field))));
    }

    Ok(encode_flat(field))
}

/// Encode a query string for `field` (never multipart).
pub fn encode_query(field: &Field) -> String {
    if !field.is_container() {
        return field
            .scalar_text()
            .map(|text| form_urlencoded::byte_serialize(text.as_bytes()).collect())
            .unwrap_or_default();
    }
    if is_nested(field) {
        return build_nested_query(field);
    }
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in field.entries() {
        if value.is_empty_container() {
            serializer.append_pair(&key, "");
        } else if let Some(text) = value.scalar_text() {
            serializer.append_pair(&key, &text);
        }
    }
    serializer.finish()
}

/// Whether any value of a container is itself a non-empty container.
pub fn is_nested(field: &Field) -> bool {
    field
        .entries()
        .iter()
        .any(|(_, value)| value.is_container() && !value.is_empty_container())
}

/// Bracket-encode a container: `a[b]=1&a[c]=2`, `a[]=1&a[]=2`, `a=`.
pub fn build_nested_query(field: &Field) -> String {
    let mut pairs = Vec::new();
    push_nested(&mut pairs, field, None);
    pairs.join("&")
}

fn push_nested(pairs: &mut Vec<String>, field: &Field, parent: Option<&str>) {
    let entries = field.entries();
    if entries.is_empty() {
        pairs.push(format!("{}=", parent.unwrap_or_default()));
        return;
    }

    let keyed = matches!(field, Field::Map(_));
    for (key, value) in entries {
        let key = form_key(&key);
        if value.is_container() {
            let nested = match parent {
                Some(parent) => format!("{}[{}]", parent, key),
                None => key,
            };
            push_nested(pairs, value, Some(&nested));
        } else if let Some(text) = value.scalar_text() {
            let name = match parent {
                None => key,
                Some(parent) if keyed => format!("{}[{}]", parent, key),
                Some(parent) => format!("{}[]", parent),
            };
            pairs.push(format!("{}={}", name, encode_scalar(value, &text)));
        }
    }
}

fn form_key(key: &str) -> String {
    form_urlencoded::byte_serialize(key.as_bytes()).collect()
}

fn encode_scalar(field: &Field, text: &str) -> String {
    match field {
        Field::Text(_) | Field::File(_) => utf8_percent_encode(text, RAW_ENCODE_SET).to_string(),
        _ => form_urlencoded::byte_serialize(text.as_bytes()).collect(),
    }
}

fn upload_path(text: &str) -> Option<&Path> {
    let path = Path::new(text.strip_prefix('@')?);
    path.is_file().then_some(path)
}

fn encode_flat(field: &Field) -> EncodedBody {
    let mut parts: IndexMap<String, Part> = IndexMap::new();
    let mut multipart = false;

    for (key, value) in field.entries() {
        let part = match value {
            Field::Null => continue,
            Field::File(file) => {
                multipart = true;
                Part::File(file.clone())
            }
            Field::Text(text) => match upload_path(text) {
                Some(path) => {
                    multipart = true;
                    Part::File(FileRef::new(path))
                }
                None => Part::Text(text.clone()),
            },
            // only empty containers reach the flat branch
            Field::List(_) | Field::Map(_) => Part::Text(String::new()),
            scalar => Part::Text(scalar.scalar_text().unwrap_or_default().into_owned()),
        };
        parts.insert(key.into_owned(), part);
    }

    if multipart {
        return EncodedBody {
            body: WireBody::Multipart(parts),
            drop_content_length: true,
        };
    }

    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, part) in &parts {
        if let Part::Text(text) = part {
            serializer.append_pair(key, text);
        }
    }
    EncodedBody::plain(WireBody::from(serializer.finish()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn encode(field: Field) -> EncodedBody {
        encode_body(&Body::Fields(field), &HeaderMap::new()).unwrap()
    }

    fn json_headers() -> HeaderMap {
        [(CONTENT_TYPE, "application/json; charset=utf-8")].into_iter().collect()
    }

    #[test]
    fn test_nested_map() {
        let encoded = encode(Field::map([("a", Field::map([("b", 1), ("c", 2)]))]));
        assert_eq!(encoded.body, WireBody::from("a[b]=1&a[c]=2"));
        assert!(!encoded.drop_content_length);
    }

    #[test]
    fn test_nested_list_omits_indices() {
        let encoded = encode(Field::map([("a", Field::list([1, 2]))]));
        assert_eq!(encoded.body, WireBody::from("a[]=1&a[]=2"));
    }

    #[test]
    fn test_empty_array_flat() {
        let encoded = encode(Field::map([("a", Field::List(vec![]))]));
        assert_eq!(encoded.body, WireBody::from("a="));
    }

    #[test]
    fn test_nested_empty_array() {
        let payload = Field::map([
            ("a", Field::map([("b", Field::List(vec![])), ("c", Field::from("x"))])),
            ("d", Field::List(vec![])),
        ]);
        assert_eq!(encode(payload).body, WireBody::from("a[b]=&a[c]=x&d="));
    }

    #[test]
    fn test_nested_values_use_raw_encoding() {
        let payload = Field::map([("q", Field::map([("term", "a b&c"), ("n", "1+1")]))]);
        assert_eq!(encode(payload).body, WireBody::from("q[term]=a%20b%26c&q[n]=1%2B1"));
    }

    #[test]
    fn test_deep_nesting_and_list_of_maps() {
        let payload = Field::map([(
            "users",
            Field::list([Field::map([("name", "ann")]), Field::map([("name", "bo")])]),
        )]);
        assert_eq!(
            encode(payload).body,
            WireBody::from("users[0][name]=ann&users[1][name]=bo")
        );
    }

    #[test]
    fn test_nested_skips_null_and_renders_bools() {
        let payload = Field::map([
            ("f", Field::map([("on", Field::Bool(true)), ("off", Field::Bool(false))])),
            ("n", Field::Null),
        ]);
        assert_eq!(encode(payload).body, WireBody::from("f[on]=1&f[off]=0"));
    }

    #[test]
    fn test_flat_form() {
        let encoded = encode(Field::map([("name", "John Doe"), ("x", "a&b=c")]));
        assert_eq!(encoded.body, WireBody::from("name=John+Doe&x=a%26b%3Dc"));
    }

    #[test]
    fn test_json_content_type() {
        let payload = Field::map([("a", Field::map([("b", 1)])), ("c", Field::from("d"))]);
        let encoded = encode_body(&Body::Fields(payload), &json_headers()).unwrap();
        assert_eq!(encoded.body, WireBody::from(r#"{"a":{"b":1},"c":"d"}"#));
    }

    #[test]
    fn test_json_content_type_raw_passthrough() {
        let encoded = encode_body(&Body::from("{\"raw\":true}"), &json_headers()).unwrap();
        assert_eq!(encoded.body, WireBody::from("{\"raw\":true}"));
    }

    #[test]
    fn test_scalar_payload_sent_as_text() {
        assert_eq!(encode(Field::from("plain text")).body, WireBody::from("plain text"));
        assert_eq!(encode(Field::from(42)).body, WireBody::from("42"));
    }

    #[test]
    fn test_at_prefixed_existing_file_forces_multipart() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"content").unwrap();
        let reference = format!("@{}", file.path().display());

        let encoded = encode(Field::map([("upload", reference.as_str()), ("title", "t")]));
        assert!(encoded.drop_content_length);
        match encoded.body {
            WireBody::Multipart(parts) => {
                assert_eq!(parts["upload"], Part::File(FileRef::new(file.path())));
                assert_eq!(parts["title"], Part::Text("t".to_string()));
            }
            other => panic!("expected multipart, got {:?}", other),
        }
    }

    #[test]
    fn test_at_prefixed_missing_file_is_text() {
        let encoded = encode(Field::map([("handle", "@not/a/real/file.txt")]));
        assert_eq!(encoded.body, WireBody::from("handle=%40not%2Fa%2Freal%2Ffile.txt"));
        assert!(!encoded.drop_content_length);
    }

    #[test]
    fn test_explicit_file_forces_multipart() {
        let file = FileRef::new("/tmp/does-not-need-to-exist.png").with_mime("image/png");
        let encoded = encode(Field::map([("img", Field::File(file))]));
        assert!(encoded.body.is_multipart());
        assert_eq!(encoded.body.len(), None);
        assert!(encoded.drop_content_length);
    }

    #[test]
    fn test_empty_body() {
        let encoded = encode_body(&Body::Empty, &HeaderMap::new()).unwrap();
        assert!(encoded.body.is_empty());
    }

    #[test]
    fn test_encode_query() {
        let query = Field::map([("page", Field::from(2)), ("q", Field::from("a b"))]);
        assert_eq!(encode_query(&query), "page=2&q=a+b");
        assert_eq!(
            encode_query(&Field::map([("ids", Field::list([1, 2]))])),
            "ids[]=1&ids[]=2"
        );
        assert_eq!(encode_query(&Field::map(Vec::<(String, Field)>::new())), "");
    }

    #[test]
    fn test_field_from_json_value() {
        let field = Field::from(serde_json::json!({"a": [1, 2.5, null, "x"]}));
        assert_eq!(
            field,
            Field::map([(
                "a",
                Field::List(vec![
                    Field::Int(1),
                    Field::Float(2.5),
                    Field::Null,
                    Field::Text("x".into())
                ])
            )])
        );
    }
}
