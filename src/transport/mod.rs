//! Transfer engine abstraction.
//!
//! A [`Transport`] performs one wire exchange: it sends a [`WireRequest`],
//! streams every received header line and progress tick into a
//! [`TransferSink`], and returns a [`TransferReport`] describing the outcome.
//! The engine never fails with `Err`; transport problems are reported through
//! the curl-style [`TransferReport::transport_code`].
//!
//! # Implementations
//!
//! | Engine | Use |
//! |--------|-----|
//! | [`ReqwestTransport`] | Production engine built on `reqwest` |
//! | [`StaticTransport`] | Scripted in-memory engine for tests |
//!
//! # Transport Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | `0` | Transfer completed (any HTTP status) |
//! | `-1` | Request could not be prepared locally |
//! | `2` | Engine client could not be initialized |
//! | `3` | Malformed URL |
//! | `7` | Could not connect |
//! | `26` | Upload file could not be read |
//! | `28` | Operation timed out |
//! | `47` | Too many redirects |
//! | `56` | Failure receiving data |

mod engine;
mod scripted;

pub use engine::ReqwestTransport;
pub use scripted::{ScriptedExchange, StaticTransport};

use crate::client::RequestOptions;
use crate::protocol::form::WireBody;
use crate::protocol::headers::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Transport code: transfer completed.
pub const CODE_OK: i32 = 0;
/// Transport code: the engine client could not be initialized.
pub const CODE_FAILED_INIT: i32 = 2;
/// Transport code: the URL is malformed.
pub const CODE_URL_MALFORMAT: i32 = 3;
/// Transport code: a local file could not be read.
pub const CODE_READ_ERROR: i32 = 26;
/// Transport code: connecting failed.
pub const CODE_COULDNT_CONNECT: i32 = 7;
/// Transport code: the transfer timed out.
pub const CODE_OPERATION_TIMEDOUT: i32 = 28;
/// Transport code: the redirect limit was hit.
pub const CODE_TOO_MANY_REDIRECTS: i32 = 47;
/// Transport code: receiving data failed.
pub const CODE_RECV_ERROR: i32 = 56;

/// Transfer progress, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    /// Expected download size, when announced.
    pub download_total: Option<u64>,
    /// Bytes downloaded so far.
    pub downloaded: u64,
    /// Expected upload size, when known.
    pub upload_total: Option<u64>,
    /// Bytes uploaded so far.
    pub uploaded: u64,
}

/// Receiver of data streamed by the engine during a transfer.
pub trait TransferSink {
    /// Consume one raw header line, including its line terminator.
    ///
    /// Returns the number of bytes consumed.
    fn header_line(&mut self, line: &[u8]) -> usize;

    /// Observe transfer progress.
    fn progress(&mut self, _progress: Progress) {}
}

/// Introspection property of a finished transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Property {
    /// Final URL after redirects.
    EffectiveUrl,
    /// Wall time of the whole transfer.
    TotalTime,
    /// Number of redirects followed.
    RedirectCount,
}

/// Value of a [`Property`].
#[derive(Debug, Clone, PartialEq)]
pub enum InfoValue {
    /// Text value.
    Text(String),
    /// Duration value.
    Duration(Duration),
    /// Counter value.
    Count(u64),
}

impl InfoValue {
    /// The text, for text values.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            InfoValue::Text(text) => Some(text),
            _ => None,
        }
    }

    /// The duration, for duration values.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            InfoValue::Duration(duration) => Some(*duration),
            _ => None,
        }
    }
}

/// Per-transfer introspection handle.
pub trait TransferInfo: Send + Sync + fmt::Debug {
    /// Query one property; `None` when the engine does not know it.
    fn query(&self, property: Property) -> Option<InfoValue>;
}

/// Introspection data recorded by an engine while transferring.
#[derive(Debug, Default)]
pub struct RecordedInfo {
    /// Final URL after redirects.
    pub effective_url: Option<String>,
    /// Wall time of the transfer.
    pub total_time: Option<Duration>,
    /// Redirects followed.
    pub redirect_count: u64,
    queries: AtomicUsize,
}

impl RecordedInfo {
    /// Number of times [`TransferInfo::query`] was called.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl TransferInfo for RecordedInfo {
    fn query(&self, property: Property) -> Option<InfoValue> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        match property {
            Property::EffectiveUrl => self.effective_url.clone().map(InfoValue::Text),
            Property::TotalTime => self.total_time.map(InfoValue::Duration),
            Property::RedirectCount => Some(InfoValue::Count(self.redirect_count)),
        }
    }
}

/// A request in the form handed to the engine.
#[derive(Debug, Clone)]
pub struct WireRequest {
    /// Request method.
    pub method: http::Method,
    /// Absolute request URL including the query.
    pub url: String,
    /// Outgoing headers, including `Cookie`.
    pub headers: HeaderMap,
    /// Encoded body.
    pub body: WireBody,
    /// Effective options with every default applied.
    pub options: RequestOptions,
}

/// Outcome of one transfer as reported by the engine.
#[derive(Debug, Clone)]
pub struct TransferReport {
    /// Response body bytes.
    pub body: Bytes,
    /// Curl-style transport code, `0` on success.
    pub transport_code: i32,
    /// Human-readable transport error.
    pub transport_message: Option<String>,
    /// Numeric HTTP status of the final response, `0` when none was received.
    pub status_code: u16,
    /// Raw request header block the engine sent, when echo was requested.
    pub request_header_text: Option<String>,
    /// Introspection handle.
    pub info: Arc<dyn TransferInfo>,
}

impl TransferReport {
    /// A report for a transfer that failed before any response arrived.
    pub fn failed(code: i32, message: impl Into<String>, info: Arc<dyn TransferInfo>) -> Self {
        TransferReport {
            body: Bytes::new(),
            transport_code: code,
            transport_message: Some(message.into()),
            status_code: 0,
            request_header_text: None,
            info,
        }
    }

    /// A report for a request that could not be prepared for sending.
    pub fn local_failure(message: impl Into<String>) -> Self {
        Self::failed(
            crate::types::LOCAL_FAILURE,
            message,
            Arc::new(RecordedInfo::default()),
        )
    }
}

/// An engine able to perform HTTP transfers.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Perform one transfer, streaming header lines and progress into `sink`.
    async fn perform(
        &self,
        request: &WireRequest,
        sink: &mut (dyn TransferSink + Send),
    ) -> TransferReport;

    /// Options a request on this engine falls back to when it sets none itself.
    fn request_defaults(&self) -> RequestOptions {
        RequestOptions::default()
    }
}

/// Raw request header block as an engine would echo it.
pub(crate) fn request_header_text(
    method: &http::Method,
    headers: &HeaderMap,
    target: &url::Url,
) -> String {
    let mut path = target.path().to_string();
    if let Some(query) = target.query() {
        path.push('?');
        path.push_str(query);
    }
    let mut text = format!("{} {} HTTP/1.1\r\n", method, path);
    if let Some(host) = target.host_str() {
        match target.port() {
            Some(port) => text.push_str(&format!("Host: {}:{}\r\n", host, port)),
            None => text.push_str(&format!("Host: {}\r\n", host)),
        }
    }
    for line in headers.to_wire_lines() {
        text.push_str(&line);
        text.push_str("\r\n");
    }
    text.push_str("\r\n");
    text
}
