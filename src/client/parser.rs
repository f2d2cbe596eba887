//! Response parser for finished transfers.
//!
//! The engine streams raw header lines into a [`ResponseParser`] while the
//! transfer runs. Once the engine reports back, [`ResponseParser::finish`]
//! turns the accumulated text and the [`TransferReport`] into an [`Exchange`].
//!
//! # Parsing Flow
//!
//! 1. **Accumulate**: every header fragment is scanned for `Set-Cookie` and
//!    appended verbatim to the raw header buffer
//! 2. **Select**: the last header block starting with `HTTP/` is authoritative,
//!    earlier redirect and `100 Continue` blocks are skipped
//! 3. **Fold**: header lines are folded into a case-insensitive [`HeaderMap`]
//!    with the status line under `Status-Line`
//! 4. **Decode**: the body is decoded by content type
//! 5. **Classify**: transport and HTTP errors are recorded in an [`ErrorState`]
//!
//! # Examples
//!
//! ```
//! use transfer_http::client::ResponseParser;
//! use transfer_http::codec::Decoders;
//! use transfer_http::transport::{RecordedInfo, TransferReport};
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! let mut parser = ResponseParser::new();
//! parser.on_header_fragment(b"HTTP/1.1 404 Not Found\r\n");
//! parser.on_header_fragment(b"Content-Type: text/plain\r\n\r\n");
//!
//! let report = TransferReport {
//!     body: Bytes::from_static(b"missing"),
//!     transport_code: 0,
//!     transport_message: None,
//!     status_code: 404,
//!     request_header_text: None,
//!     info: Arc::new(RecordedInfo::default()),
//! };
//! let exchange = parser.finish(&report, &Decoders::default());
//! assert_eq!(exchange.error.error_code(), 404);
//! assert_eq!(exchange.error.error_message(), Some("HTTP/1.1 404 Not Found"));
//! ```

use crate::client::request::ProgressCallback;
use crate::codec::Decoders;
use crate::protocol::charset::scan_set_cookies;
use crate::protocol::headers::{
    authoritative_block, parse_header_block, split_header_blocks, status_code_from_line,
    CONTENT_TYPE, REQUEST_LINE, STATUS_LINE,
};
use crate::protocol::HeaderMap;
use crate::transport::{Progress, TransferReport, TransferSink};
use crate::types::{ErrorState, Exchange, Response};
use indexmap::IndexMap;
use std::fmt;

/// Accumulates the raw header stream of one transfer and builds the
/// classified [`Exchange`] once it finishes.
#[derive(Default)]
pub struct ResponseParser {
    /// Raw header text exactly as received
    raw_headers: String,
    /// Cookies seen in any header block, in arrival order
    cookies: IndexMap<String, String>,
    /// Forwarded progress ticks
    progress: Option<ProgressCallback>,
}

impl fmt::Debug for ResponseParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseParser")
            .field("raw_headers", &self.raw_headers)
            .field("cookies", &self.cookies)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl ResponseParser {
    /// Create an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a parser that forwards progress ticks to `progress`.
    pub fn with_progress(progress: Option<ProgressCallback>) -> Self {
        ResponseParser {
            progress,
            ..Self::default()
        }
    }

    /// Consume one header fragment and return its length.
    pub fn on_header_fragment(&mut self, fragment: &[u8]) -> usize {
        let text = String::from_utf8_lossy(fragment);
        for (name, value) in scan_set_cookies(&text) {
            self.cookies.insert(name, value);
        }
        self.raw_headers.push_str(&text);
        fragment.len()
    }

    /// Raw header text accumulated so far.
    pub fn raw_headers(&self) -> &str {
        &self.raw_headers
    }

    /// Build the exchange result from the accumulated headers and the report.
    pub fn finish(&self, report: &TransferReport, decoders: &Decoders) -> Exchange {
        let headers = parse_header_block(authoritative_block(&self.raw_headers), STATUS_LINE);
        let status_line = headers.get(STATUS_LINE).unwrap_or_default().to_string();

        let status_code = match report.status_code {
            0 => status_code_from_line(&status_line).unwrap_or(0),
            code => code,
        };

        let request_headers = report
            .request_header_text
            .as_deref()
            .map(parse_request_headers);

        let body = decoders.decode(headers.get(CONTENT_TYPE), &report.body);
        let error = ErrorState::classify(
            report.transport_code,
            report.transport_message.clone(),
            status_code,
            &status_line,
        );

        Exchange {
            response: Response {
                status_code,
                headers,
                cookies: self.cookies.clone(),
                raw_body: report.body.clone(),
                body,
            },
            error,
            request_headers,
        }
    }
}

/// Parse an echoed request header block, `Request-Line` first.
fn parse_request_headers(text: &str) -> HeaderMap {
    let block = split_header_blocks(text).pop().unwrap_or("");
    parse_header_block(block, REQUEST_LINE)
}

impl TransferSink for ResponseParser {
    fn header_line(&mut self, line: &[u8]) -> usize {
        self.on_header_fragment(line)
    }

    fn progress(&mut self, progress: Progress) {
        if let Some(callback) = &self.progress {
            callback(progress);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Decoded;
    use crate::transport::RecordedInfo;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn report(status_code: u16, body: &'static [u8]) -> TransferReport {
        TransferReport {
            body: Bytes::from_static(body),
            transport_code: 0,
            transport_message: None,
            status_code,
            request_header_text: None,
            info: Arc::new(RecordedInfo::default()),
        }
    }

    fn feed(parser: &mut ResponseParser, raw: &str) {
        for line in raw.split_inclusive('\n') {
            assert_eq!(parser.on_header_fragment(line.as_bytes()), line.len());
        }
    }

    #[test]
    fn test_redirect_chain_uses_final_block() {
        let mut parser = ResponseParser::new();
        feed(
            &mut parser,
            "HTTP/1.1 301 Moved Permanently\r\nLocation: /a\r\nSet-Cookie: hop=1\r\n\r\n\
             HTTP/1.1 302 Found\r\nLocation: /b\r\n\r\n\
             HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nSet-Cookie: session=abc; Path=/\r\n\r\n",
        );
        let exchange = parser.finish(&report(200, b"{\"ok\":true}"), &Decoders::default());

        assert_eq!(exchange.response.status_line(), "HTTP/1.1 200 OK");
        assert_eq!(exchange.response.header("location"), None);
        assert_eq!(exchange.response.cookie("session"), Some("abc"));
        assert_eq!(exchange.response.cookie("hop"), Some("1"));
        assert_eq!(exchange.response.body().as_json().unwrap()["ok"], true);
        assert!(!exchange.error.is_error());
    }

    #[test]
    fn test_http_error_classified() {
        let mut parser = ResponseParser::new();
        feed(&mut parser, "HTTP/1.1 404 Not Found\r\nContent-Type: text/html\r\n\r\n");
        let exchange = parser.finish(&report(404, b"<h1>nope</h1>"), &Decoders::default());

        assert!(exchange.error.http_error);
        assert!(!exchange.error.transport_error);
        assert_eq!(exchange.error.error_code(), 404);
        assert_eq!(exchange.error.error_message(), Some("HTTP/1.1 404 Not Found"));
        assert!(exchange.response.body().is_raw());
    }

    #[test]
    fn test_transport_failure_without_headers() {
        let parser = ResponseParser::new();
        let failed = TransferReport::failed(7, "connection refused", Arc::new(RecordedInfo::default()));
        let exchange = parser.finish(&failed, &Decoders::default());

        assert_eq!(exchange.response.status_line(), "");
        assert!(exchange.error.transport_error);
        assert_eq!(exchange.error.error_code(), 7);
        assert_eq!(exchange.error.error_message(), Some("connection refused"));
    }

    #[test]
    fn test_status_code_from_line_when_unreported() {
        let mut parser = ResponseParser::new();
        feed(&mut parser, "HTTP/1.1 503 Service Unavailable\r\n\r\n");
        let exchange = parser.finish(&report(0, b""), &Decoders::default());
        assert_eq!(exchange.response.status_code(), 503);
        assert!(exchange.error.http_error);
    }

    #[test]
    fn test_request_echo_parsed() {
        let parser = ResponseParser::new();
        let mut echoed = report(200, b"");
        echoed.request_header_text =
            Some("GET /x?y=1 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n".into());
        let exchange = parser.finish(&echoed, &Decoders::default());

        let request_headers = exchange.request_headers.unwrap();
        assert_eq!(request_headers.get(REQUEST_LINE), Some("GET /x?y=1 HTTP/1.1"));
        assert_eq!(request_headers.get("host"), Some("example.com"));
    }

    #[test]
    fn test_repeated_headers_joined() {
        let mut parser = ResponseParser::new();
        feed(&mut parser, "HTTP/1.1 200 OK\r\nVary: Accept\r\nvary: Origin\r\n\r\n");
        let exchange = parser.finish(&report(200, b""), &Decoders::default());
        assert_eq!(exchange.response.header("VARY"), Some("Accept,Origin"));
        assert_eq!(exchange.response.body(), &Decoded::Raw(Bytes::new()));
    }

    #[test]
    fn test_progress_forwarded() {
        let seen = Arc::new(AtomicU64::new(0));
        let observer = seen.clone();
        let mut parser = ResponseParser::with_progress(Some(Arc::new(move |p: Progress| {
            observer.store(p.downloaded, Ordering::SeqCst);
        })));
        parser.progress(Progress {
            downloaded: 42,
            ..Default::default()
        });
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }
}
