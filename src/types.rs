//! Core exchange types: lifecycle state, classified errors and parsed responses.

use crate::codec::Decoded;
use crate::protocol::headers::{HeaderMap, STATUS_LINE};
use bytes::Bytes;
use indexmap::IndexMap;
use std::borrow::Cow;

/// Final outcome of a completed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No transport error and a non-4xx/5xx status.
    Success,
    /// Transport failure or 4xx/5xx status.
    Error,
}

/// Lifecycle of one exchange.
///
/// `Idle -> Configured -> Sent -> Completed(..)`. Reconfiguring a completed
/// request starts a new exchange and moves it back to `Configured`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Freshly created, nothing set yet.
    Idle,
    /// URL, headers or body have been set.
    Configured,
    /// Handed to the transfer engine.
    Sent,
    /// The engine returned and the result was classified.
    Completed(Outcome),
}

impl LifecycleState {
    /// Whether the exchange has finished.
    pub fn is_completed(&self) -> bool {
        matches!(self, LifecycleState::Completed(_))
    }

    pub(crate) fn allows(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Idle, Configured)
                | (Configured, Configured)
                | (Configured, Sent)
                | (Sent, Completed(_))
                | (Completed(_), Configured)
        )
    }
}

/// Transport code used when a request could not even be prepared for sending.
pub const LOCAL_FAILURE: i32 = -1;

/// Transport and HTTP error classification of one exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorState {
    /// The engine reported a non-zero transport code.
    pub transport_error: bool,
    /// Engine-specific transport code, `0` when the transfer completed.
    pub transport_code: i32,
    /// Engine-specific transport message.
    pub transport_message: Option<String>,
    /// The status code is in the 4xx or 5xx class.
    pub http_error: bool,
    /// Numeric HTTP status code reported by the engine.
    pub http_status_code: u16,
    /// Status line of the authoritative response block, set on HTTP errors.
    pub http_status_message: Option<String>,
}

impl ErrorState {
    /// Classify an exchange from the engine's transport result and the parsed status line.
    pub fn classify(
        transport_code: i32,
        transport_message: Option<String>,
        status_code: u16,
        status_line: &str,
    ) -> Self {
        let transport_error = transport_code != 0;
        let http_error = matches!(status_code / 100, 4 | 5);

        ErrorState {
            transport_error,
            transport_code,
            transport_message: if transport_error { transport_message } else { None },
            http_error,
            http_status_code: status_code,
            http_status_message: http_error.then(|| status_line.to_string()),
        }
    }

    /// Either a transport or an HTTP error occurred.
    pub fn is_error(&self) -> bool {
        self.transport_error || self.http_error
    }

    /// Transport code if the transport failed, else the HTTP status, else `0`.
    pub fn error_code(&self) -> i32 {
        if self.transport_error {
            self.transport_code
        } else if self.http_error {
            i32::from(self.http_status_code)
        } else {
            0
        }
    }

    /// Transport message if the transport failed, else the status line.
    pub fn error_message(&self) -> Option<&str> {
        if self.transport_error {
            self.transport_message.as_deref()
        } else if self.http_error {
            self.http_status_message.as_deref()
        } else {
            None
        }
    }

    pub(crate) fn outcome(&self) -> Outcome {
        if self.is_error() {
            Outcome::Error
        } else {
            Outcome::Success
        }
    }
}

/// A parsed and decoded HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub(crate) status_code: u16,
    pub(crate) headers: HeaderMap,
    pub(crate) cookies: IndexMap<String, String>,
    pub(crate) raw_body: Bytes,
    pub(crate) body: Decoded,
}

impl Response {
    /// Numeric status code reported by the engine.
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// Status line of the authoritative header block, empty if none was seen.
    pub fn status_line(&self) -> &str {
        self.headers.get(STATUS_LINE).unwrap_or_default()
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// All headers, `Status-Line` first.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Cookie set by the server through `Set-Cookie`.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// All cookies set by the server, in the order received.
    pub fn cookies(&self) -> &IndexMap<String, String> {
        &self.cookies
    }

    /// Body bytes exactly as received.
    pub fn raw_body(&self) -> &Bytes {
        &self.raw_body
    }

    /// Body after content-type driven decoding.
    pub fn body(&self) -> &Decoded {
        &self.body
    }

    /// Body as text, replacing invalid UTF-8.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.raw_body)
    }
}

/// Everything produced by one completed exchange.
#[derive(Debug, Clone)]
pub struct Exchange {
    /// Parsed response.
    pub response: Response,
    /// Error classification.
    pub error: ErrorState,
    /// Echoed request headers, when the engine was asked to echo them.
    pub request_headers: Option<HeaderMap>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_404_classification() {
        let state = ErrorState::classify(0, None, 404, "HTTP/1.1 404 Not Found");
        assert!(state.is_error());
        assert!(state.http_error);
        assert!(!state.transport_error);
        assert_eq!(state.error_code(), 404);
        assert_eq!(state.error_message(), Some("HTTP/1.1 404 Not Found"));
    }

    #[test]
    fn test_transport_takes_precedence() {
        let state = ErrorState::classify(
            28,
            Some("operation timed out".to_string()),
            503,
            "HTTP/1.1 503 Service Unavailable",
        );
        assert!(state.transport_error && state.http_error);
        assert_eq!(state.error_code(), 28);
        assert_eq!(state.error_message(), Some("operation timed out"));
    }

    #[test]
    fn test_success_has_no_error() {
        let state = ErrorState::classify(0, Some("ignored".to_string()), 204, "HTTP/1.1 204");
        assert!(!state.is_error());
        assert_eq!(state.error_code(), 0);
        assert_eq!(state.error_message(), None);
        assert_eq!(state.outcome(), Outcome::Success);
    }

    #[test]
    fn test_lifecycle_transitions() {
        use LifecycleState::*;
        assert!(Idle.allows(Configured));
        assert!(Configured.allows(Sent));
        assert!(Sent.allows(Completed(Outcome::Error)));
        assert!(Completed(Outcome::Success).allows(Configured));
        assert!(!Sent.allows(Sent));
        assert!(!Idle.allows(Sent));
        assert!(!Completed(Outcome::Success).allows(Sent));
    }
}
