//! Scripted in-memory transfer engine.
//!
//! [`StaticTransport`] answers requests from routes keyed by URL path, then
//! from a FIFO queue. It records every request it receives and every
//! introspection query made against the transfers it produced.
//!
//! ```
//! use transfer_http::transport::{ScriptedExchange, StaticTransport};
//!
//! let transport = StaticTransport::new();
//! transport.route(
//!     "/users",
//!     ScriptedExchange::new(200)
//!         .with_header("Content-Type", "application/json")
//!         .with_body(r#"[{"id":1}]"#),
//! );
//! transport.push(ScriptedExchange::transport_failure(7, "connection refused"));
//! ```

use super::{
    request_header_text, Progress, RecordedInfo, TransferReport, TransferSink, Transport,
    WireRequest,
};
use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// One canned transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedExchange {
    redirects: Vec<(u16, String)>,
    status_code: u16,
    headers: Vec<(String, String)>,
    body: Bytes,
    transport_code: i32,
    transport_message: Option<String>,
    effective_url: Option<String>,
    total_time: Duration,
    delay: Option<Duration>,
}

impl ScriptedExchange {
    /// A completed transfer answering with `status_code`.
    pub fn new(status_code: u16) -> Self {
        ScriptedExchange {
            redirects: Vec::new(),
            status_code,
            headers: Vec::new(),
            body: Bytes::new(),
            transport_code: 0,
            transport_message: None,
            effective_url: None,
            total_time: Duration::from_millis(1),
            delay: None,
        }
    }

    /// A transfer that failed at the transport level before any response.
    pub fn transport_failure(code: i32, message: impl Into<String>) -> Self {
        ScriptedExchange {
            status_code: 0,
            transport_code: code,
            transport_message: Some(message.into()),
            ..Self::new(0)
        }
    }

    /// Add a response header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the response body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Precede the final response with a redirect hop.
    pub fn with_redirect(mut self, status_code: u16, location: impl Into<String>) -> Self {
        self.redirects.push((status_code, location.into()));
        self
    }

    /// Report `url` as the effective URL instead of the request URL.
    pub fn with_effective_url(mut self, url: impl Into<String>) -> Self {
        self.effective_url = Some(url.into());
        self
    }

    /// Report `total_time` as the transfer time.
    pub fn with_total_time(mut self, total_time: Duration) -> Self {
        self.total_time = total_time;
        self
    }

    /// Wait `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// The raw header text the engine streams for this exchange.
    pub fn header_text(&self) -> String {
        if self.transport_code != 0 && self.status_code == 0 {
            return String::new();
        }
        let mut text = String::new();
        for (status, location) in &self.redirects {
            text.push_str(&status_line(*status));
            text.push_str(&format!("Location: {}\r\n\r\n", location));
        }
        text.push_str(&status_line(self.status_code));
        for (name, value) in &self.headers {
            text.push_str(&format!("{}: {}\r\n", name, value));
        }
        text.push_str("\r\n");
        text
    }
}

fn status_line(code: u16) -> String {
    let reason = StatusCode::from_u16(code)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or("");
    format!("HTTP/1.1 {} {}", code, reason).trim_end().to_string() + "\r\n"
}

/// Scripted transfer engine.
#[derive(Debug, Default)]
pub struct StaticTransport {
    routes: Mutex<HashMap<String, ScriptedExchange>>,
    queue: Mutex<VecDeque<ScriptedExchange>>,
    requests: Mutex<Vec<WireRequest>>,
    issued: Mutex<Vec<Arc<RecordedInfo>>>,
}

impl StaticTransport {
    /// Create an engine with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every request whose URL path equals `path` with `exchange`.
    pub fn route(&self, path: impl Into<String>, exchange: ScriptedExchange) -> &Self {
        self.routes.lock().insert(path.into(), exchange);
        self
    }

    /// Queue `exchange` for the next request that matches no route.
    pub fn push(&self, exchange: ScriptedExchange) -> &Self {
        self.queue.lock().push_back(exchange);
        self
    }

    /// Requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<WireRequest> {
        self.requests.lock().clone()
    }

    /// Total number of introspection queries made against produced transfers.
    pub fn info_queries(&self) -> usize {
        self.issued.lock().iter().map(|info| info.query_count()).sum()
    }

    fn next_exchange(&self, url: &str) -> Option<ScriptedExchange> {
        let path = url::Url::parse(url)
            .map(|parsed| parsed.path().to_string())
            .unwrap_or_default();
        if let Some(exchange) = self.routes.lock().get(&path) {
            return Some(exchange.clone());
        }
        self.queue.lock().pop_front()
    }
}

#[async_trait]
impl Transport for StaticTransport {
    async fn perform(
        &self,
        request: &WireRequest,
        sink: &mut (dyn TransferSink + Send),
    ) -> TransferReport {
        self.requests.lock().push(request.clone());

        let Some(exchange) = self.next_exchange(&request.url) else {
            return TransferReport::failed(
                super::CODE_COULDNT_CONNECT,
                format!("no scripted exchange for {}", request.url),
                Arc::new(RecordedInfo::default()),
            );
        };

        if let Some(delay) = exchange.delay {
            tokio::time::sleep(delay).await;
        }

        for line in exchange.header_text().split_inclusive('\n') {
            sink.header_line(line.as_bytes());
        }
        sink.progress(Progress {
            download_total: Some(exchange.body.len() as u64),
            downloaded: exchange.body.len() as u64,
            upload_total: request.body.len().map(|len| len as u64),
            uploaded: request.body.len().unwrap_or(0) as u64,
        });

        let info = Arc::new(RecordedInfo {
            effective_url: Some(
                exchange
                    .effective_url
                    .clone()
                    .unwrap_or_else(|| request.url.clone()),
            ),
            total_time: Some(exchange.total_time),
            redirect_count: exchange.redirects.len() as u64,
            ..Default::default()
        });
        self.issued.lock().push(info.clone());

        let echoed = request
            .options
            .echo_request_headers
            .unwrap_or(false)
            .then(|| url::Url::parse(&request.url).ok())
            .flatten()
            .map(|target| request_header_text(&request.method, &request.headers, &target));

        TransferReport {
            body: exchange.body,
            transport_code: exchange.transport_code,
            transport_message: exchange.transport_message,
            status_code: exchange.status_code,
            request_header_text: echoed,
            info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RequestOptions;
    use crate::protocol::form::WireBody;

    #[derive(Default)]
    struct Lines(Vec<String>);

    impl TransferSink for Lines {
        fn header_line(&mut self, line: &[u8]) -> usize {
            self.0.push(String::from_utf8_lossy(line).into_owned());
            line.len()
        }
    }

    fn get(url: &str) -> WireRequest {
        WireRequest {
            method: http::Method::GET,
            url: url.into(),
            headers: Default::default(),
            body: WireBody::Empty,
            options: RequestOptions::default(),
        }
    }

    #[test]
    fn test_header_text_with_redirects() {
        let exchange = ScriptedExchange::new(200)
            .with_redirect(301, "/a")
            .with_header("X-Id", "1");
        assert_eq!(
            exchange.header_text(),
            "HTTP/1.1 301 Moved Permanently\r\nLocation: /a\r\n\r\nHTTP/1.1 200 OK\r\nX-Id: 1\r\n\r\n"
        );
        assert_eq!(ScriptedExchange::transport_failure(7, "refused").header_text(), "");
    }

    #[tokio::test]
    async fn test_routes_before_queue() {
        let transport = StaticTransport::new();
        transport.route("/fixed", ScriptedExchange::new(204));
        transport.push(ScriptedExchange::new(500));

        let mut sink = Lines::default();
        let first = transport.perform(&get("http://h/fixed"), &mut sink).await;
        let second = transport.perform(&get("http://h/fixed"), &mut sink).await;
        let third = transport.perform(&get("http://h/other"), &mut sink).await;
        let fourth = transport.perform(&get("http://h/other"), &mut sink).await;

        assert_eq!(first.status_code, 204);
        assert_eq!(second.status_code, 204);
        assert_eq!(third.status_code, 500);
        assert_eq!(fourth.transport_code, super::super::CODE_COULDNT_CONNECT);
        assert_eq!(transport.requests().len(), 4);
        assert_eq!(sink.0[0], "HTTP/1.1 204 No Content\r\n");
    }

    #[tokio::test]
    async fn test_info_queries_counted() {
        let transport = StaticTransport::new();
        transport.push(ScriptedExchange::new(200).with_effective_url("http://h/final"));
        let report = transport.perform(&get("http://h/start"), &mut Lines::default()).await;

        assert_eq!(transport.info_queries(), 0);
        let url = report.info.query(super::super::Property::EffectiveUrl);
        assert_eq!(url.as_ref().and_then(|v| v.as_text()), Some("http://h/final"));
        assert_eq!(transport.info_queries(), 1);
    }
}
