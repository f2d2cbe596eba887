//! One HTTP exchange and its lifecycle.
//!
//! A [`Request`] owns everything needed for one exchange: the URL, headers,
//! cookies, body, options, decoders and lifecycle callbacks. After the
//! exchange completes it also owns the parsed [`Exchange`] and answers
//! deferred introspection queries such as [`Request::effective_url`].
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──configure──▶ Configured ──exec──▶ Sent ──▶ Completed(Success | Error)
//!                          ▲                                   │
//!                          └──────────── configure ────────────┘
//! ```
//!
//! Configuring a completed request starts a new exchange: the previous result
//! and every cached deferred property are dropped.
//!
//! # Callbacks
//!
//! | Callback | Fires |
//! |----------|-------|
//! | `before_send` | once per exchange, before the wire request is built |
//! | `success` | after a completed exchange without error |
//! | `error` | after a transport failure or a 4xx/5xx status |
//! | `complete` | after `success` or `error` |
//! | `progress` | on every progress tick of the engine |
//!
//! # Examples
//!
//! ```ignore
//! use transfer_http::Request;
//!
//! #[tokio::main]
//! async fn main() -> transfer_http::Result<()> {
//!     let mut request = Request::with_base_url("https://api.example.com/")?;
//!     request.on_error(|r| eprintln!("failed: {:?}", r.error_message()));
//!
//!     let exchange = request.get("users", None).await?;
//!     println!("{}", exchange.response.status_line());
//!     println!("{:?}", request.effective_url());
//!     Ok(())
//! }
//! ```

use crate::client::config::{Auth, ClientConfig, RequestOptions};
use crate::client::parser::ResponseParser;
use crate::client::utils::{exponential_backoff, is_retryable_status, is_retryable_transport_code};
use crate::codec::{Decoder, Decoders};
use crate::error::{Error, Result};
use crate::protocol::charset::{encode_cookie_name, encode_cookie_value, format_cookie_header};
use crate::protocol::form::{encode_body, encode_query, Body, Field};
use crate::protocol::headers::{HeaderMap, CONTENT_LENGTH, CONTENT_TYPE, COOKIE};
use crate::transport::{
    InfoValue, Progress, Property, ReqwestTransport, TransferInfo, TransferReport, Transport,
    WireRequest,
};
use crate::types::{ErrorState, Exchange, LifecycleState, Response};
use futures::future::BoxFuture;
use futures::FutureExt;
use http::Method;
use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// Callback invoked once before a request is sent; may still reconfigure it.
pub type BeforeSend = Arc<dyn Fn(&mut Request) + Send + Sync>;
/// Callback invoked after an exchange completes.
pub type Hook = Arc<dyn Fn(&Request) + Send + Sync>;
/// Callback receiving transfer progress.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Lifecycle callback slots of a request or dispatcher.
#[derive(Clone, Default)]
pub struct Callbacks {
    /// Fired once before sending.
    pub before_send: Option<BeforeSend>,
    /// Fired after a successful exchange.
    pub success: Option<Hook>,
    /// Fired after a failed exchange.
    pub error: Option<Hook>,
    /// Fired after `success` or `error`.
    pub complete: Option<Hook>,
    /// Fed with engine progress.
    pub progress: Option<ProgressCallback>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("before_send", &self.before_send.is_some())
            .field("success", &self.success.is_some())
            .field("error", &self.error.is_some())
            .field("complete", &self.complete.is_some())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl Callbacks {
    /// Fill empty slots from `other`.
    pub fn fill_missing(&mut self, other: &Callbacks) {
        if self.before_send.is_none() {
            self.before_send = other.before_send.clone();
        }
        if self.success.is_none() {
            self.success = other.success.clone();
        }
        if self.error.is_none() {
            self.error = other.error.clone();
        }
        if self.complete.is_none() {
            self.complete = other.complete.clone();
        }
        if self.progress.is_none() {
            self.progress = other.progress.clone();
        }
    }
}

/// Memoized deferred properties of the current exchange.
#[derive(Debug, Default)]
struct Deferred {
    effective_url: OnceCell<Option<InfoValue>>,
    total_time: OnceCell<Option<InfoValue>>,
    redirect_count: OnceCell<Option<InfoValue>>,
}

impl Deferred {
    fn cell(&self, property: Property) -> &OnceCell<Option<InfoValue>> {
        match property {
            Property::EffectiveUrl => &self.effective_url,
            Property::TotalTime => &self.total_time,
            Property::RedirectCount => &self.redirect_count,
        }
    }
}

/// A transfer that left the engine and still has to be parsed.
pub(crate) struct Finished {
    pub(crate) request: Request,
    pub(crate) parser: ResponseParser,
    pub(crate) report: TransferReport,
}

/// One HTTP exchange.
pub struct Request {
    id: Uuid,
    transport: Arc<dyn Transport>,
    base_url: Option<Url>,
    url: Option<Url>,
    pub(crate) headers: HeaderMap,
    pub(crate) cookies: IndexMap<String, String>,
    body: Body,
    pub(crate) options: RequestOptions,
    client_defaults: RequestOptions,
    enable_logging: bool,
    pub(crate) callbacks: Callbacks,
    pub(crate) decoders: Decoders,
    state: LifecycleState,
    exchange: Option<Exchange>,
    info: Option<Arc<dyn TransferInfo>>,
    deferred: Deferred,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("url", &self.url.as_ref().map(Url::as_str))
            .field("state", &self.state)
            .field("headers", &self.headers)
            .field("options", &self.options)
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

impl Request {
    /// Create a request on a fresh [`ReqwestTransport`] with default configuration.
    ///
    /// Fails with [`Error::TransportUnavailable`] when the engine cannot be built.
    pub fn new() -> Result<Self> {
        Self::with_config(ClientConfig::default())
    }

    /// Create a request whose relative URLs resolve against `base_url`.
    pub fn with_base_url(base_url: &str) -> Result<Self> {
        let mut request = Self::new()?;
        request.set_base_url(base_url)?;
        Ok(request)
    }

    /// Create a request on a fresh [`ReqwestTransport`] built from `config`.
    pub fn with_config(config: ClientConfig) -> Result<Self> {
        let enable_logging = config.enable_logging;
        let transport = ReqwestTransport::with_config(config)?;
        let mut request = Self::with_transport(Arc::new(transport));
        request.enable_logging = enable_logging;
        Ok(request)
    }

    /// Create a request on an existing engine.
    ///
    /// Unset options fall back to the engine's [`Transport::request_defaults`].
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        let client_defaults = transport.request_defaults();
        Request {
            id: Uuid::new_v4(),
            transport,
            base_url: None,
            url: None,
            headers: HeaderMap::new(),
            cookies: IndexMap::new(),
            body: Body::Empty,
            options: RequestOptions::default(),
            client_defaults,
            enable_logging: true,
            callbacks: Callbacks::default(),
            decoders: Decoders::default(),
            state: LifecycleState::Idle,
            exchange: None,
            info: None,
            deferred: Deferred::default(),
        }
    }

    /// Unique id of this request.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Engine used by this request.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Enter `Configured`, dropping the result of a completed exchange.
    fn configure(&mut self) -> &mut Self {
        if self.state.is_completed() {
            self.exchange = None;
            self.info = None;
            self.deferred = Deferred::default();
        }
        if self.state != LifecycleState::Sent {
            self.state = LifecycleState::Configured;
        }
        self
    }

    // ---- URL ----

    /// Set the URL relative requests resolve against.
    pub fn set_base_url(&mut self, base_url: &str) -> Result<&mut Self> {
        let base = Url::parse(base_url)?;
        self.base_url = Some(base);
        Ok(self.configure())
    }

    /// Base URL, if any.
    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    /// Set the request URL, resolved against the base URL, with an optional
    /// query appended.
    pub fn set_url(&mut self, url: &str, query: Option<&Field>) -> Result<&mut Self> {
        let mut resolved = match (&self.base_url, url.is_empty()) {
            (Some(base), true) => base.clone(),
            (Some(base), false) => base.join(url)?,
            (None, _) => Url::parse(url)?,
        };

        if let Some(query) = query {
            let encoded = encode_query(query);
            if !encoded.is_empty() {
                let combined = match resolved.query() {
                    Some(existing) if !existing.is_empty() => format!("{}&{}", existing, encoded),
                    _ => encoded,
                };
                resolved.set_query(Some(&combined));
            }
        }

        self.url = Some(resolved);
        Ok(self.configure())
    }

    /// Effective request URL, including the query.
    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref().or(self.base_url.as_ref())
    }

    // ---- headers and cookies ----

    /// Set a request header, replacing any value under another casing.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.insert(name, value);
        self.configure()
    }

    /// Set several request headers.
    pub fn set_headers<K, V, I>(&mut self, headers: I) -> &mut Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        for (name, value) in headers {
            self.headers.insert(name, value);
        }
        self.configure()
    }

    /// Set headers from raw `Name: value` lines.
    ///
    /// Fails with [`Error::HeaderParse`] on a line without a colon or with an
    /// empty name; no header is set in that case.
    pub fn set_header_lines<'a, I>(&mut self, lines: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut parsed = Vec::new();
        for line in lines {
            match line.split_once(':') {
                Some((name, value)) if !name.trim().is_empty() => {
                    parsed.push((name.trim(), value.trim()));
                }
                _ => return Err(Error::HeaderParse(format!("malformed header line {:?}", line))),
            }
        }
        Ok(self.set_headers(parsed))
    }

    /// Remove a request header.
    pub fn remove_header(&mut self, name: &str) -> &mut Self {
        self.headers.remove(name);
        self.configure()
    }

    /// Request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Set a cookie; name and value are encoded against the cookie character sets.
    pub fn set_cookie(&mut self, name: &str, value: &str) -> &mut Self {
        self.cookies
            .insert(encode_cookie_name(name), encode_cookie_value(value));
        self.configure()
    }

    /// Set several cookies.
    pub fn set_cookies<'a, I>(&mut self, cookies: I) -> &mut Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (name, value) in cookies {
            self.cookies
                .insert(encode_cookie_name(name), encode_cookie_value(value));
        }
        self.configure()
    }

    /// Encoded request cookies.
    pub fn cookies(&self) -> &IndexMap<String, String> {
        &self.cookies
    }

    // ---- body ----

    /// Set the request body.
    pub fn set_body(&mut self, body: impl Into<Body>) -> &mut Self {
        self.body = body.into();
        self.configure()
    }

    /// Request body before encoding.
    pub fn body(&self) -> &Body {
        &self.body
    }

    // ---- options ----

    /// Set the request method.
    pub fn set_method(&mut self, method: Method) -> &mut Self {
        self.options.method = Some(method);
        self.configure()
    }

    /// Set the total transfer timeout.
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.options.timeout = Some(timeout);
        self.configure()
    }

    /// Set the connect timeout.
    pub fn set_connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.options.connect_timeout = Some(timeout);
        self.configure()
    }

    /// Set the `User-Agent`.
    pub fn set_user_agent(&mut self, user_agent: impl Into<String>) -> &mut Self {
        self.options.user_agent = Some(user_agent.into());
        self.configure()
    }

    /// Use HTTP Basic authentication.
    pub fn set_basic_auth(&mut self, username: impl Into<String>, password: impl Into<String>) -> &mut Self {
        self.options.auth = Some(Auth::Basic {
            username: username.into(),
            password: password.into(),
        });
        self.configure()
    }

    /// Use HTTP Digest authentication.
    pub fn set_digest_auth(&mut self, username: impl Into<String>, password: impl Into<String>) -> &mut Self {
        self.options.auth = Some(Auth::Digest {
            username: username.into(),
            password: password.into(),
        });
        self.configure()
    }

    /// Read cookies from `path` before sending.
    pub fn set_cookie_file(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.options.cookie_file = Some(path.into());
        self.configure()
    }

    /// Write cookies to `path` after the exchange.
    pub fn set_cookie_jar(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.options.cookie_jar = Some(path.into());
        self.configure()
    }

    /// Trace the transfer in detail.
    pub fn set_verbose(&mut self, verbose: bool) -> &mut Self {
        self.options.verbose = Some(verbose);
        self.configure()
    }

    /// Ask the engine to echo the request headers it sent.
    pub fn set_echo_request_headers(&mut self, echo: bool) -> &mut Self {
        self.options.echo_request_headers = Some(echo);
        self.configure()
    }

    /// Follow redirects, at most `max_redirects` hops.
    pub fn set_follow_redirects(&mut self, follow: bool, max_redirects: Option<u32>) -> &mut Self {
        self.options.follow_redirects = Some(follow);
        if max_redirects.is_some() {
            self.options.max_redirects = max_redirects;
        }
        self.configure()
    }

    /// Retry failed exchanges `retries` times with exponential backoff from `delay`.
    pub fn set_retries(&mut self, retries: u32, delay: Duration) -> &mut Self {
        self.options.retries = Some(retries);
        self.options.retry_delay = Some(delay);
        self.configure()
    }

    /// Replace every option at once.
    pub fn set_options(&mut self, options: RequestOptions) -> &mut Self {
        self.options = options;
        self.configure()
    }

    /// Options set on this request (without defaults).
    pub fn request_options(&self) -> &RequestOptions {
        &self.options
    }

    /// Options with client defaults applied.
    pub fn effective_options(&self) -> RequestOptions {
        let mut options = self.options.clone();
        options.fill_missing(&self.client_defaults);
        options
    }

    // ---- decoders and callbacks ----

    /// Replace the JSON decoder.
    pub fn set_json_decoder(&mut self, decoder: Decoder) -> &mut Self {
        self.decoders.json = Some(decoder);
        self.configure()
    }

    /// Replace the XML decoder.
    pub fn set_xml_decoder(&mut self, decoder: Decoder) -> &mut Self {
        self.decoders.xml = Some(decoder);
        self.configure()
    }

    /// Set the decoder for every other content type.
    pub fn set_default_decoder(&mut self, decoder: Decoder) -> &mut Self {
        self.decoders.default = Some(decoder);
        self.configure()
    }

    /// Register the before-send callback.
    pub fn on_before_send<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&mut Request) + Send + Sync + 'static,
    {
        self.callbacks.before_send = Some(Arc::new(callback));
        self
    }

    /// Register the success callback.
    pub fn on_success<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&Request) + Send + Sync + 'static,
    {
        self.callbacks.success = Some(Arc::new(callback));
        self
    }

    /// Register the error callback.
    pub fn on_error<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&Request) + Send + Sync + 'static,
    {
        self.callbacks.error = Some(Arc::new(callback));
        self
    }

    /// Register the complete callback.
    pub fn on_complete<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&Request) + Send + Sync + 'static,
    {
        self.callbacks.complete = Some(Arc::new(callback));
        self
    }

    /// Register the progress callback.
    pub fn on_progress<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.callbacks.progress = Some(Arc::new(callback));
        self
    }

    // ---- results ----

    /// Result of the completed exchange.
    pub fn exchange(&self) -> Option<&Exchange> {
        self.exchange.as_ref()
    }

    /// Parsed response of the completed exchange.
    pub fn response(&self) -> Option<&Response> {
        self.exchange.as_ref().map(|exchange| &exchange.response)
    }

    /// Error classification of the completed exchange.
    pub fn error_state(&self) -> Option<&ErrorState> {
        self.exchange.as_ref().map(|exchange| &exchange.error)
    }

    /// Echoed request headers of the completed exchange.
    pub fn request_headers(&self) -> Option<&HeaderMap> {
        self.exchange.as_ref()?.request_headers.as_ref()
    }

    /// Whether the completed exchange failed.
    pub fn is_error(&self) -> bool {
        self.error_state().is_some_and(ErrorState::is_error)
    }

    /// Transport code or HTTP status of a failed exchange, else `0`.
    pub fn error_code(&self) -> i32 {
        self.error_state().map_or(0, ErrorState::error_code)
    }

    /// Transport message or status line of a failed exchange.
    pub fn error_message(&self) -> Option<&str> {
        self.error_state()?.error_message()
    }

    /// Deferred introspection property of the completed exchange.
    ///
    /// Returns `None` before completion without querying the engine. The
    /// first query after completion is cached, including an absent result.
    pub fn property(&self, property: Property) -> Option<InfoValue> {
        if !self.state.is_completed() {
            return None;
        }
        let info = self.info.as_ref()?;
        self.deferred
            .cell(property)
            .get_or_init(|| info.query(property))
            .clone()
    }

    /// Final URL after redirects.
    pub fn effective_url(&self) -> Option<String> {
        match self.property(Property::EffectiveUrl)? {
            InfoValue::Text(url) => Some(url),
            _ => None,
        }
    }

    /// Wall time of the whole transfer.
    pub fn total_time(&self) -> Option<Duration> {
        self.property(Property::TotalTime)?.as_duration()
    }

    // ---- execution ----

    /// Perform the exchange and wait for it to complete.
    ///
    /// Transport failures and 4xx/5xx statuses are not `Err`; inspect
    /// [`Exchange::error`]. `Err` means the request could not be sent.
    pub async fn exec(&mut self) -> Result<&Exchange> {
        match self.state {
            LifecycleState::Configured => {}
            LifecycleState::Completed(_) => {
                self.configure();
            }
            state => return Err(Error::InvalidState { state, operation: "exec" }),
        }

        self.fire_before_send();
        self.state = LifecycleState::Sent;
        let wire = match self.prepare() {
            Ok(wire) => wire,
            Err(e) => {
                self.state = LifecycleState::Configured;
                return Err(e);
            }
        };

        let (parser, report) = perform_exchange(
            self.transport.clone(),
            wire,
            self.callbacks.progress.clone(),
            self.enable_logging,
        )
        .await;
        self.complete(&parser, &report);
        let state = self.state;
        self.exchange.as_ref().ok_or(Error::InvalidState {
            state,
            operation: "read the result",
        })
    }

    /// `GET url?query`.
    pub async fn get(&mut self, url: &str, query: Option<&Field>) -> Result<&Exchange> {
        self.configure_verb(Method::GET, url, query, Body::Empty)?;
        self.exec().await
    }

    /// `POST url` with `body`.
    pub async fn post(&mut self, url: &str, body: impl Into<Body>) -> Result<&Exchange> {
        self.configure_verb(Method::POST, url, None, body.into())?;
        self.exec().await
    }

    /// `PUT url` with `body`; sets `Content-Length` for non-multipart bodies.
    pub async fn put(&mut self, url: &str, body: impl Into<Body>) -> Result<&Exchange> {
        self.configure_verb(Method::PUT, url, None, body.into())?;
        self.exec().await
    }

    /// `PATCH url` with `body`; sets `Content-Length` for non-multipart bodies.
    pub async fn patch(&mut self, url: &str, body: impl Into<Body>) -> Result<&Exchange> {
        self.configure_verb(Method::PATCH, url, None, body.into())?;
        self.exec().await
    }

    /// `DELETE url?query` with an optional `body`.
    pub async fn delete(
        &mut self,
        url: &str,
        query: Option<&Field>,
        body: impl Into<Body>,
    ) -> Result<&Exchange> {
        self.configure_verb(Method::DELETE, url, query, body.into())?;
        self.exec().await
    }

    /// `HEAD url?query`.
    pub async fn head(&mut self, url: &str, query: Option<&Field>) -> Result<&Exchange> {
        self.configure_verb(Method::HEAD, url, query, Body::Empty)?;
        self.exec().await
    }

    /// `OPTIONS url?query`.
    pub async fn options(&mut self, url: &str, query: Option<&Field>) -> Result<&Exchange> {
        self.configure_verb(Method::OPTIONS, url, query, Body::Empty)?;
        self.exec().await
    }

    pub(crate) fn configure_verb(
        &mut self,
        method: Method,
        url: &str,
        query: Option<&Field>,
        body: Body,
    ) -> Result<&mut Self> {
        self.set_url(url, query)?;
        self.set_method(method);
        Ok(self.set_body(body))
    }

    fn fire_before_send(&mut self) {
        if let Some(before_send) = self.callbacks.before_send.clone() {
            before_send(self);
        }
    }

    /// Build the wire request: encoded body, cookies and effective options.
    pub(crate) fn prepare(&self) -> Result<WireRequest> {
        let url = self
            .url()
            .cloned()
            .ok_or(Error::Url(url::ParseError::RelativeUrlWithoutBase))?;

        let options = self.effective_options();
        options.validate();

        let mut headers = self.headers.clone();
        let encoded = encode_body(&self.body, &headers)?;

        if !self.cookies.is_empty() {
            let cookies = self
                .cookies
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str()));
            headers.insert(COOKIE, format_cookie_header(cookies));
        }

        let method = options.method.clone().unwrap_or_else(|| {
            if encoded.body.is_empty() {
                Method::GET
            } else {
                Method::POST
            }
        });

        if encoded.drop_content_length {
            headers.remove(CONTENT_LENGTH);
        } else if !encoded.body.is_empty() {
            if let Some(length) = encoded.body.len() {
                if matches!(method, Method::PUT | Method::PATCH) {
                    headers.insert(CONTENT_LENGTH, length.to_string());
                }
                let form = matches!(&self.body, Body::Fields(field) if field.is_container());
                if form && !headers.contains(CONTENT_TYPE) {
                    headers.insert(CONTENT_TYPE, "application/x-www-form-urlencoded");
                }
            }
        }

        Ok(WireRequest {
            method,
            url: url.to_string(),
            headers,
            body: encoded.body,
            options,
        })
    }

    /// Fire before-send and start the transfer; the future owns the request
    /// until the engine returns.
    pub(crate) fn launch(mut self) -> BoxFuture<'static, Finished> {
        if self.state.is_completed() || self.state == LifecycleState::Idle {
            self.configure();
        }
        self.fire_before_send();
        self.state = LifecycleState::Sent;
        let prepared = self.prepare();

        async move {
            match prepared {
                Ok(wire) => {
                    let (parser, report) = perform_exchange(
                        self.transport.clone(),
                        wire,
                        self.callbacks.progress.clone(),
                        self.enable_logging,
                    )
                    .await;
                    Finished {
                        request: self,
                        parser,
                        report,
                    }
                }
                Err(e) => Finished {
                    request: self,
                    parser: ResponseParser::new(),
                    report: TransferReport::local_failure(e.to_string()),
                },
            }
        }
        .boxed()
    }

    /// Parse the engine's report, record the result and fire the completion callbacks.
    pub(crate) fn complete(&mut self, parser: &ResponseParser, report: &TransferReport) {
        let exchange = parser.finish(report, &self.decoders);
        let outcome = exchange.error.outcome();
        debug_assert!(self.state.allows(LifecycleState::Completed(outcome)));

        if exchange.error.is_error() && self.enable_logging {
            tracing::warn!(
                id = %self.id,
                url = self.url().map(Url::as_str).unwrap_or(""),
                code = exchange.error.error_code(),
                message = exchange.error.error_message().unwrap_or(""),
                "exchange failed"
            );
        }

        self.exchange = Some(exchange);
        self.info = Some(report.info.clone());
        self.deferred = Deferred::default();
        self.state = LifecycleState::Completed(outcome);

        let hook = if self.is_error() {
            self.callbacks.error.clone()
        } else {
            self.callbacks.success.clone()
        };
        if let Some(hook) = hook {
            hook(self);
        }
        if let Some(complete) = self.callbacks.complete.clone() {
            complete(self);
        }
    }
}

/// Run one transfer, retrying retryable failures with exponential backoff.
async fn perform_exchange(
    transport: Arc<dyn Transport>,
    wire: WireRequest,
    progress: Option<ProgressCallback>,
    logging: bool,
) -> (ResponseParser, TransferReport) {
    let retries = wire.options.retries.unwrap_or(0);
    let base_delay = wire
        .options
        .retry_delay
        .unwrap_or(Duration::from_millis(500));
    let mut attempt = 0;

    loop {
        let mut parser = ResponseParser::with_progress(progress.clone());
        let report = transport.perform(&wire, &mut parser).await;

        let retryable = is_retryable_transport_code(report.transport_code)
            || (report.transport_code == 0 && is_retryable_status(report.status_code));
        if retryable && attempt < retries {
            let delay = exponential_backoff(attempt, base_delay.as_millis() as u64);
            if logging {
                tracing::warn!(
                    "Request to {} failed (attempt {}), retrying after {:?}",
                    wire.url,
                    attempt + 1,
                    delay
                );
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
            continue;
        }
        return (parser, report);
    }
}
