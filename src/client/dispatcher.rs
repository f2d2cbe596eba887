//! Concurrent multi-request dispatcher.
//!
//! A [`Dispatcher`] drives many [`Request`]s through one multiplexed
//! execution cycle. Requests are attached before the run or, through a
//! [`DispatcherHandle`], while it is in progress. [`Dispatcher::run`] turns the
//! dispatcher into a [`Completions`] stream that yields every request as its
//! exchange finishes.
//!
//! # Defaults
//!
//! Defaults set on the dispatcher are copied into each request when it is
//! started:
//!
//! | Default | Rule |
//! |---------|------|
//! | callbacks | copied only into empty slots |
//! | decoders | copied only into empty slots |
//! | options | fill only unset option fields |
//! | headers, cookies | merged, the request's own entries win |
//!
//! Requests attached before [`Dispatcher::run`] are started when the run
//! begins, so every default set before that point applies to all of them.
//! During the run, [`DispatcherHandle::update_defaults`] changes the defaults
//! seen by requests started afterwards; requests already started keep the
//! copy they received.
//!
//! # Examples
//!
//! ```ignore
//! use transfer_http::client::Dispatcher;
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> transfer_http::Result<()> {
//!     let mut dispatcher = Dispatcher::with_base_url("https://api.example.com/")?;
//!     dispatcher.set_default_header("Accept", "application/json");
//!     dispatcher.on_error(|r| eprintln!("{:?} failed: {:?}", r.url(), r.error_message()));
//!
//!     for page in 1..=3 {
//!         dispatcher.add_get(&format!("pages/{}", page), None)?;
//!     }
//!
//!     let mut completions = dispatcher.run();
//!     while let Some(request) = completions.next().await {
//!         println!("{:?} -> {}", request.url(), request.error_code());
//!     }
//!     Ok(())
//! }
//! ```

use crate::client::config::{ClientConfig, RequestOptions};
use crate::client::request::{Callbacks, Finished, Request};
use crate::codec::{Decoder, Decoders};
use crate::error::Result;
use crate::protocol::charset::{encode_cookie_name, encode_cookie_value};
use crate::protocol::form::{Body, Field};
use crate::protocol::headers::HeaderMap;
use crate::transport::{Progress, ReqwestTransport, Transport};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use http::Method;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use url::Url;
use uuid::Uuid;

/// Defaults copied into every request a dispatcher starts.
#[derive(Debug, Clone, Default)]
pub struct Defaults {
    /// Default request headers.
    pub headers: HeaderMap,
    /// Default cookies, already encoded.
    pub cookies: IndexMap<String, String>,
    /// Default options.
    pub options: RequestOptions,
    /// Default callbacks.
    pub callbacks: Callbacks,
    /// Default decoders.
    pub decoders: Decoders,
}

impl Defaults {
    /// Merge these defaults into `request` without overriding anything it set itself.
    pub fn apply_to(&self, request: &mut Request) {
        request.callbacks.fill_missing(&self.callbacks);
        request.decoders.fill_missing(&self.decoders);
        request.options.fill_missing(&self.options);
        request.headers.merge_missing(&self.headers);
        for (name, value) in &self.cookies {
            request
                .cookies
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

/// Collects requests and defaults for one concurrent run.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    base_url: Option<Url>,
    defaults: Arc<Mutex<Defaults>>,
    pending: Vec<Request>,
    sender: mpsc::UnboundedSender<Request>,
    receiver: mpsc::UnboundedReceiver<Request>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("base_url", &self.base_url.as_ref().map(Url::as_str))
            .field("defaults", &*self.defaults.lock())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher on a fresh [`ReqwestTransport`].
    pub fn new() -> Result<Self> {
        Self::with_config(ClientConfig::default())
    }

    /// Create a dispatcher whose convenience constructors resolve against `base_url`.
    pub fn with_base_url(base_url: &str) -> Result<Self> {
        let mut dispatcher = Self::new()?;
        dispatcher.set_base_url(base_url)?;
        Ok(dispatcher)
    }

    /// Create a dispatcher on a [`ReqwestTransport`] built from `config`.
    pub fn with_config(config: ClientConfig) -> Result<Self> {
        let transport = ReqwestTransport::with_config(config)?;
        Ok(Self::with_transport(Arc::new(transport)))
    }

    /// Create a dispatcher on an existing engine.
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Dispatcher {
            transport,
            base_url: None,
            defaults: Arc::new(Mutex::new(Defaults::default())),
            pending: Vec::new(),
            sender,
            receiver,
        }
    }

    /// Set the base URL used by [`Dispatcher::request`] and the `add_*` constructors.
    pub fn set_base_url(&mut self, base_url: &str) -> Result<&mut Self> {
        self.base_url = Some(Url::parse(base_url)?);
        Ok(self)
    }

    /// Snapshot of the current defaults.
    pub fn defaults(&self) -> Defaults {
        self.defaults.lock().clone()
    }

    /// A handle that can attach requests before and during the run.
    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            sender: self.sender.clone(),
            transport: self.transport.clone(),
            base_url: self.base_url.clone(),
            defaults: self.defaults.clone(),
        }
    }

    /// A new, unattached request on this dispatcher's engine and base URL.
    pub fn request(&self) -> Request {
        new_request(&self.transport, self.base_url.as_ref())
    }

    /// Queue `request`; it is started when the run begins.
    pub fn attach(&mut self, request: Request) -> Uuid {
        let id = request.id();
        tracing::debug!(%id, "request attached");
        self.pending.push(request);
        id
    }

    /// Number of requests waiting for the run.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn add(&mut self, method: Method, url: &str, query: Option<&Field>, body: Body) -> Result<&mut Request> {
        let mut request = self.request();
        request.configure_verb(method, url, query, body)?;
        self.attach(request);
        let index = self.pending.len() - 1;
        Ok(&mut self.pending[index])
    }

    /// Attach a `GET url?query`.
    pub fn add_get(&mut self, url: &str, query: Option<&Field>) -> Result<&mut Request> {
        self.add(Method::GET, url, query, Body::Empty)
    }

    /// Attach a `POST url` with `body`.
    pub fn add_post(&mut self, url: &str, body: impl Into<Body>) -> Result<&mut Request> {
        self.add(Method::POST, url, None, body.into())
    }

    /// Attach a `PUT url` with `body`.
    pub fn add_put(&mut self, url: &str, body: impl Into<Body>) -> Result<&mut Request> {
        self.add(Method::PUT, url, None, body.into())
    }

    /// Attach a `PATCH url` with `body`.
    pub fn add_patch(&mut self, url: &str, body: impl Into<Body>) -> Result<&mut Request> {
        self.add(Method::PATCH, url, None, body.into())
    }

    /// Attach a `DELETE url?query` with an optional `body`.
    pub fn add_delete(
        &mut self,
        url: &str,
        query: Option<&Field>,
        body: impl Into<Body>,
    ) -> Result<&mut Request> {
        self.add(Method::DELETE, url, query, body.into())
    }

    /// Attach a `HEAD url?query`.
    pub fn add_head(&mut self, url: &str, query: Option<&Field>) -> Result<&mut Request> {
        self.add(Method::HEAD, url, query, Body::Empty)
    }

    /// Attach an `OPTIONS url?query`.
    pub fn add_options(&mut self, url: &str, query: Option<&Field>) -> Result<&mut Request> {
        self.add(Method::OPTIONS, url, query, Body::Empty)
    }

    /// Default header for every request.
    pub fn set_default_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.defaults.lock().headers.insert(name, value);
        self
    }

    /// Default cookie for every request.
    pub fn set_default_cookie(&mut self, name: &str, value: &str) -> &mut Self {
        self.defaults
            .lock()
            .cookies
            .insert(encode_cookie_name(name), encode_cookie_value(value));
        self
    }

    /// Default options for every request.
    pub fn set_default_options(&mut self, options: RequestOptions) -> &mut Self {
        self.defaults.lock().options = options;
        self
    }

    /// Default JSON decoder.
    pub fn set_default_json_decoder(&mut self, decoder: Decoder) -> &mut Self {
        self.defaults.lock().decoders.json = Some(decoder);
        self
    }

    /// Default XML decoder.
    pub fn set_default_xml_decoder(&mut self, decoder: Decoder) -> &mut Self {
        self.defaults.lock().decoders.xml = Some(decoder);
        self
    }

    /// Default decoder for every other content type.
    pub fn set_default_decoder(&mut self, decoder: Decoder) -> &mut Self {
        self.defaults.lock().decoders.default = Some(decoder);
        self
    }

    /// Default before-send callback.
    pub fn on_before_send<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&mut Request) + Send + Sync + 'static,
    {
        self.defaults.lock().callbacks.before_send = Some(Arc::new(callback));
        self
    }

    /// Default success callback.
    pub fn on_success<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&Request) + Send + Sync + 'static,
    {
        self.defaults.lock().callbacks.success = Some(Arc::new(callback));
        self
    }

    /// Default error callback.
    pub fn on_error<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&Request) + Send + Sync + 'static,
    {
        self.defaults.lock().callbacks.error = Some(Arc::new(callback));
        self
    }

    /// Default complete callback.
    pub fn on_complete<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&Request) + Send + Sync + 'static,
    {
        self.defaults.lock().callbacks.complete = Some(Arc::new(callback));
        self
    }

    /// Default progress callback.
    pub fn on_progress<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.defaults.lock().callbacks.progress = Some(Arc::new(callback));
        self
    }

    /// Start every queued request and return the completion stream.
    pub fn run(self) -> Completions {
        let Dispatcher {
            defaults,
            pending,
            receiver,
            ..
        } = self;

        tracing::debug!(count = pending.len(), "dispatcher started");
        let mut completions = Completions {
            defaults,
            late: UnboundedReceiverStream::new(receiver),
            in_flight: FuturesUnordered::new(),
            done: false,
        };
        for request in pending {
            completions.start(request);
        }
        completions
    }

    /// Run every request to completion and return them in completion order.
    pub async fn run_to_completion(self) -> Vec<Request> {
        self.run().collect().await
    }
}

fn new_request(transport: &Arc<dyn Transport>, base_url: Option<&Url>) -> Request {
    let mut request = Request::with_transport(transport.clone());
    if let Some(base) = base_url {
        // already validated when the dispatcher's base URL was set
        let _ = request.set_base_url(base.as_str());
    }
    request
}

/// Clonable handle attaching requests to a dispatcher.
#[derive(Clone)]
pub struct DispatcherHandle {
    sender: mpsc::UnboundedSender<Request>,
    transport: Arc<dyn Transport>,
    base_url: Option<Url>,
    defaults: Arc<Mutex<Defaults>>,
}

impl std::fmt::Debug for DispatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherHandle")
            .field("base_url", &self.base_url.as_ref().map(Url::as_str))
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl DispatcherHandle {
    /// Attach `request`. Before the run it waits for the run to start; during
    /// the run it is started as soon as the completion stream is polled.
    ///
    /// Returns the request back when the run has already ended.
    pub fn attach(&self, request: Request) -> std::result::Result<Uuid, Request> {
        let id = request.id();
        self.sender.send(request).map_err(|e| e.0)?;
        tracing::debug!(%id, "request attached to running dispatcher");
        Ok(id)
    }

    /// A new, unattached request on the dispatcher's engine and base URL.
    pub fn request(&self) -> Request {
        new_request(&self.transport, self.base_url.as_ref())
    }

    /// Change the dispatcher's defaults, before or during the run.
    ///
    /// Requests started afterwards receive the new values. `update` runs with
    /// the defaults locked and must not call back into this handle.
    pub fn update_defaults<F>(&self, update: F)
    where
        F: FnOnce(&mut Defaults),
    {
        update(&mut *self.defaults.lock());
    }

    /// Snapshot of the dispatcher's current defaults.
    pub fn defaults(&self) -> Defaults {
        self.defaults.lock().clone()
    }
}

/// Stream of requests whose exchanges completed, in completion order.
///
/// The stream ends once no transfer is in flight and no attachment is
/// waiting; attaching through a handle after that fails.
pub struct Completions {
    defaults: Arc<Mutex<Defaults>>,
    late: UnboundedReceiverStream<Request>,
    in_flight: FuturesUnordered<BoxFuture<'static, Finished>>,
    done: bool,
}

impl Completions {
    fn start(&mut self, mut request: Request) {
        self.defaults.lock().apply_to(&mut request);
        tracing::debug!(id = %request.id(), url = request.url().map(Url::as_str).unwrap_or(""), "starting transfer");
        self.in_flight.push(request.launch());
    }

    /// Number of transfers currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Receive the next completed request.
    pub async fn next(&mut self) -> Option<Request> {
        StreamExt::next(self).await
    }
}

impl Stream for Completions {
    type Item = Request;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }

        while let Poll::Ready(Some(request)) = Pin::new(&mut this.late).poll_next(cx) {
            this.start(request);
        }

        match Pin::new(&mut this.in_flight).poll_next(cx) {
            Poll::Ready(Some(Finished {
                mut request,
                parser,
                report,
            })) => {
                request.complete(&parser, &report);
                tracing::debug!(
                    id = %request.id(),
                    code = request.error_code(),
                    remaining = this.in_flight.len(),
                    "transfer completed"
                );
                Poll::Ready(Some(request))
            }
            Poll::Ready(None) => {
                this.done = true;
                this.late.close();
                tracing::debug!("dispatcher finished");
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ScriptedExchange, StaticTransport};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn dispatcher() -> (Arc<StaticTransport>, Dispatcher) {
        let transport = Arc::new(StaticTransport::new());
        let mut dispatcher = Dispatcher::with_transport(transport.clone());
        dispatcher.set_base_url("http://api.test/").unwrap();
        (transport, dispatcher)
    }

    #[tokio::test]
    async fn test_defaults_fill_only_unset() {
        let (transport, mut dispatcher) = dispatcher();
        transport.route("/a", ScriptedExchange::new(200));
        dispatcher
            .set_default_header("X-Mode", "default")
            .set_default_header("Accept", "*/*")
            .set_default_cookie("lang", "en")
            .set_default_options(RequestOptions {
                timeout: Some(Duration::from_secs(9)),
                user_agent: Some("dispatcher".into()),
                ..Default::default()
            });

        let request = dispatcher.add_get("a", None).unwrap();
        request.set_header("x-mode", "own").set_user_agent("own-agent");

        let done = dispatcher.run_to_completion().await;
        assert_eq!(done.len(), 1);

        let sent = &transport.requests()[0];
        assert_eq!(sent.headers.get("X-Mode"), Some("own"));
        assert_eq!(sent.headers.get("accept"), Some("*/*"));
        assert_eq!(sent.headers.get("cookie"), Some("lang=en"));
        assert_eq!(sent.options.timeout, Some(Duration::from_secs(9)));
        assert_eq!(sent.options.user_agent.as_deref(), Some("own-agent"));
    }

    #[tokio::test]
    async fn test_late_attach_inherits_before_send_once() {
        let (transport, mut dispatcher) = dispatcher();
        transport.route("/first", ScriptedExchange::new(200));
        transport.route("/late", ScriptedExchange::new(200));
        transport.route("/own", ScriptedExchange::new(200));

        let shared_calls = Arc::new(AtomicUsize::new(0));
        let counter = shared_calls.clone();
        dispatcher.on_before_send(move |r| {
            counter.fetch_add(1, Ordering::SeqCst);
            r.set_header("X-Before", "dispatcher");
        });

        let handle = dispatcher.handle();
        let attached = Arc::new(AtomicUsize::new(0));
        let attach_count = attached.clone();
        dispatcher.add_get("first", None).unwrap().on_success(move |_| {
            if attach_count.fetch_add(1, Ordering::SeqCst) == 0 {
                let mut late = handle.request();
                late.set_url("late", None).unwrap();
                assert!(handle.attach(late).is_ok());
            }
        });

        let own_calls = Arc::new(AtomicUsize::new(0));
        let own_counter = own_calls.clone();
        dispatcher.add_get("own", None).unwrap().on_before_send(move |r| {
            own_counter.fetch_add(1, Ordering::SeqCst);
            r.set_header("X-Before", "own");
        });

        let done = dispatcher.run_to_completion().await;
        assert_eq!(done.len(), 3);
        assert_eq!(shared_calls.load(Ordering::SeqCst), 2);
        assert_eq!(own_calls.load(Ordering::SeqCst), 1);

        let sent = transport.requests();
        let header_for = |path: &str| {
            sent.iter()
                .find(|r| r.url.ends_with(path))
                .and_then(|r| r.headers.get("x-before").map(str::to_string))
        };
        assert_eq!(header_for("/late").as_deref(), Some("dispatcher"));
        assert_eq!(header_for("/first").as_deref(), Some("dispatcher"));
        assert_eq!(header_for("/own").as_deref(), Some("own"));
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_siblings() {
        let (transport, mut dispatcher) = dispatcher();
        transport.route("/down", ScriptedExchange::transport_failure(7, "connection refused"));
        transport.route("/gone", ScriptedExchange::new(410));
        transport.route("/ok", ScriptedExchange::new(200).with_body("fine"));

        let errors = Arc::new(AtomicUsize::new(0));
        let error_count = errors.clone();
        dispatcher.on_error(move |_| {
            error_count.fetch_add(1, Ordering::SeqCst);
        });
        for path in ["down", "gone", "ok"] {
            dispatcher.add_get(path, None).unwrap();
        }

        let done = dispatcher.run_to_completion().await;
        assert_eq!(done.len(), 3);
        assert_eq!(errors.load(Ordering::SeqCst), 2);

        let ok = done
            .iter()
            .find(|r| r.url().unwrap().path() == "/ok")
            .unwrap();
        assert!(!ok.is_error());
        assert_eq!(ok.response().unwrap().text(), "fine");

        let down = done
            .iter()
            .find(|r| r.url().unwrap().path() == "/down")
            .unwrap();
        assert_eq!(down.error_code(), 7);
    }

    #[tokio::test]
    async fn test_callback_order_per_request() {
        let (transport, mut dispatcher) = dispatcher();
        transport.route("/x", ScriptedExchange::new(200));
        let events = Arc::new(Mutex::new(Vec::new()));

        let log = events.clone();
        dispatcher.on_before_send(move |_| log.lock().unwrap().push("before_send"));
        let log = events.clone();
        dispatcher.on_success(move |_| log.lock().unwrap().push("success"));
        let log = events.clone();
        dispatcher.on_error(move |_| log.lock().unwrap().push("error"));
        let log = events.clone();
        dispatcher.on_complete(move |_| log.lock().unwrap().push("complete"));

        dispatcher.add_get("x", None).unwrap();
        dispatcher.run_to_completion().await;
        assert_eq!(*events.lock().unwrap(), vec!["before_send", "success", "complete"]);
    }

    #[tokio::test]
    async fn test_completion_order_follows_finish_time() {
        let (transport, mut dispatcher) = dispatcher();
        transport.route("/slow", ScriptedExchange::new(200).with_delay(Duration::from_millis(60)));
        transport.route("/fast", ScriptedExchange::new(200).with_delay(Duration::from_millis(1)));
        dispatcher.add_get("slow", None).unwrap();
        dispatcher.add_get("fast", None).unwrap();

        let mut completions = dispatcher.run();
        assert_eq!(completions.in_flight(), 2);
        let first = completions.next().await.unwrap();
        let second = completions.next().await.unwrap();
        assert_eq!(first.url().unwrap().path(), "/fast");
        assert_eq!(second.url().unwrap().path(), "/slow");
        assert!(completions.next().await.is_none());
        assert!(completions.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unprepared_request_recorded_as_local_failure() {
        let (transport, mut dispatcher) = dispatcher();
        transport.route("/ok", ScriptedExchange::new(200));
        dispatcher.add_get("ok", None).unwrap();
        dispatcher.attach(Request::with_transport(transport.clone()));

        let done = dispatcher.run_to_completion().await;
        assert_eq!(done.len(), 2);
        let failed = done.iter().find(|r| r.url().is_none()).unwrap();
        assert!(failed.error_state().unwrap().transport_error);
        assert_eq!(failed.error_code(), crate::types::LOCAL_FAILURE);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_add_verbs_resolve_base_url() {
        let (transport, mut dispatcher) = dispatcher();
        transport.route("/v2/items", ScriptedExchange::new(201));
        transport.route("/v2/items/1", ScriptedExchange::new(204));
        dispatcher.add_post("v2/items", Field::map([("name", "x")])).unwrap();
        dispatcher.add_delete("v2/items/1", None, Body::Empty).unwrap();

        dispatcher.run_to_completion().await;
        let mut sent: Vec<_> = transport
            .requests()
            .into_iter()
            .map(|r| (r.method, r.url))
            .collect();
        sent.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(
            sent,
            vec![
                (Method::POST, "http://api.test/v2/items".to_string()),
                (Method::DELETE, "http://api.test/v2/items/1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_defaults_set_after_attach_still_apply() {
        let (transport, mut dispatcher) = dispatcher();
        transport.route("/direct", ScriptedExchange::new(200));
        transport.route("/queued", ScriptedExchange::new(200));

        let mut direct = dispatcher.handle().request();
        direct.set_url("direct", None).unwrap();
        dispatcher.attach(direct);
        let handle = dispatcher.handle();
        let mut queued = handle.request();
        queued.set_url("queued", None).unwrap();
        assert!(handle.attach(queued).is_ok());

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        dispatcher
            .set_default_header("X-Default", "d")
            .on_before_send(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        let done = dispatcher.run_to_completion().await;
        assert_eq!(done.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        for sent in transport.requests() {
            assert_eq!(sent.headers.get("x-default"), Some("d"), "{}", sent.url);
        }
    }

    #[tokio::test]
    async fn test_defaults_changed_mid_run_reach_later_requests() {
        let (transport, mut dispatcher) = dispatcher();
        transport.route(
            "/slow",
            ScriptedExchange::new(200).with_delay(Duration::from_millis(50)),
        );
        transport.route("/first", ScriptedExchange::new(200));
        transport.route("/late", ScriptedExchange::new(200));
        dispatcher.set_default_header("X-Gen", "1");

        dispatcher.add_get("slow", None).unwrap();
        let handle = dispatcher.handle();
        dispatcher.add_get("first", None).unwrap().on_success(move |_| {
            handle.update_defaults(|defaults| {
                defaults.headers.insert("X-Gen", "2");
            });
            let mut late = handle.request();
            late.set_url("late", None).unwrap();
            assert!(handle.attach(late).is_ok());
        });

        let done = dispatcher.run_to_completion().await;
        assert_eq!(done.len(), 3);

        let sent = transport.requests();
        let generation = |path: &str| {
            sent.iter()
                .find(|r| r.url.ends_with(path))
                .and_then(|r| r.headers.get("x-gen").map(str::to_string))
        };
        assert_eq!(generation("/slow").as_deref(), Some("1"));
        assert_eq!(generation("/first").as_deref(), Some("1"));
        assert_eq!(generation("/late").as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_handle_attach_after_end_returns_request() {
        let (_, dispatcher) = dispatcher();
        let handle = dispatcher.handle();
        let mut completions = dispatcher.run();
        assert!(completions.next().await.is_none());
        assert!(handle.attach(handle.request()).is_err());
    }
}
