//! Production transfer engine built on `reqwest`.

use super::{
    request_header_text, Progress, RecordedInfo, TransferInfo, TransferReport, TransferSink,
    Transport, WireRequest, CODE_COULDNT_CONNECT, CODE_FAILED_INIT, CODE_OK,
    CODE_OPERATION_TIMEDOUT, CODE_READ_ERROR, CODE_RECV_ERROR, CODE_TOO_MANY_REDIRECTS,
    CODE_URL_MALFORMAT,
};
use crate::client::{Auth, ClientConfig, ConfigWarning, RequestOptions};
use crate::error::{Error, Result};
use crate::protocol::form::{Part, WireBody};
use crate::protocol::headers::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::BytesMut;
use futures::StreamExt;
use http::{Method, StatusCode};
use indexmap::IndexMap;
use lru::LruCache;
use parking_lot::Mutex;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// Options that require a separately built `reqwest::Client`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    user_agent: Option<String>,
    verbose: bool,
}

impl ClientKey {
    fn from_options(options: &RequestOptions) -> Self {
        ClientKey {
            timeout: options.timeout,
            connect_timeout: options.connect_timeout,
            user_agent: options.user_agent.clone(),
            verbose: options.verbose.unwrap_or(false),
        }
    }

    fn build(&self) -> reqwest::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connection_verbose(self.verbose)
            .pool_idle_timeout(Duration::from_secs(90));

        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(connect_timeout) = self.connect_timeout {
            builder = builder.connect_timeout(connect_timeout);
        }
        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.as_str());
        }

        builder.build()
    }
}

/// Transfer engine backed by `reqwest`.
///
/// Redirects are followed by the engine itself so that the header block of
/// every hop reaches the [`TransferSink`]. Clients are cached per distinct
/// timeout / user agent / verbosity combination.
pub struct ReqwestTransport {
    config: ClientConfig,
    clients: Mutex<LruCache<ClientKey, reqwest::Client>>,
}

impl fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReqwestTransport")
            .field("config", &self.config)
            .field("cached_clients", &self.clients.lock().len())
            .finish()
    }
}

impl ReqwestTransport {
    /// Create an engine with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(ClientConfig::default())
    }

    /// Create an engine with a custom configuration.
    ///
    /// Fails with [`Error::TransportUnavailable`] when the underlying client
    /// cannot be built.
    pub fn with_config(config: ClientConfig) -> Result<Self> {
        let capacity = NonZeroUsize::new(config.client_cache_size).unwrap_or(NonZeroUsize::MIN);
        let key = ClientKey::from_options(&config.request_defaults());
        let client = key
            .build()
            .map_err(|e| Error::TransportUnavailable(e.to_string()))?;

        let mut clients = LruCache::new(capacity);
        clients.put(key, client);

        Ok(ReqwestTransport {
            config,
            clients: Mutex::new(clients),
        })
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn client_for(&self, options: &RequestOptions) -> reqwest::Result<reqwest::Client> {
        let key = ClientKey::from_options(options);
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }
        let client = key.build()?;
        clients.put(key, client.clone());
        Ok(client)
    }

    async fn build_request(
        &self,
        client: &reqwest::Client,
        method: &Method,
        target: &Url,
        request: &WireRequest,
        with_body: bool,
    ) -> std::result::Result<reqwest::RequestBuilder, (i32, String)> {
        let mut builder = client.request(method.clone(), target.clone());
        let multipart = with_body && request.body.is_multipart();

        for (name, value) in request.headers.iter() {
            let framing = name.eq_ignore_ascii_case(CONTENT_TYPE)
                || name.eq_ignore_ascii_case(CONTENT_LENGTH);
            if (multipart || !with_body) && framing {
                continue;
            }
            builder = builder.header(name, value);
        }

        if let Some(Auth::Basic { username, password }) = &request.options.auth {
            if !request.headers.contains(AUTHORIZATION) {
                let credentials = STANDARD.encode(format!("{}:{}", username, password));
                builder = builder.header(AUTHORIZATION, format!("Basic {}", credentials));
            }
        }

        if !with_body {
            return Ok(builder);
        }
        match &request.body {
            WireBody::Empty => Ok(builder),
            WireBody::Bytes(bytes) => Ok(builder.body(bytes.clone())),
            WireBody::Multipart(parts) => Ok(builder.multipart(build_form(parts).await?)),
        }
    }

    fn warn_unsupported(&self, options: &RequestOptions) {
        let mut unsupported = Vec::new();
        if matches!(options.auth, Some(Auth::Digest { .. })) {
            unsupported.push(ConfigWarning::Unsupported("digest authentication"));
        }
        if options.cookie_file.is_some() {
            unsupported.push(ConfigWarning::Unsupported("cookie file"));
        }
        if options.cookie_jar.is_some() {
            unsupported.push(ConfigWarning::Unsupported("cookie jar"));
        }
        for warning in unsupported {
            tracing::warn!(%warning, "reqwest transport");
        }
    }
}

async fn build_form(
    parts: &IndexMap<String, Part>,
) -> std::result::Result<reqwest::multipart::Form, (i32, String)> {
    let mut form = reqwest::multipart::Form::new();
    for (name, part) in parts {
        form = match part {
            Part::Text(text) => form.text(name.clone(), text.clone()),
            Part::File(file) => {
                let data = tokio::fs::read(&file.path).await.map_err(|e| {
                    (
                        CODE_READ_ERROR,
                        format!("failed to read {}: {}", file.path.display(), e),
                    )
                })?;
                let mut file_part =
                    reqwest::multipart::Part::bytes(data).file_name(file.display_name());
                if let Some(mime) = &file.mime {
                    file_part = file_part
                        .mime_str(mime)
                        .map_err(|e| (CODE_READ_ERROR, e.to_string()))?;
                }
                form.part(name.clone(), file_part)
            }
        };
    }
    Ok(form)
}

/// Map a reqwest error to a curl-style transport code.
fn transport_code(error: &reqwest::Error) -> i32 {
    if error.is_timeout() {
        CODE_OPERATION_TIMEDOUT
    } else if error.is_connect() {
        CODE_COULDNT_CONNECT
    } else if error.is_redirect() {
        CODE_TOO_MANY_REDIRECTS
    } else if error.is_builder() {
        CODE_URL_MALFORMAT
    } else {
        CODE_RECV_ERROR
    }
}

fn error_message(error: &reqwest::Error) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn status_line(response: &reqwest::Response) -> String {
    let status = response.status();
    format!(
        "{:?} {} {}",
        response.version(),
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
    .trim_end()
    .to_string()
}

fn stream_header_block(response: &reqwest::Response, sink: &mut (dyn TransferSink + Send), verbose: bool) {
    let line = status_line(response);
    if verbose {
        tracing::debug!(target: "transfer_http::wire", "< {}", line);
    }
    sink.header_line(format!("{}\r\n", line).as_bytes());

    for (name, value) in response.headers() {
        let value = String::from_utf8_lossy(value.as_bytes());
        if verbose {
            tracing::debug!(target: "transfer_http::wire", "< {}: {}", name, value);
        }
        sink.header_line(format!("{}: {}\r\n", name, value).as_bytes());
    }
    sink.header_line(b"\r\n");
}

fn redirect_target(response: &reqwest::Response, current: &Url) -> Option<Url> {
    let location = response.headers().get(reqwest::header::LOCATION)?;
    current.join(location.to_str().ok()?).ok()
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn perform(
        &self,
        request: &WireRequest,
        sink: &mut (dyn TransferSink + Send),
    ) -> TransferReport {
        let started = Instant::now();
        let options = &request.options;
        let verbose = options.verbose.unwrap_or(false);
        let follow = options.follow_redirects.unwrap_or(false);
        let max_redirects = u64::from(options.max_redirects.unwrap_or(self.config.max_redirects));
        let echo = options.echo_request_headers.unwrap_or(false);
        self.warn_unsupported(options);

        let record = |target: &Url, redirects: u64| -> Arc<dyn TransferInfo> {
            Arc::new(RecordedInfo {
                effective_url: Some(target.to_string()),
                total_time: Some(started.elapsed()),
                redirect_count: redirects,
                ..Default::default()
            })
        };

        let mut target = match Url::parse(&request.url) {
            Ok(target) => target,
            Err(e) => {
                return TransferReport::failed(
                    CODE_URL_MALFORMAT,
                    format!("malformed url {:?}: {}", request.url, e),
                    Arc::new(RecordedInfo::default()),
                )
            }
        };
        let client = match self.client_for(options) {
            Ok(client) => client,
            Err(e) => return TransferReport::failed(CODE_FAILED_INIT, error_message(&e), record(&target, 0)),
        };

        let upload_total = request.body.len().map(|len| len as u64);
        let mut method = request.method.clone();
        let mut with_body = true;
        let mut redirects = 0u64;
        let mut echoed = None;

        loop {
            if verbose {
                tracing::debug!(target: "transfer_http::wire", "> {} {}", method, target);
            }
            let builder = match self
                .build_request(&client, &method, &target, request, with_body)
                .await
            {
                Ok(builder) => builder,
                Err((code, message)) => {
                    return TransferReport::failed(code, message, record(&target, redirects))
                }
            };
            if echo {
                echoed = Some(request_header_text(&method, &request.headers, &target));
            }

            let response = match builder.send().await {
                Ok(response) => response,
                Err(e) => {
                    return TransferReport::failed(
                        transport_code(&e),
                        error_message(&e),
                        record(&target, redirects),
                    )
                }
            };
            stream_header_block(&response, sink, verbose);

            let status = response.status();
            if follow && status.is_redirection() {
                if let Some(next) = redirect_target(&response, &target) {
                    if redirects >= max_redirects {
                        return TransferReport::failed(
                            CODE_TOO_MANY_REDIRECTS,
                            format!("maximum ({}) redirects followed", max_redirects),
                            record(&target, redirects),
                        );
                    }
                    redirects += 1;
                    let rewrite_to_get = status == StatusCode::SEE_OTHER
                        || (matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND)
                            && method == Method::POST);
                    if rewrite_to_get {
                        method = Method::GET;
                        with_body = false;
                    }
                    tracing::debug!(from = %target, to = %next, status = status.as_u16(), "following redirect");
                    target = next;
                    continue;
                }
            }

            let download_total = response.content_length();
            let mut stream = response.bytes_stream();
            let mut body = BytesMut::new();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(chunk) => {
                        body.extend_from_slice(&chunk);
                        sink.progress(Progress {
                            download_total,
                            downloaded: body.len() as u64,
                            upload_total,
                            uploaded: upload_total.unwrap_or(0),
                        });
                    }
                    Err(e) => {
                        let mut report =
                            TransferReport::failed(transport_code(&e), error_message(&e), record(&target, redirects));
                        report.status_code = status.as_u16();
                        report.body = body.freeze();
                        report.request_header_text = echoed;
                        return report;
                    }
                }
            }

            tracing::trace!(url = %target, status = status.as_u16(), bytes = body.len(), "transfer finished");
            return TransferReport {
                body: body.freeze(),
                transport_code: CODE_OK,
                transport_message: None,
                status_code: status.as_u16(),
                request_header_text: echoed,
                info: record(&target, redirects),
            };
        }
    }

    fn request_defaults(&self) -> RequestOptions {
        self.config.request_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_cache_reuses_clients() {
        let transport = ReqwestTransport::new().unwrap();
        let options = RequestOptions {
            timeout: Some(Duration::from_secs(3)),
            ..Default::default()
        };
        transport.client_for(&options).unwrap();
        transport.client_for(&options).unwrap();
        assert_eq!(transport.clients.lock().len(), 2);
    }

    #[test]
    fn test_client_cache_is_bounded() {
        let transport = ReqwestTransport::with_config(ClientConfig {
            client_cache_size: 2,
            ..Default::default()
        })
        .unwrap();
        for secs in 1..=4 {
            let options = RequestOptions {
                timeout: Some(Duration::from_secs(secs)),
                ..Default::default()
            };
            transport.client_for(&options).unwrap();
        }
        assert_eq!(transport.clients.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_url_reported() {
        struct NullSink;
        impl TransferSink for NullSink {
            fn header_line(&mut self, line: &[u8]) -> usize {
                line.len()
            }
        }

        let transport = ReqwestTransport::new().unwrap();
        let request = WireRequest {
            method: Method::GET,
            url: "not a url".into(),
            headers: Default::default(),
            body: WireBody::Empty,
            options: RequestOptions::default(),
        };
        let report = transport.perform(&request, &mut NullSink).await;
        assert_eq!(report.transport_code, CODE_URL_MALFORMAT);
        assert!(report.transport_message.unwrap().contains("not a url"));
    }
}
