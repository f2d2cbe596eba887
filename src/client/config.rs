//! Client configuration and per-request transfer options.
//!
//! [`ClientConfig`] holds process-wide defaults and can be deserialized from
//! any serde format. [`RequestOptions`] holds the options of one request; every
//! field is optional so that request, dispatcher and client defaults can be
//! layered with [`RequestOptions::fill_missing`].
//!
//! # Examples
//!
//! ```
//! use transfer_http::client::{ClientConfig, RequestOptions};
//! use std::time::Duration;
//!
//! let config = ClientConfig {
//!     max_retries: 2,
//!     ..Default::default()
//! };
//!
//! let mut options = RequestOptions {
//!     timeout: Some(Duration::from_secs(5)),
//!     ..Default::default()
//! };
//! options.fill_missing(&config.request_defaults());
//! assert_eq!(options.timeout, Some(Duration::from_secs(5)));
//! assert_eq!(options.retries, Some(2));
//! ```

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default total transfer timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Client-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Total transfer timeout in milliseconds.
    pub timeout_ms: u64,
    /// Connect timeout in milliseconds, engine default when unset.
    pub connect_timeout_ms: Option<u64>,
    /// `User-Agent` sent when a request sets none.
    pub user_agent: String,
    /// Redirect hops followed when redirects are enabled.
    pub max_redirects: u32,
    /// Retries of a failed exchange.
    pub max_retries: u32,
    /// Base delay between retries in milliseconds, doubled per attempt.
    pub retry_delay_ms: u64,
    /// Number of differently configured engine clients kept alive.
    pub client_cache_size: usize,
    /// Log retries and per-exchange failures.
    pub enable_logging: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            timeout_ms: DEFAULT_TIMEOUT_SECS * 1000,
            connect_timeout_ms: None,
            user_agent: concat!("transfer_http/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 10,
            max_retries: 0,
            retry_delay_ms: 500,
            client_cache_size: 16,
            enable_logging: true,
        }
    }
}

impl ClientConfig {
    /// Parse a configuration from JSON; missing fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Request options seeded from this configuration.
    pub fn request_defaults(&self) -> RequestOptions {
        RequestOptions {
            timeout: Some(Duration::from_millis(self.timeout_ms)),
            connect_timeout: self.connect_timeout_ms.map(Duration::from_millis),
            user_agent: Some(self.user_agent.clone()),
            max_redirects: Some(self.max_redirects),
            retries: Some(self.max_retries),
            retry_delay: Some(Duration::from_millis(self.retry_delay_ms)),
            ..Default::default()
        }
    }
}

/// Credentials sent with a request.
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    /// HTTP Basic authentication.
    Basic {
        /// User name.
        username: String,
        /// Password.
        password: String,
    },
    /// HTTP Digest authentication.
    Digest {
        /// User name.
        username: String,
        /// Password.
        password: String,
    },
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (scheme, username) = match self {
            Auth::Basic { username, .. } => ("Basic", username),
            Auth::Digest { username, .. } => ("Digest", username),
        };
        f.debug_struct(scheme)
            .field("username", username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Transfer options of one request. Unset fields fall back to dispatcher and
/// client defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    /// Request method.
    pub method: Option<http::Method>,
    /// Total transfer timeout.
    pub timeout: Option<Duration>,
    /// Connect timeout.
    pub connect_timeout: Option<Duration>,
    /// `User-Agent` header value.
    pub user_agent: Option<String>,
    /// File to read cookies from before sending.
    pub cookie_file: Option<PathBuf>,
    /// File to write cookies to after the exchange.
    pub cookie_jar: Option<PathBuf>,
    /// Credentials.
    pub auth: Option<Auth>,
    /// Trace the transfer in detail.
    pub verbose: Option<bool>,
    /// Ask the engine to echo the request header block it sent.
    pub echo_request_headers: Option<bool>,
    /// Follow `Location` redirects.
    pub follow_redirects: Option<bool>,
    /// Redirect hops followed at most.
    pub max_redirects: Option<u32>,
    /// Retries of a failed exchange.
    pub retries: Option<u32>,
    /// Base delay between retries.
    pub retry_delay: Option<Duration>,
}

macro_rules! fill_fields {
    ($target:expr, $source:expr, $($field:ident),+ $(,)?) => {
        $(
            if $target.$field.is_none() {
                $target.$field = $source.$field.clone();
            }
        )+
    };
}

impl RequestOptions {
    /// Copy every field of `other` that is unset here.
    pub fn fill_missing(&mut self, other: &RequestOptions) {
        fill_fields!(
            self,
            other,
            method,
            timeout,
            connect_timeout,
            user_agent,
            cookie_file,
            cookie_jar,
            auth,
            verbose,
            echo_request_headers,
            follow_redirects,
            max_redirects,
            retries,
            retry_delay,
        );
    }

    /// Check for option combinations that will not behave as intended.
    ///
    /// Every warning is logged; none of them stops the request.
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.timeout == Some(Duration::ZERO) {
            warnings.push(ConfigWarning::ZeroTimeout);
        }
        if self.connect_timeout == Some(Duration::ZERO) {
            warnings.push(ConfigWarning::ZeroConnectTimeout);
        }
        if let (Some(connect), Some(total)) = (self.connect_timeout, self.timeout) {
            if connect > total && !total.is_zero() {
                warnings.push(ConfigWarning::ConnectExceedsTotal { connect, total });
            }
        }
        if self.user_agent.as_deref().is_some_and(|agent| agent.trim().is_empty()) {
            warnings.push(ConfigWarning::EmptyUserAgent);
        }
        if let Some(path) = &self.cookie_file {
            if !path.is_file() {
                warnings.push(ConfigWarning::MissingCookieFile(path.display().to_string()));
            }
        }

        for warning in &warnings {
            tracing::warn!(%warning, "request configuration");
        }
        warnings
    }
}

/// A configuration problem that is reported but never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigWarning {
    /// A zero total timeout.
    #[error("timeout is zero")]
    ZeroTimeout,
    /// A zero connect timeout.
    #[error("connect timeout is zero")]
    ZeroConnectTimeout,
    /// The connect timeout can never be reached.
    #[error("connect timeout {connect:?} exceeds total timeout {total:?}")]
    ConnectExceedsTotal {
        /// Connect timeout.
        connect: Duration,
        /// Total timeout.
        total: Duration,
    },
    /// An empty `User-Agent`.
    #[error("user agent is empty")]
    EmptyUserAgent,
    /// The cookie file to read does not exist.
    #[error("cookie file {0} does not exist")]
    MissingCookieFile(String),
    /// The engine ignores this option.
    #[error("{0} is not supported by this transport and is ignored")]
    Unsupported(&'static str),
}
