//! HTTP client built on a pluggable transfer engine.
//!
//! This module provides the request/response model of the crate:
//!
//! - **Configure requests** with URL, query, headers, cookies, body and options
//! - **Execute one exchange** with [`Request::exec`] or the verb helpers
//! - **Parse responses** into headers, cookies and a decoded body
//! - **Classify failures** as transport or HTTP errors without returning `Err`
//! - **Batch many requests** through one [`Dispatcher`] with shared defaults
//! - **Automatically retry** failed exchanges with exponential backoff
//!
//! # Module Organization
//!
//! ```text
//! client/
//! ├── config     - ClientConfig, RequestOptions and configuration warnings
//! ├── dispatcher - Dispatcher, handles and the completion stream
//! ├── parser     - Raw header accumulation and response classification
//! ├── request    - Request lifecycle, verb helpers and callbacks
//! └── utils      - Retry and backoff helpers
//! ```
//!
//! # Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Request`] | One HTTP exchange and its lifecycle |
//! | [`Dispatcher`] | Concurrent multi-request execution with defaults |
//! | [`Completions`] | Stream of finished requests |
//! | [`ResponseParser`] | Header stream accumulator and exchange builder |
//! | [`ClientConfig`] | Client configuration options |
//! | [`RequestOptions`] | Per-request transfer options |
//!
//! # Examples
//!
//! ## Configuring a Client
//!
//! ```
//! use transfer_http::client::ClientConfig;
//!
//! let config = ClientConfig {
//!     max_retries: 3,
//!     retry_delay_ms: 250,
//!     ..Default::default()
//! };
//! assert_eq!(config.request_defaults().retries, Some(3));
//! ```
//!
//! ## Scripted Exchange
//!
//! ```
//! use transfer_http::client::Request;
//! use transfer_http::transport::{ScriptedExchange, StaticTransport};
//! use std::sync::Arc;
//!
//! let transport = Arc::new(StaticTransport::new());
//! transport.push(ScriptedExchange::new(404));
//!
//! let mut request = Request::with_transport(transport);
//! tokio_test::block_on(async {
//!     request.get("http://example.com/missing", None).await.unwrap();
//! });
//! assert!(request.is_error());
//! assert_eq!(request.error_code(), 404);
//! ```
//!
//! ## Utility Functions
//!
//! ```
//! use transfer_http::client::{exponential_backoff, is_retryable_status};
//! use std::time::Duration;
//!
//! assert!(is_retryable_status(503));
//! assert!(!is_retryable_status(404));
//! assert_eq!(exponential_backoff(2, 100), Duration::from_millis(400));
//! ```

mod config;
mod dispatcher;
mod parser;
mod request;
mod utils;

pub use config::{Auth, ClientConfig, ConfigWarning, RequestOptions, DEFAULT_TIMEOUT_SECS};
pub use dispatcher::{Completions, Defaults, Dispatcher, DispatcherHandle};
pub use parser::ResponseParser;
pub use request::{BeforeSend, Callbacks, Hook, ProgressCallback, Request};
pub use utils::*;
