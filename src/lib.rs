#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

//! # transfer_http: a structured HTTP client over a transfer engine
//!
//! This crate turns raw transfer results into a structured request/response
//! model. It builds request URLs, headers, cookies and bodies, parses and
//! classifies response metadata, decodes bodies by content type and batches
//! many requests through one multiplexed execution context with inherited
//! defaults.
//!
//! ## Overview
//!
//! The crate is layered around a transfer engine seam:
//!
//! 1. **Encoding** - Cookie character sets, bracket form encoding, JSON and multipart bodies
//! 2. **Transport** - The [`transport::Transport`] trait, a `reqwest` engine and a scripted engine
//! 3. **Parsing** - Raw header accumulation, status line selection across redirect chains
//! 4. **Dispatching** - Many concurrent requests with per-request overrides of shared defaults
//!
//! ## Key Features
//!
//! - **Redirect-aware parsing**: the last `HTTP/` block of a redirect chain is authoritative
//! - **Error classification**: transport failures and 4xx/5xx statuses are recorded, never thrown
//! - **Content-type decoding**: JSON and XML families decoded, custom decoders per request
//! - **Deferred properties**: effective URL and total time queried once after completion
//! - **Retries**: exponential backoff on connect failures, timeouts and retryable statuses
//! - **Transport codes**:
//!   - `0` - Transfer completed
//!   - `-1` - Request could not be prepared
//!   - `7` - Could not connect
//!   - `28` - Timed out
//!   - `47` - Too many redirects
//!
//! ## Single Request
//!
//! ```ignore
//! use transfer_http::{Field, Request};
//!
//! #[tokio::main]
//! async fn main() -> transfer_http::Result<()> {
//!     let mut request = Request::with_base_url("https://api.example.com/")?;
//!     request
//!         .set_header("Accept", "application/json")
//!         .set_cookie("session", "abc123")
//!         .set_follow_redirects(true, Some(5));
//!
//!     let query = Field::map([("page", 2)]);
//!     let exchange = request.get("users", Some(&query)).await?;
//!
//!     if exchange.error.is_error() {
//!         eprintln!("{} {:?}", exchange.error.error_code(), exchange.error.error_message());
//!     } else {
//!         println!("{:?}", exchange.response.body().as_json());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Concurrent Requests
//!
//! ```ignore
//! use transfer_http::Dispatcher;
//!
//! #[tokio::main]
//! async fn main() -> transfer_http::Result<()> {
//!     let mut dispatcher = Dispatcher::with_base_url("https://api.example.com/")?;
//!     dispatcher
//!         .set_default_header("Accept", "application/json")
//!         .on_complete(|r| println!("{:?} finished", r.url()));
//!
//!     dispatcher.add_get("users", None)?;
//!     dispatcher.add_get("groups", None)?;
//!
//!     for request in dispatcher.run_to_completion().await {
//!         println!("{} -> {}", request.id(), request.error_code());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Structure
//!
//! - **[types]** - Lifecycle states, responses and error classification
//! - **[error]** - Error types and result handling
//! - **[client]** - Requests, the dispatcher and response parsing
//! - **[codec]** - Content-type driven body decoders
//! - **[protocol]** - Cookie, form and header encoding rules
//! - **[transport]** - Transfer engine abstraction and engines

pub mod client;
pub mod codec;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod types;

pub use client::{ClientConfig, Completions, Dispatcher, DispatcherHandle, Request, RequestOptions};
pub use codec::{Decoded, Decoders};
pub use error::{Error, Result};
pub use protocol::{Body, Field, FileRef, HeaderMap};
pub use transport::{ReqwestTransport, Transport};
pub use types::{ErrorState, Exchange, LifecycleState, Outcome, Response};
