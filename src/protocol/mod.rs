//! Wire-level encoding rules shared by requests and responses.
//!
//! # Module Organization
//!
//! ```text
//! protocol/
//! ├── charset - cookie character sets, cookie encoding and Set-Cookie decoding
//! ├── form    - request payload model and body / query encoding
//! └── headers - case-insensitive header map and raw header block parsing
//! ```
//!
//! Nothing in this module performs I/O except the `@path` upload check in
//! [`form::encode_body`], which asks the file system whether a file exists.

pub mod charset;
pub mod form;
pub mod headers;

pub use charset::{
    decode_set_cookie, encode_cookie_name, encode_cookie_value, format_cookie_header,
    scan_set_cookies,
};
pub use form::{encode_body, encode_query, Body, EncodedBody, Field, FileRef, Part, WireBody};
pub use headers::{
    authoritative_block, parse_header_block, HeaderMap, REQUEST_LINE, STATUS_LINE,
};
