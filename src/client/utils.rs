//! Retry helpers shared by standalone and dispatched exchanges.
//!
//! An exchange is retried when the engine reports a transient network
//! failure, or when it completed with a status the server expects clients to
//! retry. Delays grow as `base * 2^attempt`.

use crate::transport::{CODE_COULDNT_CONNECT, CODE_OPERATION_TIMEDOUT, CODE_RECV_ERROR};
use std::time::Duration;

/// Whether a completed exchange with `status` is worth repeating.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429 | 502 | 503 | 504)
}

/// Whether the transport `code` describes a transient network failure.
pub fn is_retryable_transport_code(code: i32) -> bool {
    matches!(
        code,
        CODE_COULDNT_CONNECT | CODE_OPERATION_TIMEDOUT | CODE_RECV_ERROR
    )
}

/// Delay before retry number `attempt` (zero based).
///
/// The exponent stops growing after ten doublings.
pub fn exponential_backoff(attempt: u32, base_ms: u64) -> Duration {
    let factor = 1_u64 << attempt.min(10);
    Duration::from_millis(base_ms.saturating_mul(factor))
}
