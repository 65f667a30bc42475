//! The allocator's single error type.
//!
//! Mirrors §7's failure kinds as one `thiserror`-derived enum rather than
//! the teacher's `Result<_, &'static str>` convention, so callers can match
//! on failure kind instead of parsing message text.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("invalid allocator configuration: {0}")]
    InvalidConfig(String),

    #[error("backing memory provider exhausted (could not supply a chunk-sized region)")]
    BackingExhausted,

    #[error("requested capacity {requested} exceeds the maximum representable allocation")]
    RequestTooLarge { requested: usize },

    #[error("allocator contract violation: {0}")]
    ContractViolation(&'static str),
}
