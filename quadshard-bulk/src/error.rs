//! Pipeline-wide error type.
//!
//! Four categories, mirroring the operational error model:
//! soft parse errors ([`BulkError::Parse`], counted and skipped when
//! `ignore_errors` is set), configuration errors (reported and exit 1),
//! transient allocator RPC errors (retried inside the client, never surfaced
//! here), and everything else — which is fatal.

use std::io;

pub type Result<T> = std::result::Result<T, BulkError>;

#[derive(Debug, thiserror::Error)]
pub enum BulkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// A malformed input record. The only recoverable variant: mappers count
    /// these and continue unless `ignore_errors` is off.
    #[error("illegal record: {0}")]
    Parse(String),

    /// A spill record that could not be decoded. Always fatal.
    #[error("corrupt spill record: {0}")]
    Corrupt(String),

    /// An encoding-size or ordering inconsistency detected while building
    /// output batches. Always fatal.
    #[error("encoding inconsistency: {0}")]
    Encoding(String),
}

impl BulkError {
    /// True for errors a mapper may count and skip under `ignore_errors`.
    pub fn is_soft(&self) -> bool {
        matches!(self, BulkError::Parse(_))
    }
}
