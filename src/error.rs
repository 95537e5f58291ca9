//! Unified store error model.
//! Internal plumbing uses `anyhow` with context; this module defines the
//! typed surface callers of [`crate::store::DurableStore`] branch on.
//! Expected racy outcomes are NOT errors: a tag mismatch at read returns
//! `None`, and handle exhaustion returns an invalid NodeId from `allocate`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// CRC mismatch, bad magic, or a truncated frame. `last_good_offset`
    /// names the byte offset up to which the file verified cleanly.
    #[error("integrity failure in {file}: {detail} (last good offset {last_good_offset})")]
    Integrity {
        file: String,
        detail: String,
        last_good_offset: u64,
    },

    /// No free handle or no segment space in the requested class.
    #[error("resource exhausted: {0}")]
    Exhausted(String),

    /// An operation was attempted against a handle in the wrong lifecycle
    /// state (e.g. committing a slot that was never reserved).
    #[error("invalid state transition: {0}")]
    InvalidState(String),

    /// A commit epoch moved backwards.
    #[error("non-monotonic epoch: current {current}, proposed {proposed}")]
    EpochRegression { current: u64, proposed: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
