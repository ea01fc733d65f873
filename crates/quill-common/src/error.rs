//! Error types for Quill
//!
//! This module defines the common error type used by the storage engine,
//! the typed codec layer and the command line tool.

use thiserror::Error;

/// Common result type for Quill operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Quill
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("torn record at offset {offset}: {reason}")]
    TornRecord { offset: u64, reason: String },

    #[error("corrupt record at offset {offset}: {reason}")]
    CorruptRecord { offset: u64, reason: String },

    #[error("durable flush failed: {0}")]
    FlushFailed(String),

    #[error("storage error: {0}")]
    Storage(String),

    // Engine state errors
    #[error("engine corrupted, refusing operation: {0}")]
    EngineCorrupted(String),

    #[error("engine is closed")]
    Closed,

    #[error("{} error(s) during teardown: {}", .0.len(), join_errors(.0))]
    Teardown(Vec<Error>),

    // Codec errors
    #[error("unknown type tag: {0}")]
    UnknownType(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a corrupt record error
    pub fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        Self::CorruptRecord {
            offset,
            reason: reason.into(),
        }
    }

    /// Check if this error reports damaged on-disk data
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::TornRecord { .. } | Self::CorruptRecord { .. })
    }

    /// Check if this error comes from a terminal engine state
    #[must_use]
    pub fn is_terminal_state(&self) -> bool {
        matches!(self, Self::EngineCorrupted(_) | Self::Closed)
    }
}

/// Runs teardown steps and keeps every failure instead of stopping at the first.
#[derive(Debug, Default)]
pub struct ErrorAggregator {
    errors: Vec<Error>,
}

impl ErrorAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `step`, recording its error if it fails
    pub fn execute(&mut self, step: impl FnOnce() -> Result<()>) {
        if let Err(e) = step() {
            self.errors.push(e);
        }
    }

    /// Record an error produced elsewhere
    pub fn push(&mut self, error: Error) {
        self.errors.push(error);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// `Ok` if nothing failed, otherwise every collected error at once
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown(self.errors))
        }
    }
}
