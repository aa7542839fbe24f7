//! # Error Types
//!
//! This module provides the error types used throughout the recstation crate.
//! It defines a central error type [`RecError`] that encapsulates all possible
//! errors that can occur across the ingest/recording pipeline.

use thiserror::Error;

/// Primary error type for the recstation crate.
#[derive(Error, Debug)]
pub enum RecError {
    /// I/O errors that occur during file or network operations.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Startup configuration failures (missing interface, malformed
    /// duration, unreadable config file). Per spec.md §7 these are fatal.
    #[error("configuration error: {0}")]
    Config(String),

    /// Subprocess supervision failures (failed to create a pipe, failed to
    /// spawn a capture/encode/decode child).
    #[error("process error: {0}")]
    Process(String),

    /// Malformed TS/PAT data. Per spec.md §7 these are never fatal; this
    /// variant exists for the parsers to report why they rejected input,
    /// it is logged and dropped by callers rather than propagated.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Errors surfaced by the HTTP control surface.
    #[error("http error: {0}")]
    Http(String),
}

/// A specialized `Result` type for recstation operations.
pub type Result<T> = std::result::Result<T, RecError>;
