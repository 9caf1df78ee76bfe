// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for the streaming pipeline.
//!
//! This module provides the error taxonomy shared by the ingest gateway and
//! the transcode worker. All errors implement `Display` and can be converted
//! to/from `String` for backward compatibility at the wire boundary.

use thiserror::Error;

/// Main error type for pipeline operations.
///
/// This enum categorizes errors into distinct types to enable better error
/// handling, logging, and recovery strategies. Each variant includes a
/// descriptive message.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Protocol violation on the recorder connection.
    ///
    /// Examples:
    /// - Binary frame received before `start`
    /// - Malformed control frame
    /// - Duplicate `start` on an authenticated connection
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Transport-level failure (connection dropped, send failed).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Object storage operation failed.
    ///
    /// Examples:
    /// - Chunk PUT rejected by the backend
    /// - Segment GET timed out after retries
    #[error("Storage error: {0}")]
    Storage(String),

    /// Coordination broker operation failed.
    ///
    /// Examples:
    /// - Log append rejected
    /// - Hash update failed
    /// - Pub/sub connection lost
    #[error("Broker error: {0}")]
    Broker(String),

    /// Muxer child process failure.
    ///
    /// Examples:
    /// - Spawn failed (binary not on PATH)
    /// - Exited with a non-zero status
    /// - Flagged error output on stderr
    #[error("Muxer error: {0}")]
    Muxer(String),

    /// Chunk sequencing failure (gap exceeded tolerance).
    #[error("Sequence error: {0}")]
    Sequence(String),

    /// Stream ownership failure (claim lost or never acquired).
    #[error("Ownership error: {0}")]
    Ownership(String),

    /// I/O error (temp directory, muxer stdin, filesystem polling).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results using `PipelineError`.
pub type Result<T> = std::result::Result<T, PipelineError>;

impl From<PipelineError> for String {
    fn from(err: PipelineError) -> Self {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PipelineError::Protocol("binary frame before start".to_string());
        assert_eq!(err.to_string(), "Protocol error: binary frame before start");

        let err = PipelineError::Muxer("exited with status 1".to_string());
        assert_eq!(err.to_string(), "Muxer error: exited with status 1");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "segment dir missing");
        let err: PipelineError = io_err.into();
        assert!(err.to_string().contains("I/O error"));
        assert!(err.to_string().contains("segment dir missing"));
    }
}
