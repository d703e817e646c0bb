//! Error type definitions for the tuner bridge
//!
//! This module defines all error types used throughout the application,
//! providing a hierarchical error system that makes debugging and error
//! handling more straightforward.

use thiserror::Error;

/// Top-level application error type
///
/// This enum represents all possible errors that can occur in the application.
/// It uses `thiserror` to provide automatic error trait implementations and
/// proper error chaining.
#[derive(Error, Debug)]
pub enum AppError {
    /// Admission control rejections on the stream path
    #[error("Admission rejected: {0}")]
    Admission(#[from] AdmissionError),

    /// Stream analysis failures
    #[error("Analyzer error: {0}")]
    Analyzer(#[from] AnalyzerError),

    /// Encoder process failures
    #[error("Transcoder error: {0}")]
    Transcoder(#[from] TranscoderError),

    /// Web layer errors
    #[error("Web error: {0}")]
    Web(#[from] WebError),

    /// Resource not found errors
    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Admission rejections. These map to 4xx/503 responses and never create
/// any session state.
#[derive(Error, Debug, Clone)]
pub enum AdmissionError {
    /// The process-wide concurrent stream budget is exhausted
    #[error("Concurrent stream limit reached: {current}/{max}")]
    GlobalLimit { current: u32, max: u32 },

    /// Per-channel concurrent stream budget is exhausted
    #[error("Channel {channel_id} stream limit reached: {current}/{max}")]
    ChannelLimit {
        channel_id: String,
        current: u32,
        max: u32,
    },

    /// The same client already holds a session on this channel
    #[error("Client already streaming channel {channel_id} in session {session_id}")]
    DuplicateClient {
        channel_id: String,
        session_id: String,
    },

    /// The channel exists but has no enabled stream
    #[error("Channel {channel_id} has no enabled stream")]
    NoEnabledStream { channel_id: String },
}

/// Stream analysis failures. Most are softened into a conservative handling
/// profile rather than failing the request.
#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Playlist fetch exceeded size limit ({limit} bytes)")]
    SizeLimit { limit: usize },

    #[error("Timeout while probing upstream")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(String),
}

/// Encoder process failures
#[derive(Error, Debug)]
pub enum TranscoderError {
    /// Process could not be spawned at all
    #[error("Failed to spawn encoder: {0}")]
    SpawnFailed(String),

    /// Process exited non-zero before producing any output
    #[error("Encoder exited with {status} before producing output")]
    FailedBeforeOutput { status: i32 },

    /// Stdout pipe was unavailable on the spawned child
    #[error("Encoder stdout pipe missing")]
    MissingStdout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Web layer specific errors
#[derive(Error, Debug)]
pub enum WebError {
    /// Invalid request format
    #[error("Invalid request: {field} - {message}")]
    InvalidRequest { field: String, message: String },

    /// A session id was presented by a different client than the one that
    /// created it
    #[error("Session {session_id} belongs to a different client")]
    SessionIpMismatch { session_id: String },

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    /// Create a not-found error
    pub fn not_found<R: Into<String>, I: Into<String>>(resource: R, id: I) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
