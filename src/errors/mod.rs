//! Centralized error handling for the tuner bridge
//!
//! This module provides a layered error system that unifies error types
//! across the streaming core and keeps HTTP mapping decisions in one place.
//!
//! # Error Categories
//!
//! - **Admission Errors**: limit breaches and duplicate-client rejections
//! - **Analyzer Errors**: upstream probe and playlist fetch failures
//! - **Transcoder Errors**: encoder spawn and lifetime failures
//! - **Web Errors**: HTTP request/response handling issues

pub mod types;

pub use types::*;

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Convenience type alias for Analyzer Results
pub type AnalyzerResult<T> = Result<T, AnalyzerError>;

/// Convenience type alias for Transcoder Results
pub type TranscoderResult<T> = Result<T, TranscoderError>;
