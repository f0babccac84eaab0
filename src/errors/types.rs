//! Error type definitions for Olla.
//!
//! This module defines all error types used throughout the dataplane,
//! providing a hierarchical error system that makes debugging and error
//! handling more straightforward.

use std::time::Duration;
use thiserror::Error;

/// Top-level dataplane error type.
///
/// Each variant corresponds to one of the Kinds in the error-handling
/// design: a disposition (HTTP status, retry or not) is attached to the
/// variant itself so callers at the edge don't have to re-derive it.
#[derive(Error, Debug)]
pub enum OllaError {
    /// No endpoints reported healthy by discovery.
    #[error("no healthy endpoints available")]
    NoHealthyEndpoints,

    /// Every healthy endpoint's breaker is open.
    #[error("all endpoints unavailable (circuit breakers open)")]
    AllEndpointsUnavailable,

    /// Dispatch-level errors (connection, backend, streaming).
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Admission-chain rejection (rate limit or size limit).
    #[error("admission rejected: {0}")]
    Admission(#[from] AdmissionError),

    /// A handler-level panic was caught and converted to a 500.
    #[error("internal panic recovered: {message}")]
    PanicRecovered { message: String },

    /// Configuration could not be loaded or was invalid.
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl OllaError {
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

/// Errors that can occur while dispatching a request to an upstream endpoint.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// DNS failure, connection refused/reset, or a timeout before the first
    /// response byte. Retryable on the next endpoint if the body hasn't been
    /// streamed yet.
    #[error("connection error to {endpoint} after {elapsed:?}: {message}")]
    Connection {
        endpoint: String,
        elapsed: Duration,
        message: String,
    },

    /// A read/write failure after the response had already started streaming
    /// to the client. Never retried — the client is already receiving bytes.
    #[error("stream error during {phase} after {elapsed:?}: {message}")]
    Stream {
        phase: &'static str,
        elapsed: Duration,
        message: String,
    },

    /// The per-read deadline fired with no data arriving in time.
    #[error("read timeout waiting on {endpoint} after {elapsed:?}")]
    ReadTimeout { endpoint: String, elapsed: Duration },
}

impl DispatchError {
    /// True for the connection-class errors the retry policy is allowed to
    /// advance past to the next endpoint.
    pub fn is_retryable_connection_error(&self) -> bool {
        matches!(self, DispatchError::Connection { .. })
    }
}

/// Errors raised by the admission chain (rate limiting, size validation).
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u64, max: u64 },

    #[error("headers too large: {size} bytes (max {max})")]
    HeadersTooLarge { size: u64, max: u64 },
}
