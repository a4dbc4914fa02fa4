//! Consumer error types and processing error categorization
//!
//! Two families of errors live here:
//! - [`ConsumerError`]: lifecycle failures of the manager, pool and workers
//! - [`ProcessingError`]: failures returned by a [`DeliveryProcessor`](crate::DeliveryProcessor),
//!   categorized to decide how a delivery is acknowledged

use thiserror::Error;

/// Category of a processing failure, used to pick the acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure - reject with requeue
    Transient,
    /// Unrecoverable failure - reject without requeue (dead-lettered if a DLX is set)
    Permanent,
    /// Downstream rate limit hit - reject with requeue
    RateLimited,
}

impl ErrorCategory {
    /// Whether a delivery failing with this category goes back on the queue.
    pub fn requeue(&self) -> bool {
        match self {
            ErrorCategory::Transient => true,
            ErrorCategory::Permanent => false,
            ErrorCategory::RateLimited => true,
        }
    }

    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::RateLimited => "rate_limited",
        }
    }
}

/// Lifecycle errors raised by the consumer manager and its workers.
#[derive(Error, Debug, Clone)]
pub enum ConsumerError {
    /// Static misconfiguration, fatal and never retried
    #[error("Configuration error: {0}")]
    Config(String),

    /// Broker unreachable or connection handshake rejected
    #[error("Connect failure: {0}")]
    Connect(String),

    /// Channel could not be opened, declared, bound or consumed after connecting
    #[error("Start failure: {0}")]
    Start(String),

    /// Graceful worker shutdown exceeded its bound
    #[error("Worker {worker} did not stop within {timeout_ms}ms")]
    StopTimeout { worker: String, timeout_ms: u64 },

    /// Operation on an established channel failed (ack, reject, cancel, close)
    #[error("Channel error: {0}")]
    Channel(String),
}

impl ConsumerError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        ConsumerError::Config(message.into())
    }

    /// Create a connect failure
    pub fn connect(message: impl Into<String>) -> Self {
        ConsumerError::Connect(message.into())
    }

    /// Create a start failure
    pub fn start(message: impl Into<String>) -> Self {
        ConsumerError::Start(message.into())
    }

    /// Create a channel error
    pub fn channel(message: impl Into<String>) -> Self {
        ConsumerError::Channel(message.into())
    }

    /// Whether the reconnect supervisor should keep retrying after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConsumerError::Connect(_) | ConsumerError::Start(_) | ConsumerError::Channel(_)
        )
    }

    /// Whether this is a worker stop timeout.
    pub fn is_stop_timeout(&self) -> bool {
        matches!(self, ConsumerError::StopTimeout { .. })
    }
}

/// Error returned by a delivery processor.
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// Temporary failure (downstream unavailable, timeout)
    #[error("transient error: {0}")]
    Transient(String),

    /// Permanent failure (invalid payload, business rule violation)
    #[error("permanent error: {0}")]
    Permanent(String),

    /// Downstream service rate limited the processor
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Payload could not be decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProcessingError {
    /// Create a transient error
    pub fn transient(message: impl Into<String>) -> Self {
        ProcessingError::Transient(message.into())
    }

    /// Create a permanent error
    pub fn permanent(message: impl Into<String>) -> Self {
        ProcessingError::Permanent(message.into())
    }

    /// Create a rate limited error
    pub fn rate_limited(message: impl Into<String>) -> Self {
        ProcessingError::RateLimited(message.into())
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProcessingError::Transient(_) => ErrorCategory::Transient,
            ProcessingError::Permanent(_) => ErrorCategory::Permanent,
            ProcessingError::RateLimited(_) => ErrorCategory::RateLimited,
            ProcessingError::Serialization(_) => ErrorCategory::Permanent,
        }
    }
}
