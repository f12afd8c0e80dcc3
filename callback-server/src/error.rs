//! Error types for the callback server.

use std::net::SocketAddr;
use std::time::Duration;

use crate::event::EventKind;

/// Errors surfaced by server construction and lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Invalid options were supplied to the builder
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The listening socket could not be opened
    #[error("Failed to bind callback server to {addr}: {source}")]
    Bind {
        /// The address that was requested
        addr: SocketAddr,
        /// The underlying I/O failure
        #[source]
        source: std::io::Error,
    },

    /// Bind confirmation did not arrive before the startup timeout
    #[error("Callback server startup timed out after {0:?}")]
    StartupTimeout(Duration),

    /// The serving task ended before confirming startup
    #[error("Callback server failed to start: {0}")]
    Startup(String),

    /// `start` was called while the server was already serving
    #[error("Callback server is already running")]
    AlreadyRunning,

    /// `start` was called after the server had been stopped
    #[error("Callback server has been stopped and cannot be restarted")]
    AlreadyStopped,
}

/// Reasons an inbound request could not be turned into an envelope.
///
/// These never escape a request: the dispatcher answers them with a 400.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassificationError {
    /// The body is neither a form nor a JSON object
    #[error("Malformed callback body: {0}")]
    MalformedBody(String),

    /// The `type` field is absent or empty
    #[error("Callback is missing the `type` discriminator")]
    MissingDiscriminator,

    /// The `type` field names no known event kind
    #[error("Unknown callback type: {0}")]
    UnknownDiscriminator(String),

    /// The `data` field does not match the kind's schema
    #[error("Failed to decode {kind} payload: {message}")]
    Decode {
        /// The kind the discriminator selected
        kind: EventKind,
        /// Decoder message
        message: String,
    },
}

/// Failure reported by a processor.
///
/// The dispatcher answers these with a 500; the server keeps running.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    /// The processor rejected or could not handle the event
    #[error("Processor failed: {0}")]
    Failed(String),

    /// A downstream dependency of the processor is unavailable
    #[error("Processor unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised while tearing the listener down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShutdownError {
    /// In-flight requests did not drain within the grace period
    #[error("Graceful shutdown did not finish within {0:?}")]
    GracePeriodElapsed(Duration),

    /// The listener or its connections could not be torn down
    #[error("Forced close failed: {0}")]
    ForcedClose(String),
}

/// Convenience type alias for Results using ServerError.
pub type Result<T> = std::result::Result<T, ServerError>;
