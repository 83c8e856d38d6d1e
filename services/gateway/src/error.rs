use thiserror::Error;

/// The typed error surface of the connection fabric. Library code returns
/// `Result<_, GatewayError>` and never panics on reachable input; the binary
/// entry point is the only place that `.expect()`s.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rate limit exceeded for connection {connection_id}")]
    RateLimited { connection_id: String },

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The connection transitioned away from ACTIVE between the time a
    /// caller looked it up and the time it tried to act on it.
    #[error("connection {connection_id} is no longer active")]
    ConnectionClosedRace { connection_id: String },

    #[error("transient I/O error: {0}")]
    TransientIo(#[from] std::io::Error),

    #[error("unexpected error: {0}")]
    Unexpected(String),

    #[error("shutdown already in progress")]
    ShutdownInProgress,

    #[error("connection limit exceeded: {0}")]
    ConnectionLimitExceeded(String),

    /// A registered collaborator callback (shutdown hook, message handler)
    /// panicked or returned an error during a critical phase.
    #[error("critical callback failure: {0}")]
    CriticalCallbackFailure(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;
