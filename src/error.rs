//! Crate-level error types.
//!
//! [`ChartfeedError`] unifies every error source (configuration, HTTP,
//! WebSocket, JSON, per-request broker failures) behind a single enum so
//! callers can match on the variant they care about while still using the
//! `?` operator for easy propagation.

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ChartfeedError>;

/// Top-level error type returned by all public APIs.
#[derive(Debug, thiserror::Error)]
pub enum ChartfeedError {
    /// Configuration could not be read or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// A WebSocket operation (connect, send, receive) failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// An HTTP request failed at the transport level.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A message from a provider did not have the expected shape.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The realtime handshake (connect/auth acknowledgements) went wrong.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The realtime connection could not be established or was lost.
    #[error("connection error: {0}")]
    Connection(String),

    /// The provider rejected or failed a request.
    #[error("provider error: {0}")]
    Provider(String),

    /// The provider reported quota exhaustion.
    #[error("api rate limit exceeded")]
    RateLimited,

    /// The operation was cancelled by its caller.
    #[error("operation cancelled")]
    Cancelled,

    /// A search matched zero or more than one asset.
    #[error("asset ambiguous or not found: {0}")]
    AmbiguousOrNotFound(String),

    /// A response lacked a field required to answer the request.
    #[error("missing data: {0}")]
    MissingData(String),

    /// The broker does not offer the requested operation.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The symbol already has a live subscription for this data kind.
    #[error("already subscribed to {0}")]
    AlreadySubscribed(String),

    /// The symbol has no live subscription for this data kind.
    #[error("not subscribed to {0}")]
    NotSubscribed(String),

    /// A realtime item could not be delivered and was discarded.
    #[error("realtime data for {0} dropped")]
    Dropped(String),

    /// An external resolution code or label did not name a resolution.
    #[error("unknown candle resolution: {0}")]
    UnknownResolution(String),
}
