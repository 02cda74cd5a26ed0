use thiserror::Error;

/// Application-wide error types for LeadHound.
#[derive(Error, Debug)]
pub enum AppError {
    /// Relay or transport failure (tunnel, refused, reset, DNS, ...).
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// A single bounded operation exceeded its timeout.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Navigation failed for a reason unrelated to the transport.
    #[error("Navigation error: {0}")]
    Navigation(String),

    /// Extraction routine failed to produce a record.
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// The target demands interactive credentials.
    #[error("Authentication required: {0}")]
    AuthRequired(String),

    /// No relay could be acquired and direct mode is not allowed.
    #[error("Relay pool exhausted and direct mode is disabled")]
    PoolExhausted,

    /// User-requested cancellation.
    #[error("Cancelled")]
    Cancelled,

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Saving results failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

/// Routing class of an error, used to decide between rotate, count and fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connectivity,
    Timeout,
    Extraction,
    AuthRequired,
    PoolExhausted,
    Cancelled,
    Fatal,
}

/// Message fragments that identify relay/transport failures in error strings
/// reported by collaborators without structured error kinds.
///
/// Matched case-insensitively.
pub const CONNECTIVITY_SIGNATURES: &[&str] = &[
    "err_proxy_connection_failed",
    "err_tunnel_connection_failed",
    "tunnel",
    "err_socks_connection_failed",
    "err_connection_refused",
    "econnrefused",
    "connection refused",
    "err_connection_reset",
    "econnreset",
    "connection reset",
    "err_connection_closed",
    "err_connection_timed_out",
    "etimedout",
    "err_timed_out",
    "err_name_not_resolved",
    "enotfound",
    "eai_again",
    "socket hang up",
    "net::err_",
];

/// Returns true if the message matches a known connectivity-failure signature.
pub fn is_connectivity_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    CONNECTIVITY_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

impl AppError {
    /// Builds a tagged error from an untyped transport message.
    ///
    /// Collaborators that only expose error strings go through here so the
    /// rest of the engine routes on [`ErrorKind`] rather than on text.
    pub fn from_transport(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_connectivity_message(&message) {
            AppError::Connectivity(message)
        } else {
            AppError::Navigation(message)
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Connectivity(_) => ErrorKind::Connectivity,
            AppError::Timeout(msg) => {
                if is_connectivity_message(msg) {
                    ErrorKind::Connectivity
                } else {
                    ErrorKind::Timeout
                }
            }
            AppError::Navigation(_) | AppError::Extraction(_) | AppError::SerializationError(_) => {
                ErrorKind::Extraction
            }
            AppError::AuthRequired(_) => ErrorKind::AuthRequired,
            AppError::PoolExhausted => ErrorKind::PoolExhausted,
            AppError::Cancelled => ErrorKind::Cancelled,
            AppError::ConfigError(_) | AppError::Persistence(_) | AppError::Generic(_) => {
                ErrorKind::Fatal
            }
        }
    }

    /// Returns true if this error should trigger relay rotation.
    pub fn is_connectivity(&self) -> bool {
        self.kind() == ErrorKind::Connectivity
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }
}
