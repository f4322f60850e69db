use rust_decimal::Decimal;
use serde::Serialize;
use std::time::Duration;

/// Crate-wide error taxonomy.
///
/// Local failures (`ValidationError`, `StateConflict`, `OverReceive`,
/// `QuantityMismatch`, `NotFound`) are detected before any remote write.
/// Remote failures carry whatever the inventory API reported.
#[derive(Debug, Clone, thiserror::Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Validation failed: {}", .0.join("; "))]
    ValidationErrors(Vec<String>),

    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error(
        "Over-receive rejected for product {product_id}: ordered {ordered}, already received {already_received}, requested {requested}"
    )]
    OverReceive {
        product_id: i64,
        ordered: Decimal,
        already_received: Decimal,
        requested: Decimal,
    },

    #[error("Quantity mismatch: {serials} serial numbers supplied for quantity {quantity}")]
    QuantityMismatch { quantity: Decimal, serials: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Remote API error (status {status}, code {}): {message}", .code.as_deref().unwrap_or("none"))]
    RemoteApi {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Version conflict: {message}")]
    VersionConflict {
        code: Option<String>,
        message: String,
    },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<ServiceError>,
    },

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ServiceError {
    /// Retry classification: 5xx, 429, and failures where no response arrived.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RemoteApi { status, .. } => *status >= 500 || *status == 429,
            Self::Transport(_) | Self::Timeout(_) => true,
            _ => false,
        }
    }

    /// The remote HTTP status behind this error, if one was received.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::RemoteApi { status, .. } => Some(*status),
            Self::VersionConflict { .. } => Some(409),
            Self::RetryExhausted { last, .. } => last.status_code(),
            _ => None,
        }
    }

    /// Stable machine-readable name of the error category.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ValidationError(_) | Self::ValidationErrors(_) => "validation_error",
            Self::StateConflict(_) => "state_conflict_error",
            Self::OverReceive { .. } => "over_receive_error",
            Self::QuantityMismatch { .. } => "quantity_mismatch_error",
            Self::NotFound(_) => "not_found_error",
            Self::RemoteApi { .. } => "remote_api_error",
            Self::VersionConflict { .. } => "version_conflict_error",
            Self::Timeout(_) => "timeout_error",
            Self::Transport(_) => "transport_error",
            Self::RetryExhausted { .. } => "retry_exhausted_error",
            Self::SerializationError(_) => "serialization_error",
            Self::ConfigError(_) => "config_error",
        }
    }

    /// Collapses a batch of collected failures into one error.
    ///
    /// A single failure is returned as-is so callers can match on its variant.
    pub fn from_failures(mut failures: Vec<ServiceError>) -> Self {
        if failures.len() == 1 {
            return failures.remove(0);
        }
        Self::ValidationErrors(failures.iter().map(ToString::to_string).collect())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}
