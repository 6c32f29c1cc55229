use http::StatusCode;
use serde::Serialize;

/// Generic prompt shown when the provider gave us nothing better to say.
pub const GENERIC_RETRY_MESSAGE: &str = "Something went wrong. Please try again.";

/// How loudly an error has to be surfaced to the shopper and the operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Rejected locally, nothing left the process.
    Recoverable,
    /// Remote call failed; the shopper may retry.
    Degraded,
    /// Money may have moved without the order reflecting it.
    Critical,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("{0} is already in progress")]
    ConcurrencyError(String),

    #[error("Transport error: {message}")]
    TransportError { message: String, timeout: bool },

    #[error("Provider error ({status}): {message}")]
    ProviderError { status: u16, message: String },

    #[error("Order {order_id} was not updated after payment: {message}")]
    ReconciliationError { order_id: String, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Circuit breaker open")]
    CircuitBreakerOpen,

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return ServiceError::ProviderError {
                status: status.as_u16(),
                message: err.to_string(),
            };
        }
        ServiceError::TransportError {
            message: err.to_string(),
            timeout: err.is_timeout(),
        }
    }
}

impl ServiceError {
    pub fn transport(message: impl Into<String>) -> Self {
        ServiceError::TransportError {
            message: message.into(),
            timeout: false,
        }
    }

    pub fn provider(status: u16, message: impl Into<String>) -> Self {
        ServiceError::ProviderError {
            status,
            message: message.into(),
        }
    }

    /// Whether a retry of the same request could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransportError { .. } | Self::CircuitBreakerOpen => true,
            Self::ProviderError { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
                    || *status >= StatusCode::INTERNAL_SERVER_ERROR.as_u16()
            }
            _ => false,
        }
    }

    /// Errors that never reached the network.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::ValidationError(_) | Self::ConcurrencyError(_) | Self::NotFound(_)
        )
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::ReconciliationError { .. } => Severity::Critical,
            Self::TransportError { .. }
            | Self::ProviderError { .. }
            | Self::CircuitBreakerOpen
            | Self::StorageError(_)
            | Self::SerializationError(_)
            | Self::Other(_) => Severity::Degraded,
            Self::ValidationError(_) | Self::ConcurrencyError(_) | Self::NotFound(_) => {
                Severity::Recoverable
            }
        }
    }

    /// Rough ranking used when two attempts failed and only one error can be
    /// returned: provider text beats a bare transport failure.
    pub(crate) fn informativeness(&self) -> u8 {
        match self {
            Self::ProviderError { message, .. } if !message.trim().is_empty() => 3,
            Self::ProviderError { .. } => 2,
            Self::TransportError { .. } => 1,
            _ => 0,
        }
    }

    /// Message suitable for a shopper-facing notification.
    /// Provider text is preserved; internal failures get a generic prompt.
    pub fn user_message(&self) -> String {
        match self {
            Self::ValidationError(msg) => msg.clone(),
            Self::ConcurrencyError(_) => self.to_string(),
            Self::ProviderError { message, .. } if !message.trim().is_empty() => message.clone(),
            Self::NotFound(msg) => msg.clone(),
            Self::ReconciliationError { order_id, .. } => format!(
                "Your payment was received but order {} could not be updated. Our team has been notified.",
                order_id
            ),
            Self::TransportError { timeout: true, .. } => {
                "The request timed out. Please check your connection and try again.".to_string()
            }
            _ => GENERIC_RETRY_MESSAGE.to_string(),
        }
    }
}
