use crate::domain::payment_request::PaymentState;
use std::fmt;

#[derive(Debug)]
pub enum PaymentError {
    InvalidRequest(String),
    DuplicatePendingRequest {
        order_reference: String,
        correlation_id: String,
    },
    ProviderUnavailable(String),
    MalformedCallback(String),
    UnknownCorrelation(String),
    ConflictingCallback {
        correlation_id: String,
        recorded: PaymentState,
        reported_success: bool,
    },
    AlreadyTerminal {
        correlation_id: String,
        state: PaymentState,
    },
    IoError(std::io::Error),
    JsonError(serde_json::Error),
}

impl fmt::Display for PaymentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentError::InvalidRequest(msg) => write!(f, "Invalid payment request: {}", msg),
            PaymentError::DuplicatePendingRequest {
                order_reference,
                correlation_id,
            } => write!(
                f,
                "Order {} already has a pending payment request {}",
                order_reference, correlation_id
            ),
            PaymentError::ProviderUnavailable(msg) => {
                write!(f, "Payment provider unavailable: {}", msg)
            }
            PaymentError::MalformedCallback(msg) => write!(f, "Malformed callback: {}", msg),
            PaymentError::UnknownCorrelation(id) => {
                write!(f, "No payment request matches correlation id {}", id)
            }
            PaymentError::ConflictingCallback {
                correlation_id,
                recorded,
                reported_success,
            } => write!(
                f,
                "Conflicting callback for {}: recorded {:?}, provider now reports {}",
                correlation_id,
                recorded,
                if *reported_success { "success" } else { "failure" }
            ),
            PaymentError::AlreadyTerminal {
                correlation_id,
                state,
            } => write!(
                f,
                "Payment request {} is already terminal ({:?})",
                correlation_id, state
            ),
            PaymentError::IoError(e) => write!(f, "I/O error: {}", e),
            PaymentError::JsonError(e) => write!(f, "JSON error: {}", e),
        }
    }
}

impl std::error::Error for PaymentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PaymentError::IoError(e) => Some(e),
            PaymentError::JsonError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PaymentError {
    fn from(err: std::io::Error) -> Self {
        PaymentError::IoError(err)
    }
}

impl From<serde_json::Error> for PaymentError {
    fn from(err: serde_json::Error) -> Self {
        PaymentError::JsonError(err)
    }
}

impl From<reqwest::Error> for PaymentError {
    fn from(err: reqwest::Error) -> Self {
        PaymentError::ProviderUnavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PaymentError>;
