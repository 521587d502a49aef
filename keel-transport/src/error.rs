//! Typed error taxonomy for exchange communication.

use std::time::Duration;

use thiserror::Error;

/// Coarse classification every transport failure maps onto.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportErrorKind {
    Authentication,
    InvalidParams,
    InsufficientFunds,
    RateLimited,
    ServerError,
    Timeout,
    ConnectionLost,
    Unknown,
}

#[derive(Clone, Debug, Error)]
pub enum TransportError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("invalid request parameters: {0}")]
    InvalidParams(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("rate limited by exchange: {0}")]
    RateLimited(String),
    #[error("exchange server error {code}: {message}")]
    ServerError { code: i64, message: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("unclassified exchange error {code}: {message}")]
    Unknown { code: i64, message: String },
}

impl TransportError {
    #[must_use]
    pub fn kind(&self) -> TransportErrorKind {
        match self {
            Self::Authentication(_) => TransportErrorKind::Authentication,
            Self::InvalidParams(_) => TransportErrorKind::InvalidParams,
            Self::InsufficientFunds(_) => TransportErrorKind::InsufficientFunds,
            Self::RateLimited(_) => TransportErrorKind::RateLimited,
            Self::ServerError { .. } => TransportErrorKind::ServerError,
            Self::Timeout(_) => TransportErrorKind::Timeout,
            Self::ConnectionLost(_) => TransportErrorKind::ConnectionLost,
            Self::Unknown { .. } => TransportErrorKind::Unknown,
        }
    }

    /// Only transient infrastructure failures are safe to retry blindly.
    /// Business rejections (auth, params, funds) will fail again; rate
    /// limits need the limiter, not a retry loop.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            TransportErrorKind::Timeout
                | TransportErrorKind::ServerError
                | TransportErrorKind::ConnectionLost
        )
    }

    /// Map a remote `{code, message}` pair onto the taxonomy. Well-known
    /// venue codes take precedence; otherwise the message text decides.
    #[must_use]
    pub fn from_remote(code: i64, message: &str) -> Self {
        match code {
            13004 | 13009 | 13778 => Self::Authentication(message.to_string()),
            10009 | 10010 => Self::InsufficientFunds(message.to_string()),
            10028 | 10047 => Self::RateLimited(message.to_string()),
            11029 | 11030 | -32602 | -32600 => Self::InvalidParams(message.to_string()),
            -32099..=-32000 => Self::ServerError {
                code,
                message: message.to_string(),
            },
            _ => Self::classify_by_message(code, message),
        }
    }

    fn classify_by_message(code: i64, message: &str) -> Self {
        let lowered = message.to_ascii_lowercase();
        if lowered.contains("signature")
            || lowered.contains("credential")
            || lowered.contains("unauthorized")
            || lowered.contains("token")
        {
            Self::Authentication(message.to_string())
        } else if lowered.contains("param") || lowered.contains("argument") {
            Self::InvalidParams(message.to_string())
        } else if lowered.contains("funds") || lowered.contains("margin") {
            Self::InsufficientFunds(message.to_string())
        } else if lowered.contains("rate") || lowered.contains("too_many") {
            Self::RateLimited(message.to_string())
        } else {
            Self::Unknown {
                code,
                message: message.to_string(),
            }
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_map_directly() {
        assert_eq!(
            TransportError::from_remote(13004, "invalid_credentials").kind(),
            TransportErrorKind::Authentication
        );
        assert_eq!(
            TransportError::from_remote(10009, "not_enough_funds").kind(),
            TransportErrorKind::InsufficientFunds
        );
        assert_eq!(
            TransportError::from_remote(10028, "too_many_requests").kind(),
            TransportErrorKind::RateLimited
        );
        assert_eq!(
            TransportError::from_remote(-32602, "Invalid params").kind(),
            TransportErrorKind::InvalidParams
        );
        assert_eq!(
            TransportError::from_remote(-32050, "internal").kind(),
            TransportErrorKind::ServerError
        );
    }

    #[test]
    fn message_keywords_are_the_fallback() {
        assert_eq!(
            TransportError::from_remote(9999, "bad signature provided").kind(),
            TransportErrorKind::Authentication
        );
        assert_eq!(
            TransportError::from_remote(9999, "missing required argument").kind(),
            TransportErrorKind::InvalidParams
        );
        assert_eq!(
            TransportError::from_remote(9999, "completely novel failure").kind(),
            TransportErrorKind::Unknown
        );
    }

    #[test]
    fn only_transient_failures_retry() {
        assert!(TransportError::Timeout(Duration::from_secs(10)).is_retryable());
        assert!(TransportError::ConnectionLost("reset".into()).is_retryable());
        assert!(TransportError::ServerError {
            code: -32000,
            message: "busy".into()
        }
        .is_retryable());

        assert!(!TransportError::Authentication("bad key".into()).is_retryable());
        assert!(!TransportError::InvalidParams("bad qty".into()).is_retryable());
        assert!(!TransportError::InsufficientFunds("margin".into()).is_retryable());
        assert!(!TransportError::RateLimited("slow down".into()).is_retryable());
    }
}
