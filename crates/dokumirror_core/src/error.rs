use thiserror::Error;

/// Failures raised by a [`crate::remote::RemoteSource`].
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Transport failure, timeout or a retryable HTTP status.
    #[error("remote source unavailable during {method}: {reason}")]
    Unavailable { method: String, reason: String },

    /// The remote answered with an application-level error payload.
    #[error("remote source error [{code}] during {method}: {message}")]
    Remote {
        method: String,
        code: i64,
        message: String,
    },

    #[error("page not found on remote source: {0}")]
    NotFound(String),
}

impl RemoteError {
    pub fn unavailable(method: &str, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            method: method.to_string(),
            reason: reason.into(),
        }
    }

    pub fn remote(method: &str, code: i64, message: impl Into<String>) -> Self {
        Self::Remote {
            method: method.to_string(),
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("invalid page id {0:?}")]
    InvalidId(String),

    #[error("page {0} has no raw content")]
    EmptyContent(String),

    #[error("page {0} has no rendered html")]
    EmptyHtml(String),
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("search backend {backend} unavailable: {reason}")]
    Unavailable {
        backend: &'static str,
        reason: String,
    },

    #[error("search backend {backend} rejected request with status {status}: {details}")]
    Rejected {
        backend: &'static str,
        status: u16,
        details: String,
    },

    #[error("invalid response from {backend}: {details}")]
    InvalidResponse {
        backend: &'static str,
        details: String,
    },
}
