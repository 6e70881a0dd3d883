//! Downstream faults.
//!
//! A [`Fault`] is what a handler returns when it cannot produce a normal
//! response. Faults travel back up the middleware chain untouched and are
//! classified exactly once, by the outermost
//! [`ExceptionTranslator`](crate::middleware::ExceptionTranslator).
//!
//! ```rust
//! use portico::{Fault, Request, Response};
//!
//! async fn get_account(req: Request) -> Result<Response, Fault> {
//!     let id = req.param("id").ok_or_else(|| Fault::missing_input("id"))?;
//!     Err(Fault::not_found(format!("account {id}")))
//! }
//! ```

use http::StatusCode;
use thiserror::Error;

/// Closed set of fault kinds a downstream handler can raise.
///
/// Each variant carries a diagnostic detail. The detail is logged, and is
/// only shown to clients in [`RunMode::Development`](crate::RunMode).
#[derive(Debug, Error)]
pub enum Fault {
    #[error("missing required input: {0}")]
    MissingInput(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// Anything else. Always maps to `500`.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Fault {
    pub fn missing_input(detail: impl Into<String>) -> Self {
        Self::MissingInput(detail.into())
    }

    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        Self::InvalidArgument(detail.into())
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::NotFound(detail.into())
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::Unauthorized(detail.into())
    }

    pub fn not_implemented(detail: impl Into<String>) -> Self {
        Self::NotImplemented(detail.into())
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::Timeout(detail.into())
    }

    pub fn internal(detail: impl std::fmt::Display) -> Self {
        Self::Internal(anyhow::anyhow!("{detail}"))
    }

    /// The status code this fault is answered with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingInput(_)    => StatusCode::BAD_REQUEST,
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_)        => StatusCode::NOT_FOUND,
            Self::Unauthorized(_)    => StatusCode::UNAUTHORIZED,
            Self::NotImplemented(_)  => StatusCode::NOT_IMPLEMENTED,
            Self::Timeout(_)         => StatusCode::REQUEST_TIMEOUT,
            Self::Internal(_)        => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing message. Never includes the diagnostic detail.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::MissingInput(_)    => "Required parameter is missing",
            Self::InvalidArgument(_) => "Invalid request parameters",
            Self::NotFound(_)        => "Resource not found",
            Self::Unauthorized(_)    => "Unauthorized access",
            Self::NotImplemented(_)  => "Feature not implemented",
            Self::Timeout(_)         => "Request timeout",
            Self::Internal(_)        => "An internal server error occurred",
        }
    }

    /// Full diagnostic text, including the cause chain for internal faults.
    pub fn diagnostic(&self) -> String {
        match self {
            Self::Internal(e) => format!("{e:?}"),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_table() {
        let cases = [
            (Fault::missing_input("id"), 400),
            (Fault::invalid_argument("balance"), 400),
            (Fault::not_found("account 7"), 404),
            (Fault::unauthorized("token"), 401),
            (Fault::not_implemented("export"), 501),
            (Fault::timeout("db"), 408),
            (Fault::internal("boom"), 500),
        ];
        for (fault, status) in cases {
            assert_eq!(fault.status().as_u16(), status, "{fault}");
        }
    }

    #[test]
    fn public_message_hides_detail() {
        let fault = Fault::not_found("account 42 in shard eu-3");
        assert_eq!(fault.public_message(), "Resource not found");
        assert!(fault.diagnostic().contains("shard eu-3"));
    }

    #[test]
    fn anyhow_errors_become_internal() {
        let err = anyhow::anyhow!("connection reset").context("loading account");
        let fault = Fault::from(err);
        assert_eq!(fault.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let diagnostic = fault.diagnostic();
        assert!(diagnostic.contains("loading account"));
        assert!(diagnostic.contains("connection reset"));
    }
}
