//! The JSON body of every failure response.

use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::response::Response;

/// Structured error body shared by validation rejections and translated faults.
///
/// ```json
/// {
///   "requestId": "1f0c…",
///   "message": "Resource not found",
///   "statusCode": 404,
///   "timestamp": "2026-10-18T09:30:00Z"
/// }
/// ```
///
/// `details` is only present in development mode.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub request_id: String,
    pub message: String,
    pub status_code: u16,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(request_id: impl Into<String>, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            message: message.into(),
            status_code: status.as_u16(),
            timestamp: Utc::now(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Renders the envelope as a JSON response carrying its own status.
    pub fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        match serde_json::to_vec(&self) {
            Ok(body) => Response::builder().status(status).json(body),
            Err(e) => {
                error!(request_id = %self.request_id, "failed to serialize error envelope: {e}");
                Response::status(status)
            }
        }
    }
}
