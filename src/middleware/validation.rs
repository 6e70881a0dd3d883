//! Request shape validation.
//!
//! Stateless checks that run before rate limiting and the handler. The first
//! failing rule decides the response; later rules are not evaluated.

use http::StatusCode;
use serde::de::IgnoredAny;
use tracing::warn;

use super::{Middleware, Next};
use crate::config::ValidationConfig;
use crate::envelope::ErrorEnvelope;
use crate::handler::{BoxFuture, Outcome};
use crate::method::Method;
use crate::request::Request;

const MAX_USER_AGENT_CHARS: usize = 500;

/// Status and message for a body over the size limit. The server uses it too,
/// for bodies it refuses to buffer.
pub(crate) const TOO_LARGE: (StatusCode, &str) = (StatusCode::PAYLOAD_TOO_LARGE, "Request entity too large");

/// Result of [`RequestValidator::validate`]. Every rejection names its reason.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidationOutcome {
    Accepted,
    RejectedContentType,
    RejectedTooLarge,
    RejectedMalformedJson,
    RejectedMissingHeader,
}

impl ValidationOutcome {
    pub fn is_accepted(self) -> bool {
        self == Self::Accepted
    }

    /// Status code and client-facing message for a rejection.
    pub fn rejection(self) -> Option<(StatusCode, &'static str)> {
        match self {
            Self::Accepted              => None,
            Self::RejectedContentType   => Some((StatusCode::BAD_REQUEST, "Invalid content type")),
            Self::RejectedTooLarge      => Some(TOO_LARGE),
            Self::RejectedMalformedJson => Some((StatusCode::BAD_REQUEST, "Invalid JSON format")),
            Self::RejectedMissingHeader => Some((StatusCode::BAD_REQUEST, "Required headers missing")),
        }
    }
}

/// Validates content type, size, JSON well-formedness and headers.
///
/// The content-type, JSON and header rules can each be switched off through
/// [`ValidationConfig`]. The size limit always applies.
#[derive(Clone, Debug)]
pub struct RequestValidator {
    config: ValidationConfig,
}

impl RequestValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn validate(&self, req: &Request) -> ValidationOutcome {
        self.evaluate(req).0
    }

    /// Like [`validate`](Self::validate), but also hands back the parser's
    /// complaint when the body is malformed JSON.
    fn evaluate(&self, req: &Request) -> (ValidationOutcome, Option<serde_json::Error>) {
        if self.config.validate_content_type && !content_type_ok(req) {
            return (ValidationOutcome::RejectedContentType, None);
        }
        if req.content_length() > self.config.max_content_length_bytes {
            return (ValidationOutcome::RejectedTooLarge, None);
        }
        if self.config.validate_json_format {
            if let Err(e) = check_json(req) {
                return (ValidationOutcome::RejectedMalformedJson, Some(e));
            }
        }
        if self.config.validate_headers && !headers_ok(req) {
            return (ValidationOutcome::RejectedMissingHeader, None);
        }
        (ValidationOutcome::Accepted, None)
    }
}

impl Middleware for RequestValidator {
    fn handle<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            let (outcome, parse_error) = self.evaluate(&req);
            let Some((status, message)) = outcome.rejection() else {
                return next.run(req).await;
            };

            let request_id = req.request_id();
            warn!(
                request_id,
                method = %req.method(),
                path = req.path(),
                reason = ?outcome,
                parse_error = parse_error.as_ref().map(tracing::field::display),
                "request validation failed: {message}"
            );
            Ok(ErrorEnvelope::new(request_id, status, message).into_response())
        })
    }
}

fn is_json(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| {
        ct.get(..16).is_some_and(|prefix| prefix.eq_ignore_ascii_case("application/json"))
    })
}

fn content_type_ok(req: &Request) -> bool {
    matches!(req.method(), Method::Get | Method::Delete)
        || req.content_length() == 0
        || is_json(req.content_type())
}

/// Only JSON-typed, non-blank bodies are parsed. Anything else passes.
fn check_json(req: &Request) -> Result<(), serde_json::Error> {
    if req.content_length() == 0 || !is_json(req.content_type()) {
        return Ok(());
    }
    if req.body().iter().all(u8::is_ascii_whitespace) {
        return Ok(());
    }
    serde_json::from_slice::<IgnoredAny>(req.body()).map(|_| ())
}

fn headers_ok(req: &Request) -> bool {
    if matches!(req.method(), Method::Post | Method::Put)
        && req.content_length() > 0
        && req.content_type().is_none()
    {
        return false;
    }
    if req.headers().contains_key(http::header::USER_AGENT) {
        // A present but non-UTF-8 agent counts as blank.
        let agent = req.header("user-agent").unwrap_or("");
        if agent.trim().is_empty() || agent.chars().count() > MAX_USER_AGENT_CHARS {
            return false;
        }
    }
    true
}
