//! Incoming HTTP request type and its per-request context.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use http::HeaderMap;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::fault::Fault;
use crate::method::Method;
use crate::middleware::Decision;

// ── RequestContext ────────────────────────────────────────────────────────────

/// State shared by every layer that touches one request.
///
/// Layers that need to see the context after handing the request downstream
/// (the exception translator, for one) keep their own `Arc` to it.
#[derive(Debug, Default)]
pub struct RequestContext {
    request_id: OnceLock<String>,
    rate_limit: OnceLock<Decision>,
}

impl RequestContext {
    /// The correlation id for this request.
    ///
    /// Generated on first access and fixed for the rest of the request.
    pub fn request_id(&self) -> &str {
        self.request_id.get_or_init(|| Uuid::new_v4().to_string())
    }

    /// `true` once some layer has asked for the correlation id.
    pub fn has_request_id(&self) -> bool {
        self.request_id.get().is_some()
    }

    /// The rate-limit verdict that let this request through, if a limiter
    /// has seen it. Whoever renders the final response, success or fault,
    /// copies its headers from here.
    pub fn rate_limit(&self) -> Option<&Decision> {
        self.rate_limit.get()
    }

    /// Records the verdict. Only the first call per request sticks.
    pub(crate) fn set_rate_limit(&self, decision: Decision) {
        let _ = self.rate_limit.set(decision);
    }
}

// ── Request ───────────────────────────────────────────────────────────────────

/// An incoming HTTP request with its body fully buffered.
///
/// The body is a shared [`Bytes`] buffer: every layer can read it as often as
/// it likes and nobody consumes it.
pub struct Request {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) query: Option<String>,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
    pub(crate) params: HashMap<String, String>,
    pub(crate) remote_addr: Option<SocketAddr>,
    pub(crate) context: Arc<RequestContext>,
}

impl Request {
    /// Starts building a request by hand. Mostly useful in tests.
    ///
    /// ```rust
    /// use portico::{Method, Request};
    ///
    /// let req = Request::builder(Method::Post, "/api/accounts?dry_run=1")
    ///     .header("content-type", "application/json")
    ///     .body(r#"{"accountName":"savings"}"#)
    ///     .build();
    /// assert_eq!(req.query(), Some("dry_run=1"));
    /// ```
    pub fn builder(method: Method, uri: &str) -> RequestBuilder {
        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (uri.to_owned(), None),
        };
        RequestBuilder {
            inner: Request {
                method,
                path,
                query,
                headers: HeaderMap::new(),
                body: Bytes::new(),
                params: HashMap::new(),
                remote_addr: None,
                context: Arc::default(),
            },
        }
    }

    pub fn method(&self) -> Method { self.method }
    pub fn path(&self) -> &str { &self.path }
    pub fn query(&self) -> Option<&str> { self.query.as_deref() }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn body(&self) -> &[u8] { &self.body }
    pub fn remote_addr(&self) -> Option<SocketAddr> { self.remote_addr }

    /// Case-insensitive header lookup. Non-UTF-8 values read as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(CONTENT_TYPE.as_str())
    }

    /// The declared body length: the `Content-Length` header when present and
    /// numeric, otherwise the number of bytes actually received.
    pub fn content_length(&self) -> u64 {
        self.header(CONTENT_LENGTH.as_str())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(self.body.len() as u64)
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/users/{id}`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Deserializes the JSON body. Malformed input is an invalid-argument fault.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Fault> {
        serde_json::from_slice(&self.body).map_err(|e| Fault::invalid_argument(e.to_string()))
    }

    /// The correlation id for this request. See [`RequestContext::request_id`].
    pub fn request_id(&self) -> &str {
        self.context.request_id()
    }

    pub fn context(&self) -> &Arc<RequestContext> {
        &self.context
    }
}

// ── RequestBuilder ────────────────────────────────────────────────────────────

/// Fluent builder for hand-made [`Request`]s. Obtain via [`Request::builder`].
pub struct RequestBuilder {
    inner: Request,
}

impl RequestBuilder {
    /// Adds a header. Invalid names or values are skipped.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.inner.headers.append(name, value);
        }
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.inner.body = body.into();
        self
    }

    pub fn remote_addr(mut self, addr: SocketAddr) -> Self {
        self.inner.remote_addr = Some(addr);
        self
    }

    pub(crate) fn set_headers(&mut self, headers: HeaderMap) {
        self.inner.headers = headers;
    }

    pub(crate) fn set_query(&mut self, query: &str) {
        self.inner.query = Some(query.to_owned());
    }

    pub fn build(self) -> Request {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_is_stable_once_generated() {
        let req = Request::builder(Method::Get, "/").build();
        assert!(!req.context().has_request_id());
        let first = req.request_id().to_owned();
        assert_eq!(req.request_id(), first);
        assert!(req.context().has_request_id());
    }

    #[test]
    fn first_rate_limit_verdict_sticks() {
        let req = Request::builder(Method::Get, "/").build();
        assert!(req.context().rate_limit().is_none());

        let first = Decision { allow: true, limit: 10, remaining: 9, reset_unix_seconds: 60 };
        req.context().set_rate_limit(first);
        req.context().set_rate_limit(Decision { remaining: 3, ..first });
        assert_eq!(req.context().rate_limit(), Some(&first));
    }

    #[test]
    fn content_length_prefers_declared_header() {
        let req = Request::builder(Method::Post, "/")
            .header("Content-Length", "12")
            .body("abc")
            .build();
        assert_eq!(req.content_length(), 12);

        let req = Request::builder(Method::Post, "/").body("abc").build();
        assert_eq!(req.content_length(), 3);
    }

    #[test]
    fn header_lookup_ignores_case() {
        let req = Request::builder(Method::Get, "/")
            .header("X-Forwarded-For", "10.0.0.1")
            .build();
        assert_eq!(req.header("x-forwarded-for"), Some("10.0.0.1"));
    }

    #[test]
    fn malformed_json_body_is_invalid_argument() {
        let req = Request::builder(Method::Post, "/").body("{").build();
        let fault = req.json::<serde_json::Value>().unwrap_err();
        assert!(matches!(fault, Fault::InvalidArgument(_)));
    }
}
