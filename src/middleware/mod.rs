//! Middleware layer.
//!
//! Middleware intercepts requests and responses and is the place for
//! cross-cutting concerns. A [`Pipeline`] wraps a [`Router`] in an ordered
//! list of layers; each layer sees the request on the way in and the
//! [`Outcome`] on the way out, and may short-circuit by answering itself.
//!
//! The standard pipeline, outermost first:
//!
//! ```text
//! ExceptionTranslator → RequestLogger → RequestValidator → RateLimitLayer → Router
//! ```
//!
//! ```rust,no_run
//! use portico::{Config, Router, Server, Pipeline};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), portico::Error> {
//!     let config = Config::from_env()?;
//!     let app = Pipeline::standard(Router::new(), &config);
//!     Server::bind(&config.server.address).serve(app).await
//! }
//! ```

mod exception;
mod logging;
mod rate_limit;
mod validation;

use std::sync::Arc;

pub use exception::ExceptionTranslator;
pub use logging::RequestLogger;
pub use rate_limit::{ClientWindowState, ClientWindowTracker, Decision, RateLimitLayer, RateLimiter};
pub use validation::{RequestValidator, ValidationOutcome};

use tracing::warn;

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, RunMode};
use crate::envelope::ErrorEnvelope;
use crate::fault::Fault;
use crate::handler::{BoxFuture, Outcome};
use crate::request::{Request, RequestContext};
use crate::response::Response;
use crate::router::Router;

// ── Middleware ────────────────────────────────────────────────────────────────

/// A layer in the request pipeline.
///
/// Call `next.run(req)` to continue down the chain, or return without calling
/// it to short-circuit.
///
/// ```rust
/// use portico::middleware::{Middleware, Next};
/// use portico::{BoxFuture, Outcome, Request};
///
/// struct ServerHeader;
///
/// impl Middleware for ServerHeader {
///     fn handle<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, Outcome> {
///         Box::pin(async move {
///             let mut res = next.run(req).await?;
///             res.set_header("server", "portico");
///             Ok(res)
///         })
///     }
/// }
/// ```
pub trait Middleware: Send + Sync + 'static {
    fn handle<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, Outcome>;
}

/// The rest of the chain below the current layer.
pub struct Next<'a> {
    layers: &'a [Arc<dyn Middleware>],
    router: &'a Router,
}

impl<'a> Next<'a> {
    /// Runs the remaining layers and finally the router.
    pub fn run(self, req: Request) -> BoxFuture<'a, Outcome> {
        match self.layers.split_first() {
            Some((layer, rest)) => layer.handle(req, Next { layers: rest, router: self.router }),
            None => self.router.dispatch(req),
        }
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

/// A router wrapped in middleware, ready to serve.
pub struct Pipeline {
    layers: Vec<Arc<dyn Middleware>>,
    router: Router,
    fallback: ExceptionTranslator,
    body_limit: Option<u64>,
}

impl Pipeline {
    /// A pipeline with no layers. Faults that reach the top are still
    /// rendered, as in production mode.
    pub fn new(router: Router) -> Self {
        Self {
            layers: Vec::new(),
            router,
            fallback: ExceptionTranslator::new(RunMode::Production),
            body_limit: None,
        }
    }

    /// The fixed production chain built from `config`, using the system clock.
    pub fn standard(router: Router, config: &Config) -> Self {
        Self::with_clock(router, config, Arc::new(SystemClock))
    }

    /// Same as [`standard`](Self::standard) with an injected clock for the
    /// rate limiter.
    pub fn with_clock(router: Router, config: &Config, clock: Arc<dyn Clock>) -> Self {
        let mode = config.server.environment;
        let limiter = RateLimiter::new(&config.rate_limit, clock);
        let mut pipeline = Self::new(router)
            .layer(ExceptionTranslator::new(mode))
            .layer(RequestLogger)
            .layer(RequestValidator::new(config.request_validation.clone()))
            .layer(RateLimitLayer::new(limiter));
        pipeline.fallback = ExceptionTranslator::new(mode);
        pipeline.body_limit(config.request_validation.max_content_length_bytes)
    }

    /// Caps how much of a request body the server buffers. A body declared or
    /// streamed past `max_bytes` is answered `413` without being read in full.
    ///
    /// [`standard`](Self::standard) sets this from
    /// `RequestValidation.MaxContentLengthBytes`. A bare pipeline has no cap.
    pub fn body_limit(mut self, max_bytes: u64) -> Self {
        self.body_limit = Some(max_bytes);
        self
    }

    pub fn max_body_bytes(&self) -> Option<u64> {
        self.body_limit
    }

    /// Appends `middleware` inside every layer added before it.
    pub fn layer(mut self, middleware: impl Middleware) -> Self {
        self.layers.push(Arc::new(middleware));
        self
    }

    /// Runs one request through the whole chain.
    pub async fn handle(&self, req: Request) -> Response {
        let context = Arc::clone(req.context());
        let method = req.method();
        let path = req.path().to_owned();
        let next = Next { layers: &self.layers, router: &self.router };
        match next.run(req).await {
            Ok(res) => res,
            Err(fault) => self.fallback.translate(&fault, &context, method, &path),
        }
    }

    /// Answers a fault raised before a [`Request`] could be built, such as
    /// a client that disconnected while sending its body.
    pub(crate) fn reject(&self, fault: &Fault, method: crate::Method, path: &str) -> Response {
        self.fallback.translate(fault, &RequestContext::default(), method, path)
    }

    /// Answers a request whose body went past [`body_limit`](Self::body_limit)
    /// before it was fully read.
    pub(crate) fn reject_oversized(&self, method: crate::Method, path: &str, limit: u64) -> Response {
        let context = RequestContext::default();
        let request_id = context.request_id();
        let (status, message) = validation::TOO_LARGE;
        warn!(request_id, %method, path, limit, "request body exceeds the size limit, not buffering it");
        ErrorEnvelope::new(request_id, status, message).into_response()
    }
}

impl From<Router> for Pipeline {
    fn from(router: Router) -> Self {
        Self::new(router)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use http::StatusCode;

    use super::*;
    use crate::Method;

    struct Tag {
        name: &'static str,
        trail: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware for Tag {
        fn handle<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, Outcome> {
            Box::pin(async move {
                self.trail.lock().unwrap().push(format!("{} in", self.name));
                let outcome = next.run(req).await;
                self.trail.lock().unwrap().push(format!("{} out", self.name));
                outcome
            })
        }
    }

    struct Deny;

    impl Middleware for Deny {
        fn handle<'a>(&'a self, _req: Request, _next: Next<'a>) -> BoxFuture<'a, Outcome> {
            Box::pin(async { Ok(Response::status(StatusCode::FORBIDDEN)) })
        }
    }

    async fn ok(_req: Request) -> &'static str {
        "ok"
    }

    async fn missing(_req: Request) -> Result<Response, Fault> {
        Err(Fault::not_found("nothing here"))
    }

    #[tokio::test]
    async fn layers_wrap_in_registration_order() {
        let trail = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(Router::new().get("/", ok))
            .layer(Tag { name: "outer", trail: Arc::clone(&trail) })
            .layer(Tag { name: "inner", trail: Arc::clone(&trail) });

        let res = pipeline.handle(Request::builder(Method::Get, "/").build()).await;
        assert_eq!(res.body(), b"ok");
        assert_eq!(*trail.lock().unwrap(), ["outer in", "inner in", "inner out", "outer out"]);
    }

    #[tokio::test]
    async fn short_circuit_skips_the_rest() {
        let trail = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(Router::new().get("/", ok))
            .layer(Deny)
            .layer(Tag { name: "inner", trail: Arc::clone(&trail) });

        let res = pipeline.handle(Request::builder(Method::Get, "/").build()).await;
        assert_eq!(res.status_code(), StatusCode::FORBIDDEN);
        assert!(trail.lock().unwrap().is_empty());
    }

    #[test]
    fn standard_pipeline_caps_bodies_at_the_validation_limit() {
        let mut config = Config::default();
        config.request_validation.max_content_length_bytes = 4096;
        assert_eq!(Pipeline::standard(Router::new(), &config).max_body_bytes(), Some(4096));
        assert_eq!(Pipeline::new(Router::new()).max_body_bytes(), None);
    }

    #[test]
    fn oversized_rejection_is_a_413_envelope() {
        let res = Pipeline::new(Router::new()).reject_oversized(Method::Post, "/upload", 16);
        assert_eq!(res.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["message"], "Request entity too large");
        assert_eq!(body["statusCode"], 413);
    }

    #[tokio::test]
    async fn bare_pipeline_still_renders_faults() {
        let pipeline = Pipeline::new(Router::new().get("/", missing));
        let res = pipeline.handle(Request::builder(Method::Get, "/").build()).await;
        assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["message"], "Resource not found");
        assert!(body.get("details").is_none());
    }
}
