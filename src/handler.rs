//! Route handlers and how the router stores them.
//!
//! Handlers are plain `async fn`s of differing concrete types. Registration
//! wraps each one in `FnHandler` and keeps it as an `Arc<dyn ErasedHandler>`
//! so one router table can hold them all:
//!
//! ```text
//! router.get("/users/{id}", get_user)
//!   -> Handler::into_boxed_handler(get_user)   Arc<FnHandler<get_user>>
//!   -> ErasedHandler::call(req)                BoxFuture<'static, Outcome>
//!   -> get_user(req).await.into_outcome()
//! ```
//!
//! Every handler resolves to an [`Outcome`]: either a response, or a
//! [`Fault`] that travels back up the middleware chain to be translated.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http::StatusCode;
use serde::Serialize;

use crate::fault::Fault;
use crate::request::Request;
use crate::response::{IntoResponse, Json, Response};

// ── Shared types ──────────────────────────────────────────────────────────────

/// A heap-allocated, type-erased future.
///
/// Middleware borrow themselves for `'a`; handler futures are `'static`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What every layer of the pipeline produces.
pub type Outcome = Result<Response, Fault>;

// ── IntoOutcome ───────────────────────────────────────────────────────────────

/// Conversion of a handler's return value into an [`Outcome`].
///
/// Plain response values succeed. `Result<T, E>` succeeds with `T` or faults
/// with `E` converted into a [`Fault`].
pub trait IntoOutcome {
    fn into_outcome(self) -> Outcome;
}

impl IntoOutcome for Response {
    fn into_outcome(self) -> Outcome { Ok(self) }
}

impl IntoOutcome for &'static str {
    fn into_outcome(self) -> Outcome { Ok(self.into_response()) }
}

impl IntoOutcome for String {
    fn into_outcome(self) -> Outcome { Ok(self.into_response()) }
}

impl IntoOutcome for StatusCode {
    fn into_outcome(self) -> Outcome { Ok(self.into_response()) }
}

impl<T: Serialize> IntoOutcome for Json<T> {
    fn into_outcome(self) -> Outcome { Ok(self.into_response()) }
}

impl<T, E> IntoOutcome for Result<T, E>
where
    T: IntoResponse,
    E: Into<Fault>,
{
    fn into_outcome(self) -> Outcome {
        // `E: Into<Fault>` is what lets handlers use `?` on anyhow errors and
        // on their own fault constructors alike.
        self.map(IntoResponse::into_response).map_err(Into::into)
    }
}

// ── Type erasure ──────────────────────────────────────────────────────────────

/// Object-safe face of a handler. Public only because [`Handler`] names it.
#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, req: Request) -> BoxFuture<'static, Outcome>;
}

#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

// ── Handler ───────────────────────────────────────────────────────────────────

/// Anything the router accepts as a route handler: a `Send + Sync` function
/// or closure taking a [`Request`] and returning a future whose output is
/// [`IntoOutcome`]. Sealed.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

// ── Function handlers ─────────────────────────────────────────────────────────

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoOutcome + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoOutcome + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        // Arc rather than Box: the router hands out a clone per request.
        Arc::new(FnHandler(self))
    }
}

struct FnHandler<F>(F);

impl<F, Fut, R> ErasedHandler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoOutcome + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture<'static, Outcome> {
        // Calling the function only builds its future; nothing runs yet.
        // The future owns the request, so it can outlive `&self`.
        let fut = (self.0)(req);
        // Whatever the handler returns is normalised here, once, into an
        // Outcome the middleware above can inspect.
        Box::pin(async move { fut.await.into_outcome() })
    }
}
