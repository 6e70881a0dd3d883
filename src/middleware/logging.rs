//! Request/response logging with body capture.
//!
//! The request body is a shared buffer, so reading it here leaves it intact
//! for the validator and the handler. The response passes back through
//! untouched; this layer only looks at it.

use std::time::Instant;

use tracing::{info, warn};

use super::{Middleware, Next};
use crate::handler::{BoxFuture, Outcome};
use crate::method::Method;
use crate::request::Request;

/// Logs `request started` and `request completed` for every request, with
/// both bodies, under the request's correlation id.
///
/// This is the layer that assigns the correlation id. Anything logged or
/// returned further down reuses it.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestLogger;

impl Middleware for RequestLogger {
    fn handle<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            let request_id = req.request_id().to_owned();
            let method = req.method();
            let path = req.path().to_owned();

            info!(
                request_id = %request_id,
                %method,
                path = %path,
                query = req.query().unwrap_or(""),
                body = %String::from_utf8_lossy(req.body()),
                "request started"
            );

            let mut guard = Completion {
                request_id,
                method,
                path,
                started: Instant::now(),
                done: false,
            };

            let outcome = next.run(req).await;
            match &outcome {
                Ok(res) => guard.finish(res.status_code().as_u16(), &String::from_utf8_lossy(res.body())),
                // The translator above writes the body; only the status is known here.
                Err(fault) => guard.finish(fault.status().as_u16(), ""),
            }
            outcome
        })
    }
}

/// Emits the completion record exactly once.
///
/// If the request future is dropped before [`finish`](Self::finish) runs (the
/// client went away, or a handler panicked) the drop emits an abort record
/// instead, so every `request started` line has a matching end.
struct Completion {
    request_id: String,
    method: Method,
    path: String,
    started: Instant,
    done: bool,
}

impl Completion {
    fn finish(&mut self, status: u16, response: &str) {
        self.done = true;
        info!(
            request_id = %self.request_id,
            method = %self.method,
            path = %self.path,
            status,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            response,
            "request completed"
        );
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.done {
            warn!(
                request_id = %self.request_id,
                method = %self.method,
                path = %self.path,
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "request aborted before completion"
            );
        }
    }
}
