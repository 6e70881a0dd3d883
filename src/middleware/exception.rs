//! Outermost layer: turns faults into error responses.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::error;

use super::{Middleware, Next};
use crate::config::RunMode;
use crate::envelope::ErrorEnvelope;
use crate::fault::Fault;
use crate::handler::{BoxFuture, Outcome};
use crate::method::Method;
use crate::request::{Request, RequestContext};
use crate::response::Response;

/// Catches every [`Fault`] (and panic) from further down the chain and
/// answers with an [`ErrorEnvelope`].
///
/// Belongs at the top of the chain. Nothing inside it needs to handle
/// faults; they pass through untouched until they reach this layer.
#[derive(Clone, Copy, Debug)]
pub struct ExceptionTranslator {
    mode: RunMode,
}

impl ExceptionTranslator {
    pub fn new(mode: RunMode) -> Self {
        Self { mode }
    }

    /// Logs `fault` and renders it.
    ///
    /// Uses the correlation id already on `context`, generating one if no
    /// layer has done so yet.
    pub fn translate(
        &self,
        fault: &Fault,
        context: &RequestContext,
        method: Method,
        path: &str,
    ) -> Response {
        let request_id = context.request_id();
        let status = fault.status();
        let diagnostic = fault.diagnostic();

        error!(
            request_id,
            %method,
            path,
            status = status.as_u16(),
            error = %diagnostic,
            "unhandled fault"
        );

        let envelope = ErrorEnvelope::new(request_id, status, fault.public_message());
        let envelope = if self.mode.is_development() {
            envelope.with_details(diagnostic)
        } else {
            envelope
        };
        let mut res = envelope.into_response();
        if let Some(decision) = context.rate_limit() {
            decision.apply_headers(&mut res);
        }
        res
    }
}

impl Middleware for ExceptionTranslator {
    fn handle<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            let context = Arc::clone(req.context());
            let method = req.method();
            let path = req.path().to_owned();

            let fault = match AssertUnwindSafe(next.run(req)).catch_unwind().await {
                Ok(Ok(res)) => return Ok(res),
                Ok(Err(fault)) => fault,
                Err(panic) => Fault::internal(format!("handler panicked: {}", panic_message(&*panic))),
            };
            Ok(self.translate(&fault, &context, method, &path))
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload.downcast_ref::<&str>().copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
