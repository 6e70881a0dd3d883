//! TCP listener, connection tasks and shutdown.
//!
//! [`Server::serve`] accepts connections until SIGTERM or Ctrl-C arrives,
//! then stops accepting and waits for every open connection to finish its
//! in-flight requests before returning. Under an orchestrator that sends
//! SIGTERM ahead of a hard kill, give the pod a grace period longer than the
//! slowest request you expect.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::CONTENT_LENGTH;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::error::Error;
use crate::fault::Fault;
use crate::method::Method;
use crate::middleware::Pipeline;
use crate::request::Request;
use crate::response::Response;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Serves a [`Pipeline`] over HTTP/1.1 and HTTP/2.
pub struct Server {
    addr: SocketAddr,
}

impl Server {
    /// Records the address to listen on. Nothing is bound until
    /// [`serve`](Server::serve).
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not a valid `host:port` string. Use
    /// [`try_bind`](Server::try_bind) for addresses read from configuration.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use portico::Server;
    /// let server = Server::bind("0.0.0.0:3000");
    /// ```
    pub fn bind(addr: &str) -> Self {
        Self::try_bind(addr).expect("invalid socket address")
    }

    /// Like [`bind`](Server::bind), but reports a bad address as an error.
    pub fn try_bind(addr: &str) -> Result<Self, Error> {
        let addr = addr
            .parse()
            .map_err(|e| Error::Config(format!("invalid address `{addr}`: {e}")))?;
        Ok(Self { addr })
    }

    /// Starts accepting connections and dispatching them through `app`, which
    /// is either a bare [`Router`](crate::Router) or a full [`Pipeline`].
    ///
    /// Resolves once a shutdown signal has been received and every open
    /// connection has drained.
    pub async fn serve(self, app: impl Into<Pipeline>) -> Result<(), Error> {
        let listener = TcpListener::bind(self.addr).await?;
        Self::serve_listener(listener, app).await
    }

    /// Same as [`serve`](Server::serve) on a listener the caller already
    /// bound, e.g. to port 0 in a test.
    pub async fn serve_listener(listener: TcpListener, app: impl Into<Pipeline>) -> Result<(), Error> {
        let addr = listener.local_addr()?;

        // One pipeline, shared by every connection task. It owns the
        // rate-limit table, so all connections see the same counters.
        let pipeline = Arc::new(app.into());

        info!(%addr, body_limit = ?pipeline.max_body_bytes(), "portico listening");

        // Every connection runs in its own task. Keeping them in a JoinSet
        // is what lets shutdown wait for the ones still open.
        let mut connections = tokio::task::JoinSet::new();

        // The signal future is polled once per loop turn, so it has to stay
        // put in memory between polls.
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // Arms are polled in order, so shutdown wins over a non-empty
                // accept queue.
                biased;

                () = &mut shutdown => {
                    info!(open_connections = connections.len(), "shutting down");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("failed to accept connection: {e}");
                            continue;
                        }
                    };

                    let pipeline = Arc::clone(&pipeline);
                    // hyper speaks its own IO traits; TokioIo bridges tokio's.
                    let io = TokioIo::new(stream);

                    connections.spawn(async move {
                        // Runs once per request, and a keep-alive connection
                        // carries many requests.
                        let svc = service_fn(move |req| {
                            let pipeline = Arc::clone(&pipeline);
                            async move { dispatch(pipeline, req, remote_addr).await }
                        });

                        // HTTP/1.1 or HTTP/2, decided from the client's first bytes.
                        let conn = ConnBuilder::new(TokioExecutor::new());
                        if let Err(e) = conn.serve_connection(io, svc).await {
                            error!(peer = %remote_addr, "connection closed with error: {e}");
                        }
                    });
                }

                // Reap closed connections as they finish.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        // Accepting has stopped; let the open connections finish.
        while connections.join_next().await.is_some() {}

        info!("portico stopped");
        Ok(())
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Buffers one request body, runs the pipeline, and hands the response to hyper.
///
/// The error type is [`Infallible`]: every failure becomes a response here or
/// inside the pipeline, so hyper never sees an error.
async fn dispatch(
    pipeline: Arc<Pipeline>,
    req: hyper::Request<Incoming>,
    remote_addr: SocketAddr,
) -> Result<http::Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();

    let Ok(method) = Method::try_from(&parts.method) else {
        return Ok(Response::status(http::StatusCode::METHOD_NOT_ALLOWED).into_http());
    };
    let path = parts.uri.path().to_owned();

    // A declared length over the cap is refused before a single body byte is
    // read.
    let limit = pipeline.max_body_bytes();
    if let Some(limit) = limit {
        let declared = parts.headers.get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        if declared.is_some_and(|len| len > limit) {
            return Ok(pipeline.reject_oversized(method, &path, limit).into_http());
        }
    }

    // Chunked bodies carry no length up front, so the cap is also enforced
    // while reading.
    let collected: Result<_, BoxError> = match limit {
        Some(limit) => {
            let cap = usize::try_from(limit).unwrap_or(usize::MAX);
            Limited::new(body, cap).collect().await
        }
        None => body.collect().await.map_err(Into::into),
    };

    let body = match collected {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => {
            let limit = limit.unwrap_or_default();
            return Ok(pipeline.reject_oversized(method, &path, limit).into_http());
        }
        Err(e) => {
            warn!(peer = %remote_addr, %method, path = %path, "failed to read request body: {e}");
            let fault = Fault::internal(format!("request body read failed: {e}"));
            return Ok(pipeline.reject(&fault, method, &path).into_http());
        }
    };

    // Headers and query move over as they are; path params are filled in by
    // the router once a route matches.
    let mut builder = Request::builder(method, &path)
        .body(body)
        .remote_addr(remote_addr);
    builder.set_headers(parts.headers);
    if let Some(query) = parts.uri.query() {
        builder.set_query(query);
    }

    let response = pipeline.handle(builder.build()).await;
    Ok(response.into_http())
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Completes on Ctrl-C, or on SIGTERM where the platform has it.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => {}
        () = terminate => {}
    }
}
