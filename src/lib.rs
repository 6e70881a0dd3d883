//! # portico
//!
//! A small HTTP framework for JSON services, with the request pipeline every
//! such service ends up writing already built in.
//!
//! ## The pipeline
//!
//! Every request passes through four layers before it reaches your handler,
//! and the response passes back through them in reverse:
//!
//! | Layer | Job |
//! |---|---|
//! | [`ExceptionTranslator`](middleware::ExceptionTranslator) | turns any [`Fault`] (or panic) into a JSON [`ErrorEnvelope`] |
//! | [`RequestLogger`](middleware::RequestLogger) | assigns the correlation id, logs both bodies |
//! | [`RequestValidator`](middleware::RequestValidator) | content type, size, JSON syntax, header sanity |
//! | [`RateLimitLayer`](middleware::RateLimitLayer) | per-client request window, `X-RateLimit-*` headers |
//!
//! Handlers stay small. They return a response, or a [`Fault`] saying what
//! went wrong, and never build error bodies themselves.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use portico::{Config, Fault, Json, Pipeline, Request, Response, Router, Server, Status};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), portico::Error> {
//!     let config = Config::from_env()?;
//!     portico::telemetry::init(config.server.environment);
//!
//!     let app = Router::new()
//!         .get("/api/users/{id}", get_user)
//!         .post("/api/users",     create_user);
//!
//!     Server::try_bind(&config.server.address)?
//!         .serve(Pipeline::standard(app, &config))
//!         .await
//! }
//!
//! async fn get_user(req: Request) -> Result<Json<serde_json::Value>, Fault> {
//!     let id = req.param("id").ok_or_else(|| Fault::missing_input("id"))?;
//!     Err(Fault::not_found(format!("user {id}")))
//! }
//!
//! async fn create_user(req: Request) -> Result<Response, Fault> {
//!     let user: serde_json::Value = req.json()?;
//!     Ok(Response::builder()
//!         .status(Status::CREATED)
//!         .header("location", "/api/users/99")
//!         .json(serde_json::to_vec(&user).map_err(anyhow::Error::from)?))
//! }
//! ```

mod envelope;
mod error;
mod fault;
mod handler;
mod method;
mod request;
mod response;
mod router;
mod server;

pub mod clock;
pub mod config;
pub mod middleware;
pub mod telemetry;

pub use config::{Config, RunMode};
pub use envelope::ErrorEnvelope;
pub use error::Error;
pub use fault::Fault;
pub use handler::{BoxFuture, Handler, IntoOutcome, Outcome};
pub use http::StatusCode as Status;
pub use method::Method;
pub use middleware::Pipeline;
pub use request::{Request, RequestBuilder, RequestContext};
pub use response::{IntoResponse, Json, Response, ResponseBuilder};
pub use router::Router;
pub use server::Server;
