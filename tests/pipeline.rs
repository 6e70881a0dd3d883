//! End-to-end behaviour of the standard pipeline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{TimeDelta, Utc};
use portico::clock::{Clock, ManualClock};
use portico::{Config, ErrorEnvelope, Fault, Method, Pipeline, Request, Response, Router, Status};
use tracing::Level;
use tracing::field::{Field, Visit};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;

// ── Log capture ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Captured {
    level: Level,
    fields: HashMap<String, String>,
}

impl Captured {
    fn message(&self) -> &str {
        self.fields.get("message").map(String::as_str).unwrap_or("")
    }

    fn request_id(&self) -> Option<&str> {
        self.fields.get("request_id").map(String::as_str)
    }
}

#[derive(Clone, Default)]
struct CaptureLayer {
    events: Arc<Mutex<Vec<Captured>>>,
}

impl CaptureLayer {
    fn events(&self) -> Vec<Captured> {
        self.events.lock().unwrap().clone()
    }
}

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_owned(), value.to_owned());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_owned(), format!("{value:?}"));
    }
}

impl<S: tracing::Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let mut fields = HashMap::new();
        event.record(&mut FieldVisitor(&mut fields));
        self.events.lock().unwrap().push(Captured { level: *event.metadata().level(), fields });
    }
}

// ── Fixture ───────────────────────────────────────────────────────────────────

async fn get_account(req: Request) -> Result<Response, Fault> {
    match req.param("id") {
        Some("1") => Ok(Response::json(r#"{"id":1,"accountName":"checking"}"#)),
        Some(id) => Err(Fault::not_found(format!("account {id}"))),
        None => Err(Fault::missing_input("id")),
    }
}

async fn create_account(req: Request) -> Result<Response, Fault> {
    let body: serde_json::Value = req.json()?;
    Ok(Response::builder()
        .status(Status::CREATED)
        .json(serde_json::to_vec(&body).map_err(anyhow::Error::from)?))
}

async fn echo(req: Request) -> Response {
    Response::json(bytes::Bytes::copy_from_slice(req.body()))
}

fn app(config: &Config, clock: &ManualClock) -> Pipeline {
    let router = Router::new()
        .get("/api/accounts/{id}", get_account)
        .post("/api/accounts", create_account)
        .post("/echo", echo);
    Pipeline::with_clock(router, config, Arc::new(clock.clone()))
}

fn config(max_requests: u32) -> Config {
    let mut config = Config::default();
    config.rate_limit.max_requests_per_window = max_requests;
    config
}

fn get(path: &str, client: &str) -> Request {
    Request::builder(Method::Get, path)
        .header("x-forwarded-for", client)
        .build()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn not_found_fault_carries_logged_correlation_id() {
    let capture = CaptureLayer::default();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(capture.clone()));

    let pipeline = app(&config(100), &ManualClock::new(Utc::now()));
    let res = pipeline.handle(get("/api/accounts/404", "10.1.1.1")).await;

    assert_eq!(res.status_code(), Status::NOT_FOUND);
    let envelope: ErrorEnvelope = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(envelope.status_code, 404);
    assert_eq!(envelope.message, "Resource not found");

    let events = capture.events();
    let fault_logs: Vec<_> = events.iter().filter(|e| e.message() == "unhandled fault").collect();
    assert_eq!(fault_logs.len(), 1);
    assert_eq!(fault_logs[0].level, Level::ERROR);
    assert_eq!(fault_logs[0].request_id(), Some(envelope.request_id.as_str()));

    let started = events.iter().find(|e| e.message() == "request started").unwrap();
    assert_eq!(started.request_id(), Some(envelope.request_id.as_str()));
}

#[tokio::test]
async fn validation_rejection_is_logged_with_same_id() {
    let capture = CaptureLayer::default();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(capture.clone()));

    let pipeline = app(&config(100), &ManualClock::new(Utc::now()));
    let req = Request::builder(Method::Post, "/api/accounts")
        .header("content-type", "text/plain")
        .body("accountName=savings")
        .build();
    let res = pipeline.handle(req).await;

    assert_eq!(res.status_code(), Status::BAD_REQUEST);
    let envelope: ErrorEnvelope = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(envelope.message, "Invalid content type");
    // Rejected before the rate limiter, so no rate-limit headers.
    assert!(res.header("x-ratelimit-limit").is_none());

    let warning = capture.events().into_iter().find(|e| e.level == Level::WARN).unwrap();
    assert_eq!(warning.request_id(), Some(envelope.request_id.as_str()));
}

#[tokio::test]
async fn oversized_body_is_413() {
    let mut config = config(100);
    config.request_validation.max_content_length_bytes = 16;
    let pipeline = app(&config, &ManualClock::new(Utc::now()));

    let under = "[1,2,3,4,5,6,7]"; // 15 bytes
    let at_limit = "[1,2,3,4,5,6,78]"; // 16 bytes
    let over = "[1,2,3,4,5,6,789]"; // 17 bytes
    for (body, expected) in [(under, Status::OK), (at_limit, Status::OK), (over, Status::PAYLOAD_TOO_LARGE)] {
        let req = Request::builder(Method::Post, "/echo")
            .header("content-type", "application/json")
            .body(body)
            .build();
        assert_eq!(pipeline.handle(req).await.status_code(), expected, "{body}");
    }
}

#[tokio::test]
async fn bodies_are_transparent_end_to_end() {
    let pipeline = app(&config(100), &ManualClock::new(Utc::now()));
    let sent = r#"{"accountName":"savings","balance":250.75,"isActive":true}"#;
    let req = Request::builder(Method::Post, "/echo")
        .header("content-type", "application/json")
        .body(sent)
        .build();

    let res = pipeline.handle(req).await;
    assert_eq!(res.status_code(), Status::OK);
    assert_eq!(res.body(), sent.as_bytes());
    assert_eq!(res.header("x-ratelimit-remaining"), Some("99"));
}

#[tokio::test]
async fn rate_limit_denies_then_resets() {
    let clock = ManualClock::new(Utc::now());
    let pipeline = app(&config(3), &clock);

    for remaining in ["2", "1", "0"] {
        let res = pipeline.handle(get("/api/accounts/1", "172.16.0.5")).await;
        assert_eq!(res.status_code(), Status::OK);
        assert_eq!(res.header("x-ratelimit-remaining"), Some(remaining));
        assert_eq!(res.header("x-ratelimit-limit"), Some("3"));
    }

    let denied = pipeline.handle(get("/api/accounts/1", "172.16.0.5")).await;
    assert_eq!(denied.status_code(), Status::TOO_MANY_REQUESTS);
    assert_eq!(denied.header("x-ratelimit-remaining"), Some("0"));

    // A different client is unaffected.
    let other = pipeline.handle(get("/api/accounts/1", "172.16.0.6")).await;
    assert_eq!(other.status_code(), Status::OK);

    clock.advance(TimeDelta::minutes(1));
    let after = pipeline.handle(get("/api/accounts/1", "172.16.0.5")).await;
    assert_eq!(after.status_code(), Status::OK);
    assert_eq!(after.header("x-ratelimit-remaining"), Some("2"));
}

#[tokio::test]
async fn faulted_request_still_reports_its_rate_limit() {
    let clock = ManualClock::new(Utc::now());
    let pipeline = app(&config(5), &clock);

    pipeline.handle(get("/api/accounts/1", "192.0.2.50")).await;
    let res = pipeline.handle(get("/api/accounts/404", "192.0.2.50")).await;

    assert_eq!(res.status_code(), Status::NOT_FOUND);
    assert_eq!(res.header("x-ratelimit-limit"), Some("5"));
    assert_eq!(res.header("x-ratelimit-remaining"), Some("3"));
    let reset: i64 = res.header("x-ratelimit-reset").unwrap().parse().unwrap();
    assert_eq!(reset, (clock.now() + TimeDelta::minutes(1)).timestamp());
    let envelope: ErrorEnvelope = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(envelope.message, "Resource not found");
}

#[tokio::test]
async fn malformed_json_never_reaches_handler() {
    let capture = CaptureLayer::default();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(capture.clone()));

    let pipeline = app(&config(100), &ManualClock::new(Utc::now()));
    let req = Request::builder(Method::Post, "/api/accounts")
        .header("content-type", "application/json")
        .body(r#"{"a":"#)
        .build();
    let res = pipeline.handle(req).await;
    assert_eq!(res.status_code(), Status::BAD_REQUEST);
    let envelope: ErrorEnvelope = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(envelope.message, "Invalid JSON format");

    let warning = capture.events().into_iter().find(|e| e.level == Level::WARN).unwrap();
    assert_eq!(warning.request_id(), Some(envelope.request_id.as_str()));
    assert!(warning.fields["parse_error"].contains("EOF"), "{:?}", warning.fields);
}

#[tokio::test]
async fn development_mode_exposes_fault_details() {
    let mut config = config(100);
    config.server.environment = portico::RunMode::Development;
    let pipeline = app(&config, &ManualClock::new(Utc::now()));

    let res = pipeline.handle(get("/api/accounts/77", "10.0.0.9")).await;
    let envelope: ErrorEnvelope = serde_json::from_slice(res.body()).unwrap();
    assert!(envelope.details.unwrap().contains("account 77"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_clients_are_limited_independently() {
    let pipeline = Arc::new(app(&config(100), &ManualClock::new(Utc::now())));
    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..300 {
        let pipeline = Arc::clone(&pipeline);
        let client = if i % 2 == 0 { "10.9.0.1" } else { "10.9.0.2" };
        tasks.spawn(async move {
            let res = pipeline.handle(get("/api/accounts/1", client)).await;
            (client, res.status_code())
        });
    }

    let mut ok: HashMap<&str, usize> = HashMap::new();
    let mut limited: HashMap<&str, usize> = HashMap::new();
    while let Some(joined) = tasks.join_next().await {
        let (client, status) = joined.unwrap();
        let bucket = if status == Status::OK { &mut ok } else { &mut limited };
        *bucket.entry(client).or_default() += 1;
    }
    assert_eq!(ok["10.9.0.1"], 100);
    assert_eq!(ok["10.9.0.2"], 100);
    assert_eq!(limited["10.9.0.1"], 50);
    assert_eq!(limited["10.9.0.2"], 50);
}
