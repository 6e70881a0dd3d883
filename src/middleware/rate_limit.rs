//! Per-client fixed-window rate limiting.
//!
//! Each client gets a counter that starts when its first request arrives and
//! resets once a full window has passed since then. The table of counters is
//! a [`DashMap`]: updates for one client take that key's shard lock only, so
//! unrelated clients never wait on each other.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use http::StatusCode;
use tracing::{debug, warn};

use super::{Middleware, Next};
use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::handler::{BoxFuture, Outcome};
use crate::request::Request;
use crate::response::Response;

const LIMIT_HEADER: &str = "X-RateLimit-Limit";
const REMAINING_HEADER: &str = "X-RateLimit-Remaining";
const RESET_HEADER: &str = "X-RateLimit-Reset";

/// Entries idle for this long past the end of their window are evicted.
const EVICTION_GRACE_SECS: i64 = 60;

/// Minimum spacing between opportunistic sweeps.
const SWEEP_INTERVAL_SECS: i64 = 30;

// ── ClientWindowTracker ───────────────────────────────────────────────────────

/// One client's position in its current window.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClientWindowState {
    pub window_start: DateTime<Utc>,
    pub request_count: u32,
    pub last_request_time: DateTime<Utc>,
}

impl ClientWindowState {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self { window_start: now, request_count: 1, last_request_time: now }
    }

    fn record(&mut self, now: DateTime<Utc>, window: TimeDelta) {
        if now - self.window_start >= window {
            *self = Self::fresh(now);
        } else {
            self.request_count = self.request_count.saturating_add(1);
            self.last_request_time = now;
        }
    }
}

/// Concurrent table of per-client request counters.
#[derive(Debug)]
pub struct ClientWindowTracker {
    clients: DashMap<String, ClientWindowState>,
    window: TimeDelta,
}

impl ClientWindowTracker {
    pub fn new(window: TimeDelta) -> Self {
        Self { clients: DashMap::new(), window }
    }

    pub fn window(&self) -> TimeDelta {
        self.window
    }

    /// Counts one request from `client_id` and returns the updated state.
    ///
    /// The insert-or-update happens under the key's shard lock, so concurrent
    /// requests from the same client are each counted exactly once.
    pub fn record_and_get(&self, client_id: &str, now: DateTime<Utc>) -> ClientWindowState {
        if let Some(mut state) = self.clients.get_mut(client_id) {
            state.record(now, self.window);
            return *state;
        }
        match self.clients.entry(client_id.to_owned()) {
            // Another request for this client won the race to insert.
            Entry::Occupied(mut occupied) => {
                let state = occupied.get_mut();
                state.record(now, self.window);
                *state
            }
            Entry::Vacant(vacant) => *vacant.insert(ClientWindowState::fresh(now)),
        }
    }

    /// Drops clients whose last request is older than one window plus a
    /// minute. Returns how many entries were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.window - TimeDelta::seconds(EVICTION_GRACE_SECS);
        let before = self.clients.len();
        self.clients.retain(|_, state| state.last_request_time >= cutoff);
        before.saturating_sub(self.clients.len())
    }

    pub fn get(&self, client_id: &str) -> Option<ClientWindowState> {
        self.clients.get(client_id).map(|state| *state)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

// ── RateLimiter ───────────────────────────────────────────────────────────────

/// Allow/deny verdict for one request, with the values for the rate-limit headers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Decision {
    pub allow: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_unix_seconds: i64,
}

impl Decision {
    pub fn apply_headers(&self, res: &mut Response) {
        res.set_header(LIMIT_HEADER, self.limit.to_string());
        res.set_header(REMAINING_HEADER, self.remaining.to_string());
        res.set_header(RESET_HEADER, self.reset_unix_seconds.to_string());
    }
}

/// Decides whether a client may proceed. Cheap to clone; clones share the
/// same client table.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    tracker: Arc<ClientWindowTracker>,
    max_requests: u32,
    clock: Arc<dyn Clock>,
    last_sweep: Arc<AtomicI64>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let last_sweep = Arc::new(AtomicI64::new(clock.now().timestamp()));
        Self {
            tracker: Arc::new(ClientWindowTracker::new(config.window())),
            max_requests: config.max_requests_per_window,
            clock,
            last_sweep,
        }
    }

    /// Counts a request from `client_id` and decides on it.
    pub fn check(&self, client_id: &str) -> Decision {
        let state = self.tracker.record_and_get(client_id, self.clock.now());
        Decision {
            allow: state.request_count <= self.max_requests,
            limit: self.max_requests,
            remaining: self.max_requests.saturating_sub(state.request_count),
            reset_unix_seconds: (state.window_start + self.tracker.window()).timestamp(),
        }
    }

    pub fn tracker(&self) -> &ClientWindowTracker {
        &self.tracker
    }

    /// Sweeps the table if the last sweep is old enough. Only one caller
    /// wins when several notice at the same time.
    pub fn sweep_if_due(&self) {
        let now = self.clock.now();
        let last = self.last_sweep.load(Ordering::Relaxed);
        if now.timestamp() - last < SWEEP_INTERVAL_SECS {
            return;
        }
        if self.last_sweep
            .compare_exchange(last, now.timestamp(), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            let removed = self.tracker.sweep(now);
            if removed > 0 {
                debug!(removed, remaining = self.tracker.len(), "evicted idle rate-limit clients");
            }
        }
    }
}

// ── Middleware ────────────────────────────────────────────────────────────────

/// Applies a [`RateLimiter`] to every request.
///
/// Clients are identified by the first `X-Forwarded-For` entry, falling back
/// to the peer address, and finally to `"unknown"`.
#[derive(Clone, Debug)]
pub struct RateLimitLayer {
    limiter: RateLimiter,
}

impl RateLimitLayer {
    pub fn new(limiter: RateLimiter) -> Self {
        Self { limiter }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }
}

impl Middleware for RateLimitLayer {
    fn handle<'a>(&'a self, req: Request, next: Next<'a>) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            let client_id = client_identifier(&req);
            let decision = self.limiter.check(&client_id);

            if !decision.allow {
                warn!(
                    request_id = req.request_id(),
                    client_id = %client_id,
                    limit = decision.limit,
                    "rate limit exceeded"
                );
                let mut res = Response::builder()
                    .status(StatusCode::TOO_MANY_REQUESTS)
                    .text("Rate limit exceeded. Please try again later.");
                decision.apply_headers(&mut res);
                return Ok(res);
            }

            // A fault is rendered further out, by the translator, which reads
            // the verdict back from the context.
            req.context().set_rate_limit(decision);
            let outcome = next.run(req).await.map(|mut res| {
                decision.apply_headers(&mut res);
                res
            });
            self.limiter.sweep_if_due();
            outcome
        })
    }
}

fn client_identifier(req: &Request) -> String {
    let forwarded = req.header("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    match (forwarded, req.remote_addr()) {
        (Some(ip), _) => ip.to_owned(),
        (None, Some(addr)) => addr.ip().to_string(),
        (None, None) => "unknown".to_owned(),
    }
}
