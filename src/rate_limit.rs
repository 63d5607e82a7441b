//! Per-IP sliding-window rate limiting for the room lifecycle endpoints.
//!
//! A window of request timestamps is kept per source IP; requests beyond the
//! limit inside one window get a 429. Standard `X-RateLimit-*` headers go out
//! on every response so well-behaved clients can pace themselves.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::Mutex;
use tracing::warn;

pub const DEFAULT_LIMIT: usize = 30;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: usize,
    pub remaining: usize,
    /// Seconds until the oldest counted request leaves the window.
    pub reset_secs: u64,
}

#[derive(Clone)]
pub struct RateLimiter {
    hits: Arc<Mutex<HashMap<IpAddr, VecDeque<Instant>>>>,
    limit: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            hits: Arc::new(Mutex::new(HashMap::new())),
            limit,
            window,
        }
    }

    pub async fn check(&self, ip: IpAddr) -> RateDecision {
        let now = Instant::now();
        let mut hits = self.hits.lock().await;
        let window = hits.entry(ip).or_default();

        while let Some(front) = window.front() {
            if now.duration_since(*front) >= self.window {
                window.pop_front();
            } else {
                break;
            }
        }

        let reset_secs = window
            .front()
            .map(|oldest| {
                self.window
                    .saturating_sub(now.duration_since(*oldest))
                    .as_secs()
                    .max(1)
            })
            .unwrap_or(self.window.as_secs());

        if window.len() >= self.limit {
            return RateDecision {
                allowed: false,
                limit: self.limit,
                remaining: 0,
                reset_secs,
            };
        }

        window.push_back(now);
        RateDecision {
            allowed: true,
            limit: self.limit,
            remaining: self.limit - window.len(),
            reset_secs,
        }
    }

    /// Drop IPs whose whole window has expired.
    pub async fn purge_stale(&self) {
        let now = Instant::now();
        let window = self.window;
        let mut hits = self.hits.lock().await;
        hits.retain(|_, times| {
            times
                .back()
                .map(|last| now.duration_since(*last) < window)
                .unwrap_or(false)
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_LIMIT, DEFAULT_WINDOW)
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    req: Request,
    next: Next,
) -> Response {
    let Some(ip) = extract_client_ip(&req) else {
        // No attributable source; let it through without counting.
        return next.run(req).await;
    };

    let decision = limiter.check(ip).await;
    if !decision.allowed {
        warn!(ip = %ip, "rate limit exceeded");
        let mut resp = (
            StatusCode::TOO_MANY_REQUESTS,
            axum::Json(serde_json::json!({ "error": "rate limit exceeded" })),
        )
            .into_response();
        apply_headers(&mut resp, &decision);
        resp.headers_mut().insert(
            "retry-after",
            header_value(decision.reset_secs.to_string()),
        );
        return resp;
    }

    let mut resp = next.run(req).await;
    apply_headers(&mut resp, &decision);
    resp
}

fn apply_headers(resp: &mut Response, decision: &RateDecision) {
    let headers = resp.headers_mut();
    headers.insert("x-ratelimit-limit", header_value(decision.limit.to_string()));
    headers.insert(
        "x-ratelimit-remaining",
        header_value(decision.remaining.to_string()),
    );
    headers.insert(
        "x-ratelimit-reset",
        header_value(decision.reset_secs.to_string()),
    );
}

fn header_value(s: String) -> HeaderValue {
    HeaderValue::from_str(&s).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

/// Try ConnectInfo first, then X-Forwarded-For, then X-Real-IP.
fn extract_client_ip(req: &Request) -> Option<IpAddr> {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<std::net::SocketAddr>>() {
        return Some(connect_info.0.ip());
    }

    if let Some(forwarded) = req.headers().get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(first) = value.split(',').next() {
                if let Ok(ip) = first.trim().parse::<IpAddr>() {
                    return Some(ip);
                }
            }
        }
    }

    if let Some(real_ip) = req.headers().get("x-real-ip") {
        if let Ok(value) = real_ip.to_str() {
            if let Ok(ip) = value.trim().parse::<IpAddr>() {
                return Some(ip);
            }
        }
    }

    None
}
