//! Token-bucket rate limiting, keyed by client IP for HTTP requests and by
//! peer id for signaling frames.

use std::collections::HashMap;
use std::hash::Hash;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct Quota {
    /// Tokens refilled per second.
    pub rate: f64,
    /// Bucket size.
    pub burst: f64,
}

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    touched: Instant,
}

impl Bucket {
    fn full(quota: Quota) -> Self {
        Self {
            tokens: quota.burst,
            touched: Instant::now(),
        }
    }

    fn take(&mut self, quota: Quota) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.touched).as_secs_f64();
        self.touched = now;
        self.tokens = (self.tokens + elapsed * quota.rate).min(quota.burst);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter<K = IpAddr> {
    buckets: Arc<Mutex<HashMap<K, Bucket>>>,
    quota: Quota,
}

impl<K: Hash + Eq + Clone> RateLimiter<K> {
    pub fn new(quota: Quota) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            quota,
        }
    }

    /// Consume one token for `key`.
    pub async fn check(&self, key: &K) -> bool {
        let mut buckets = self.buckets.lock().await;
        buckets
            .entry(key.clone())
            .or_insert_with(|| Bucket::full(self.quota))
            .take(self.quota)
    }

    pub async fn forget(&self, key: &K) {
        self.buckets.lock().await.remove(key);
    }

    /// Drop buckets idle for longer than `max_idle`. Returns how many went.
    pub async fn purge_idle(&self, max_idle: Duration) -> usize {
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        let now = Instant::now();
        buckets.retain(|_, b| now.duration_since(b.touched) < max_idle);
        before - buckets.len()
    }

    pub async fn tracked(&self) -> usize {
        self.buckets.lock().await.len()
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(ip) = client_ip(&req) {
        if !limiter.check(&ip).await {
            warn!(ip = %ip, path = %req.uri().path(), "Rate limit exceeded");
            return Err(StatusCode::TOO_MANY_REQUESTS);
        }
    }

    Ok(next.run(req).await)
}

/// Proxy headers first (the relay usually sits behind one), then the socket.
fn client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    };

    header("x-forwarded-for")
        .or_else(|| header("x-real-ip"))
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ci| ci.0.ip())
        })
}
