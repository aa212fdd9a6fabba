use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use http::{Method, StatusCode};
use serde::Serialize;
use tokio::time::Instant;

use crate::context::Context;
use crate::error::Error;
use crate::handler::{BoxFuture, HandlerFunc, Middleware, handler_fn};

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token buckets keyed by an arbitrary string.
///
/// Each key starts with `capacity` tokens, spends one per request and earns
/// `refill_rate` tokens per second back up to `capacity`.
pub struct RateLimiter {
    capacity: f64,
    refill_rate: f64,
    buckets: DashMap<String, Bucket>,
}

#[derive(Serialize)]
struct Snapshot {
    capacity: f64,
    refill_rate: f64,
    buckets: BTreeMap<String, u64>,
}

impl RateLimiter {
    /// Returns [`Error::Config`] unless both arguments are positive.
    pub fn new(capacity: u32, refill_rate: f64) -> Result<Self, Error> {
        if capacity == 0 || refill_rate <= 0.0 || !refill_rate.is_finite() {
            return Err(Error::Config("rate limiter needs a positive capacity and refill rate".into()));
        }
        Ok(Self { capacity: f64::from(capacity), refill_rate, buckets: DashMap::new() })
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let earned = now.duration_since(bucket.last_refill).as_secs_f64() * self.refill_rate;
        bucket.tokens = (bucket.tokens + earned).min(self.capacity);
        bucket.last_refill = now;
    }

    /// Spends one token for `key`; false when the bucket is empty.
    pub fn try_acquire(&self, key: &str) -> bool {
        let mut bucket = self
            .buckets
            .entry(key.to_owned())
            .or_insert_with(|| Bucket { tokens: self.capacity, last_refill: Instant::now() });
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn remaining(&self, key: &str) -> u64 {
        self.buckets.get(key).map_or(self.capacity as u64, |b| b.tokens as u64)
    }

    pub fn reset(&self, key: &str) {
        self.buckets.remove(key);
    }

    pub fn reset_all(&self) {
        self.buckets.clear();
    }

    /// Whole seconds until one token is available again.
    pub fn retry_after(&self) -> u64 {
        (1.0 / self.refill_rate).ceil().max(1.0) as u64
    }

    /// JSON inspection surface.
    ///
    /// - `GET`: capacity, refill rate and remaining tokens per key.
    /// - `DELETE`: refills `?key=` or, without a key, every bucket.
    pub fn admin(self: &Arc<Self>) -> HandlerFunc {
        let limiter = Arc::clone(self);
        handler_fn(move |ctx: &mut Context| {
            let limiter = Arc::clone(&limiter);
            Box::pin(async move {
                if *ctx.method() == Method::DELETE {
                    match ctx.query("key") {
                        Some(key) => limiter.reset(&key),
                        None => limiter.reset_all(),
                    }
                    ctx.write_header(StatusCode::NO_CONTENT);
                    return;
                }
                let snapshot = Snapshot {
                    capacity: limiter.capacity,
                    refill_rate: limiter.refill_rate,
                    buckets: limiter.buckets.iter().map(|e| (e.key().clone(), e.tokens as u64)).collect(),
                };
                ctx.render(&snapshot);
            })
        })
    }
}

type KeyFn = Arc<dyn Fn(&Context) -> String + Send + Sync>;

/// Rejects requests with 429 once their key's bucket is empty. The key
/// defaults to the client IP.
#[derive(Clone)]
pub struct RateLimit {
    limiter: Arc<RateLimiter>,
    key: KeyFn,
}

impl RateLimit {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter, key: Arc::new(Context::real_ip) }
    }

    pub fn with_key<F>(mut self, key: F) -> Self
    where
        F: Fn(&Context) -> String + Send + Sync + 'static,
    {
        self.key = Arc::new(key);
        self
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

impl Middleware for RateLimit {
    fn handle<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a> {
        Box::pin(async move {
            let key = (self.key)(ctx);
            if self.limiter.try_acquire(&key) {
                ctx.next().await;
                return;
            }
            ctx.debug(format_args!("rate limited key={key}"));
            ctx.set_header("retry-after", &self.limiter.retry_after().to_string());
            ctx.write_error(&Error::RateLimited);
            ctx.end();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::middleware::testing::run;
    use crate::params::PARAM_USERID;

    fn ok() -> HandlerFunc {
        handler_fn(|ctx: &mut Context| Box::pin(async move { ctx.write_string("ok") }))
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(RateLimiter::new(0, 1.0).is_err());
        assert!(RateLimiter::new(1, 0.0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_drains_and_refills() {
        let limiter = RateLimiter::new(2, 1.0).unwrap();
        assert!(limiter.try_acquire("a"));
        assert!(limiter.try_acquire("a"));
        assert!(!limiter.try_acquire("a"));
        assert!(limiter.try_acquire("b"));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.try_acquire("a"));
        limiter.reset("a");
        assert_eq!(limiter.remaining("a"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_key_gets_429() {
        let limiter = Arc::new(RateLimiter::new(1, 0.5).unwrap());
        let mw = crate::handler(RateLimit::new(Arc::clone(&limiter)));
        assert_eq!(run("/", vec![mw.clone(), ok()]).await.status, StatusCode::OK);
        let resp = run("/", vec![mw, ok()]).await;
        assert_eq!(resp.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers["retry-after"], "2");
        assert_eq!(limiter.remaining("10.0.0.1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_key_and_admin_snapshot() {
        let limiter = Arc::new(RateLimiter::new(3, 1.0).unwrap());
        let mw = crate::handler(
            RateLimit::new(Arc::clone(&limiter))
                .with_key(|ctx| ctx.get_param(PARAM_USERID).unwrap_or("anon").to_owned()),
        );
        run("/", vec![mw, ok()]).await;
        let resp = run("/admin", vec![limiter.admin()]).await;
        let json: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(json["buckets"]["anon"], 2);
        assert_eq!(json["capacity"], 3.0);
    }
}
