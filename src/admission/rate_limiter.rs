//! Token-bucket rate limiting: one global bucket, one bucket per client
//! identity, and a separate bucket namespace for health-check traffic so
//! probes never starve user requests.

use super::{AdmissionRequest, Validator, Verdict};
use crate::config::ipnet_like::IpCidr;
use crate::config::RateLimitConfig;
use crate::errors::AdmissionError;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

fn now_nanos() -> i64 {
    epoch().elapsed().as_nanos() as i64
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single token bucket. `rate` is tokens/sec; `burst` is the cap.
struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    fn new(rpm: u64, burst: u64) -> Self {
        Self {
            rate: rpm as f64 / 60.0,
            burst: burst as f64,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;
    }

    /// Attempt to acquire one token without delay. On failure, the caller
    /// receives the wait duration but nothing is consumed — the
    /// reservation is implicitly canceled.
    fn try_reserve(&self) -> Result<(), Duration> {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            Err(Duration::from_secs_f64((deficit / self.rate).max(0.0)))
        }
    }

    /// Refund a previously consumed token (used when a sibling
    /// reservation in the same admission decision fails and the whole
    /// request is rejected).
    fn refund(&self) {
        let mut state = self.state.lock();
        state.tokens = (state.tokens + 1.0).min(self.burst);
    }

    fn remaining(&self) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens.floor().max(0.0) as u64
    }
}

struct ClientBucket {
    bucket: TokenBucket,
    last_access_nanos: AtomicI64,
}

impl ClientBucket {
    fn new(rpm: u64, burst: u64) -> Self {
        Self {
            bucket: TokenBucket::new(rpm, burst),
            last_access_nanos: AtomicI64::new(now_nanos()),
        }
    }

    fn touch(&self) {
        self.last_access_nanos.store(now_nanos(), Ordering::Release);
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_access_nanos.load(Ordering::Acquire);
        Duration::from_nanos(now_nanos().saturating_sub(last).max(0) as u64)
    }
}

pub struct RateLimiter {
    global: TokenBucket,
    per_client: DashMap<String, Arc<ClientBucket>>,
    config: RateLimitConfig,
    trusted_proxies: Vec<IpCidr>,
    stopped: AtomicBool,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Arc<Self> {
        let trusted_proxies = config
            .trusted_proxy_cidrs
            .iter()
            .filter_map(|raw| IpCidr::parse(raw))
            .collect();
        Arc::new(Self {
            global: TokenBucket::new(config.global_rpm, config.burst_size),
            per_client: DashMap::new(),
            trusted_proxies,
            config,
            stopped: AtomicBool::new(false),
        })
    }

    /// Derive client identity: the direct peer address, unless it falls
    /// within a trusted-proxy CIDR and `trustProxyHeaders` is set, in
    /// which case the left-most `X-Forwarded-For` entry is used instead.
    pub fn client_identity(&self, peer: IpAddr, forwarded_for: Option<&str>) -> String {
        if self.config.trust_proxy_headers && self.trusted_proxies.iter().any(|c| c.contains(&peer))
        {
            if let Some(forwarded) = forwarded_for {
                if let Some(first) = forwarded.split(',').next() {
                    let trimmed = first.trim();
                    if !trimmed.is_empty() {
                        return trimmed.to_string();
                    }
                }
            }
        }
        peer.to_string()
    }

    fn client_bucket(&self, client_id: &str, is_health: bool) -> Arc<ClientBucket> {
        let key = if is_health {
            format!("{client_id}:health")
        } else {
            client_id.to_string()
        };
        let (rpm, burst) = if is_health {
            (self.config.health_rpm, self.config.burst_size)
        } else {
            (self.config.per_client_rpm, self.config.burst_size)
        };
        self.per_client
            .entry(key)
            .or_insert_with(|| Arc::new(ClientBucket::new(rpm, burst)))
            .clone()
    }

    fn check(&self, client_id: &str, is_health: bool) -> Result<(), AdmissionError> {
        let global_reservation = self.global.try_reserve();
        let client_bucket = self.client_bucket(client_id, is_health);
        client_bucket.touch();

        let client_reservation = client_bucket.bucket.try_reserve();

        match (global_reservation, client_reservation) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(wait)) => {
                self.global.refund();
                Err(AdmissionError::RateLimited {
                    retry_after: wait.max(Duration::from_secs(1)),
                })
            }
            (Err(wait), Ok(())) => {
                client_bucket.bucket.refund();
                Err(AdmissionError::RateLimited {
                    retry_after: wait.max(Duration::from_secs(1)),
                })
            }
            (Err(global_wait), Err(client_wait)) => Err(AdmissionError::RateLimited {
                retry_after: global_wait.max(client_wait).max(Duration::from_secs(1)),
            }),
        }
    }

    pub fn remaining(&self, client_id: &str, is_health: bool) -> u64 {
        self.client_bucket(client_id, is_health).bucket.remaining()
    }

    pub fn limit(&self, is_health: bool) -> u64 {
        if is_health {
            self.config.health_rpm
        } else {
            self.config.per_client_rpm
        }
    }

    /// Remove client buckets idle for at least `idle_ttl`. Run from the
    /// sweeper task on `cleanup_interval`.
    fn sweep(&self, idle_ttl: Duration) {
        let before = self.per_client.len();
        self.per_client.retain(|_, bucket| bucket.idle_for() < idle_ttl);
        let evicted = before - self.per_client.len();
        if evicted > 0 {
            debug!(evicted, "rate limiter reaped idle client buckets");
        }
    }

    /// Spawn the sweeper task, returning a handle whose `stop()` is safe
    /// to call any number of times.
    pub fn spawn_sweeper(self: Arc<Self>) -> SweeperHandle {
        let (tx, mut rx) = watch::channel(false);
        let interval = self.config.cleanup_interval;
        let idle_ttl = self.config.idle_ttl;
        let limiter = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => limiter.sweep(idle_ttl),
                    _ = rx.changed() => break,
                }
            }
        });

        SweeperHandle {
            shutdown: tx,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }
}

pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    stopped: Arc<AtomicBool>,
}

impl SweeperHandle {
    /// Idempotent: the second and subsequent calls are no-ops.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            let _ = self.shutdown.send(true);
        }
    }
}

#[async_trait]
impl Validator for RateLimiter {
    async fn validate(&self, request: &AdmissionRequest<'_>) -> Verdict {
        match self.check(request.client_id, request.is_health_check) {
            Ok(()) => Verdict::Allow,
            Err(err) => Verdict::Deny(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(per_client_rpm: u64, burst: u64) -> RateLimitConfig {
        RateLimitConfig {
            global_rpm: 100_000,
            per_client_rpm,
            health_rpm: per_client_rpm,
            burst_size: burst,
            cleanup_interval: Duration::from_secs(60),
            idle_ttl: Duration::from_secs(600),
            trust_proxy_headers: false,
            trusted_proxy_cidrs: Vec::new(),
        }
    }

    #[test]
    fn allows_up_to_burst_then_denies() {
        let limiter = RateLimiter::new(config(60, 3));
        assert!(limiter.check("client-a", false).is_ok());
        assert!(limiter.check("client-a", false).is_ok());
        assert!(limiter.check("client-a", false).is_ok());
        assert!(limiter.check("client-a", false).is_err());
    }

    #[test]
    fn canceled_reservation_does_not_consume_tokens() {
        let limiter = RateLimiter::new(config(60, 1));
        assert!(limiter.check("client-a", false).is_ok());
        // This one is denied; the global reservation it made should have
        // been refunded rather than silently spent.
        assert!(limiter.check("client-a", false).is_err());

        let remaining_before = limiter.global.remaining();
        limiter.check("client-b", false).unwrap();
        // client-b's success should not have been starved by client-a's
        // canceled attempt.
        assert!(limiter.global.remaining() <= remaining_before);
    }

    #[test]
    fn health_and_user_buckets_are_independent() {
        let limiter = RateLimiter::new(config(60, 1));
        assert!(limiter.check("client-a", false).is_ok());
        // Health bucket for the same client id is untouched by the user
        // bucket being exhausted.
        assert!(limiter.check("client-a", true).is_ok());
    }

    #[test]
    fn client_identity_prefers_peer_without_trust() {
        let limiter = RateLimiter::new(config(60, 3));
        let peer: IpAddr = "203.0.113.5".parse().unwrap();
        assert_eq!(limiter.client_identity(peer, Some("10.0.0.1")), "203.0.113.5");
    }

    #[test]
    fn client_identity_uses_forwarded_for_when_trusted() {
        let mut cfg = config(60, 3);
        cfg.trust_proxy_headers = true;
        cfg.trusted_proxy_cidrs = vec!["10.0.0.0/8".to_string()];
        let limiter = RateLimiter::new(cfg);
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(
            limiter.client_identity(peer, Some("203.0.113.9, 10.0.0.1")),
            "203.0.113.9"
        );
    }
}
