//! Per-endpoint HTTP connection pool registry.
//!
//! Each endpoint gets its own `reqwest::Client`, which owns a `hyper`
//! connection pool keyed by host. Pools are created lazily on first use
//! and reclaimed by a background sweeper once idle past a threshold.

use crate::config::PoolConfig;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

fn now_nanos() -> i64 {
    epoch().elapsed().as_nanos() as i64
}

/// A live transport for one endpoint, plus the bookkeeping the sweeper
/// needs to decide whether it's still earning its keep.
pub struct ConnectionPool {
    pub client: reqwest::Client,
    last_used_nanos: AtomicI64,
}

impl ConnectionPool {
    fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            last_used_nanos: AtomicI64::new(now_nanos()),
        }
    }

    pub fn touch(&self) {
        self.last_used_nanos.store(now_nanos(), Ordering::Release);
    }

    fn idle_for(&self) -> Duration {
        let last_used = self.last_used_nanos.load(Ordering::Acquire);
        let elapsed_nanos = now_nanos().saturating_sub(last_used).max(0);
        Duration::from_nanos(elapsed_nanos as u64)
    }
}

// reqwest/hyper don't expose a hard cap on total (non-idle) connections per
// host, only on idle pooling; `max_conns_per_host` is enforced upstream of
// here via the balancer's active-connection accounting instead.
fn build_client(
    config: &PoolConfig,
    connect_timeout: Duration,
    keep_alive: Duration,
) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .pool_max_idle_per_host(config.max_idle_conns_per_host)
        .pool_idle_timeout(config.idle_conn_timeout)
        .tcp_nodelay(true)
        .tcp_keepalive(keep_alive)
        .no_gzip()
        .no_brotli()
        .no_deflate()
        .build()
}

/// Lazily-creates one [`ConnectionPool`] per endpoint name, sweeping out
/// idle ones on a configured cadence.
pub struct EndpointPoolRegistry {
    pools: DashMap<String, Arc<ConnectionPool>>,
    config: PoolConfig,
    connect_timeout: Duration,
    keep_alive: Duration,
}

impl EndpointPoolRegistry {
    pub fn new(config: PoolConfig, connect_timeout: Duration, keep_alive: Duration) -> Self {
        Self {
            pools: DashMap::new(),
            config,
            connect_timeout,
            keep_alive,
        }
    }

    /// Get-or-create under compare-and-swap-insert semantics: concurrent
    /// first callers for the same endpoint converge on the same pool.
    pub fn get_or_create(&self, endpoint: &str) -> reqwest::Result<Arc<ConnectionPool>> {
        if let Some(pool) = self.pools.get(endpoint) {
            pool.touch();
            return Ok(pool.clone());
        }

        let client = build_client(&self.config, self.connect_timeout, self.keep_alive)?;
        let pool = Arc::new(ConnectionPool::new(client));
        let pool = self
            .pools
            .entry(endpoint.to_string())
            .or_insert(pool)
            .clone();
        pool.touch();
        Ok(pool)
    }

    /// Remove and close (drop) any pool idle past `idle_threshold`.
    /// Returns the set of endpoint names that remained, for the breaker
    /// registry's own sweep to cross-reference.
    pub fn sweep(&self, idle_threshold: Duration) -> Vec<String> {
        let mut survivors = Vec::new();
        self.pools.retain(|endpoint, pool| {
            if pool.idle_for() > idle_threshold {
                debug!(endpoint, "evicting idle connection pool");
                false
            } else {
                survivors.push(endpoint.clone());
                true
            }
        });
        survivors
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn contains(&self, endpoint: &str) -> bool {
        self.pools.contains_key(endpoint)
    }

    /// Drop all pools, releasing idle connections. Part of graceful
    /// shutdown.
    pub fn clear(&self) {
        let count = self.pools.len();
        self.pools.clear();
        info!(count, "closed all connection pools");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> EndpointPoolRegistry {
        EndpointPoolRegistry::new(PoolConfig::default(), Duration::from_secs(5), Duration::from_secs(30))
    }

    #[test]
    fn concurrent_get_or_create_returns_same_instance() {
        let registry = registry();
        let a = registry.get_or_create("a").unwrap();
        let b = registry.get_or_create("a").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn sweep_evicts_idle_pools() {
        let registry = registry();
        registry.get_or_create("a").unwrap();
        assert_eq!(registry.len(), 1);

        let survivors = registry.sweep(Duration::from_nanos(0));
        assert!(survivors.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn sweep_keeps_recently_used_pools() {
        let registry = registry();
        registry.get_or_create("a").unwrap();

        let survivors = registry.sweep(Duration::from_secs(300));
        assert_eq!(survivors, vec!["a".to_string()]);
        assert_eq!(registry.len(), 1);
    }
}
