//! Lock-free per-endpoint and per-model statistics aggregation.

pub mod reservoir;

use crate::stats::reservoir::ReservoirSampler;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::debug;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

fn now_nanos() -> i64 {
    epoch().elapsed().as_nanos() as i64
}

const LATENCY_UNSET: i64 = -1;

/// Counters for one endpoint. All fields are updated via atomics; derived
/// fields (average latency, success rate) are computed on read.
pub struct EndpointStats {
    pub name: String,
    total_requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    total_bytes: AtomicU64,
    total_latency_ms: AtomicU64,
    min_latency_ms: AtomicI64,
    max_latency_ms: AtomicI64,
    last_used_nanos: AtomicI64,
    active_connections: AtomicI64,
}

impl EndpointStats {
    fn new(name: String) -> Self {
        Self {
            name,
            total_requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            min_latency_ms: AtomicI64::new(LATENCY_UNSET),
            max_latency_ms: AtomicI64::new(LATENCY_UNSET),
            last_used_nanos: AtomicI64::new(now_nanos()),
            active_connections: AtomicI64::new(0),
        }
    }

    fn record(&self, success: bool, latency_ms: u64, bytes: u64) {
        self.total_requests.fetch_add(1, Ordering::AcqRel);
        if success {
            self.successes.fetch_add(1, Ordering::AcqRel);
            self.total_latency_ms.fetch_add(latency_ms, Ordering::AcqRel);
        } else {
            self.failures.fetch_add(1, Ordering::AcqRel);
        }
        self.total_bytes.fetch_add(bytes, Ordering::AcqRel);
        self.last_used_nanos.store(now_nanos(), Ordering::Release);
        cas_min(&self.min_latency_ms, latency_ms as i64);
        cas_max(&self.max_latency_ms, latency_ms as i64);
    }

    pub fn record_connection_delta(&self, delta: i64) {
        self.active_connections.fetch_add(delta, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> EndpointStatsSnapshot {
        let total_requests = self.total_requests.load(Ordering::Acquire);
        let successes = self.successes.load(Ordering::Acquire);
        let failures = self.failures.load(Ordering::Acquire);
        let total_latency_ms = self.total_latency_ms.load(Ordering::Acquire);
        let avg_latency_ms = if successes > 0 {
            total_latency_ms as f64 / successes as f64
        } else {
            0.0
        };
        let success_rate = if total_requests > 0 {
            successes as f64 / total_requests as f64
        } else {
            0.0
        };

        EndpointStatsSnapshot {
            name: self.name.clone(),
            total_requests,
            successes,
            failures,
            total_bytes: self.total_bytes.load(Ordering::Acquire),
            avg_latency_ms,
            min_latency_ms: self.min_latency_ms.load(Ordering::Acquire),
            max_latency_ms: self.max_latency_ms.load(Ordering::Acquire),
            success_rate,
            active_connections: self.active_connections.load(Ordering::Acquire),
        }
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_used_nanos.load(Ordering::Acquire);
        Duration::from_nanos(now_nanos().saturating_sub(last).max(0) as u64)
    }
}

#[derive(Debug, Clone)]
pub struct EndpointStatsSnapshot {
    pub name: String,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_bytes: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: i64,
    pub max_latency_ms: i64,
    pub success_rate: f64,
    pub active_connections: i64,
}

/// Counters for one model, plus a latency reservoir and a capped,
/// TTL-bounded set of observed client identities.
pub struct ModelStats {
    pub name: String,
    total_requests: AtomicU64,
    total_bytes: AtomicU64,
    last_used_nanos: AtomicI64,
    latencies: ReservoirSampler,
    clients: DashMap<String, AtomicI64>,
    max_clients: usize,
}

impl ModelStats {
    fn new(name: String, reservoir_capacity: usize, max_clients: usize) -> Self {
        Self {
            name,
            total_requests: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            last_used_nanos: AtomicI64::new(now_nanos()),
            latencies: ReservoirSampler::new(reservoir_capacity),
            clients: DashMap::new(),
            max_clients,
        }
    }

    fn record(&self, latency_ms: u64, bytes: u64, client_id: Option<&str>) {
        self.total_requests.fetch_add(1, Ordering::AcqRel);
        self.total_bytes.fetch_add(bytes, Ordering::AcqRel);
        self.last_used_nanos.store(now_nanos(), Ordering::Release);
        self.latencies.add(latency_ms);

        if let Some(client_id) = client_id {
            if self.clients.len() < self.max_clients || self.clients.contains_key(client_id) {
                self.clients.insert(client_id.to_string(), AtomicI64::new(now_nanos()));
            }
        }
    }

    fn reap_clients(&self, ttl: Duration) {
        let ttl_nanos = ttl.as_nanos() as i64;
        self.clients
            .retain(|_, last_seen| now_nanos().saturating_sub(last_seen.load(Ordering::Acquire)) < ttl_nanos);
    }

    pub fn snapshot(&self) -> ModelStatsSnapshot {
        let (p50, p95, p99) = self.latencies.percentiles();
        ModelStatsSnapshot {
            name: self.name.clone(),
            total_requests: self.total_requests.load(Ordering::Acquire),
            total_bytes: self.total_bytes.load(Ordering::Acquire),
            unique_clients: self.clients.len(),
            p50_latency_ms: p50,
            p95_latency_ms: p95,
            p99_latency_ms: p99,
        }
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_used_nanos.load(Ordering::Acquire);
        Duration::from_nanos(now_nanos().saturating_sub(last).max(0) as u64)
    }
}

#[derive(Debug, Clone)]
pub struct ModelStatsSnapshot {
    pub name: String,
    pub total_requests: u64,
    pub total_bytes: u64,
    pub unique_clients: usize,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
}

fn cas_min(slot: &AtomicI64, candidate: i64) {
    let mut current = slot.load(Ordering::Acquire);
    loop {
        if current != LATENCY_UNSET && current <= candidate {
            return;
        }
        match slot.compare_exchange_weak(current, candidate, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

fn cas_max(slot: &AtomicI64, candidate: i64) {
    let mut current = slot.load(Ordering::Acquire);
    loop {
        if current >= candidate {
            return;
        }
        match slot.compare_exchange_weak(current, candidate, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

/// Optional out-of-band extraction of provider-specific metrics (token
/// counts, cost) from the final chunk of a streamed response. The core
/// dataplane only calls this hook; it never interprets the bytes itself.
pub trait MetricsExtractor: Send + Sync {
    fn extract_from_chunk(&self, last_chunk: &[u8], provider: &str) -> Option<ProviderMetrics>;
}

#[derive(Debug, Clone, Default)]
pub struct ProviderMetrics {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

/// No-op default: most deployments don't need token accounting baked into
/// the dataplane itself.
pub struct NoopExtractor;

impl MetricsExtractor for NoopExtractor {
    fn extract_from_chunk(&self, _last_chunk: &[u8], _provider: &str) -> Option<ProviderMetrics> {
        None
    }
}

pub struct StatsConfig {
    pub endpoint_ttl: Duration,
    pub model_ttl: Duration,
    pub max_endpoints: usize,
    pub max_models: usize,
    pub reservoir_capacity: usize,
    pub max_clients_per_model: usize,
}

impl From<&crate::config::StatsConfig> for StatsConfig {
    fn from(config: &crate::config::StatsConfig) -> Self {
        Self {
            endpoint_ttl: config.endpoint_ttl,
            model_ttl: config.model_ttl,
            max_endpoints: config.max_endpoints,
            max_models: config.max_models,
            reservoir_capacity: config.reservoir_capacity,
            max_clients_per_model: config.max_clients_per_model,
        }
    }
}

pub struct StatsAggregator {
    endpoints: DashMap<String, Arc<EndpointStats>>,
    models: DashMap<String, Arc<ModelStats>>,
    config: StatsConfig,
}

impl StatsAggregator {
    pub fn new(config: StatsConfig) -> Self {
        Self {
            endpoints: DashMap::new(),
            models: DashMap::new(),
            config,
        }
    }

    fn endpoint(&self, name: &str) -> Arc<EndpointStats> {
        self.endpoints
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(EndpointStats::new(name.to_string())))
            .clone()
    }

    fn model(&self, name: &str) -> Arc<ModelStats> {
        self.models
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(ModelStats::new(
                    name.to_string(),
                    self.config.reservoir_capacity,
                    self.config.max_clients_per_model,
                ))
            })
            .clone()
    }

    pub fn record_request(&self, endpoint: &str, success: bool, latency_ms: u64, bytes: u64) {
        self.endpoint(endpoint).record(success, latency_ms, bytes);
    }

    pub fn record_connection(&self, endpoint: &str, delta: i64) {
        self.endpoint(endpoint).record_connection_delta(delta);
    }

    pub fn record_model_request(
        &self,
        model: &str,
        latency_ms: u64,
        bytes: u64,
        client_id: Option<&str>,
    ) {
        self.model(model).record(latency_ms, bytes, client_id);
    }

    pub fn endpoint_snapshot(&self, name: &str) -> Option<EndpointStatsSnapshot> {
        self.endpoints.get(name).map(|e| e.snapshot())
    }

    pub fn model_snapshot(&self, name: &str) -> Option<ModelStatsSnapshot> {
        self.models.get(name).map(|m| m.snapshot())
    }

    pub fn all_endpoint_snapshots(&self) -> Vec<EndpointStatsSnapshot> {
        self.endpoints.iter().map(|e| e.snapshot()).collect()
    }

    pub fn all_model_snapshots(&self) -> Vec<ModelStatsSnapshot> {
        self.models.iter().map(|m| m.snapshot()).collect()
    }

    /// Evict entries past TTL, then trim to cap by oldest-last-used if
    /// still over, for both endpoints and models. Also reaps each model's
    /// per-client TTL set.
    pub fn sweep(&self) {
        evict_by_ttl_and_cap(
            &self.endpoints,
            self.config.endpoint_ttl,
            self.config.max_endpoints,
            |e| e.idle_for(),
            |e| e.last_used_nanos.load(Ordering::Acquire),
        );
        evict_by_ttl_and_cap(
            &self.models,
            self.config.model_ttl,
            self.config.max_models,
            |m| m.idle_for(),
            |m| m.last_used_nanos.load(Ordering::Acquire),
        );
        for model in self.models.iter() {
            model.reap_clients(self.config.model_ttl);
        }
        debug!(
            endpoints = self.endpoints.len(),
            models = self.models.len(),
            "stats sweep complete"
        );
    }
}

fn evict_by_ttl_and_cap<V>(
    map: &DashMap<String, Arc<V>>,
    ttl: Duration,
    cap: usize,
    idle_for: impl Fn(&V) -> Duration,
    last_used_nanos: impl Fn(&V) -> i64,
) {
    map.retain(|_, v| idle_for(v) < ttl);

    if map.len() > cap {
        let mut entries: Vec<(String, i64)> = map
            .iter()
            .map(|entry| (entry.key().clone(), last_used_nanos(entry.value())))
            .collect();
        entries.sort_by_key(|(_, last_used)| *last_used);
        let overflow = map.len() - cap;
        for (key, _) in entries.into_iter().take(overflow) {
            map.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StatsConfig {
        StatsConfig {
            endpoint_ttl: Duration::from_secs(3600),
            model_ttl: Duration::from_secs(3600),
            max_endpoints: 2,
            max_models: 2,
            reservoir_capacity: 100,
            max_clients_per_model: 100,
        }
    }

    #[test]
    fn success_and_failure_counts_sum_to_total() {
        let stats = StatsAggregator::new(config());
        stats.record_request("e1", true, 10, 100);
        stats.record_request("e1", false, 0, 0);
        stats.record_request("e1", true, 20, 50);

        let snapshot = stats.endpoint_snapshot("e1").unwrap();
        assert_eq!(snapshot.successes + snapshot.failures, snapshot.total_requests);
        assert_eq!(snapshot.total_requests, 3);
    }

    #[test]
    fn min_max_track_extremes_under_cas() {
        let stats = StatsAggregator::new(config());
        stats.record_request("e1", true, 50, 0);
        stats.record_request("e1", true, 10, 0);
        stats.record_request("e1", true, 90, 0);

        let snapshot = stats.endpoint_snapshot("e1").unwrap();
        assert_eq!(snapshot.min_latency_ms, 10);
        assert_eq!(snapshot.max_latency_ms, 90);
    }

    #[test]
    fn sweep_trims_to_cap_by_oldest() {
        let stats = StatsAggregator::new(config());
        stats.record_request("e1", true, 1, 0);
        stats.record_request("e2", true, 1, 0);
        stats.record_request("e3", true, 1, 0);
        assert_eq!(stats.endpoints.len(), 3);

        stats.sweep();
        assert!(stats.endpoints.len() <= 2);
    }

    #[test]
    fn connection_count_reflects_increments_and_decrements() {
        let stats = StatsAggregator::new(config());
        stats.record_connection("e1", 1);
        stats.record_connection("e1", 1);
        stats.record_connection("e1", -1);
        let snapshot = stats.endpoint_snapshot("e1").unwrap();
        assert_eq!(snapshot.active_connections, 1);
    }
}
