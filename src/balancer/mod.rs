//! Load-balancing collaborator: chooses among healthy endpoints and tracks
//! active-connection counts per endpoint. The policy itself is external to
//! the dataplane; [`RoundRobinSelector`] is the default implementation used
//! when nothing fancier is wired in.

use crate::domain::Endpoint;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// `select` / `incrementConnections` / `decrementConnections` contract
/// consumed by the dispatcher.
#[async_trait]
pub trait EndpointSelector: Send + Sync {
    /// Pick a candidate order over `endpoints`. The dispatcher walks this
    /// order skipping any endpoint whose breaker is open; it does not
    /// re-invoke `select` per candidate.
    async fn select(&self, endpoints: &[Endpoint]) -> Option<Endpoint>;

    fn increment_connections(&self, endpoint: &str);
    fn decrement_connections(&self, endpoint: &str);
    fn active_connections(&self, endpoint: &str) -> i64;
}

/// Simple round-robin over the healthy set, with a per-endpoint active
/// connection counter for observability and for admission decisions that
/// want to avoid a saturated endpoint.
pub struct RoundRobinSelector {
    cursor: AtomicUsize,
    active: DashMap<String, AtomicUsize>,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
            active: DashMap::new(),
        }
    }
}

impl Default for RoundRobinSelector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EndpointSelector for RoundRobinSelector {
    async fn select(&self, endpoints: &[Endpoint]) -> Option<Endpoint> {
        if endpoints.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % endpoints.len();
        Some(endpoints[index].clone())
    }

    fn increment_connections(&self, endpoint: &str) {
        self.active
            .entry(endpoint.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::AcqRel);
    }

    fn decrement_connections(&self, endpoint: &str) {
        if let Some(counter) = self.active.get(endpoint) {
            counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(1))
            })
            .ok();
        }
    }

    fn active_connections(&self, endpoint: &str) -> i64 {
        self.active
            .get(endpoint)
            .map(|c| c.load(Ordering::Acquire) as i64)
            .unwrap_or(0)
    }
}

pub type SharedSelector = Arc<dyn EndpointSelector>;

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn endpoint(name: &str) -> Endpoint {
        Endpoint::new(name, Url::parse("http://localhost:11434").unwrap(), false)
    }

    #[tokio::test]
    async fn round_robins_across_candidates() {
        let selector = RoundRobinSelector::new();
        let endpoints = vec![endpoint("a"), endpoint("b")];

        let first = selector.select(&endpoints).await.unwrap();
        let second = selector.select(&endpoints).await.unwrap();
        assert_ne!(first.name, second.name);
    }

    #[test]
    fn connections_never_go_negative() {
        let selector = RoundRobinSelector::new();
        selector.decrement_connections("a");
        assert_eq!(selector.active_connections("a"), 0);

        selector.increment_connections("a");
        selector.decrement_connections("a");
        selector.decrement_connections("a");
        assert_eq!(selector.active_connections("a"), 0);
    }
}
