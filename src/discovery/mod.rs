//! Service-discovery collaborator: supplies the current endpoint set and
//! their liveness flags. The dataplane only consumes this interface; the
//! policy for how endpoints are discovered and health-checked lives
//! elsewhere (a real deployment would swap [`StaticDiscovery`] for one
//! backed by DNS SRV records, Consul, Kubernetes endpoints, etc).

use crate::domain::{Endpoint, EndpointSpec};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;

/// `getHealthyEndpoints` / `refresh` contract consumed by the dispatcher.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Ordered list of currently healthy endpoints. Order is whatever the
    /// balancer's candidate iteration should see; discovery does not
    /// implement load-balancing policy itself.
    async fn healthy_endpoints(&self) -> Vec<Endpoint>;

    /// Re-derive the endpoint set / health flags from the backing source.
    async fn refresh(&self);
}

/// Fixed endpoint list read from configuration. Health is tracked via each
/// [`Endpoint`]'s own atomic flag; `refresh` is a no-op since there is no
/// external source to reconcile against.
pub struct StaticDiscovery {
    endpoints: RwLock<Vec<Endpoint>>,
}

impl StaticDiscovery {
    pub fn new(specs: &[EndpointSpec]) -> Result<Self, url::ParseError> {
        let endpoints = specs
            .iter()
            .map(EndpointSpec::resolve)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            endpoints: RwLock::new(endpoints),
        })
    }

    pub fn from_endpoints(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints: RwLock::new(endpoints),
        }
    }

    pub fn set_endpoint_health(&self, name: &str, healthy: bool) {
        if let Some(endpoint) = self.endpoints.read().iter().find(|e| e.name == name) {
            endpoint.set_healthy(healthy);
        }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn healthy_endpoints(&self) -> Vec<Endpoint> {
        self.endpoints
            .read()
            .iter()
            .filter(|e| e.is_healthy())
            .cloned()
            .collect()
    }

    async fn refresh(&self) {}
}

pub type SharedDiscovery = Arc<dyn Discovery>;

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn endpoint(name: &str) -> Endpoint {
        Endpoint::new(name, Url::parse("http://localhost:11434").unwrap(), false)
    }

    #[tokio::test]
    async fn filters_unhealthy_endpoints() {
        let a = endpoint("a");
        let b = endpoint("b");
        b.set_healthy(false);
        let discovery = StaticDiscovery::from_endpoints(vec![a, b]);

        let healthy = discovery.healthy_endpoints().await;
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].name, "a");
    }
}
