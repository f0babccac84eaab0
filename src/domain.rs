//! Shared domain types passed between discovery, the balancer, and the
//! dispatcher.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use url::Url;

/// A configured backend: name, parsed base URL, and the flags that govern
/// how target URLs are composed against it.
///
/// Discovery owns the canonical copy; the dispatcher only ever holds
/// cloned, read-only snapshots.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub name: String,
    pub base_url: Url,
    pub preserve_path: bool,
    healthy: Arc<AtomicBool>,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, base_url: Url, preserve_path: bool) -> Self {
        Self {
            name: name.into(),
            base_url,
            preserve_path,
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Endpoint {}

/// On-disk / config representation of an endpoint, before it's resolved
/// into a live [`Endpoint`] by discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub preserve_path: bool,
}

impl EndpointSpec {
    pub fn resolve(&self) -> Result<Endpoint, url::ParseError> {
        let base_url = Url::parse(&self.url)?;
        Ok(Endpoint::new(self.name.clone(), base_url, self.preserve_path))
    }
}
