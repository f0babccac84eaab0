//! Admission chain: rate limiting and size validation run before a request
//! is ever handed to the dispatcher.

pub mod rate_limiter;
pub mod size_validator;

use crate::errors::AdmissionError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one validator's decision.
pub enum Verdict {
    Allow,
    Deny(AdmissionError),
}

pub struct AdmissionRequest<'a> {
    pub client_id: &'a str,
    pub is_health_check: bool,
    pub declared_body_size: Option<u64>,
    pub header_byte_size: u64,
}

/// One link in the admission chain.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, request: &AdmissionRequest<'_>) -> Verdict;
}

/// Ordered sequence of validators; the first denial short-circuits the
/// chain. Rate limiting is ordered before size validation so an abusive
/// client is cut off before the (potentially large) body is inspected.
pub struct AdmissionChain {
    validators: Vec<Arc<dyn Validator>>,
}

impl AdmissionChain {
    pub fn new(validators: Vec<Arc<dyn Validator>>) -> Self {
        Self { validators }
    }

    pub async fn admit(&self, request: &AdmissionRequest<'_>) -> Verdict {
        for validator in &self.validators {
            if let Verdict::Deny(reason) = validator.validate(request).await {
                return Verdict::Deny(reason);
            }
        }
        Verdict::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysDeny;

    #[async_trait]
    impl Validator for AlwaysDeny {
        async fn validate(&self, _request: &AdmissionRequest<'_>) -> Verdict {
            Verdict::Deny(AdmissionError::RateLimited {
                retry_after: Duration::from_secs(1),
            })
        }
    }

    struct AlwaysAllow;

    #[async_trait]
    impl Validator for AlwaysAllow {
        async fn validate(&self, _request: &AdmissionRequest<'_>) -> Verdict {
            Verdict::Allow
        }
    }

    fn request() -> AdmissionRequest<'static> {
        AdmissionRequest {
            client_id: "client-a",
            is_health_check: false,
            declared_body_size: Some(0),
            header_byte_size: 0,
        }
    }

    #[tokio::test]
    async fn first_denial_short_circuits() {
        let chain: AdmissionChain = AdmissionChain::new(vec![
            Arc::new(AlwaysDeny),
            Arc::new(AlwaysAllow),
        ]);
        assert!(matches!(chain.admit(&request()).await, Verdict::Deny(_)));
    }

    #[tokio::test]
    async fn empty_chain_allows() {
        let chain = AdmissionChain::new(vec![]);
        assert!(matches!(chain.admit(&request()).await, Verdict::Allow));
    }
}
