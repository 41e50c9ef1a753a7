//! Endpoint selection over the instance cache

use std::sync::Arc;

use crate::cache::InstanceCache;
use crate::model::{InstanceDescriptor, ServiceIdentity};

/// No usable endpoint for a service right now
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Unavailable {
    #[error("service {0} not found")]
    UnknownService(ServiceIdentity),

    #[error("service {0} has no instance up")]
    NoInstanceUp(ServiceIdentity),
}

/// Picks the first UP instance's first endpoint
#[derive(Debug, Clone)]
pub struct EndpointSelector {
    cache: Arc<InstanceCache>,
}

impl EndpointSelector {
    pub fn new(cache: Arc<InstanceCache>) -> Self {
        Self { cache }
    }

    pub fn select(&self, identity: &ServiceIdentity) -> Result<String, Unavailable> {
        let instances = self
            .cache
            .get(identity)
            .ok_or_else(|| Unavailable::UnknownService(identity.clone()))?;

        first_up_endpoint(&instances)
            .map(normalize_endpoint)
            .ok_or_else(|| Unavailable::NoInstanceUp(identity.clone()))
    }
}

/// First endpoint of the first UP instance that has one
pub fn first_up_endpoint(instances: &[InstanceDescriptor]) -> Option<&str> {
    instances
        .iter()
        .filter(|i| i.status.is_up())
        .find_map(|i| i.endpoints.first().filter(|e| !e.is_empty()))
        .map(String::as_str)
}

/// Map the registry's `rest://` scheme to `http://`
pub fn normalize_endpoint(endpoint: &str) -> String {
    match endpoint.strip_prefix("rest://") {
        Some(rest) => format!("http://{}", rest),
        None => endpoint.to_string(),
    }
}
