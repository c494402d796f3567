//! Service discovery seam.
//!
//! The client resolves a logical service name to a base URL exactly once per
//! service and caches the result; a session re-resolves only on explicit
//! reconnect. Applications plug in their own resolver (DNS, registry, ...);
//! [`StaticDiscovery`] covers fixed rosters and tests.

use std::collections::HashMap;

use async_trait::async_trait;

/// A resolved network address for a logical service.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServiceEndpoint {
    pub service: String,
    /// Base URL without a trailing slash, e.g. `http://tools.internal:8080`.
    pub base_url: String,
}

impl ServiceEndpoint {
    pub fn new(service: impl Into<String>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            service: service.into(),
            base_url,
        }
    }
}

/// Resolves a logical service name to a network address.
/// `None` surfaces to callers as [`crate::ClientError::ServiceNotFound`].
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    async fn resolve(&self, service: &str) -> Option<ServiceEndpoint>;
}

/// In-memory discovery over a fixed `name -> base URL` map.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    routes: HashMap<String, String>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: impl Into<String>, base_url: impl Into<String>) -> Self {
        self.routes.insert(service.into(), base_url.into());
        self
    }

    pub fn insert(&mut self, service: impl Into<String>, base_url: impl Into<String>) {
        self.routes.insert(service.into(), base_url.into());
    }
}

#[async_trait]
impl ServiceDiscovery for StaticDiscovery {
    async fn resolve(&self, service: &str) -> Option<ServiceEndpoint> {
        self.routes
            .get(service)
            .map(|url| ServiceEndpoint::new(service, url.clone()))
    }
}
