//! Handler registry and per-service scheduling policy.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::task::TaskRow;

/// Concurrency policy for one downstream service.
#[derive(Debug, Clone)]
pub struct ServicePolicy {
    pub service_name: String,
    /// Candidate rows the store returns per SKU per ranked read.
    pub per_sku_limit: i64,
    /// Ceiling on rows in progress at any instant.
    pub max_concurrency: i64,
}

impl ServicePolicy {
    /// Both limits are clamped to at least one.
    pub fn new(
        service_name: impl Into<String>,
        per_sku_limit: i64,
        max_concurrency: i64,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            per_sku_limit: per_sku_limit.max(1),
            max_concurrency: max_concurrency.max(1),
        }
    }
}

/// Side-effecting executor for one claimed task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Perform the downstream call for `task`.
    ///
    /// Invoked once per claim. Must observe `cancel`: once it fires, return
    /// an error promptly and the poller settles the row to canceled instead
    /// of failed. Handlers may not mutate the row.
    async fn execute(&self, task: &TaskRow, cancel: CancellationToken) -> Result<()>;
}

/// A registered service: its policy plus its handler.
#[derive(Clone)]
pub struct ServiceEntry {
    pub policy: ServicePolicy,
    pub handler: Arc<dyn TaskHandler>,
}

/// Maps a service name to its handler and policy.
///
/// Registration order is preserved; the poller visits services in exactly
/// this order each tick.
#[derive(Default)]
pub struct HandlerRegistry {
    order: Vec<String>,
    entries: HashMap<String, ServiceEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service. Re-registering replaces the entry but keeps the
    /// original position.
    pub fn register(&mut self, policy: ServicePolicy, handler: Arc<dyn TaskHandler>) {
        let name = policy.service_name.clone();
        if !self.entries.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.entries.insert(name, ServiceEntry { policy, handler });
    }

    pub fn get(&self, service: &str) -> Option<&ServiceEntry> {
        self.entries.get(service)
    }

    /// Registered services in registration order.
    pub fn services(&self) -> impl Iterator<Item = &ServiceEntry> {
        self.order.iter().filter_map(|name| self.entries.get(name))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl TaskHandler for NoopHandler {
        async fn execute(&self, _task: &TaskRow, _cancel: CancellationToken) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn policy_clamps_limits() {
        let policy = ServicePolicy::new("iam", 0, -3);
        assert_eq!(policy.per_sku_limit, 1);
        assert_eq!(policy.max_concurrency, 1);
    }

    #[test]
    fn registry_preserves_registration_order() {
        let mut registry = HandlerRegistry::new();
        for name in ["iam", "iot", "billing"] {
            registry.register(ServicePolicy::new(name, 2, 4), Arc::new(NoopHandler));
        }
        // Re-registering keeps the original slot.
        registry.register(ServicePolicy::new("iot", 1, 1), Arc::new(NoopHandler));

        let names: Vec<&str> = registry
            .services()
            .map(|entry| entry.policy.service_name.as_str())
            .collect();
        assert_eq!(names, ["iam", "iot", "billing"]);
        assert_eq!(registry.get("iot").unwrap().policy.max_concurrency, 1);
        assert_eq!(registry.len(), 3);
    }
}
