use crate::error::{Result, RouterError};
use crate::pool::configurator::{ConnectionConfigurator, SearchOrder};
use crate::registry::{Namespace, NamespaceRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Central routing decisions: who may migrate which unit, and which search
/// order a service connects with. Immutable after construction.
pub struct RoutingDecisionEngine {
    registry: Arc<NamespaceRegistry>,
    orders: HashMap<String, SearchOrder>,
    fallback_order: SearchOrder,
}

impl RoutingDecisionEngine {
    pub fn new(registry: Arc<NamespaceRegistry>) -> Self {
        let configurator = ConnectionConfigurator::new();

        let orders = registry
            .services()
            .into_iter()
            .map(|service| {
                (
                    service.to_string(),
                    configurator.search_order(&registry, service),
                )
            })
            .collect();

        // No private namespaces: shared ones plus the fallback
        let fallback_order = configurator.search_order(&registry, "");

        Self {
            registry,
            orders,
            fallback_order,
        }
    }

    /// True iff `service` is the sole authorized migration owner of the
    /// unit's namespace. Unregistered units always fail closed.
    pub fn allow_migrate(&self, service: &str, unit: &str) -> bool {
        match self.authorize_migrate(service, unit) {
            Ok(_) => true,
            Err(e @ RouterError::UnregisteredUnit { .. }) => {
                error!(category = e.category(), service, unit, "{}", e);
                false
            }
            Err(e) => {
                warn!(category = e.category(), service, unit, "{}", e);
                false
            }
        }
    }

    /// Same decision as [`allow_migrate`](Self::allow_migrate), returning the
    /// target namespace or the reason for refusal.
    pub fn authorize_migrate(&self, service: &str, unit: &str) -> Result<&Namespace> {
        let namespace =
            self.registry
                .namespace_of(unit)
                .ok_or_else(|| RouterError::UnregisteredUnit {
                    unit: unit.to_string(),
                })?;

        // Private: the owning service. Shared: the designated migration owner.
        if namespace.owner == service {
            debug!(
                "Service {} authorized to migrate {} into {}",
                service, unit, namespace.name
            );
            Ok(namespace)
        } else {
            Err(RouterError::MigrationNotAuthorized {
                service: service.to_string(),
                unit: unit.to_string(),
                namespace: namespace.name.clone(),
                owner: namespace.owner.clone(),
            })
        }
    }

    /// Precomputed connection search order for a service.
    pub fn select_search_order(&self, service: &str) -> &[String] {
        &self.search_order(service).namespaces
    }

    pub fn search_order(&self, service: &str) -> &SearchOrder {
        self.orders.get(service).unwrap_or(&self.fallback_order)
    }
}
