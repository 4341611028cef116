//! Connection search order
//!
//! Every service connects with `search_path` set to
//! `[its private namespaces, shared namespaces, default fallback]`.
//! Private namespaces come first so a same-named table in a shared namespace
//! is shadowed instead of read across service boundaries.

use crate::ident::quote_ident;
use crate::registry::NamespaceRegistry;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchOrder {
    pub service: String,
    pub namespaces: Vec<String>,
}

impl SearchOrder {
    /// Value for `SET search_path`, each namespace quoted.
    pub fn search_path(&self) -> String {
        self.namespaces
            .iter()
            .map(|ns| quote_ident(ns))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// libpq `options` string applying the order at connection start.
    pub fn connection_options(&self) -> String {
        // Spaces inside the value are escaped with a backslash for libpq
        format!("-c search_path={}", self.search_path().replace(' ', "\\ "))
    }

    /// The namespace a bare table name resolves to when it exists in several.
    pub fn first(&self) -> Option<&str> {
        self.namespaces.first().map(String::as_str)
    }
}

pub struct ConnectionConfigurator;

impl ConnectionConfigurator {
    pub fn new() -> Self {
        Self
    }

    pub fn search_order(&self, registry: &NamespaceRegistry, service: &str) -> SearchOrder {
        let mut namespaces: Vec<String> = Vec::new();
        let mut push = |name: &str| {
            if !namespaces.iter().any(|n| n == name) {
                namespaces.push(name.to_string());
            }
        };

        for ns in registry.private_namespaces_of(service) {
            push(&ns.name);
        }
        for ns in registry.shared_namespaces() {
            push(&ns.name);
        }
        push(registry.default_namespace());

        SearchOrder {
            service: service.to_string(),
            namespaces,
        }
    }
}

impl Default for ConnectionConfigurator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Manifest;

    fn registry() -> NamespaceRegistry {
        NamespaceRegistry::from_manifest(
            &Manifest::from_json(
                r#"{
                    "namespaces": [
                        {"name": "svc_a", "kind": "private", "owner": "intern-service"},
                        {"name": "svc_b", "kind": "private", "owner": "billing-service"},
                        {"name": "shared_ref", "kind": "shared", "owner": "core-service"},
                        {"name": "auth", "kind": "shared", "owner": "core-service"}
                    ]
                }"#,
            )
            .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_private_before_shared_before_fallback() {
        let order = ConnectionConfigurator::new().search_order(&registry(), "billing-service");
        assert_eq!(order.namespaces, vec!["svc_b", "auth", "shared_ref", "public"]);
        assert_eq!(order.first(), Some("svc_b"));
    }

    #[test]
    fn test_other_services_private_namespaces_are_excluded() {
        let order = ConnectionConfigurator::new().search_order(&registry(), "intern-service");
        assert!(!order.namespaces.contains(&"svc_b".to_string()));
        assert_eq!(order.namespaces[0], "svc_a");
    }

    #[test]
    fn test_unknown_service_gets_shared_and_fallback() {
        let order = ConnectionConfigurator::new().search_order(&registry(), "ghost");
        assert_eq!(order.namespaces, vec!["auth", "shared_ref", "public"]);
    }

    #[test]
    fn test_fallback_not_duplicated_when_declared_shared() {
        let registry = NamespaceRegistry::from_manifest(
            &Manifest::from_json(
                r#"{"namespaces": [{"name": "public", "kind": "shared", "owner": "core-service"}]}"#,
            )
            .unwrap(),
        )
        .unwrap();
        let order = ConnectionConfigurator::new().search_order(&registry, "core-service");
        assert_eq!(order.namespaces, vec!["public"]);
    }

    #[test]
    fn test_connection_options() {
        let order = ConnectionConfigurator::new().search_order(&registry(), "billing-service");
        assert_eq!(
            order.search_path(),
            "\"svc_b\",\"auth\",\"shared_ref\",\"public\""
        );
        assert_eq!(
            order.connection_options(),
            "-c search_path=\"svc_b\",\"auth\",\"shared_ref\",\"public\""
        );
    }

    #[test]
    fn test_connection_options_escapes_only_the_value() {
        let order = SearchOrder {
            service: "billing-service".to_string(),
            namespaces: vec!["svc b".to_string(), "public".to_string()],
        };
        let options = order.connection_options();
        assert!(options.starts_with("-c search_path="));
        assert_eq!(options, "-c search_path=\"svc\\ b\",\"public\"");
    }
}
