//! Namespace manifest
//!
//! The static deployment document the registry is built from. Stored as JSON:
//!
//! ```json
//! {
//!   "default_namespace": "public",
//!   "namespaces": [
//!     { "name": "svc_b", "kind": "private", "owner": "billing-service" },
//!     { "name": "shared", "kind": "shared", "owner": "core-service" }
//!   ],
//!   "units": [
//!     { "name": "billing", "namespace": "svc_b", "tables": ["billing_invoice"] }
//!   ]
//! }
//! ```

use crate::error::{Result, RouterError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceKind {
    Private,
    Shared,
}

impl std::fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NamespaceKind::Private => write!(f, "private"),
            NamespaceKind::Shared => write!(f, "shared"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceEntry {
    pub name: String,
    pub kind: NamespaceKind,
    /// Owning service for private namespaces, migration owner for shared ones.
    #[serde(default)]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitEntry {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub tables: Vec<String>,
    /// Tables named `{prefix}_...` belong to this unit. Defaults to the unit name.
    #[serde(default)]
    pub table_prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default = "default_namespace")]
    pub default_namespace: String,
    #[serde(default)]
    pub namespaces: Vec<NamespaceEntry>,
    #[serde(default)]
    pub units: Vec<UnitEntry>,
}

fn default_namespace() -> String {
    "public".to_string()
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            RouterError::config(format!("Failed to read manifest {}: {}", path.display(), e))
        })?;

        let manifest = Self::from_json(&content).map_err(|e| match e {
            RouterError::Configuration { message } => {
                RouterError::config(format!("{}: {}", path.display(), message))
            }
            other => other,
        })?;

        info!(
            "Loaded manifest {} ({} namespaces, {} units)",
            path.display(),
            manifest.namespaces.len(),
            manifest.units.len()
        );
        Ok(manifest)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| RouterError::config(format!("Failed to parse manifest: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_with_defaults() {
        let manifest = Manifest::from_json(
            r#"{
                "namespaces": [{"name": "svc_b", "kind": "private", "owner": "billing-service"}],
                "units": [{"name": "billing", "namespace": "svc_b"}]
            }"#,
        )
        .unwrap();

        assert_eq!(manifest.default_namespace, "public");
        assert_eq!(manifest.namespaces[0].kind, NamespaceKind::Private);
        assert!(manifest.units[0].tables.is_empty());
        assert_eq!(manifest.units[0].table_prefix, None);
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let err = Manifest::from_json(
            r#"{"namespaces": [{"name": "x", "kind": "global", "owner": "a"}]}"#,
        )
        .unwrap_err();
        assert_eq!(err.category(), "configuration_error");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"default_namespace": "common", "namespaces": [], "units": []}}"#
        )
        .unwrap();

        let manifest = Manifest::load(file.path()).unwrap();
        assert_eq!(manifest.default_namespace, "common");
    }

    #[test]
    fn test_load_missing_file() {
        let err = Manifest::load(Path::new("/nonexistent/namespaces.json")).unwrap_err();
        assert!(matches!(err, RouterError::Configuration { .. }));
    }
}
