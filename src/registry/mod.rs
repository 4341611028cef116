//! Namespace Registry
//!
//! Loads the namespace manifest and freezes it into the registry every other
//! component consults.
//!
//! Manifest layout:
//! ```json
//! {
//!   "default_namespace": "public",
//!   "namespaces": [{"name": "svc_b", "kind": "private", "owner": "billing-service"}],
//!   "units": [{"name": "billing", "namespace": "svc_b", "tables": [], "table_prefix": "billing"}]
//! }
//! ```

mod manifest;
mod namespace;

pub use manifest::{Manifest, NamespaceEntry, NamespaceKind, UnitEntry};
pub use namespace::{LogicalUnit, Namespace, NamespaceRegistry, TableResolution, UnresolvedReason};
