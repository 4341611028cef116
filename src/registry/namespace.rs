//! Namespace Registry
//!
//! Immutable mapping of logical units to namespaces, built once from the
//! manifest. Every other component receives it as `Arc<NamespaceRegistry>`.

use crate::error::{Result, RouterError};
use crate::ident::is_valid_identifier;
use crate::registry::manifest::{Manifest, NamespaceKind};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Namespace {
    pub name: String,
    pub kind: NamespaceKind,
    pub owner: String,
}

impl Namespace {
    pub fn is_shared(&self) -> bool {
        self.kind == NamespaceKind::Shared
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogicalUnit {
    pub name: String,
    pub namespace: String,
    pub tables: BTreeSet<String>,
    pub table_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnresolvedReason {
    /// No unit lists the table and no declared prefix matches it.
    Unmapped,
    /// More than one unit's prefix matches.
    Ambiguous { candidates: Vec<String> },
    /// The namespace could not be introspected.
    ScanFailed { cause: String },
}

impl std::fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnresolvedReason::Unmapped => write!(f, "no logical unit claims this table"),
            UnresolvedReason::Ambiguous { candidates } => {
                write!(f, "ambiguous table prefix: {}", candidates.join(", "))
            }
            UnresolvedReason::ScanFailed { cause } => write!(f, "scan failed: {}", cause),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableResolution<'a> {
    Resolved(&'a LogicalUnit),
    Unresolved(UnresolvedReason),
}

#[derive(Debug)]
pub struct NamespaceRegistry {
    default_namespace: String,
    namespaces: BTreeMap<String, Namespace>,
    units: BTreeMap<String, LogicalUnit>,
    table_owners: HashMap<String, String>,
}

impl NamespaceRegistry {
    /// Validate the manifest and freeze it. Any contradiction is fatal.
    pub fn from_manifest(manifest: &Manifest) -> Result<Self> {
        if !is_valid_identifier(&manifest.default_namespace) {
            return Err(RouterError::config(format!(
                "Invalid default namespace name: {}",
                manifest.default_namespace
            )));
        }

        let mut namespaces: BTreeMap<String, Namespace> = BTreeMap::new();

        for entry in &manifest.namespaces {
            if !is_valid_identifier(&entry.name) {
                return Err(RouterError::config(format!(
                    "Invalid namespace name: {}",
                    entry.name
                )));
            }

            let owner = match entry.owner.as_deref().map(str::trim) {
                Some(owner) if !owner.is_empty() => owner.to_string(),
                _ => {
                    return Err(RouterError::config(format!(
                        "{} namespace '{}' has no designated owner",
                        entry.kind, entry.name
                    )))
                }
            };

            let namespace = Namespace {
                name: entry.name.clone(),
                kind: entry.kind,
                owner,
            };

            match namespaces.get(&entry.name) {
                Some(existing) if *existing != namespace => {
                    return Err(RouterError::config(format!(
                        "Namespace '{}' declared twice with conflicting definitions ({} owned by {} vs {} owned by {})",
                        entry.name, existing.kind, existing.owner, namespace.kind, namespace.owner
                    )));
                }
                Some(_) => debug!("Namespace {} redeclared identically", entry.name),
                None => {
                    namespaces.insert(entry.name.clone(), namespace);
                }
            }
        }

        let mut units: BTreeMap<String, LogicalUnit> = BTreeMap::new();
        // Prefixes a declaration spelled out, as opposed to the unit-name default
        let mut explicit_prefixes: HashMap<String, String> = HashMap::new();

        for entry in &manifest.units {
            if !is_valid_identifier(&entry.name) {
                return Err(RouterError::config(format!(
                    "Invalid logical unit name: {}",
                    entry.name
                )));
            }

            if !namespaces.contains_key(&entry.namespace) {
                return Err(RouterError::config(format!(
                    "Logical unit '{}' maps to undeclared namespace '{}'",
                    entry.name, entry.namespace
                )));
            }

            let prefix = entry.table_prefix.clone();
            if let Some(p) = &prefix {
                if !is_valid_identifier(p) {
                    return Err(RouterError::config(format!(
                        "Invalid table prefix '{}' for unit '{}'",
                        p, entry.name
                    )));
                }
            }

            for table in &entry.tables {
                if !is_valid_identifier(table) {
                    return Err(RouterError::config(format!(
                        "Invalid table name '{}' for unit '{}'",
                        table, entry.name
                    )));
                }
            }

            match units.get_mut(&entry.name) {
                Some(existing) => {
                    if existing.namespace != entry.namespace {
                        return Err(RouterError::config(format!(
                            "Logical unit '{}' declared twice with conflicting namespaces ({} vs {})",
                            entry.name, existing.namespace, entry.namespace
                        )));
                    }
                    if let Some(p) = prefix {
                        if let Some(declared) = explicit_prefixes.get(&entry.name) {
                            if *declared != p {
                                return Err(RouterError::config(format!(
                                    "Logical unit '{}' declared twice with conflicting table prefixes ({} vs {})",
                                    entry.name, declared, p
                                )));
                            }
                        }
                        existing.table_prefix = p.clone();
                        explicit_prefixes.insert(entry.name.clone(), p);
                    }
                    existing.tables.extend(entry.tables.iter().cloned());
                }
                None => {
                    if let Some(p) = &prefix {
                        explicit_prefixes.insert(entry.name.clone(), p.clone());
                    }
                    units.insert(
                        entry.name.clone(),
                        LogicalUnit {
                            name: entry.name.clone(),
                            namespace: entry.namespace.clone(),
                            tables: entry.tables.iter().cloned().collect(),
                            table_prefix: prefix.unwrap_or_else(|| entry.name.clone()),
                        },
                    );
                }
            }
        }

        let mut table_owners: HashMap<String, String> = HashMap::new();
        for unit in units.values() {
            for table in &unit.tables {
                if let Some(other) = table_owners.insert(table.clone(), unit.name.clone()) {
                    return Err(RouterError::config(format!(
                        "Table '{}' is claimed by both '{}' and '{}'",
                        table, other, unit.name
                    )));
                }
            }
        }

        info!(
            "Namespace registry built: {} namespaces, {} logical units, default namespace {}",
            namespaces.len(),
            units.len(),
            manifest.default_namespace
        );

        Ok(Self {
            default_namespace: manifest.default_namespace.clone(),
            namespaces,
            units,
            table_owners,
        })
    }

    /// Owning namespace of a unit. `None` means unregistered.
    pub fn namespace_of(&self, unit: &str) -> Option<&Namespace> {
        self.units
            .get(unit)
            .and_then(|u| self.namespaces.get(&u.namespace))
    }

    pub fn kind_of(&self, namespace: &str) -> Option<NamespaceKind> {
        self.namespaces.get(namespace).map(|ns| ns.kind)
    }

    pub fn owner_of(&self, namespace: &str) -> Option<&str> {
        self.namespaces.get(namespace).map(|ns| ns.owner.as_str())
    }

    pub fn unit(&self, name: &str) -> Option<&LogicalUnit> {
        self.units.get(name)
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    /// Declared namespaces, sorted by name.
    pub fn namespaces(&self) -> impl Iterator<Item = &Namespace> {
        self.namespaces.values()
    }

    pub fn shared_namespaces(&self) -> impl Iterator<Item = &Namespace> {
        self.namespaces.values().filter(|ns| ns.is_shared())
    }

    pub fn private_namespaces_of<'a>(
        &'a self,
        service: &'a str,
    ) -> impl Iterator<Item = &'a Namespace> + 'a {
        self.namespaces
            .values()
            .filter(move |ns| ns.kind == NamespaceKind::Private && ns.owner == service)
    }

    /// Every service that owns at least one namespace.
    pub fn services(&self) -> BTreeSet<&str> {
        self.namespaces.values().map(|ns| ns.owner.as_str()).collect()
    }

    /// Map a physical table to the unit that owns it.
    ///
    /// An explicit `tables` entry always wins. Otherwise the table must match
    /// exactly one unit's `{prefix}_` convention.
    pub fn unit_for_table(&self, table: &str) -> TableResolution<'_> {
        if let Some(unit) = self.table_owners.get(table).and_then(|u| self.units.get(u)) {
            return TableResolution::Resolved(unit);
        }

        let candidates: Vec<&LogicalUnit> = self
            .units
            .values()
            .filter(|u| {
                table
                    .strip_prefix(u.table_prefix.as_str())
                    .map(|rest| rest.starts_with('_') && rest.len() > 1)
                    .unwrap_or(false)
            })
            .collect();

        match candidates.as_slice() {
            [unit] => TableResolution::Resolved(unit),
            [] => TableResolution::Unresolved(UnresolvedReason::Unmapped),
            many => TableResolution::Unresolved(UnresolvedReason::Ambiguous {
                candidates: many.iter().map(|u| u.name.clone()).collect(),
            }),
        }
    }
}
