//! Catalog backends
//!
//! Everything the journal, auditor and repairer need from the physical
//! database goes through [`Catalog`]. Mutations are atomic per call: each one
//! runs in its own transaction under the advisory locks of the namespaces it
//! touches, and reports whether it changed anything.
//!
//! - [`PgCatalog`]: PostgreSQL through a deadpool admin pool
//! - [`MemoryCatalog`]: in-process backend with the same locking semantics

mod memory;
mod postgres;

pub use memory::MemoryCatalog;
pub use postgres::PgCatalog;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Journal table created in every namespace.
pub const JOURNAL_TABLE: &str = "_schema_router_migrations";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub namespace: String,
    pub logical_unit: String,
    pub migration_name: String,
    pub applied_at: DateTime<Utc>,
}

impl MigrationRecord {
    /// `unit.migration`
    pub fn key(&self) -> String {
        format!("{}.{}", self.logical_unit, self.migration_name)
    }
}

/// An outgoing foreign key of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub constraint: String,
    pub referenced_namespace: String,
    pub referenced_table: String,
}

/// Parameters of an in-place table relocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMove {
    pub table: String,
    pub from: String,
    pub to: String,
    /// Namespaces an outgoing foreign key may point into after the move.
    pub reference_scope: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted(MigrationRecord),
    AlreadyPresent(MigrationRecord),
    /// The pair is already recorded elsewhere; nothing was written.
    Conflict(Vec<MigrationRecord>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum ActionOutcome {
    Applied,
    /// The desired end state already holds.
    AlreadyApplied,
    /// A precondition failed; nothing was changed.
    Rejected(String),
}

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Name used in log lines and reports.
    fn describe(&self) -> String;

    /// User namespaces (system schemas excluded), sorted.
    async fn list_namespaces(&self) -> Result<BTreeSet<String>>;

    /// Base tables of a namespace, excluding the journal table.
    async fn list_tables(&self, namespace: &str) -> Result<BTreeSet<String>>;

    /// Namespaces that contain a journal table.
    async fn journal_namespaces(&self) -> Result<BTreeSet<String>>;

    /// Returns true when the namespace was created by this call.
    async fn create_namespace(&self, namespace: &str) -> Result<bool>;

    /// Create the namespace and its journal table if missing.
    /// Returns true when the journal table was created by this call.
    async fn ensure_journal(&self, namespace: &str) -> Result<bool>;

    async fn journal_records(&self, namespace: &str) -> Result<Vec<MigrationRecord>>;

    /// Every record of `(unit, migration)` across all namespaces.
    async fn find_records(&self, unit: &str, migration: &str) -> Result<Vec<MigrationRecord>>;

    /// Check-then-insert under the namespace and unit locks.
    async fn record_migration(
        &self,
        namespace: &str,
        unit: &str,
        migration: &str,
    ) -> Result<RecordOutcome>;

    async fn foreign_keys(&self, namespace: &str, table: &str) -> Result<Vec<ForeignKeyRef>>;

    /// Table contents as a JSON array of row objects.
    async fn export_table(&self, namespace: &str, table: &str) -> Result<serde_json::Value>;

    async fn move_table(&self, mv: &TableMove) -> Result<ActionOutcome>;

    /// Move a journal row to another namespace, keeping its `applied_at`.
    async fn relocate_record(
        &self,
        unit: &str,
        migration: &str,
        from: &str,
        to: &str,
    ) -> Result<ActionOutcome>;

    /// Delete the copy in `namespace`, provided the copy in `canonical`
    /// exists and is not later.
    async fn delete_duplicate_record(
        &self,
        unit: &str,
        migration: &str,
        namespace: &str,
        canonical: &str,
    ) -> Result<ActionOutcome>;

    /// Deployment-scoped lock held across a whole repair run.
    async fn try_lock_deployment(&self, deployment: &str) -> Result<bool>;

    async fn unlock_deployment(&self, deployment: &str) -> Result<()>;
}

/// Key namespace for advisory locks taken by this crate.
pub(crate) const LOCK_CLASS: i32 = 0x5352;

pub(crate) fn namespace_lock_key(namespace: &str) -> String {
    format!("namespace:{}", namespace)
}

pub(crate) fn unit_lock_key(unit: &str) -> String {
    format!("unit:{}", unit)
}

pub(crate) fn deployment_lock_key(deployment: &str) -> String {
    format!("deployment:{}", deployment)
}

/// Lock keys for a set of namespaces plus a unit, in acquisition order:
/// namespaces sorted, the unit last.
pub(crate) fn lock_order(namespaces: &[&str], unit: Option<&str>) -> Vec<String> {
    let sorted: BTreeSet<&str> = namespaces.iter().copied().collect();
    let mut keys: Vec<String> = sorted.into_iter().map(namespace_lock_key).collect();
    if let Some(unit) = unit {
        keys.push(unit_lock_key(unit));
    }
    keys
}

/// Whether a foreign key stays valid once `mv.table` sits in `mv.to`.
pub(crate) fn reference_allowed(fk: &ForeignKeyRef, mv: &TableMove) -> bool {
    let self_reference = fk.referenced_namespace == mv.from && fk.referenced_table == mv.table;
    self_reference || mv.reference_scope.contains(&fk.referenced_namespace)
}
