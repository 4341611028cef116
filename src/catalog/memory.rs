//! In-process catalog
//!
//! Mirrors the PostgreSQL backend's observable behavior: per-namespace and
//! per-unit locks around every mutation, a session-style deployment lock,
//! and in-place table moves that carry foreign keys along. Failures can be
//! injected per operation for exercising repair pause/resume paths.

use crate::catalog::{
    lock_order, reference_allowed, ActionOutcome, Catalog, ForeignKeyRef, MigrationRecord,
    RecordOutcome, TableMove,
};
use crate::error::{Result, RouterError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
struct MemTable {
    rows: Vec<JsonValue>,
    foreign_keys: Vec<ForeignKeyRef>,
}

#[derive(Debug, Clone, Default)]
struct MemNamespace {
    tables: BTreeMap<String, MemTable>,
    /// `None` until the journal table exists.
    journal: Option<Vec<MigrationRecord>>,
}

#[derive(Debug, Default)]
struct State {
    namespaces: BTreeMap<String, MemNamespace>,
}

pub struct MemoryCatalog {
    state: Mutex<State>,
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
    deployment_locks: DashSet<String>,
    faults: DashSet<(String, String)>,
}

impl MemoryCatalog {
    /// Starts with an empty `public` namespace, like a fresh database.
    pub fn new() -> Self {
        let mut state = State::default();
        state
            .namespaces
            .insert("public".to_string(), MemNamespace::default());
        Self {
            state: Mutex::new(state),
            locks: DashMap::new(),
            deployment_locks: DashSet::new(),
            faults: DashSet::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // Mutations never yield mid-update, so a poisoned state is still whole
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn lock(&self, keys: Vec<String>) -> Vec<OwnedMutexGuard<()>> {
        // An entry only the map still references has no holder or waiter
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);

        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let mutex = self
                .locks
                .entry(key)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone();
            guards.push(mutex.lock_owned().await);
        }
        guards
    }

    fn check_fault(&self, operation: &str, target: &str) -> Result<()> {
        if self
            .faults
            .contains(&(operation.to_string(), target.to_string()))
        {
            return Err(RouterError::QueryFailed {
                namespace: target.to_string(),
                operation: operation.to_string(),
                cause: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    /// Make `operation` fail for `target` (a namespace or table name) until
    /// [`clear_failures`](Self::clear_failures) is called.
    pub fn fail_on(&self, operation: &str, target: &str) {
        self.faults
            .insert((operation.to_string(), target.to_string()));
    }

    pub fn clear_failures(&self) {
        self.faults.clear();
    }

    pub fn add_namespace(&self, namespace: &str) {
        self.state()
            .namespaces
            .entry(namespace.to_string())
            .or_default();
    }

    pub fn add_table(&self, namespace: &str, table: &str, rows: Vec<JsonValue>) {
        self.state()
            .namespaces
            .entry(namespace.to_string())
            .or_default()
            .tables
            .insert(
                table.to_string(),
                MemTable {
                    rows,
                    foreign_keys: Vec::new(),
                },
            );
    }

    pub fn add_foreign_key(
        &self,
        namespace: &str,
        table: &str,
        referenced_namespace: &str,
        referenced_table: &str,
    ) {
        let mut state = self.state();
        if let Some(t) = state
            .namespaces
            .get_mut(namespace)
            .and_then(|ns| ns.tables.get_mut(table))
        {
            t.foreign_keys.push(ForeignKeyRef {
                constraint: format!("{}_{}_fkey", table, referenced_table),
                referenced_namespace: referenced_namespace.to_string(),
                referenced_table: referenced_table.to_string(),
            });
        }
    }

    /// Insert a journal row directly, bypassing all checks. Creates the
    /// namespace and journal as needed.
    pub fn add_record(&self, namespace: &str, unit: &str, migration: &str, applied_at: DateTime<Utc>) {
        self.state()
            .namespaces
            .entry(namespace.to_string())
            .or_default()
            .journal
            .get_or_insert_with(Vec::new)
            .push(MigrationRecord {
                namespace: namespace.to_string(),
                logical_unit: unit.to_string(),
                migration_name: migration.to_string(),
                applied_at,
            });
    }

    pub fn has_table(&self, namespace: &str, table: &str) -> bool {
        self.state()
            .namespaces
            .get(namespace)
            .map(|ns| ns.tables.contains_key(table))
            .unwrap_or(false)
    }

    pub fn table_rows(&self, namespace: &str, table: &str) -> Option<Vec<JsonValue>> {
        self.state()
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.tables.get(table))
            .map(|t| t.rows.clone())
    }

    pub fn has_journal(&self, namespace: &str) -> bool {
        self.state()
            .namespaces
            .get(namespace)
            .map(|ns| ns.journal.is_some())
            .unwrap_or(false)
    }

    /// Every journal row in the database, ordered by namespace.
    pub fn all_records(&self) -> Vec<MigrationRecord> {
        self.state()
            .namespaces
            .values()
            .filter_map(|ns| ns.journal.as_ref())
            .flat_map(|j| j.iter().cloned())
            .collect()
    }

    pub fn is_deployment_locked(&self, deployment: &str) -> bool {
        self.deployment_locks.contains(deployment)
    }
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

fn record_in(state: &State, namespace: &str, unit: &str, migration: &str) -> Option<MigrationRecord> {
    state
        .namespaces
        .get(namespace)
        .and_then(|ns| ns.journal.as_ref())
        .and_then(|j| {
            j.iter()
                .find(|r| r.logical_unit == unit && r.migration_name == migration)
                .cloned()
        })
}

fn remove_record(state: &mut State, namespace: &str, unit: &str, migration: &str) {
    if let Some(journal) = state
        .namespaces
        .get_mut(namespace)
        .and_then(|ns| ns.journal.as_mut())
    {
        journal.retain(|r| !(r.logical_unit == unit && r.migration_name == migration));
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn list_namespaces(&self) -> Result<BTreeSet<String>> {
        Ok(self.state().namespaces.keys().cloned().collect())
    }

    async fn list_tables(&self, namespace: &str) -> Result<BTreeSet<String>> {
        self.check_fault("list_tables", namespace)?;
        Ok(self
            .state()
            .namespaces
            .get(namespace)
            .map(|ns| ns.tables.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn journal_namespaces(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .state()
            .namespaces
            .iter()
            .filter(|(_, ns)| ns.journal.is_some())
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn create_namespace(&self, namespace: &str) -> Result<bool> {
        let _guards = self.lock(lock_order(&[namespace], None)).await;
        self.check_fault("create_namespace", namespace)?;

        let mut state = self.state();
        if state.namespaces.contains_key(namespace) {
            return Ok(false);
        }
        state
            .namespaces
            .insert(namespace.to_string(), MemNamespace::default());
        Ok(true)
    }

    async fn ensure_journal(&self, namespace: &str) -> Result<bool> {
        let _guards = self.lock(lock_order(&[namespace], None)).await;
        self.check_fault("ensure_journal", namespace)?;

        let mut state = self.state();
        let ns = state.namespaces.entry(namespace.to_string()).or_default();
        if ns.journal.is_some() {
            return Ok(false);
        }
        ns.journal = Some(Vec::new());
        Ok(true)
    }

    async fn journal_records(&self, namespace: &str) -> Result<Vec<MigrationRecord>> {
        self.check_fault("journal_records", namespace)?;

        let state = self.state();
        let journal = state
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.journal.as_ref())
            .ok_or_else(|| RouterError::QueryFailed {
                namespace: namespace.to_string(),
                operation: "read journal".to_string(),
                cause: "journal table does not exist".to_string(),
            })?;

        let mut records = journal.clone();
        records.sort_by(|a, b| {
            (a.applied_at, &a.migration_name, &a.logical_unit)
                .cmp(&(b.applied_at, &b.migration_name, &b.logical_unit))
        });
        Ok(records)
    }

    async fn find_records(&self, unit: &str, migration: &str) -> Result<Vec<MigrationRecord>> {
        let state = self.state();
        Ok(state
            .namespaces
            .keys()
            .filter_map(|ns| record_in(&state, ns, unit, migration))
            .collect())
    }

    async fn record_migration(
        &self,
        namespace: &str,
        unit: &str,
        migration: &str,
    ) -> Result<RecordOutcome> {
        let _guards = self.lock(lock_order(&[namespace], Some(unit))).await;
        self.check_fault("record_migration", namespace)?;

        let mut state = self.state();
        if !state
            .namespaces
            .get(namespace)
            .map(|ns| ns.journal.is_some())
            .unwrap_or(false)
        {
            return Err(RouterError::QueryFailed {
                namespace: namespace.to_string(),
                operation: "record migration".to_string(),
                cause: "journal table missing, run bootstrap first".to_string(),
            });
        }

        let elsewhere: Vec<MigrationRecord> = state
            .namespaces
            .keys()
            .filter(|ns| ns.as_str() != namespace)
            .filter_map(|ns| record_in(&state, ns, unit, migration))
            .collect();
        if !elsewhere.is_empty() {
            return Ok(RecordOutcome::Conflict(elsewhere));
        }
        if let Some(existing) = record_in(&state, namespace, unit, migration) {
            return Ok(RecordOutcome::AlreadyPresent(existing));
        }

        let record = MigrationRecord {
            namespace: namespace.to_string(),
            logical_unit: unit.to_string(),
            migration_name: migration.to_string(),
            applied_at: Utc::now(),
        };
        if let Some(journal) = state
            .namespaces
            .get_mut(namespace)
            .and_then(|ns| ns.journal.as_mut())
        {
            journal.push(record.clone());
        }
        Ok(RecordOutcome::Inserted(record))
    }

    async fn foreign_keys(&self, namespace: &str, table: &str) -> Result<Vec<ForeignKeyRef>> {
        Ok(self
            .state()
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.tables.get(table))
            .map(|t| t.foreign_keys.clone())
            .unwrap_or_default())
    }

    async fn export_table(&self, namespace: &str, table: &str) -> Result<JsonValue> {
        self.check_fault("export_table", table)?;
        self.table_rows(namespace, table)
            .map(JsonValue::Array)
            .ok_or_else(|| RouterError::QueryFailed {
                namespace: namespace.to_string(),
                operation: "export table".to_string(),
                cause: format!("relation {}.{} does not exist", namespace, table),
            })
    }

    async fn move_table(&self, mv: &TableMove) -> Result<ActionOutcome> {
        let _guards = self
            .lock(lock_order(&[mv.from.as_str(), mv.to.as_str()], None))
            .await;
        self.check_fault("move_table", &mv.table)?;

        let mut state = self.state();
        let in_from = state
            .namespaces
            .get(&mv.from)
            .map(|ns| ns.tables.contains_key(&mv.table))
            .unwrap_or(false);
        let in_to = state
            .namespaces
            .get(&mv.to)
            .map(|ns| ns.tables.contains_key(&mv.table));

        match (in_from, in_to) {
            (_, None) => {
                return Ok(ActionOutcome::Rejected(format!(
                    "destination namespace {} does not exist",
                    mv.to
                )))
            }
            (false, Some(true)) => return Ok(ActionOutcome::AlreadyApplied),
            (true, Some(true)) => {
                return Ok(ActionOutcome::Rejected(format!(
                    "{} already exists in {}",
                    mv.table, mv.to
                )))
            }
            (false, Some(false)) => {
                return Ok(ActionOutcome::Rejected(format!(
                    "{} not found in {}",
                    mv.table, mv.from
                )))
            }
            (true, Some(false)) => {}
        }

        let table = state
            .namespaces
            .get(&mv.from)
            .and_then(|ns| ns.tables.get(&mv.table))
            .cloned()
            .unwrap_or_default();

        let dangling: Vec<String> = table
            .foreign_keys
            .iter()
            .filter(|fk| !reference_allowed(fk, mv))
            .map(|fk| {
                format!(
                    "{} -> {}.{}",
                    fk.constraint, fk.referenced_namespace, fk.referenced_table
                )
            })
            .collect();
        if !dangling.is_empty() {
            return Ok(ActionOutcome::Rejected(format!(
                "foreign keys reference tables absent from {}: {}",
                mv.to,
                dangling.join(", ")
            )));
        }

        if let Some(ns) = state.namespaces.get_mut(&mv.from) {
            ns.tables.remove(&mv.table);
        }
        if let Some(ns) = state.namespaces.get_mut(&mv.to) {
            ns.tables.insert(mv.table.clone(), table);
        }

        // Constraints follow the relation, not its name
        for ns in state.namespaces.values_mut() {
            for t in ns.tables.values_mut() {
                for fk in &mut t.foreign_keys {
                    if fk.referenced_namespace == mv.from && fk.referenced_table == mv.table {
                        fk.referenced_namespace = mv.to.clone();
                    }
                }
            }
        }

        Ok(ActionOutcome::Applied)
    }

    async fn relocate_record(
        &self,
        unit: &str,
        migration: &str,
        from: &str,
        to: &str,
    ) -> Result<ActionOutcome> {
        let _guards = self.lock(lock_order(&[from, to], Some(unit))).await;
        self.check_fault("relocate_record", from)?;

        let mut state = self.state();
        let source = match (
            record_in(&state, from, unit, migration),
            record_in(&state, to, unit, migration),
        ) {
            (None, Some(_)) => return Ok(ActionOutcome::AlreadyApplied),
            (Some(_), Some(_)) => {
                return Ok(ActionOutcome::Rejected(format!(
                    "{}.{} is recorded in both {} and {}",
                    unit, migration, from, to
                )))
            }
            (None, None) => {
                return Ok(ActionOutcome::Rejected(format!(
                    "{}.{} not recorded in {}",
                    unit, migration, from
                )))
            }
            (Some(source), None) => source,
        };

        remove_record(&mut state, from, unit, migration);
        state
            .namespaces
            .entry(to.to_string())
            .or_default()
            .journal
            .get_or_insert_with(Vec::new)
            .push(MigrationRecord {
                namespace: to.to_string(),
                ..source
            });
        Ok(ActionOutcome::Applied)
    }

    async fn delete_duplicate_record(
        &self,
        unit: &str,
        migration: &str,
        namespace: &str,
        canonical: &str,
    ) -> Result<ActionOutcome> {
        let _guards = self
            .lock(lock_order(&[namespace, canonical], Some(unit)))
            .await;
        self.check_fault("delete_duplicate_record", namespace)?;

        let mut state = self.state();
        let Some(duplicate) = record_in(&state, namespace, unit, migration) else {
            return Ok(ActionOutcome::AlreadyApplied);
        };
        let Some(kept) = record_in(&state, canonical, unit, migration) else {
            return Ok(ActionOutcome::Rejected(format!(
                "canonical record {}.{} missing from {}",
                unit, migration, canonical
            )));
        };
        if kept.applied_at > duplicate.applied_at {
            return Ok(ActionOutcome::Rejected(format!(
                "record in {} is earlier than the one kept in {}",
                namespace, canonical
            )));
        }

        remove_record(&mut state, namespace, unit, migration);
        Ok(ActionOutcome::Applied)
    }

    async fn try_lock_deployment(&self, deployment: &str) -> Result<bool> {
        Ok(self.deployment_locks.insert(deployment.to_string()))
    }

    async fn unlock_deployment(&self, deployment: &str) -> Result<()> {
        self.deployment_locks.remove(deployment);
        Ok(())
    }
}
