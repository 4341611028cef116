use crate::catalog::{Catalog, MigrationRecord, RecordOutcome};
use crate::error::{Result, RouterError};
use crate::pool::RoutingDecisionEngine;
use crate::registry::NamespaceRegistry;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(MigrationRecord),
    /// Already recorded in the same namespace; nothing was written.
    AlreadyApplied(MigrationRecord),
}

impl ApplyOutcome {
    pub fn record(&self) -> &MigrationRecord {
        match self {
            ApplyOutcome::Applied(r) | ApplyOutcome::AlreadyApplied(r) => r,
        }
    }
}

/// Per-namespace migration journal with system-wide uniqueness of
/// `(logical_unit, migration_name)`.
pub struct MigrationJournal {
    catalog: Arc<dyn Catalog>,
    registry: Arc<NamespaceRegistry>,
}

impl MigrationJournal {
    pub fn new(catalog: Arc<dyn Catalog>, registry: Arc<NamespaceRegistry>) -> Self {
        Self { catalog, registry }
    }

    /// Ensure the namespace and its journal table exist. Safe on every startup.
    pub async fn bootstrap(&self, namespace: &str) -> Result<()> {
        let created = self.catalog.ensure_journal(namespace).await?;
        if created {
            info!("Created migration journal in namespace {}", namespace);
        } else {
            debug!("Migration journal already present in {}", namespace);
        }
        Ok(())
    }

    /// Bootstrap every namespace the registry declares, plus the default fallback.
    /// Returns the namespaces processed.
    pub async fn bootstrap_all(&self) -> Result<Vec<String>> {
        let mut targets: Vec<String> = self.registry.namespaces().map(|ns| ns.name.clone()).collect();
        let default = self.registry.default_namespace().to_string();
        if !targets.contains(&default) {
            targets.push(default);
        }

        for namespace in &targets {
            self.bootstrap(namespace).await?;
        }

        info!(
            "Bootstrap complete for {} namespaces on {}",
            targets.len(),
            self.catalog.describe()
        );
        Ok(targets)
    }

    /// Record a migration in `namespace`, refusing when the pair already
    /// lives in any other namespace.
    pub async fn apply(&self, namespace: &str, unit: &str, migration: &str) -> Result<ApplyOutcome> {
        match self.catalog.record_migration(namespace, unit, migration).await? {
            RecordOutcome::Inserted(record) => {
                info!("Recorded migration {}.{} in {}", unit, migration, namespace);
                Ok(ApplyOutcome::Applied(record))
            }
            RecordOutcome::AlreadyPresent(record) => {
                debug!(
                    "Migration {}.{} already recorded in {}, skipping",
                    unit, migration, namespace
                );
                Ok(ApplyOutcome::AlreadyApplied(record))
            }
            RecordOutcome::Conflict(existing) => {
                let err = RouterError::Consistency {
                    unit: unit.to_string(),
                    migration: migration.to_string(),
                    namespace: namespace.to_string(),
                    existing: existing.into_iter().map(|r| r.namespace).collect(),
                };
                warn!(category = err.category(), "{}", err);
                Err(err)
            }
        }
    }

    /// Authorize `service` for the unit, then record into the unit's own namespace.
    pub async fn apply_for(
        &self,
        engine: &RoutingDecisionEngine,
        service: &str,
        unit: &str,
        migration: &str,
    ) -> Result<ApplyOutcome> {
        let namespace = engine.authorize_migrate(service, unit).map_err(|e| {
            warn!(category = e.category(), service, unit, "Migration refused: {}", e);
            e
        })?;
        let namespace = namespace.name.clone();
        self.apply(&namespace, unit, migration).await
    }

    /// Applied records ordered by `applied_at`, then `migration_name`.
    pub async fn list_applied(&self, namespace: &str) -> Result<Vec<MigrationRecord>> {
        let mut records = self.catalog.journal_records(namespace).await?;
        records.sort_by(|a, b| {
            (a.applied_at, &a.migration_name, &a.logical_unit)
                .cmp(&(b.applied_at, &b.migration_name, &b.logical_unit))
        });
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::registry::Manifest;
    use chrono::TimeZone;

    fn registry() -> Arc<NamespaceRegistry> {
        let manifest = Manifest::from_json(
            r#"{
                "namespaces": [
                    {"name": "svc_a", "kind": "private", "owner": "intern-service"},
                    {"name": "svc_b", "kind": "private", "owner": "billing-service"},
                    {"name": "shared", "kind": "shared", "owner": "core-service"}
                ],
                "units": [
                    {"name": "billing", "namespace": "svc_b"},
                    {"name": "internships", "namespace": "svc_a"},
                    {"name": "auth", "namespace": "shared"}
                ]
            }"#,
        )
        .unwrap();
        Arc::new(NamespaceRegistry::from_manifest(&manifest).unwrap())
    }

    fn journal() -> (Arc<MemoryCatalog>, MigrationJournal) {
        let catalog = Arc::new(MemoryCatalog::new());
        let journal = MigrationJournal::new(catalog.clone(), registry());
        (catalog, journal)
    }

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let (catalog, journal) = journal();

        journal.bootstrap_all().await.unwrap();
        let once = catalog.list_namespaces().await.unwrap();
        let journals_once = catalog.journal_namespaces().await.unwrap();

        for _ in 0..3 {
            journal.bootstrap_all().await.unwrap();
        }

        assert_eq!(catalog.list_namespaces().await.unwrap(), once);
        assert_eq!(catalog.journal_namespaces().await.unwrap(), journals_once);
        assert!(catalog.has_journal("svc_b"));
        assert!(catalog.has_journal("public"));
    }

    #[tokio::test]
    async fn test_apply_is_idempotent_in_same_namespace() {
        let (catalog, journal) = journal();
        journal.bootstrap_all().await.unwrap();

        let first = journal.apply("svc_b", "billing", "0001_initial").await.unwrap();
        assert!(matches!(first, ApplyOutcome::Applied(_)));

        let second = journal.apply("svc_b", "billing", "0001_initial").await.unwrap();
        assert!(matches!(second, ApplyOutcome::AlreadyApplied(_)));
        assert_eq!(first.record(), second.record());

        assert_eq!(catalog.all_records().len(), 1);
    }

    #[tokio::test]
    async fn test_apply_refuses_record_in_second_namespace() {
        let (catalog, journal) = journal();
        journal.bootstrap_all().await.unwrap();

        journal.apply("svc_b", "billing", "0001_initial").await.unwrap();
        let err = journal
            .apply("public", "billing", "0001_initial")
            .await
            .unwrap_err();

        match err {
            RouterError::Consistency { existing, namespace, .. } => {
                assert_eq!(existing, vec!["svc_b".to_string()]);
                assert_eq!(namespace, "public");
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let records = catalog.all_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].namespace, "svc_b");
    }

    #[tokio::test]
    async fn test_concurrent_apply_records_once() {
        let (catalog, journal) = journal();
        journal.bootstrap_all().await.unwrap();
        let journal = Arc::new(journal);

        let mut handles = Vec::new();
        for ns in ["svc_b", "public", "svc_b", "shared", "public"] {
            let journal = journal.clone();
            handles.push(tokio::spawn(async move {
                journal.apply(ns, "billing", "0002_lines").await
            }));
        }

        let mut ok = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                ok += 1;
            }
        }

        let records = catalog.all_records();
        assert_eq!(records.len(), 1);
        assert!(ok >= 1);
    }

    #[tokio::test]
    async fn test_apply_for_checks_ownership() {
        let (_catalog, journal) = journal();
        journal.bootstrap_all().await.unwrap();
        let engine = RoutingDecisionEngine::new(registry());

        let outcome = journal
            .apply_for(&engine, "billing-service", "billing", "0001_initial")
            .await
            .unwrap();
        assert_eq!(outcome.record().namespace, "svc_b");

        let err = journal
            .apply_for(&engine, "intern-service", "billing", "0002_lines")
            .await
            .unwrap_err();
        assert_eq!(err.category(), "migration_not_authorized");

        let err = journal
            .apply_for(&engine, "billing-service", "payroll", "0001_initial")
            .await
            .unwrap_err();
        assert_eq!(err.category(), "unregistered_unit");
    }

    #[tokio::test]
    async fn test_list_applied_ordering() {
        let (catalog, journal) = journal();
        let t = |s| chrono::Utc.timestamp_opt(s, 0).unwrap();
        catalog.add_record("svc_b", "billing", "0003_tax", t(300));
        catalog.add_record("svc_b", "billing", "0002_lines", t(100));
        catalog.add_record("svc_b", "billing", "0001_initial", t(100));

        let names: Vec<String> = journal
            .list_applied("svc_b")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.migration_name)
            .collect();
        assert_eq!(names, vec!["0001_initial", "0002_lines", "0003_tax"]);
    }
}
