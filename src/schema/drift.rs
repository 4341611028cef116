use crate::catalog::{Catalog, MigrationRecord};
use crate::registry::{NamespaceKind, NamespaceRegistry, TableResolution, UnresolvedReason};
use crate::schema::report::{DriftIssue, DriftReport, IssueDetail, RecordCopy};
use crate::error::Result;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where the registry says a table belongs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Expected {
    Namespace { namespace: String, unit: String },
    Unresolved(UnresolvedReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableObservation {
    pub table_name: String,
    pub actual_namespace: String,
    pub expected: Expected,
}

/// Read-only comparison of the physical catalog against the registry.
pub struct DriftAuditor {
    catalog: Arc<dyn Catalog>,
    registry: Arc<NamespaceRegistry>,
}

impl DriftAuditor {
    pub fn new(catalog: Arc<dyn Catalog>, registry: Arc<NamespaceRegistry>) -> Self {
        Self { catalog, registry }
    }

    pub async fn scan_namespaces(&self) -> Result<BTreeSet<String>> {
        self.catalog.list_namespaces().await
    }

    pub async fn scan_tables(&self, namespace: &str) -> Result<BTreeSet<String>> {
        self.catalog.list_tables(namespace).await
    }

    pub fn expected_namespace(&self, table: &str) -> Expected {
        match self.registry.unit_for_table(table) {
            TableResolution::Resolved(unit) => Expected::Namespace {
                namespace: unit.namespace.clone(),
                unit: unit.name.clone(),
            },
            TableResolution::Unresolved(reason) => Expected::Unresolved(reason),
        }
    }

    /// Every table in every user namespace, with its expected home.
    /// A namespace that cannot be scanned yields one `ScanFailed` observation.
    pub async fn observe_tables(&self) -> Result<Vec<TableObservation>> {
        let namespaces = self.scan_namespaces().await?;
        let mut observations = Vec::new();

        for namespace in &namespaces {
            match self.scan_tables(namespace).await {
                Ok(tables) => {
                    debug!("Scanned {} tables in {}", tables.len(), namespace);
                    for table in tables {
                        let expected = self.expected_namespace(&table);
                        observations.push(TableObservation {
                            table_name: table,
                            actual_namespace: namespace.clone(),
                            expected,
                        });
                    }
                }
                Err(e) => {
                    warn!(category = e.category(), "Could not scan namespace {}: {}", namespace, e);
                    observations.push(TableObservation {
                        table_name: "*".to_string(),
                        actual_namespace: namespace.clone(),
                        expected: Expected::Unresolved(UnresolvedReason::ScanFailed {
                            cause: e.to_string(),
                        }),
                    });
                }
            }
        }

        Ok(observations)
    }

    pub async fn audit_namespaces(&self) -> Result<Vec<DriftIssue>> {
        let existing = self.scan_namespaces().await?;
        Ok(self.missing_namespaces(&existing))
    }

    fn missing_namespaces(&self, existing: &BTreeSet<String>) -> Vec<DriftIssue> {
        self.registry
            .namespaces()
            .filter(|ns| !existing.contains(&ns.name))
            .map(|ns| {
                warn!("Declared namespace {} does not exist", ns.name);
                DriftIssue::new(&ns.name, &ns.name, IssueDetail::NamespaceMissing)
            })
            .collect()
    }

    pub async fn audit_tables(&self) -> Result<Vec<DriftIssue>> {
        let mut issues = Vec::new();

        for obs in self.observe_tables().await? {
            match obs.expected {
                Expected::Namespace { namespace, unit } if namespace != obs.actual_namespace => {
                    debug!(
                        "Table {} is in {}, expected {}",
                        obs.table_name, obs.actual_namespace, namespace
                    );
                    issues.push(DriftIssue::new(
                        &obs.actual_namespace,
                        &obs.table_name,
                        IssueDetail::TableMisplaced {
                            unit,
                            expected: namespace,
                            actual: obs.actual_namespace.clone(),
                        },
                    ));
                }
                Expected::Namespace { .. } => {}
                Expected::Unresolved(reason) => {
                    issues.push(DriftIssue::new(
                        &obs.actual_namespace,
                        &obs.table_name,
                        IssueDetail::Unresolved {
                            reason: reason.to_string(),
                        },
                    ));
                }
            }
        }

        Ok(issues)
    }

    pub async fn audit_migrations(&self) -> Result<Vec<DriftIssue>> {
        let mut issues = Vec::new();
        let mut by_pair: BTreeMap<(String, String), Vec<MigrationRecord>> = BTreeMap::new();

        for namespace in self.catalog.journal_namespaces().await? {
            match self.catalog.journal_records(&namespace).await {
                Ok(records) => {
                    for record in records {
                        by_pair
                            .entry((record.logical_unit.clone(), record.migration_name.clone()))
                            .or_default()
                            .push(record);
                    }
                }
                Err(e) => {
                    warn!(category = e.category(), "Could not read journal in {}: {}", namespace, e);
                    issues.push(DriftIssue::new(
                        &namespace,
                        crate::catalog::JOURNAL_TABLE,
                        IssueDetail::Unresolved {
                            reason: UnresolvedReason::ScanFailed {
                                cause: e.to_string(),
                            }
                            .to_string(),
                        },
                    ));
                }
            }
        }

        for ((unit, migration), mut records) in by_pair {
            let subject = format!("{}.{}", unit, migration);

            let Some(owning) = self.registry.namespace_of(&unit) else {
                for record in &records {
                    issues.push(DriftIssue::new(
                        &record.namespace,
                        &subject,
                        IssueDetail::Unresolved {
                            reason: format!("journal row for unregistered logical unit {}", unit),
                        },
                    ));
                }
                continue;
            };

            if records.len() > 1 {
                // Earliest wins; ties prefer the owning namespace, then name
                records.sort_by(|a, b| {
                    (a.applied_at, a.namespace != owning.name, &a.namespace).cmp(&(
                        b.applied_at,
                        b.namespace != owning.name,
                        &b.namespace,
                    ))
                });
                let canonical = records[0].namespace.clone();
                warn!(
                    "Migration {} recorded in {} namespaces, canonical {}",
                    subject,
                    records.len(),
                    canonical
                );

                let mut copies: Vec<RecordCopy> = records
                    .iter()
                    .map(|r| RecordCopy {
                        namespace: r.namespace.clone(),
                        applied_at: r.applied_at,
                    })
                    .collect();
                copies.sort_by(|a, b| a.namespace.cmp(&b.namespace));

                issues.push(DriftIssue::new(
                    &owning.name,
                    &subject,
                    IssueDetail::MigrationDuplicated {
                        unit: unit.clone(),
                        migration: migration.clone(),
                        owning: owning.name.clone(),
                        canonical,
                        copies,
                    },
                ));
            } else if owning.kind == NamespaceKind::Private && records[0].namespace != owning.name {
                warn!(
                    "Migration {} recorded in {} instead of {}",
                    subject, records[0].namespace, owning.name
                );
                issues.push(DriftIssue::new(
                    &records[0].namespace,
                    &subject,
                    IssueDetail::MigrationWrongNamespace {
                        unit: unit.clone(),
                        migration: migration.clone(),
                        expected: owning.name.clone(),
                        actual: records[0].namespace.clone(),
                    },
                ));
            }
        }

        Ok(issues)
    }

    /// Full audit, sorted for byte-stable output.
    pub async fn audit(&self) -> Result<DriftReport> {
        let existing = self.scan_namespaces().await?;

        let mut issues = self.missing_namespaces(&existing);
        issues.extend(self.audit_tables().await?);
        issues.extend(self.audit_migrations().await?);

        let report = DriftReport::new(issues);
        info!(
            "Audit of {} found {} issues",
            self.catalog.describe(),
            report.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::registry::Manifest;
    use crate::schema::report::IssueKind;
    use chrono::{DateTime, TimeZone, Utc};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

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
                    {"name": "internships", "namespace": "svc_a", "tables": ["placement"]},
                    {"name": "auth", "namespace": "shared"}
                ]
            }"#,
        )
        .unwrap();
        Arc::new(NamespaceRegistry::from_manifest(&manifest).unwrap())
    }

    fn catalog() -> Arc<MemoryCatalog> {
        let catalog = Arc::new(MemoryCatalog::new());
        for ns in ["svc_a", "svc_b", "shared"] {
            catalog.add_namespace(ns);
        }
        catalog
    }

    fn auditor(catalog: &Arc<MemoryCatalog>) -> DriftAuditor {
        DriftAuditor::new(catalog.clone(), registry())
    }

    #[test]
    fn test_expected_namespace() {
        let auditor = auditor(&catalog());
        assert_eq!(
            auditor.expected_namespace("billing_invoice"),
            Expected::Namespace {
                namespace: "svc_b".to_string(),
                unit: "billing".to_string()
            }
        );
        assert_eq!(
            auditor.expected_namespace("placement"),
            Expected::Namespace {
                namespace: "svc_a".to_string(),
                unit: "internships".to_string()
            }
        );
        assert_eq!(
            auditor.expected_namespace("legacy_tmp"),
            Expected::Unresolved(UnresolvedReason::Unmapped)
        );
    }

    #[tokio::test]
    async fn test_clean_database_has_no_issues() {
        let catalog = catalog();
        catalog.add_table("svc_b", "billing_invoice", vec![]);
        catalog.add_table("shared", "auth_user", vec![]);
        catalog.add_record("svc_b", "billing", "0001_initial", ts(1));

        let report = auditor(&catalog).audit().await.unwrap();
        assert!(report.is_empty(), "{:?}", report);
    }

    #[tokio::test]
    async fn test_misplaced_table() {
        let catalog = catalog();
        catalog.add_table("public", "billing_invoice", vec![]);

        let report = auditor(&catalog).audit().await.unwrap();
        assert_eq!(report.len(), 1);

        let issue = &report.issues[0];
        assert_eq!(issue.kind(), IssueKind::TableMisplaced);
        assert_eq!(issue.namespace, "public");
        assert_eq!(issue.subject, "billing_invoice");
        assert_eq!(
            issue.detail,
            IssueDetail::TableMisplaced {
                unit: "billing".to_string(),
                expected: "svc_b".to_string(),
                actual: "public".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_duplicated_migration_picks_earliest() {
        let catalog = catalog();
        catalog.add_record("svc_b", "billing", "0001_initial", ts(100));
        catalog.add_record("public", "billing", "0001_initial", ts(200));

        let report = auditor(&catalog).audit().await.unwrap();
        assert_eq!(report.len(), 1);

        match &report.issues[0].detail {
            IssueDetail::MigrationDuplicated {
                canonical, copies, ..
            } => {
                assert_eq!(canonical, "svc_b");
                assert_eq!(copies.len(), 2);
            }
            other => panic!("unexpected detail: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_tie_prefers_owning_namespace() {
        let catalog = catalog();
        catalog.add_record("public", "billing", "0001_initial", ts(100));
        catalog.add_record("svc_b", "billing", "0001_initial", ts(100));

        let issues = auditor(&catalog).audit_migrations().await.unwrap();
        match &issues[0].detail {
            IssueDetail::MigrationDuplicated { canonical, .. } => assert_eq!(canonical, "svc_b"),
            other => panic!("unexpected detail: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wrong_namespace_only_for_private_units() {
        let catalog = catalog();
        catalog.add_record("public", "billing", "0001_initial", ts(1));
        catalog.add_record("public", "auth", "0001_initial", ts(1));

        let issues = auditor(&catalog).audit_migrations().await.unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind(), IssueKind::MigrationWrongNamespace);
        assert_eq!(issues[0].subject, "billing.0001_initial");
    }

    #[tokio::test]
    async fn test_unresolved_items_are_isolated() {
        let catalog = catalog();
        catalog.add_table("public", "legacy_tmp", vec![]);
        catalog.add_table("svc_a", "placement", vec![]);
        catalog.add_record("public", "payroll", "0001_initial", ts(1));
        catalog.fail_on("list_tables", "shared");

        let report = auditor(&catalog).audit().await.unwrap();
        let kinds: Vec<(String, String, IssueKind)> = report
            .issues
            .iter()
            .map(|i| (i.namespace.clone(), i.subject.clone(), i.kind()))
            .collect();

        assert_eq!(
            kinds,
            vec![
                ("public".to_string(), "legacy_tmp".to_string(), IssueKind::Unresolved),
                ("public".to_string(), "payroll.0001_initial".to_string(), IssueKind::Unresolved),
                ("shared".to_string(), "*".to_string(), IssueKind::Unresolved),
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_namespace() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_namespace("svc_a");
        catalog.add_namespace("shared");

        let issues = auditor(&catalog).audit_namespaces().await.unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].namespace, "svc_b");
        assert_eq!(issues[0].kind(), IssueKind::NamespaceMissing);
    }

    #[tokio::test]
    async fn test_audit_is_deterministic() {
        let catalog = catalog();
        catalog.add_table("public", "billing_invoice", vec![]);
        catalog.add_table("public", "legacy_tmp", vec![]);
        catalog.add_table("public", "internships_offer", vec![]);
        catalog.add_record("svc_b", "billing", "0001_initial", ts(100));
        catalog.add_record("public", "billing", "0001_initial", ts(200));
        catalog.add_record("public", "internships", "0001_initial", ts(50));

        let auditor = auditor(&catalog);
        let first = auditor.audit().await.unwrap().to_json().unwrap();
        let second = auditor.audit().await.unwrap().to_json().unwrap();
        assert_eq!(first, second);

        let text_1 = auditor.audit().await.unwrap().render_text();
        let text_2 = auditor.audit().await.unwrap().render_text();
        assert_eq!(text_1, text_2);
    }
}
