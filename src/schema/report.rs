//! Drift report
//!
//! Issues found by one audit, sorted by `(namespace, subject, kind, detail)`
//! so the same database state always renders to the same bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    NamespaceMissing,
    TableMisplaced,
    MigrationDuplicated,
    MigrationWrongNamespace,
    Unresolved,
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IssueKind::NamespaceMissing => write!(f, "namespace_missing"),
            IssueKind::TableMisplaced => write!(f, "table_misplaced"),
            IssueKind::MigrationDuplicated => write!(f, "migration_duplicated"),
            IssueKind::MigrationWrongNamespace => write!(f, "migration_wrong_namespace"),
            IssueKind::Unresolved => write!(f, "unresolved"),
        }
    }
}

/// One journal copy of a duplicated migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCopy {
    pub namespace: String,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IssueDetail {
    NamespaceMissing,
    TableMisplaced {
        unit: String,
        expected: String,
        actual: String,
    },
    MigrationDuplicated {
        unit: String,
        migration: String,
        owning: String,
        /// Namespace holding the earliest copy.
        canonical: String,
        copies: Vec<RecordCopy>,
    },
    MigrationWrongNamespace {
        unit: String,
        migration: String,
        expected: String,
        actual: String,
    },
    Unresolved {
        reason: String,
    },
}

impl IssueDetail {
    pub fn kind(&self) -> IssueKind {
        match self {
            IssueDetail::NamespaceMissing => IssueKind::NamespaceMissing,
            IssueDetail::TableMisplaced { .. } => IssueKind::TableMisplaced,
            IssueDetail::MigrationDuplicated { .. } => IssueKind::MigrationDuplicated,
            IssueDetail::MigrationWrongNamespace { .. } => IssueKind::MigrationWrongNamespace,
            IssueDetail::Unresolved { .. } => IssueKind::Unresolved,
        }
    }
}

impl std::fmt::Display for IssueDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IssueDetail::NamespaceMissing => write!(f, "namespace does not exist"),
            IssueDetail::TableMisplaced {
                unit,
                expected,
                actual,
            } => write!(f, "unit {}: expected={}, actual={}", unit, expected, actual),
            IssueDetail::MigrationDuplicated {
                canonical, copies, ..
            } => {
                let places: Vec<String> = copies
                    .iter()
                    .map(|c| format!("{}@{}", c.namespace, c.applied_at.to_rfc3339()))
                    .collect();
                write!(f, "canonical={}, copies={}", canonical, places.join(","))
            }
            IssueDetail::MigrationWrongNamespace {
                expected, actual, ..
            } => write!(f, "expected={}, actual={}", expected, actual),
            IssueDetail::Unresolved { reason } => write!(f, "{}", reason),
        }
    }
}

/// A single detected violation.
///
/// `namespace` is where the drift was observed: the physical namespace of a
/// misplaced table or stray journal row, the missing namespace itself, or the
/// owning namespace of a duplicated migration. `subject` is a table name,
/// `unit.migration`, or a namespace name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftIssue {
    pub namespace: String,
    pub subject: String,
    #[serde(flatten)]
    pub detail: IssueDetail,
}

impl DriftIssue {
    pub fn new(namespace: &str, subject: &str, detail: IssueDetail) -> Self {
        Self {
            namespace: namespace.to_string(),
            subject: subject.to_string(),
            detail,
        }
    }

    pub fn kind(&self) -> IssueKind {
        self.detail.kind()
    }

    pub fn recommended_action(&self) -> String {
        match &self.detail {
            IssueDetail::NamespaceMissing => format!("create namespace {}", self.namespace),
            IssueDetail::TableMisplaced {
                expected, actual, ..
            } => format!("move table from {} to {}", actual, expected),
            IssueDetail::MigrationDuplicated {
                owning,
                canonical,
                copies,
                ..
            } => {
                let doomed: Vec<&str> = copies
                    .iter()
                    .filter(|c| &c.namespace != canonical)
                    .map(|c| c.namespace.as_str())
                    .collect();
                let mut action = format!(
                    "delete record from {} (keep {})",
                    doomed.join(","),
                    canonical
                );
                if canonical != owning {
                    action.push_str(&format!(", relocate to {}", owning));
                }
                action
            }
            IssueDetail::MigrationWrongNamespace {
                expected, actual, ..
            } => format!("relocate record from {} to {}", actual, expected),
            IssueDetail::Unresolved { .. } => "none (manual review)".to_string(),
        }
    }

    fn sort_key(&self) -> (String, String, IssueKind, String) {
        (
            self.namespace.clone(),
            self.subject.clone(),
            self.kind(),
            self.detail.to_string(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportRow {
    pub namespace: String,
    pub table_or_unit: String,
    pub issue_kind: IssueKind,
    pub recommended_action: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReport {
    pub issues: Vec<DriftIssue>,
}

impl DriftReport {
    pub fn new(mut issues: Vec<DriftIssue>) -> Self {
        issues.sort_by_cached_key(|i| i.sort_key());
        issues.dedup();
        Self { issues }
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn counts(&self) -> BTreeMap<IssueKind, usize> {
        let mut counts = BTreeMap::new();
        for issue in &self.issues {
            *counts.entry(issue.kind()).or_insert(0) += 1;
        }
        counts
    }

    pub fn rows(&self) -> Vec<ReportRow> {
        self.issues
            .iter()
            .map(|i| ReportRow {
                namespace: i.namespace.clone(),
                table_or_unit: i.subject.clone(),
                issue_kind: i.kind(),
                recommended_action: i.recommended_action(),
            })
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Aligned text table followed by per-kind totals.
    pub fn render_text(&self) -> String {
        let mut out = String::new();

        out.push_str("═══════════════════════════════════════════════════════════════\n");
        out.push_str("                      SCHEMA DRIFT REPORT\n");
        out.push_str("═══════════════════════════════════════════════════════════════\n\n");

        if self.issues.is_empty() {
            out.push_str("No drift detected.\n");
            return out;
        }

        let header = ["NAMESPACE", "TABLE_OR_UNIT", "ISSUE", "RECOMMENDED_ACTION"];
        let cells: Vec<[String; 4]> = self
            .rows()
            .into_iter()
            .map(|r| {
                [
                    r.namespace,
                    r.table_or_unit,
                    r.issue_kind.to_string(),
                    r.recommended_action,
                ]
            })
            .collect();

        let mut widths = header.map(str::len);
        for row in &cells {
            for (w, cell) in widths.iter_mut().zip(row.iter()) {
                *w = (*w).max(cell.chars().count());
            }
        }

        let line = |cols: [&str; 4]| {
            format!(
                "{:<w0$}  {:<w1$}  {:<w2$}  {}\n",
                cols[0],
                cols[1],
                cols[2],
                cols[3],
                w0 = widths[0],
                w1 = widths[1],
                w2 = widths[2]
            )
        };

        out.push_str(&line(header));
        for row in &cells {
            out.push_str(&line([
                row[0].as_str(),
                row[1].as_str(),
                row[2].as_str(),
                row[3].as_str(),
            ]));
        }

        out.push('\n');
        for (kind, count) in self.counts() {
            out.push_str(&format!("  {}: {}\n", kind, count));
        }
        out.push_str(&format!("  total: {}\n", self.issues.len()));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn misplaced() -> DriftIssue {
        DriftIssue::new(
            "public",
            "billing_invoice",
            IssueDetail::TableMisplaced {
                unit: "billing".to_string(),
                expected: "svc_b".to_string(),
                actual: "public".to_string(),
            },
        )
    }

    fn unresolved() -> DriftIssue {
        DriftIssue::new(
            "public",
            "legacy_tmp",
            IssueDetail::Unresolved {
                reason: "no logical unit claims this table".to_string(),
            },
        )
    }

    #[test]
    fn test_report_is_sorted_regardless_of_input_order() {
        let missing = DriftIssue::new("svc_c", "svc_c", IssueDetail::NamespaceMissing);
        let a = DriftReport::new(vec![missing.clone(), unresolved(), misplaced()]);
        let b = DriftReport::new(vec![misplaced(), missing, unresolved()]);

        assert_eq!(a, b);
        assert_eq!(a.issues[0].subject, "billing_invoice");
        assert_eq!(a.issues[1].subject, "legacy_tmp");
        assert_eq!(a.issues[2].namespace, "svc_c");
        assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
    }

    #[test]
    fn test_issue_serializes_with_kind_tag() {
        let json = serde_json::to_value(misplaced()).unwrap();
        assert_eq!(json["kind"], "table_misplaced");
        assert_eq!(json["expected"], "svc_b");
        assert_eq!(json["actual"], "public");

        let back: DriftIssue = serde_json::from_value(json).unwrap();
        assert_eq!(back, misplaced());
    }

    #[test]
    fn test_render_text_rows() {
        let report = DriftReport::new(vec![misplaced(), unresolved()]);
        let text = report.render_text();

        assert!(text.contains("SCHEMA DRIFT REPORT"));
        assert!(text.contains("move table from public to svc_b"));
        assert!(text.contains("none (manual review)"));
        assert!(text.contains("table_misplaced: 1"));
        assert!(text.contains("total: 2"));

        assert!(DriftReport::default().render_text().contains("No drift detected."));
    }

    #[test]
    fn test_duplicate_recommendation_mentions_relocation() {
        let t = |s| Utc.timestamp_opt(s, 0).unwrap();
        let issue = DriftIssue::new(
            "svc_b",
            "billing.0001_initial",
            IssueDetail::MigrationDuplicated {
                unit: "billing".to_string(),
                migration: "0001_initial".to_string(),
                owning: "svc_b".to_string(),
                canonical: "public".to_string(),
                copies: vec![
                    RecordCopy {
                        namespace: "public".to_string(),
                        applied_at: t(10),
                    },
                    RecordCopy {
                        namespace: "svc_b".to_string(),
                        applied_at: t(20),
                    },
                ],
            },
        );
        assert_eq!(
            issue.recommended_action(),
            "delete record from svc_b (keep public), relocate to svc_b"
        );
    }
}
