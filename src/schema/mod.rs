//! Journal, audit and repair
//!
//! - `journal`: per-namespace migration journal with system-wide uniqueness
//! - `drift`: read-only comparison of the catalog against the registry
//! - `report`: sorted drift issues, text and JSON rendering
//! - `repair`: plan and execute fixes under the deployment lock
//! - `backup`: tar.gz snapshot taken before a repair changes anything
//! - `changelog`: append-only repair log used for resume

mod backup;
mod changelog;
mod drift;
mod journal;
mod report;
mod repair;

pub use backup::{compute_checksum, BackupArtifact, BackupSnapshot, BackupWriter, TableSnapshot};
pub use changelog::{RepairLog, RepairLogEntry, RepairLogEvent, RunStatus};
pub use drift::{DriftAuditor, Expected, TableObservation};
pub use journal::{ApplyOutcome, MigrationJournal};
pub use report::{DriftIssue, DriftReport, IssueDetail, IssueKind, RecordCopy, ReportRow};
pub use repair::{
    ActionResult, ActionStatus, DriftRepairer, ExecutionReport, IssueState, IssueStatus,
    PlannedAction, RepairAction, RepairPlan,
};
