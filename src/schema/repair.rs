use crate::catalog::{deployment_lock_key, ActionOutcome, Catalog, MigrationRecord, TableMove};
use crate::error::{Result, RouterError};
use crate::registry::NamespaceRegistry;
use crate::schema::backup::{compute_checksum, BackupArtifact, BackupSnapshot, BackupWriter, TableSnapshot};
use crate::schema::changelog::{RepairLog, RepairLogEvent, RunStatus};
use crate::schema::report::{DriftIssue, DriftReport, IssueDetail};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RepairAction {
    CreateNamespace {
        namespace: String,
    },
    MoveTable {
        table: String,
        from: String,
        to: String,
    },
    RelocateMigrationRecord {
        unit: String,
        migration: String,
        from: String,
        to: String,
    },
    DeleteDuplicateMigrationRecord {
        unit: String,
        migration: String,
        namespace: String,
        /// Copy that must survive the deletion.
        canonical: String,
    },
}

impl std::fmt::Display for RepairAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepairAction::CreateNamespace { namespace } => {
                write!(f, "create namespace {}", namespace)
            }
            RepairAction::MoveTable { table, from, to } => {
                write!(f, "move table {}: {} -> {}", table, from, to)
            }
            RepairAction::RelocateMigrationRecord {
                unit,
                migration,
                from,
                to,
            } => write!(f, "relocate record {}.{}: {} -> {}", unit, migration, from, to),
            RepairAction::DeleteDuplicateMigrationRecord {
                unit,
                migration,
                namespace,
                canonical,
            } => write!(
                f,
                "delete duplicate record {}.{} from {} (keep {})",
                unit, migration, namespace, canonical
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedAction {
    pub action: RepairAction,
    /// Index into [`RepairPlan::issues`].
    pub issue: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairPlan {
    pub issues: Vec<DriftIssue>,
    pub actions: Vec<PlannedAction>,
}

impl RepairPlan {
    fn has_actions(&self, issue: usize) -> bool {
        self.actions.iter().any(|a| a.issue == issue)
    }

    /// Issues with no automated fix.
    pub fn skipped(&self) -> Vec<&DriftIssue> {
        self.issues
            .iter()
            .enumerate()
            .filter(|(k, _)| !self.has_actions(*k))
            .map(|(_, issue)| issue)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();

        out.push_str("═══════════════════════════════════════════════════════════════\n");
        out.push_str("                        REPAIR PLAN\n");
        out.push_str("═══════════════════════════════════════════════════════════════\n\n");

        if self.actions.is_empty() {
            out.push_str("No automated actions.\n");
        } else {
            out.push_str("ACTIONS:\n");
            for (i, planned) in self.actions.iter().enumerate() {
                out.push_str(&format!("  {:>3}. {}\n", i + 1, planned.action));
            }
        }

        let skipped = self.skipped();
        if !skipped.is_empty() {
            out.push_str("\nSKIPPED (manual review):\n");
            for issue in skipped {
                out.push_str(&format!(
                    "  - {} {}: {}\n",
                    issue.namespace, issue.subject, issue.detail
                ));
            }
        }

        out
    }
}

/// Lifecycle of one issue through a repair run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    Detected,
    Planned,
    Applying,
    Applied,
    Failed,
    Skipped,
}

impl IssueState {
    pub fn can_transition_to(self, next: IssueState) -> bool {
        use IssueState::*;
        matches!(
            (self, next),
            (Detected, Planned)
                | (Detected, Skipped)
                | (Planned, Applying)
                | (Applying, Applied)
                | (Applying, Failed)
                | (Failed, Detected)
        )
    }

    pub fn transition(self, next: IssueState) -> Result<IssueState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(RouterError::Internal(format!(
                "Illegal issue state transition {:?} -> {:?}",
                self, next
            )))
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, IssueState::Applied | IssueState::Skipped)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ActionStatus {
    /// Dry run only.
    Planned,
    Applied,
    AlreadyApplied,
    /// Recorded as applied by an earlier attempt of the same run.
    Logged,
    Failed(String),
    /// Not attempted because the run paused.
    Pending,
}

impl ActionStatus {
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            ActionStatus::Applied | ActionStatus::AlreadyApplied | ActionStatus::Logged
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionResult {
    pub index: usize,
    pub action: RepairAction,
    pub status: ActionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssueStatus {
    pub issue: DriftIssue,
    pub state: IssueState,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub run_id: Option<String>,
    pub dry_run: bool,
    pub backup: Option<BackupArtifact>,
    pub actions: Vec<ActionResult>,
    pub issues: Vec<IssueStatus>,
}

impl ExecutionReport {
    pub fn failed(&self) -> Vec<&ActionResult> {
        self.actions
            .iter()
            .filter(|a| matches!(a.status, ActionStatus::Failed(_)))
            .collect()
    }

    pub fn pending(&self) -> Vec<&ActionResult> {
        self.actions
            .iter()
            .filter(|a| a.status == ActionStatus::Pending)
            .collect()
    }

    pub fn skipped_issues(&self) -> usize {
        self.issues
            .iter()
            .filter(|s| s.state == IssueState::Skipped)
            .count()
    }

    /// 0 when every issue was repaired, 1 when only skipped issues remain,
    /// 2 when an action failed or is pending.
    pub fn exit_code(&self) -> u8 {
        if self.dry_run {
            return 0;
        }
        let unfinished = self
            .issues
            .iter()
            .any(|s| !s.state.is_terminal());
        if !self.failed().is_empty() || !self.pending().is_empty() || unfinished {
            2
        } else if self.skipped_issues() > 0 {
            1
        } else {
            0
        }
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();

        out.push_str("═══════════════════════════════════════════════════════════════\n");
        match &self.run_id {
            Some(run_id) => out.push_str(&format!("                   REPAIR RUN {}\n", run_id)),
            None => out.push_str("                      REPAIR DRY RUN\n"),
        }
        out.push_str("═══════════════════════════════════════════════════════════════\n\n");

        if let Some(backup) = &self.backup {
            out.push_str(&format!(
                "Backup: {} (sha256 {})\n\n",
                backup.path.display(),
                backup.checksum
            ));
        }

        for result in &self.actions {
            let status = match &result.status {
                ActionStatus::Planned => "PLANNED".to_string(),
                ActionStatus::Applied => "APPLIED".to_string(),
                ActionStatus::AlreadyApplied => "ALREADY APPLIED".to_string(),
                ActionStatus::Logged => "APPLIED (earlier attempt)".to_string(),
                ActionStatus::Failed(reason) => format!("FAILED: {}", reason),
                ActionStatus::Pending => "PENDING".to_string(),
            };
            out.push_str(&format!(
                "  {:>3}. {} [{}]\n",
                result.index + 1,
                result.action,
                status
            ));
        }

        let skipped: Vec<&IssueStatus> = self
            .issues
            .iter()
            .filter(|s| s.state == IssueState::Skipped)
            .collect();
        if !skipped.is_empty() {
            out.push_str("\nSKIPPED:\n");
            for s in skipped {
                out.push_str(&format!(
                    "  - {} {}: {}\n",
                    s.issue.namespace, s.issue.subject, s.issue.detail
                ));
            }
        }

        let failed = self.failed().len();
        let pending = self.pending().len();
        if failed > 0 || pending > 0 {
            out.push_str(&format!(
                "\nRun paused: {} failed, {} pending. Fix the cause and resume with --resume {}\n",
                failed,
                pending,
                self.run_id.as_deref().unwrap_or("-")
            ));
        }

        out
    }
}

/// Plans and executes repairs for an audit report.
pub struct DriftRepairer {
    catalog: Arc<dyn Catalog>,
    registry: Arc<NamespaceRegistry>,
    backups: BackupWriter,
    log: RepairLog,
    deployment: String,
}

impl DriftRepairer {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        registry: Arc<NamespaceRegistry>,
        backup_dir: impl Into<PathBuf>,
        log_path: impl Into<PathBuf>,
        deployment: &str,
    ) -> Self {
        Self {
            catalog,
            registry,
            backups: BackupWriter::new(backup_dir),
            log: RepairLog::new(log_path),
            deployment: deployment.to_string(),
        }
    }

    pub fn log(&self) -> &RepairLog {
        &self.log
    }

    /// Build the ordered action list: namespace creation, table moves in
    /// foreign-key order, duplicate deletions, then relocations.
    pub async fn plan(&self, report: &DriftReport) -> Result<RepairPlan> {
        let mut creates = Vec::new();
        let mut moves = Vec::new();
        let mut deletes = Vec::new();
        let mut relocations = Vec::new();

        for (k, issue) in report.issues.iter().enumerate() {
            match &issue.detail {
                IssueDetail::NamespaceMissing => creates.push(PlannedAction {
                    action: RepairAction::CreateNamespace {
                        namespace: issue.namespace.clone(),
                    },
                    issue: k,
                }),
                IssueDetail::TableMisplaced {
                    expected, actual, ..
                } => moves.push(PlannedAction {
                    action: RepairAction::MoveTable {
                        table: issue.subject.clone(),
                        from: actual.clone(),
                        to: expected.clone(),
                    },
                    issue: k,
                }),
                IssueDetail::MigrationDuplicated {
                    unit,
                    migration,
                    owning,
                    canonical,
                    copies,
                } => {
                    for copy in copies.iter().filter(|c| &c.namespace != canonical) {
                        deletes.push(PlannedAction {
                            action: RepairAction::DeleteDuplicateMigrationRecord {
                                unit: unit.clone(),
                                migration: migration.clone(),
                                namespace: copy.namespace.clone(),
                                canonical: canonical.clone(),
                            },
                            issue: k,
                        });
                    }
                    if canonical != owning {
                        relocations.push(PlannedAction {
                            action: RepairAction::RelocateMigrationRecord {
                                unit: unit.clone(),
                                migration: migration.clone(),
                                from: canonical.clone(),
                                to: owning.clone(),
                            },
                            issue: k,
                        });
                    }
                }
                IssueDetail::MigrationWrongNamespace {
                    unit,
                    migration,
                    expected,
                    actual,
                } => relocations.push(PlannedAction {
                    action: RepairAction::RelocateMigrationRecord {
                        unit: unit.clone(),
                        migration: migration.clone(),
                        from: actual.clone(),
                        to: expected.clone(),
                    },
                    issue: k,
                }),
                IssueDetail::Unresolved { .. } => {
                    debug!(
                        "No automated fix for {} {}, skipping",
                        issue.namespace, issue.subject
                    );
                }
            }
        }

        let mut actions = creates;
        actions.extend(self.order_moves(moves).await?);
        actions.extend(deletes);
        actions.extend(relocations);

        let plan = RepairPlan {
            issues: report.issues.clone(),
            actions,
        };
        info!(
            "Repair plan: {} actions, {} issues skipped",
            plan.actions.len(),
            plan.skipped().len()
        );
        Ok(plan)
    }

    /// Referenced tables move before the tables that reference them.
    async fn order_moves(&self, moves: Vec<PlannedAction>) -> Result<Vec<PlannedAction>> {
        let key = |p: &PlannedAction| match &p.action {
            RepairAction::MoveTable { table, from, .. } => (from.clone(), table.clone()),
            _ => (String::new(), String::new()),
        };

        let mut moves = moves;
        moves.sort_by_key(key);
        let keys: Vec<(String, String)> = moves.iter().map(key).collect();

        let mut deps: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); moves.len()];
        for (i, (from, table)) in keys.iter().enumerate() {
            for fk in self.catalog.foreign_keys(from, table).await? {
                if let Some(j) = keys.iter().position(|(ns, t)| {
                    ns == &fk.referenced_namespace && t == &fk.referenced_table
                }) {
                    if j != i {
                        deps[i].insert(j);
                    }
                }
            }
        }

        let mut emitted: Vec<bool> = vec![false; moves.len()];
        let mut order = Vec::with_capacity(moves.len());
        while order.len() < moves.len() {
            let ready = (0..moves.len())
                .find(|&i| !emitted[i] && deps[i].iter().all(|&j| emitted[j]));
            let next = match ready {
                Some(i) => i,
                None => {
                    // Cycle: fall back to name order for the rest
                    let i = (0..moves.len()).find(|&i| !emitted[i]).unwrap_or(0);
                    warn!(
                        "Foreign-key cycle among moved tables, ordering {}.{} by name",
                        keys[i].0, keys[i].1
                    );
                    i
                }
            };
            emitted[next] = true;
            order.push(next);
        }

        Ok(order.into_iter().map(|i| moves[i].clone()).collect())
    }

    /// Dry run renders the plan only. Otherwise the run holds the deployment
    /// lock, takes a backup, and applies actions until one fails.
    pub async fn execute(&self, plan: &RepairPlan, dry_run: bool) -> Result<ExecutionReport> {
        if dry_run {
            return Ok(self.dry_run(plan));
        }

        let run_id = new_run_id(plan)?;
        self.locked(plan, &run_id, BTreeSet::new(), false).await
    }

    /// Re-run a logged plan, skipping actions the log records as applied.
    pub async fn resume(&self, run_id: &str) -> Result<ExecutionReport> {
        let plan = self.log.plan_for(run_id)?.ok_or_else(|| {
            RouterError::Internal(format!(
                "No repair run {} in {}",
                run_id,
                self.log.path().display()
            ))
        })?;
        let done = self.log.applied_actions(run_id)?;
        info!(
            "Resuming repair run {}: {} of {} actions already applied",
            run_id,
            done.len(),
            plan.actions.len()
        );
        self.locked(&plan, run_id, done, true).await
    }

    fn dry_run(&self, plan: &RepairPlan) -> ExecutionReport {
        let issues = plan
            .issues
            .iter()
            .enumerate()
            .map(|(k, issue)| IssueStatus {
                issue: issue.clone(),
                state: if plan.has_actions(k) {
                    IssueState::Planned
                } else {
                    IssueState::Skipped
                },
            })
            .collect();

        ExecutionReport {
            run_id: None,
            dry_run: true,
            backup: None,
            actions: plan
                .actions
                .iter()
                .enumerate()
                .map(|(index, p)| ActionResult {
                    index,
                    action: p.action.clone(),
                    status: ActionStatus::Planned,
                })
                .collect(),
            issues,
        }
    }

    async fn locked(
        &self,
        plan: &RepairPlan,
        run_id: &str,
        done: BTreeSet<usize>,
        resumed: bool,
    ) -> Result<ExecutionReport> {
        if !self.catalog.try_lock_deployment(&self.deployment).await? {
            let err = RouterError::LockUnavailable {
                lock: deployment_lock_key(&self.deployment),
            };
            error!(category = err.category(), "{}", err);
            return Err(err);
        }

        let result = self.run(plan, run_id, &done, resumed).await;

        if let Err(e) = self.catalog.unlock_deployment(&self.deployment).await {
            warn!("Failed to release deployment lock {}: {}", self.deployment, e);
        }
        result
    }

    async fn run(
        &self,
        plan: &RepairPlan,
        run_id: &str,
        done: &BTreeSet<usize>,
        resumed: bool,
    ) -> Result<ExecutionReport> {
        self.log.append(
            run_id,
            RepairLogEvent::RunStarted {
                plan: plan.clone(),
                resumed,
            },
        )?;

        let mut states = Vec::with_capacity(plan.issues.len());
        for k in 0..plan.issues.len() {
            let next = if plan.has_actions(k) {
                IssueState::Planned
            } else {
                IssueState::Skipped
            };
            states.push(IssueState::Detected.transition(next)?);
        }

        let backup = if plan.actions.iter().enumerate().any(|(i, _)| !done.contains(&i)) {
            match self.take_backup(plan, run_id, done).await {
                Ok(artifact) => {
                    self.log.append(
                        run_id,
                        RepairLogEvent::BackupWritten {
                            backup: artifact.clone(),
                        },
                    )?;
                    Some(artifact)
                }
                Err(e) => {
                    error!(category = e.category(), "Repair run {} aborted: {}", run_id, e);
                    self.log.append(
                        run_id,
                        RepairLogEvent::RunFinished {
                            status: RunStatus::Aborted,
                        },
                    )?;
                    return Err(e);
                }
            }
        } else {
            None
        };

        let mut remaining: Vec<usize> = (0..plan.issues.len())
            .map(|k| plan.actions.iter().filter(|a| a.issue == k).count())
            .collect();
        let mut results = Vec::with_capacity(plan.actions.len());
        let mut paused = false;

        for (index, planned) in plan.actions.iter().enumerate() {
            if paused {
                results.push(ActionResult {
                    index,
                    action: planned.action.clone(),
                    status: ActionStatus::Pending,
                });
                continue;
            }

            let k = planned.issue;
            if states[k] == IssueState::Planned {
                states[k] = states[k].transition(IssueState::Applying)?;
            }

            let status = if done.contains(&index) {
                debug!("Action {} already applied in an earlier attempt", planned.action);
                ActionStatus::Logged
            } else {
                let status = match self.apply_action(&planned.action).await {
                    Ok(ActionOutcome::Applied) => ActionStatus::Applied,
                    Ok(ActionOutcome::AlreadyApplied) => ActionStatus::AlreadyApplied,
                    Ok(ActionOutcome::Rejected(reason)) => ActionStatus::Failed(reason),
                    Err(e) => ActionStatus::Failed(e.to_string()),
                };
                self.log.append(
                    run_id,
                    RepairLogEvent::ActionFinished {
                        index,
                        action: planned.action.clone(),
                        status: status.clone(),
                    },
                )?;
                status
            };

            if let ActionStatus::Failed(reason) = &status {
                let err = RouterError::RepairActionFailure {
                    action: planned.action.to_string(),
                    cause: reason.clone(),
                };
                error!(category = err.category(), "{}", err);
                states[k] = states[k].transition(IssueState::Failed)?;
                states[k] = states[k].transition(IssueState::Detected)?;
                paused = true;
            } else {
                info!("{} [{:?}]", planned.action, status);
                remaining[k] -= 1;
                if remaining[k] == 0 {
                    states[k] = states[k].transition(IssueState::Applied)?;
                }
            }

            results.push(ActionResult {
                index,
                action: planned.action.clone(),
                status,
            });
        }

        // Issues cut off midway go back to Detected
        for state in states.iter_mut() {
            if *state == IssueState::Applying {
                *state = state.transition(IssueState::Failed)?;
                *state = state.transition(IssueState::Detected)?;
            }
        }

        let status = if paused {
            RunStatus::Paused
        } else {
            RunStatus::Completed
        };
        self.log
            .append(run_id, RepairLogEvent::RunFinished { status })?;

        if paused {
            warn!("Repair run {} paused", run_id);
        } else {
            info!("Repair run {} completed", run_id);
        }

        Ok(ExecutionReport {
            run_id: Some(run_id.to_string()),
            dry_run: false,
            backup,
            actions: results,
            issues: plan
                .issues
                .iter()
                .cloned()
                .zip(states)
                .map(|(issue, state)| IssueStatus { issue, state })
                .collect(),
        })
    }

    /// Snapshot every journal row and table the outstanding actions touch.
    async fn take_backup(
        &self,
        plan: &RepairPlan,
        run_id: &str,
        done: &BTreeSet<usize>,
    ) -> Result<BackupArtifact> {
        let mut journal_rows: Vec<MigrationRecord> = Vec::new();
        let mut tables: Vec<TableSnapshot> = Vec::new();
        let mut seen_pairs: HashSet<(String, String)> = HashSet::new();

        let backup_failure = |e: RouterError| RouterError::BackupFailure {
            cause: e.to_string(),
        };

        for (index, planned) in plan.actions.iter().enumerate() {
            if done.contains(&index) {
                continue;
            }
            match &planned.action {
                RepairAction::CreateNamespace { .. } => {}
                RepairAction::MoveTable { table, from, to } => {
                    // A move that already committed leaves the rows under `to`
                    let (namespace, rows) = match self.catalog.export_table(from, table).await {
                        Ok(rows) => (from.clone(), rows),
                        Err(first) => match self.catalog.export_table(to, table).await {
                            Ok(rows) => (to.clone(), rows),
                            Err(_) => return Err(backup_failure(first)),
                        },
                    };
                    tables.push(TableSnapshot {
                        namespace,
                        table: table.clone(),
                        rows,
                    });
                }
                RepairAction::RelocateMigrationRecord {
                    unit, migration, ..
                }
                | RepairAction::DeleteDuplicateMigrationRecord {
                    unit, migration, ..
                } => {
                    if seen_pairs.insert((unit.clone(), migration.clone())) {
                        let records = self
                            .catalog
                            .find_records(unit, migration)
                            .await
                            .map_err(backup_failure)?;
                        journal_rows.extend(records);
                    }
                }
            }
        }

        self.backups.write(&BackupSnapshot {
            run_id: run_id.to_string(),
            taken_at: Utc::now(),
            journal_rows,
            tables,
        })
    }

    async fn apply_action(&self, action: &RepairAction) -> Result<ActionOutcome> {
        match action {
            RepairAction::CreateNamespace { namespace } => {
                if self.catalog.create_namespace(namespace).await? {
                    Ok(ActionOutcome::Applied)
                } else {
                    Ok(ActionOutcome::AlreadyApplied)
                }
            }
            RepairAction::MoveTable { table, from, to } => {
                // Outgoing foreign keys must resolve inside the destination
                self.catalog
                    .move_table(&TableMove {
                        table: table.clone(),
                        from: from.clone(),
                        to: to.clone(),
                        reference_scope: BTreeSet::from([to.clone()]),
                    })
                    .await
            }
            RepairAction::RelocateMigrationRecord {
                unit,
                migration,
                from,
                to,
            } => {
                self.catalog
                    .relocate_record(unit, migration, from, to)
                    .await
            }
            RepairAction::DeleteDuplicateMigrationRecord {
                unit,
                migration,
                namespace,
                canonical,
            } => {
                // Only pairs still present in more than one namespace qualify
                let copies = self.catalog.find_records(unit, migration).await?;
                if copies.len() < 2 && copies.iter().all(|r| &r.namespace != namespace) {
                    return Ok(ActionOutcome::AlreadyApplied);
                }
                if copies.len() < 2 {
                    return Ok(ActionOutcome::Rejected(format!(
                        "{}.{} is no longer duplicated",
                        unit, migration
                    )));
                }
                self.catalog
                    .delete_duplicate_record(unit, migration, namespace, canonical)
                    .await
            }
        }
    }
}

fn new_run_id(plan: &RepairPlan) -> Result<String> {
    let now = Utc::now();
    let seed = format!(
        "{}{}",
        serde_json::to_string(plan)?,
        now.timestamp_nanos_opt().unwrap_or_default()
    );
    Ok(format!(
        "{}-{}",
        now.format("%Y%m%dT%H%M%S"),
        &compute_checksum(seed.as_bytes())[..8]
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::registry::Manifest;
    use crate::schema::drift::DriftAuditor;
    use chrono::{DateTime, TimeZone};
    use tempfile::TempDir;

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
                    {"name": "internships", "namespace": "svc_a"},
                    {"name": "auth", "namespace": "shared"}
                ]
            }"#,
        )
        .unwrap();
        Arc::new(NamespaceRegistry::from_manifest(&manifest).unwrap())
    }

    struct Fixture {
        _dir: TempDir,
        catalog: Arc<MemoryCatalog>,
        auditor: DriftAuditor,
        repairer: DriftRepairer,
    }

    impl Fixture {
        fn new() -> Self {
            let catalog = Arc::new(MemoryCatalog::new());
            for ns in ["svc_a", "svc_b", "shared"] {
                catalog.add_namespace(ns);
            }
            Self::with_catalog(catalog)
        }

        fn with_catalog(catalog: Arc<MemoryCatalog>) -> Self {
            let dir = TempDir::new().unwrap();
            let auditor = DriftAuditor::new(catalog.clone(), registry());
            let repairer = DriftRepairer::new(
                catalog.clone(),
                registry(),
                dir.path().join("backups"),
                dir.path().join("repair-log.jsonl"),
                "default",
            );
            Self {
                _dir: dir,
                catalog,
                auditor,
                repairer,
            }
        }

        async fn repair(&self) -> ExecutionReport {
            let report = self.auditor.audit().await.unwrap();
            let plan = self.repairer.plan(&report).await.unwrap();
            self.repairer.execute(&plan, false).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_misplaced_table_is_moved() {
        let fx = Fixture::new();
        fx.catalog.add_table(
            "public",
            "billing_invoice",
            vec![serde_json::json!({"id": 1, "total": 42})],
        );

        let report = fx.auditor.audit().await.unwrap();
        assert_eq!(report.len(), 1);

        let execution = fx.repair().await;
        assert_eq!(execution.exit_code(), 0);
        assert_eq!(execution.actions[0].status, ActionStatus::Applied);
        assert!(fx.catalog.has_table("svc_b", "billing_invoice"));
        assert!(!fx.catalog.has_table("public", "billing_invoice"));
        assert_eq!(
            fx.catalog.table_rows("svc_b", "billing_invoice").unwrap().len(),
            1
        );

        let backup = execution.backup.expect("backup taken");
        let snapshot = BackupWriter::read(&backup).unwrap();
        assert_eq!(snapshot.tables[0].table, "billing_invoice");
        assert_eq!(snapshot.tables[0].rows[0]["total"], 42);

        assert!(fx.auditor.audit().await.unwrap().is_empty());
        assert!(!fx.catalog.is_deployment_locked("default"));
    }

    #[tokio::test]
    async fn test_duplicate_keeps_earliest_record() {
        let fx = Fixture::new();
        fx.catalog.add_record("svc_b", "billing", "0001_initial", ts(100));
        fx.catalog.add_record("public", "billing", "0001_initial", ts(200));

        let execution = fx.repair().await;
        assert_eq!(execution.exit_code(), 0);

        let records = fx.catalog.all_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].namespace, "svc_b");
        assert_eq!(records[0].applied_at, ts(100));

        let snapshot = BackupWriter::read(execution.backup.as_ref().unwrap()).unwrap();
        assert_eq!(snapshot.journal_rows.len(), 2);

        assert!(fx.auditor.audit().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_table_is_skipped() {
        let fx = Fixture::new();
        fx.catalog.add_table("public", "legacy_tmp", vec![]);

        let report = fx.auditor.audit().await.unwrap();
        let plan = fx.repairer.plan(&report).await.unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.skipped().len(), 1);

        let execution = fx.repairer.execute(&plan, false).await.unwrap();
        assert_eq!(execution.skipped_issues(), 1);
        assert_eq!(execution.exit_code(), 1);
        assert!(execution.backup.is_none());
        assert!(fx.catalog.has_table("public", "legacy_tmp"));
    }

    #[tokio::test]
    async fn test_move_rejected_for_dangling_foreign_key() {
        let fx = Fixture::new();
        fx.catalog.add_table("public", "billing_invoice", vec![]);
        fx.catalog.add_table("public", "legacy_customer", vec![]);
        fx.catalog
            .add_foreign_key("public", "billing_invoice", "public", "legacy_customer");

        let execution = fx.repair().await;
        assert_eq!(execution.exit_code(), 2);
        assert_eq!(execution.failed().len(), 1);
        assert!(fx.catalog.has_table("public", "billing_invoice"));
        assert!(!fx.catalog.has_table("svc_b", "billing_invoice"));

        let misplaced = execution
            .issues
            .iter()
            .find(|s| s.issue.subject == "billing_invoice")
            .unwrap();
        assert_eq!(misplaced.state, IssueState::Detected);
    }

    #[tokio::test]
    async fn test_move_rejected_for_foreign_key_into_shared_namespace() {
        let fx = Fixture::new();
        fx.catalog.add_table("shared", "auth_user", vec![]);
        fx.catalog.add_table("public", "billing_invoice", vec![]);
        fx.catalog
            .add_foreign_key("public", "billing_invoice", "shared", "auth_user");

        let execution = fx.repair().await;
        assert_eq!(execution.exit_code(), 2);
        assert!(matches!(execution.actions[0].status, ActionStatus::Failed(_)));
        assert!(fx.catalog.has_table("public", "billing_invoice"));
        assert!(!fx.catalog.has_table("svc_b", "billing_invoice"));
        assert!(!fx.catalog.has_table("svc_b", "auth_user"));
    }

    #[tokio::test]
    async fn test_referenced_tables_move_first() {
        let fx = Fixture::new();
        fx.catalog.add_table("public", "billing_a_line", vec![]);
        fx.catalog.add_table("public", "billing_invoice", vec![]);
        fx.catalog
            .add_foreign_key("public", "billing_a_line", "public", "billing_invoice");

        let report = fx.auditor.audit().await.unwrap();
        let plan = fx.repairer.plan(&report).await.unwrap();
        let tables: Vec<&str> = plan
            .actions
            .iter()
            .filter_map(|p| match &p.action {
                RepairAction::MoveTable { table, .. } => Some(table.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(tables, vec!["billing_invoice", "billing_a_line"]);

        let execution = fx.repairer.execute(&plan, false).await.unwrap();
        assert_eq!(execution.exit_code(), 0);
        assert!(fx.catalog.has_table("svc_b", "billing_a_line"));
    }

    #[tokio::test]
    async fn test_backup_failure_aborts_before_changes() {
        let fx = Fixture::new();
        fx.catalog.add_table("public", "billing_invoice", vec![]);
        fx.catalog.fail_on("export_table", "billing_invoice");

        let report = fx.auditor.audit().await.unwrap();
        let plan = fx.repairer.plan(&report).await.unwrap();
        let err = fx.repairer.execute(&plan, false).await.unwrap_err();

        assert_eq!(err.category(), "backup_failure");
        assert!(fx.catalog.has_table("public", "billing_invoice"));
        assert!(!fx.catalog.is_deployment_locked("default"));
    }

    #[tokio::test]
    async fn test_failure_pauses_and_resume_skips_applied() {
        let fx = Fixture::new();
        fx.catalog.add_table("public", "billing_invoice", vec![]);
        fx.catalog.add_table("public", "internships_offer", vec![]);
        fx.catalog.add_table("public", "internships_report", vec![]);
        fx.catalog.fail_on("move_table", "internships_offer");

        let first = fx.repair().await;
        assert_eq!(first.exit_code(), 2);
        assert_eq!(first.actions[0].status, ActionStatus::Applied);
        assert!(matches!(first.actions[1].status, ActionStatus::Failed(_)));
        assert_eq!(first.actions[2].status, ActionStatus::Pending);
        assert_eq!(first.pending().len(), 1);

        let states: Vec<IssueState> = first.issues.iter().map(|s| s.state).collect();
        assert_eq!(
            states,
            vec![IssueState::Applied, IssueState::Detected, IssueState::Planned]
        );

        fx.catalog.clear_failures();
        let run_id = first.run_id.clone().unwrap();
        let resumed = fx.repairer.resume(&run_id).await.unwrap();

        assert_eq!(resumed.run_id.as_deref(), Some(run_id.as_str()));
        assert_eq!(resumed.actions[0].status, ActionStatus::Logged);
        assert_eq!(resumed.actions[1].status, ActionStatus::Applied);
        assert_eq!(resumed.actions[2].status, ActionStatus::Applied);
        assert_eq!(resumed.exit_code(), 0);
        assert!(fx.auditor.audit().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rerun_after_success_is_noop() {
        let fx = Fixture::new();
        fx.catalog.add_table("public", "billing_invoice", vec![]);

        let report = fx.auditor.audit().await.unwrap();
        let plan = fx.repairer.plan(&report).await.unwrap();
        assert_eq!(fx.repairer.execute(&plan, false).await.unwrap().exit_code(), 0);

        // Same plan again: the backend reports the end state already holds
        let again = fx.repairer.execute(&plan, false).await.unwrap();
        assert_eq!(again.actions[0].status, ActionStatus::AlreadyApplied);
        assert_eq!(again.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_record_in_wrong_namespace_is_relocated() {
        let fx = Fixture::new();
        fx.catalog.add_record("public", "billing", "0001_initial", ts(100));

        let report = fx.auditor.audit().await.unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(
            report.issues[0].kind(),
            crate::schema::report::IssueKind::MigrationWrongNamespace
        );

        let execution = fx.repair().await;
        assert_eq!(execution.exit_code(), 0);
        assert_eq!(execution.actions[0].status, ActionStatus::Applied);

        let records = fx.catalog.all_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].namespace, "svc_b");
        assert_eq!(records[0].applied_at, ts(100));

        assert!(fx.auditor.audit().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_canonical_outside_owning_namespace_is_relocated() {
        let fx = Fixture::new();
        fx.catalog.add_record("public", "billing", "0001_initial", ts(100));
        fx.catalog.add_record("svc_b", "billing", "0001_initial", ts(200));

        let report = fx.auditor.audit().await.unwrap();
        let plan = fx.repairer.plan(&report).await.unwrap();
        assert!(matches!(
            plan.actions[0].action,
            RepairAction::DeleteDuplicateMigrationRecord { ref namespace, .. } if namespace == "svc_b"
        ));
        assert!(matches!(
            plan.actions[1].action,
            RepairAction::RelocateMigrationRecord { ref to, .. } if to == "svc_b"
        ));

        let execution = fx.repairer.execute(&plan, false).await.unwrap();
        assert_eq!(execution.exit_code(), 0);

        let records = fx.catalog.all_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].namespace, "svc_b");
        assert_eq!(records[0].applied_at, ts(100));
    }

    #[tokio::test]
    async fn test_missing_namespace_created_before_moves() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_namespace("svc_a");
        catalog.add_namespace("shared");
        catalog.add_table("public", "billing_invoice", vec![]);
        let fx = Fixture::with_catalog(catalog);

        let report = fx.auditor.audit().await.unwrap();
        let plan = fx.repairer.plan(&report).await.unwrap();
        assert_eq!(
            plan.actions[0].action,
            RepairAction::CreateNamespace {
                namespace: "svc_b".to_string()
            }
        );

        let execution = fx.repairer.execute(&plan, false).await.unwrap();
        assert_eq!(execution.exit_code(), 0);
        assert!(fx.catalog.has_table("svc_b", "billing_invoice"));
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let fx = Fixture::new();
        fx.catalog.add_table("public", "billing_invoice", vec![]);

        let report = fx.auditor.audit().await.unwrap();
        let plan = fx.repairer.plan(&report).await.unwrap();
        let execution = fx.repairer.execute(&plan, true).await.unwrap();

        assert_eq!(execution.exit_code(), 0);
        assert_eq!(execution.actions[0].status, ActionStatus::Planned);
        assert!(fx.catalog.has_table("public", "billing_invoice"));
        assert!(fx.repairer.log().entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_held_deployment_lock_refuses_run() {
        let fx = Fixture::new();
        fx.catalog.add_table("public", "billing_invoice", vec![]);
        assert!(fx.catalog.try_lock_deployment("default").await.unwrap());

        let report = fx.auditor.audit().await.unwrap();
        let plan = fx.repairer.plan(&report).await.unwrap();
        let err = fx.repairer.execute(&plan, false).await.unwrap_err();

        assert_eq!(err.category(), "lock_unavailable");
        assert!(fx.catalog.has_table("public", "billing_invoice"));
    }

    #[test]
    fn test_issue_state_transitions() {
        use IssueState::*;

        assert_eq!(Detected.transition(Planned).unwrap(), Planned);
        assert_eq!(Failed.transition(Detected).unwrap(), Detected);
        assert!(Detected.transition(Applied).is_err());
        assert!(Skipped.transition(Planned).is_err());
        assert!(Applied.transition(Applying).is_err());
        assert!(Planned.transition(Skipped).is_err());

        assert!(Applied.is_terminal());
        assert!(Skipped.is_terminal());
        assert!(!Detected.is_terminal());
    }
}
