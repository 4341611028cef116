//! Repair log
//!
//! Append-only JSON-lines record of every repair run: the plan, the backup
//! location, each action's outcome and how the run ended. Resuming a run
//! reads it back to find the plan and the actions already applied.

use crate::error::Result;
use crate::schema::backup::BackupArtifact;
use crate::schema::repair::{ActionStatus, RepairAction, RepairPlan};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Paused,
    /// Stopped before any action ran.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RepairLogEvent {
    RunStarted {
        plan: RepairPlan,
        resumed: bool,
    },
    BackupWritten {
        backup: BackupArtifact,
    },
    ActionFinished {
        index: usize,
        action: RepairAction,
        status: ActionStatus,
    },
    RunFinished {
        status: RunStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairLogEntry {
    pub run_id: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RepairLogEvent,
}

pub struct RepairLog {
    path: PathBuf,
}

impl RepairLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, run_id: &str, event: RepairLogEvent) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let entry = RepairLogEntry {
            run_id: run_id.to_string(),
            at: Utc::now(),
            event,
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        debug!("Repair log {}: {}", run_id, line.trim_end());
        Ok(())
    }

    /// All entries in file order. A line that does not parse (for example a
    /// torn final write) is logged and skipped.
    pub fn entries(&self) -> Result<Vec<RepairLogEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path)?;
        let mut entries = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RepairLogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(
                    "Skipping unreadable repair log line {} in {}: {}",
                    lineno + 1,
                    self.path.display(),
                    e
                ),
            }
        }
        Ok(entries)
    }

    pub fn entries_for(&self, run_id: &str) -> Result<Vec<RepairLogEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.run_id == run_id)
            .collect())
    }

    /// The plan the run originally started with.
    pub fn plan_for(&self, run_id: &str) -> Result<Option<RepairPlan>> {
        Ok(self
            .entries_for(run_id)?
            .into_iter()
            .find_map(|e| match e.event {
                RepairLogEvent::RunStarted { plan, .. } => Some(plan),
                _ => None,
            }))
    }

    /// Plan indices of actions any attempt of the run completed.
    pub fn applied_actions(&self, run_id: &str) -> Result<BTreeSet<usize>> {
        Ok(self
            .entries_for(run_id)?
            .into_iter()
            .filter_map(|e| match e.event {
                RepairLogEvent::ActionFinished { index, status, .. } if status.is_done() => {
                    Some(index)
                }
                _ => None,
            })
            .collect())
    }
}
