//! Pre-repair backups
//!
//! Before a repair run changes anything, the journal rows and table contents
//! it touches are written to `{backup_dir}/{run_id}-{timestamp}.tar.gz`:
//! ```text
//! snapshot.json                     # run id, timestamp, counts
//! journal.json                      # affected journal rows
//! tables/{namespace}.{table}.json   # rows of each table about to move
//! ```
//! A `.sha256` sidecar holds the archive checksum.

use crate::catalog::MigrationRecord;
use crate::error::{Result, RouterError};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use tar::{Archive, Builder, Header};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub namespace: String,
    pub table: String,
    pub rows: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub run_id: String,
    pub taken_at: DateTime<Utc>,
    pub journal_rows: Vec<MigrationRecord>,
    pub tables: Vec<TableSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub path: PathBuf,
    pub checksum: String,
    pub bytes: u64,
}

#[derive(Debug, Serialize)]
struct SnapshotHeader<'a> {
    run_id: &'a str,
    taken_at: DateTime<Utc>,
    journal_rows: usize,
    tables: Vec<String>,
}

pub struct BackupWriter {
    dir: PathBuf,
}

impl BackupWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Write the archive and its checksum sidecar. Any failure is a
    /// `BackupFailure`.
    pub fn write(&self, snapshot: &BackupSnapshot) -> Result<BackupArtifact> {
        self.write_inner(snapshot)
            .map_err(|e| RouterError::BackupFailure {
                cause: e.to_string(),
            })
    }

    fn write_inner(&self, snapshot: &BackupSnapshot) -> Result<BackupArtifact> {
        fs::create_dir_all(&self.dir)?;

        let header = SnapshotHeader {
            run_id: &snapshot.run_id,
            taken_at: snapshot.taken_at,
            journal_rows: snapshot.journal_rows.len(),
            tables: snapshot
                .tables
                .iter()
                .map(|t| format!("{}.{}", t.namespace, t.table))
                .collect(),
        };

        let mut archive_data = Vec::new();
        {
            let encoder = GzEncoder::new(&mut archive_data, Compression::default());
            let mut builder = Builder::new(encoder);

            append_json(&mut builder, "snapshot.json", &serde_json::to_vec_pretty(&header)?)?;
            append_json(
                &mut builder,
                "journal.json",
                &serde_json::to_vec_pretty(&snapshot.journal_rows)?,
            )?;
            for table in &snapshot.tables {
                append_json(
                    &mut builder,
                    &format!("tables/{}.{}.json", table.namespace, table.table),
                    &serde_json::to_vec_pretty(&table.rows)?,
                )?;
            }

            builder.into_inner()?.finish()?;
        }

        let file_name = format!(
            "{}-{}.tar.gz",
            snapshot.run_id,
            snapshot.taken_at.format("%Y%m%dT%H%M%SZ")
        );
        let path = self.dir.join(&file_name);
        fs::write(&path, &archive_data)?;

        let checksum = compute_checksum(&archive_data);
        fs::write(
            path.with_extension("gz.sha256"),
            format!("{}  {}\n", checksum, file_name),
        )?;

        info!(
            "Wrote backup {} ({} bytes, sha256 {})",
            path.display(),
            archive_data.len(),
            checksum
        );

        Ok(BackupArtifact {
            path,
            checksum,
            bytes: archive_data.len() as u64,
        })
    }

    /// Read a backup back, refusing it when the checksum does not match.
    pub fn read(artifact: &BackupArtifact) -> Result<BackupSnapshot> {
        let data = fs::read(&artifact.path)?;
        let actual = compute_checksum(&data);
        if actual != artifact.checksum {
            return Err(RouterError::BackupFailure {
                cause: format!(
                    "checksum mismatch for {}: expected {}, got {}",
                    artifact.path.display(),
                    artifact.checksum,
                    actual
                ),
            });
        }

        let mut run_id = String::new();
        let mut taken_at = Utc::now();
        let mut journal_rows = Vec::new();
        let mut tables = Vec::new();

        let mut archive = Archive::new(GzDecoder::new(&data[..]));
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = entry.path()?.to_string_lossy().to_string();
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;

            if name == "snapshot.json" {
                let header: JsonValue = serde_json::from_slice(&content)?;
                run_id = header["run_id"].as_str().unwrap_or_default().to_string();
                if let Some(at) = header["taken_at"]
                    .as_str()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                {
                    taken_at = at.with_timezone(&Utc);
                }
            } else if name == "journal.json" {
                journal_rows = serde_json::from_slice(&content)?;
            } else if let Some(qualified) = name
                .strip_prefix("tables/")
                .and_then(|n| n.strip_suffix(".json"))
            {
                if let Some((namespace, table)) = qualified.split_once('.') {
                    tables.push(TableSnapshot {
                        namespace: namespace.to_string(),
                        table: table.to_string(),
                        rows: serde_json::from_slice(&content)?,
                    });
                }
            }
            debug!("Read backup entry {}", name);
        }

        Ok(BackupSnapshot {
            run_id,
            taken_at,
            journal_rows,
            tables,
        })
    }
}

fn append_json<W: std::io::Write>(builder: &mut Builder<W>, name: &str, content: &[u8]) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_path(name)?;
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    builder.append(&header, content)?;
    Ok(())
}

pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn snapshot() -> BackupSnapshot {
        BackupSnapshot {
            run_id: "20261014093000-1a2b3c4d".to_string(),
            taken_at: Utc.timestamp_opt(1_790_000_000, 0).unwrap(),
            journal_rows: vec![MigrationRecord {
                namespace: "public".to_string(),
                logical_unit: "billing".to_string(),
                migration_name: "0001_initial".to_string(),
                applied_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            }],
            tables: vec![TableSnapshot {
                namespace: "public".to_string(),
                table: "billing_invoice".to_string(),
                rows: serde_json::json!([{"id": 1, "total": 42}]),
            }],
        }
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let writer = BackupWriter::new(dir.path().join("backups"));

        let artifact = writer.write(&snapshot()).unwrap();
        assert!(artifact.path.exists());
        assert_eq!(artifact.checksum.len(), 64);

        let sidecar = fs::read_to_string(artifact.path.with_extension("gz.sha256")).unwrap();
        assert!(sidecar.starts_with(&artifact.checksum));

        let restored = BackupWriter::read(&artifact).unwrap();
        assert_eq!(restored, snapshot());
    }

    #[test]
    fn test_tampered_backup_is_rejected() {
        let dir = TempDir::new().unwrap();
        let writer = BackupWriter::new(dir.path());
        let mut artifact = writer.write(&snapshot()).unwrap();
        artifact.checksum = compute_checksum(b"something else");

        let err = BackupWriter::read(&artifact).unwrap_err();
        assert_eq!(err.category(), "backup_failure");
    }

    #[test]
    fn test_unwritable_directory_is_backup_failure() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"file").unwrap();

        let err = BackupWriter::new(&blocker).write(&snapshot()).unwrap_err();
        assert_eq!(err.category(), "backup_failure");
    }
}
