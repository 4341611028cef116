use crate::catalog::{
    deployment_lock_key, lock_order, reference_allowed, ActionOutcome, Catalog, ForeignKeyRef,
    MigrationRecord, RecordOutcome, TableMove, JOURNAL_TABLE, LOCK_CLASS,
};
use crate::error::{Result, RouterError};
use crate::ident::{is_valid_identifier, qualified, quote_ident};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Object, Pool, Transaction};
use std::collections::BTreeSet;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// PostgreSQL catalog backend.
///
/// Every statement uses fully qualified names, so the admin pool needs no
/// particular `search_path`.
pub struct PgCatalog {
    pool: Pool,
    database: String,
    deployment_session: Mutex<Option<Object>>,
}

impl PgCatalog {
    pub fn new(pool: Pool, database: &str) -> Self {
        Self {
            pool,
            database: database.to_string(),
            deployment_session: Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| RouterError::ConnectionFailed {
                database: self.database.clone(),
                cause: e.to_string(),
            })
    }

    fn query_failed(namespace: &str, operation: &str, e: impl std::fmt::Display) -> RouterError {
        RouterError::QueryFailed {
            namespace: namespace.to_string(),
            operation: operation.to_string(),
            cause: e.to_string(),
        }
    }
}

fn checked(name: &str) -> Result<&str> {
    if is_valid_identifier(name) {
        Ok(name)
    } else {
        Err(RouterError::Internal(format!(
            "Refusing to build SQL for invalid identifier: {}",
            name
        )))
    }
}

fn journal(namespace: &str) -> Result<String> {
    Ok(qualified(checked(namespace)?, JOURNAL_TABLE))
}

/// Transaction-scoped advisory locks, released on commit or rollback.
async fn lock_xact(tx: &Transaction<'_>, keys: &[String]) -> Result<()> {
    for key in keys {
        tx.execute(
            "SELECT pg_advisory_xact_lock($1, hashtext($2))",
            &[&LOCK_CLASS, key],
        )
        .await
        .map_err(|e| PgCatalog::query_failed(key, "advisory lock", e))?;
        debug!("Acquired advisory lock {}", key);
    }
    Ok(())
}

async fn relation_exists(tx: &Transaction<'_>, namespace: &str, relation: &str) -> Result<bool> {
    let row = tx
        .query_one(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM pg_class c
                JOIN pg_namespace n ON n.oid = c.relnamespace
                WHERE n.nspname = $1 AND c.relname = $2 AND c.relkind IN ('r', 'p')
            )
            "#,
            &[&namespace, &relation],
        )
        .await
        .map_err(|e| PgCatalog::query_failed(namespace, "relation lookup", e))?;
    Ok(row.get(0))
}

async fn record_in(
    tx: &Transaction<'_>,
    namespace: &str,
    unit: &str,
    migration: &str,
) -> Result<Option<MigrationRecord>> {
    if !relation_exists(tx, namespace, JOURNAL_TABLE).await? {
        return Ok(None);
    }

    let sql = format!(
        "SELECT applied_at FROM {} WHERE logical_unit = $1 AND migration_name = $2",
        journal(namespace)?
    );
    let row = tx
        .query_opt(&sql, &[&unit, &migration])
        .await
        .map_err(|e| PgCatalog::query_failed(namespace, "journal lookup", e))?;

    Ok(row.map(|row| MigrationRecord {
        namespace: namespace.to_string(),
        logical_unit: unit.to_string(),
        migration_name: migration.to_string(),
        applied_at: row.get(0),
    }))
}

async fn journal_namespaces_in(tx: &Transaction<'_>) -> Result<Vec<String>> {
    let rows = tx
        .query(
            r#"
            SELECT n.nspname::text
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE c.relname = $1 AND c.relkind = 'r'
            ORDER BY 1
            "#,
            &[&JOURNAL_TABLE],
        )
        .await
        .map_err(|e| PgCatalog::query_failed("*", "journal discovery", e))?;
    Ok(rows.iter().map(|r| r.get(0)).collect())
}

async fn create_journal_in(tx: &Transaction<'_>, namespace: &str) -> Result<()> {
    let sql = format!(
        r#"
        CREATE SCHEMA IF NOT EXISTS {ns};
        CREATE TABLE IF NOT EXISTS {journal} (
            id BIGSERIAL PRIMARY KEY,
            logical_unit TEXT NOT NULL,
            migration_name TEXT NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE (logical_unit, migration_name)
        );
        "#,
        ns = quote_ident(checked(namespace)?),
        journal = journal(namespace)?
    );
    tx.batch_execute(&sql)
        .await
        .map_err(|e| PgCatalog::query_failed(namespace, "journal table creation", e))
}

#[async_trait]
impl Catalog for PgCatalog {
    fn describe(&self) -> String {
        format!("postgres:{}", self.database)
    }

    async fn list_namespaces(&self) -> Result<BTreeSet<String>> {
        let client = self.client().await?;
        let rows = client
            .query(
                r#"
                SELECT nspname::text
                FROM pg_namespace
                WHERE nspname NOT IN ('pg_catalog', 'information_schema')
                    AND nspname NOT LIKE 'pg\_%'
                ORDER BY nspname
                "#,
                &[],
            )
            .await
            .map_err(|e| Self::query_failed("*", "list namespaces", e))?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn list_tables(&self, namespace: &str) -> Result<BTreeSet<String>> {
        let client = self.client().await?;
        let rows = client
            .query(
                r#"
                SELECT c.relname::text
                FROM pg_class c
                JOIN pg_namespace n ON n.oid = c.relnamespace
                WHERE n.nspname = $1
                    AND c.relkind IN ('r', 'p')
                    AND NOT c.relispartition
                    AND c.relname <> $2
                ORDER BY 1
                "#,
                &[&namespace, &JOURNAL_TABLE],
            )
            .await
            .map_err(|e| Self::query_failed(namespace, "list tables", e))?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn journal_namespaces(&self) -> Result<BTreeSet<String>> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        let namespaces = journal_namespaces_in(&tx).await?;
        tx.commit().await?;
        Ok(namespaces.into_iter().collect())
    }

    async fn create_namespace(&self, namespace: &str) -> Result<bool> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        lock_xact(&tx, &lock_order(&[namespace], None)).await?;

        let exists: bool = tx
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = $1)",
                &[&namespace],
            )
            .await
            .map_err(|e| Self::query_failed(namespace, "namespace lookup", e))?
            .get(0);

        if !exists {
            tx.batch_execute(&format!("CREATE SCHEMA {}", quote_ident(checked(namespace)?)))
                .await
                .map_err(|e| Self::query_failed(namespace, "create namespace", e))?;
        }
        tx.commit().await?;

        if !exists {
            info!("Created namespace {}", namespace);
        }
        Ok(!exists)
    }

    async fn ensure_journal(&self, namespace: &str) -> Result<bool> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        lock_xact(&tx, &lock_order(&[namespace], None)).await?;

        let existed = relation_exists(&tx, namespace, JOURNAL_TABLE).await?;
        if !existed {
            create_journal_in(&tx, namespace).await?;
        }
        tx.commit().await?;
        Ok(!existed)
    }

    async fn journal_records(&self, namespace: &str) -> Result<Vec<MigrationRecord>> {
        let client = self.client().await?;
        let sql = format!(
            "SELECT logical_unit, migration_name, applied_at FROM {} ORDER BY applied_at, migration_name, logical_unit",
            journal(namespace)?
        );
        let rows = client
            .query(&sql, &[])
            .await
            .map_err(|e| Self::query_failed(namespace, "read journal", e))?;

        Ok(rows
            .iter()
            .map(|row| MigrationRecord {
                namespace: namespace.to_string(),
                logical_unit: row.get(0),
                migration_name: row.get(1),
                applied_at: row.get(2),
            })
            .collect())
    }

    async fn find_records(&self, unit: &str, migration: &str) -> Result<Vec<MigrationRecord>> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;

        let mut records = Vec::new();
        for namespace in journal_namespaces_in(&tx).await? {
            if let Some(record) = record_in(&tx, &namespace, unit, migration).await? {
                records.push(record);
            }
        }
        tx.commit().await?;
        Ok(records)
    }

    async fn record_migration(
        &self,
        namespace: &str,
        unit: &str,
        migration: &str,
    ) -> Result<RecordOutcome> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        lock_xact(&tx, &lock_order(&[namespace], Some(unit))).await?;

        if !relation_exists(&tx, namespace, JOURNAL_TABLE).await? {
            return Err(Self::query_failed(
                namespace,
                "record migration",
                "journal table missing, run bootstrap first",
            ));
        }

        let mut elsewhere = Vec::new();
        let mut here = None;
        for ns in journal_namespaces_in(&tx).await? {
            if let Some(record) = record_in(&tx, &ns, unit, migration).await? {
                if ns == namespace {
                    here = Some(record);
                } else {
                    elsewhere.push(record);
                }
            }
        }

        if !elsewhere.is_empty() {
            tx.rollback().await?;
            return Ok(RecordOutcome::Conflict(elsewhere));
        }
        if let Some(record) = here {
            tx.rollback().await?;
            return Ok(RecordOutcome::AlreadyPresent(record));
        }

        let sql = format!(
            "INSERT INTO {} (logical_unit, migration_name) VALUES ($1, $2) RETURNING applied_at",
            journal(namespace)?
        );
        let applied_at: DateTime<Utc> = tx
            .query_one(&sql, &[&unit, &migration])
            .await
            .map_err(|e| Self::query_failed(namespace, "record migration", e))?
            .get(0);
        tx.commit().await?;

        Ok(RecordOutcome::Inserted(MigrationRecord {
            namespace: namespace.to_string(),
            logical_unit: unit.to_string(),
            migration_name: migration.to_string(),
            applied_at,
        }))
    }

    async fn foreign_keys(&self, namespace: &str, table: &str) -> Result<Vec<ForeignKeyRef>> {
        let client = self.client().await?;
        let rows = client
            .query(
                r#"
                SELECT con.conname::text, rn.nspname::text, rc.relname::text
                FROM pg_constraint con
                JOIN pg_class c ON c.oid = con.conrelid
                JOIN pg_namespace n ON n.oid = c.relnamespace
                JOIN pg_class rc ON rc.oid = con.confrelid
                JOIN pg_namespace rn ON rn.oid = rc.relnamespace
                WHERE con.contype = 'f' AND n.nspname = $1 AND c.relname = $2
                ORDER BY 1
                "#,
                &[&namespace, &table],
            )
            .await
            .map_err(|e| Self::query_failed(namespace, "foreign keys", e))?;

        Ok(rows
            .iter()
            .map(|row| ForeignKeyRef {
                constraint: row.get(0),
                referenced_namespace: row.get(1),
                referenced_table: row.get(2),
            })
            .collect())
    }

    async fn export_table(&self, namespace: &str, table: &str) -> Result<serde_json::Value> {
        let client = self.client().await?;
        let sql = format!(
            "SELECT COALESCE(json_agg(row_to_json(t)), '[]'::json) FROM {} t",
            qualified(checked(namespace)?, checked(table)?)
        );
        let row = client
            .query_one(&sql, &[])
            .await
            .map_err(|e| Self::query_failed(namespace, "export table", e))?;
        Ok(row.get(0))
    }

    async fn move_table(&self, mv: &TableMove) -> Result<ActionOutcome> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        lock_xact(&tx, &lock_order(&[mv.from.as_str(), mv.to.as_str()], None)).await?;

        let in_from = relation_exists(&tx, &mv.from, &mv.table).await?;
        let in_to = relation_exists(&tx, &mv.to, &mv.table).await?;

        match (in_from, in_to) {
            (false, true) => return Ok(ActionOutcome::AlreadyApplied),
            (true, true) => {
                return Ok(ActionOutcome::Rejected(format!(
                    "{} already exists in {}",
                    mv.table, mv.to
                )))
            }
            (false, false) => {
                return Ok(ActionOutcome::Rejected(format!(
                    "{} not found in {}",
                    mv.table, mv.from
                )))
            }
            (true, false) => {}
        }

        let to_exists: bool = tx
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = $1)",
                &[&mv.to],
            )
            .await
            .map_err(|e| Self::query_failed(&mv.to, "namespace lookup", e))?
            .get(0);
        if !to_exists {
            return Ok(ActionOutcome::Rejected(format!(
                "destination namespace {} does not exist",
                mv.to
            )));
        }

        let rows = tx
            .query(
                r#"
                SELECT con.conname::text, rn.nspname::text, rc.relname::text
                FROM pg_constraint con
                JOIN pg_class c ON c.oid = con.conrelid
                JOIN pg_namespace n ON n.oid = c.relnamespace
                JOIN pg_class rc ON rc.oid = con.confrelid
                JOIN pg_namespace rn ON rn.oid = rc.relnamespace
                WHERE con.contype = 'f' AND n.nspname = $1 AND c.relname = $2
                ORDER BY 1
                "#,
                &[&mv.from, &mv.table],
            )
            .await
            .map_err(|e| Self::query_failed(&mv.from, "foreign keys", e))?;

        let dangling: Vec<String> = rows
            .iter()
            .map(|row| ForeignKeyRef {
                constraint: row.get(0),
                referenced_namespace: row.get(1),
                referenced_table: row.get(2),
            })
            .filter(|fk| !reference_allowed(fk, mv))
            .map(|fk| {
                format!(
                    "{} -> {}.{}",
                    fk.constraint, fk.referenced_namespace, fk.referenced_table
                )
            })
            .collect();

        if !dangling.is_empty() {
            warn!(
                "Refusing to move {}.{} to {}: foreign keys reference tables outside the destination: {}",
                mv.from,
                mv.table,
                mv.to,
                dangling.join(", ")
            );
            return Ok(ActionOutcome::Rejected(format!(
                "foreign keys reference tables absent from {}: {}",
                mv.to,
                dangling.join(", ")
            )));
        }

        let sql = format!(
            "ALTER TABLE {} SET SCHEMA {}",
            qualified(checked(&mv.from)?, checked(&mv.table)?),
            quote_ident(checked(&mv.to)?)
        );
        tx.batch_execute(&sql)
            .await
            .map_err(|e| Self::query_failed(&mv.from, "move table", e))?;
        tx.commit().await?;

        info!("Moved table {} from {} to {}", mv.table, mv.from, mv.to);
        Ok(ActionOutcome::Applied)
    }

    async fn relocate_record(
        &self,
        unit: &str,
        migration: &str,
        from: &str,
        to: &str,
    ) -> Result<ActionOutcome> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        lock_xact(&tx, &lock_order(&[from, to], Some(unit))).await?;

        let source = record_in(&tx, from, unit, migration).await?;
        let target = record_in(&tx, to, unit, migration).await?;

        let source = match (source, target) {
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

        create_journal_in(&tx, to).await?;

        tx.execute(
            &format!(
                "INSERT INTO {} (logical_unit, migration_name, applied_at) VALUES ($1, $2, $3)",
                journal(to)?
            ),
            &[&unit, &migration, &source.applied_at],
        )
        .await
        .map_err(|e| Self::query_failed(to, "relocate record", e))?;

        tx.execute(
            &format!(
                "DELETE FROM {} WHERE logical_unit = $1 AND migration_name = $2",
                journal(from)?
            ),
            &[&unit, &migration],
        )
        .await
        .map_err(|e| Self::query_failed(from, "relocate record", e))?;

        tx.commit().await?;
        info!("Relocated journal record {}.{} from {} to {}", unit, migration, from, to);
        Ok(ActionOutcome::Applied)
    }

    async fn delete_duplicate_record(
        &self,
        unit: &str,
        migration: &str,
        namespace: &str,
        canonical: &str,
    ) -> Result<ActionOutcome> {
        let mut client = self.client().await?;
        let tx = client.transaction().await?;
        lock_xact(&tx, &lock_order(&[namespace, canonical], Some(unit))).await?;

        let Some(duplicate) = record_in(&tx, namespace, unit, migration).await? else {
            return Ok(ActionOutcome::AlreadyApplied);
        };
        let Some(kept) = record_in(&tx, canonical, unit, migration).await? else {
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

        tx.execute(
            &format!(
                "DELETE FROM {} WHERE logical_unit = $1 AND migration_name = $2",
                journal(namespace)?
            ),
            &[&unit, &migration],
        )
        .await
        .map_err(|e| Self::query_failed(namespace, "delete duplicate record", e))?;
        tx.commit().await?;

        info!(
            "Deleted duplicate journal record {}.{} from {} (kept {})",
            unit, migration, namespace, canonical
        );
        Ok(ActionOutcome::Applied)
    }

    async fn try_lock_deployment(&self, deployment: &str) -> Result<bool> {
        let mut session = self.deployment_session.lock().await;
        if session.is_some() {
            return Ok(false);
        }

        let client = self.client().await?;
        let key = deployment_lock_key(deployment);
        let acquired: bool = client
            .query_one(
                "SELECT pg_try_advisory_lock($1, hashtext($2))",
                &[&LOCK_CLASS, &key],
            )
            .await
            .map_err(|e| Self::query_failed("*", "deployment lock", e))?
            .get(0);

        if acquired {
            // The session lock lives as long as this connection stays checked out
            *session = Some(client);
            info!("Acquired deployment lock {}", key);
        }
        Ok(acquired)
    }

    async fn unlock_deployment(&self, deployment: &str) -> Result<()> {
        let mut session = self.deployment_session.lock().await;
        if let Some(client) = session.take() {
            let key = deployment_lock_key(deployment);
            client
                .query_one(
                    "SELECT pg_advisory_unlock($1, hashtext($2))",
                    &[&LOCK_CLASS, &key],
                )
                .await
                .map_err(|e| Self::query_failed("*", "deployment unlock", e))?;
            info!("Released deployment lock {}", key);
        }
        Ok(())
    }
}
