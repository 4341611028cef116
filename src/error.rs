use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Logical unit '{unit}' is not registered")]
    UnregisteredUnit { unit: String },

    #[error("Service '{service}' may not migrate '{unit}' into {namespace} (owner: {owner})")]
    MigrationNotAuthorized {
        service: String,
        unit: String,
        namespace: String,
        owner: String,
    },

    #[error("Consistency error: {unit}.{migration} is already recorded in {existing:?}, refusing to record it in {namespace}")]
    Consistency {
        unit: String,
        migration: String,
        namespace: String,
        existing: Vec<String>,
    },

    #[error("Repair action failed: {action} - {cause}")]
    RepairActionFailure { action: String, cause: String },

    #[error("Backup failed, repair aborted before any destructive step: {cause}")]
    BackupFailure { cause: String },

    #[error("Advisory lock {lock} is held by another process")]
    LockUnavailable { lock: String },

    #[error("Connection failed to {database}: {cause}")]
    ConnectionFailed { database: String, cause: String },

    #[error("Query failed ({operation}) in {namespace}: {cause}")]
    QueryFailed {
        namespace: String,
        operation: String,
        cause: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RouterError {
    pub fn config(message: impl Into<String>) -> Self {
        RouterError::Configuration {
            message: message.into(),
        }
    }

    /// Stable label used as the `category` field in log events.
    pub fn category(&self) -> &'static str {
        match self {
            RouterError::Configuration { .. } => "configuration_error",
            RouterError::UnregisteredUnit { .. } => "unregistered_unit",
            RouterError::MigrationNotAuthorized { .. } => "migration_not_authorized",
            RouterError::Consistency { .. } => "consistency_error",
            RouterError::RepairActionFailure { .. } => "repair_action_failure",
            RouterError::BackupFailure { .. } => "backup_failure",
            RouterError::LockUnavailable { .. } => "lock_unavailable",
            RouterError::ConnectionFailed { .. } => "connection_failed",
            RouterError::QueryFailed { .. } => "query_failed",
            RouterError::Internal(_) => "internal_error",
        }
    }
}

impl From<tokio_postgres::Error> for RouterError {
    fn from(err: tokio_postgres::Error) -> Self {
        RouterError::Internal(err.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for RouterError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        RouterError::Internal(format!("Pool error: {}", err))
    }
}

impl From<std::io::Error> for RouterError {
    fn from(err: std::io::Error) -> Self {
        RouterError::Internal(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for RouterError {
    fn from(err: serde_json::Error) -> Self {
        RouterError::Internal(format!("JSON error: {}", err))
    }
}

impl From<anyhow::Error> for RouterError {
    fn from(err: anyhow::Error) -> Self {
        RouterError::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_labels() {
        assert_eq!(RouterError::config("x").category(), "configuration_error");
        assert_eq!(
            RouterError::UnregisteredUnit {
                unit: "billing".to_string()
            }
            .category(),
            "unregistered_unit"
        );
        assert_eq!(
            RouterError::BackupFailure {
                cause: "disk full".to_string()
            }
            .category(),
            "backup_failure"
        );
    }

    #[test]
    fn test_consistency_message_names_locations() {
        let err = RouterError::Consistency {
            unit: "billing".to_string(),
            migration: "0001_initial".to_string(),
            namespace: "public".to_string(),
            existing: vec!["svc_b".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("billing.0001_initial"));
        assert!(msg.contains("svc_b"));
        assert!(msg.contains("public"));
    }
}
