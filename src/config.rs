use std::env;
use std::path::PathBuf;

const DEFAULT_LOG_DIR: &str = "/var/log/schema-router";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Identity of the running service; decides search order and migrate rights.
    pub service_name: String,
    pub manifest_path: PathBuf,
    /// Holds `backups/` and the repair log.
    pub data_dir: PathBuf,
    /// Scope of the repair-run advisory lock.
    pub deployment_name: String,
    pub max_connections: u32,
    pub log_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        // Build database_url from individual fields or use DATABASE_URL if provided
        let database_url = if let Ok(url) = env::var("DATABASE_URL") {
            url
        } else {
            let db_host = env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string());
            let db_port = env::var("DB_PORT").unwrap_or_else(|_| "5432".to_string());
            let db_name = env::var("DB_NAME").unwrap_or_else(|_| "postgres".to_string());
            let db_user = env::var("DB_USER").unwrap_or_else(|_| "schema_router".to_string());
            let db_password = env::var("DB_PASSWORD").unwrap_or_else(|_| "password".to_string());

            // URL-encode password to handle special characters
            let encoded_password = urlencoding::encode(&db_password);

            format!(
                "postgres://{}:{}@{}:{}/{}",
                db_user, encoded_password, db_host, db_port, db_name
            )
        };

        let service_name = env::var("SERVICE_NAME").unwrap_or_default();

        let manifest_path = env::var("MANIFEST_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./namespaces.json"));

        let data_dir = env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let deployment_name =
            env::var("DEPLOYMENT_NAME").unwrap_or_else(|_| "default".to_string());

        let max_connections = env::var("MAX_CONNECTIONS")
            .unwrap_or_else(|_| "4".to_string())
            .parse()
            .unwrap_or(4);

        let log_dir = env::var("LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_DIR));

        Ok(Config {
            database_url,
            service_name,
            manifest_path,
            data_dir,
            deployment_name,
            max_connections,
            log_dir,
        })
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    pub fn repair_log_path(&self) -> PathBuf {
        self.data_dir.join("repair-log.jsonl")
    }

    /// Database name from the URL, without credentials, for log lines.
    pub fn database_name(&self) -> String {
        self.database_url
            .rsplit('/')
            .next()
            .map(|s| s.split('?').next().unwrap_or(s).to_string())
            .unwrap_or_default()
    }
}
