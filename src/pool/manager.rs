use crate::config::Config;
use crate::error::{Result, RouterError};
use crate::pool::configurator::SearchOrder;
use dashmap::DashMap;
use deadpool_postgres::{Config as PoolConfig, Pool, Runtime};
use std::time::Duration;
use tokio_postgres::NoTls;
use tracing::{debug, info};

/// Owns the admin pool used for catalog work and one pool per service whose
/// connections start with that service's `search_path`.
pub struct PoolManager {
    config: Config,
    admin_pool: Pool,
    service_pools: DashMap<String, Pool>,
}

impl PoolManager {
    pub async fn new(config: Config) -> Result<Self> {
        let admin_pool = create_pool(&config.database_url, config.max_connections, None)?;

        let client = admin_pool
            .get()
            .await
            .map_err(|e| RouterError::ConnectionFailed {
                database: config.database_name(),
                cause: e.to_string(),
            })?;

        client
            .execute("SELECT 1", &[])
            .await
            .map_err(|e| RouterError::ConnectionFailed {
                database: config.database_name(),
                cause: format!("Ping failed: {}", e),
            })?;

        info!("Connected to PostgreSQL database {}", config.database_name());

        Ok(Self {
            config,
            admin_pool,
            service_pools: DashMap::new(),
        })
    }

    pub fn admin_pool(&self) -> &Pool {
        &self.admin_pool
    }

    /// Pool whose connections resolve unqualified names through `order`.
    pub fn service_pool(&self, order: &SearchOrder) -> Result<Pool> {
        if let Some(pool) = self.service_pools.get(&order.service) {
            return Ok(pool.clone());
        }

        let pool = create_pool(
            &self.config.database_url,
            self.config.max_connections,
            Some(order.connection_options()),
        )?;
        self.service_pools
            .insert(order.service.clone(), pool.clone());

        info!(
            "Created pool for service {} with search_path {}",
            order.service,
            order.search_path()
        );
        Ok(pool)
    }

    /// The `search_path` a live connection of the service actually reports.
    pub async fn effective_search_path(&self, order: &SearchOrder) -> Result<String> {
        let pool = self.service_pool(order)?;
        let client = pool.get().await.map_err(|e| RouterError::ConnectionFailed {
            database: self.config.database_name(),
            cause: e.to_string(),
        })?;

        let row = client
            .query_one("SELECT current_setting('search_path')", &[])
            .await
            .map_err(|e| RouterError::QueryFailed {
                namespace: order.service.clone(),
                operation: "show search_path".to_string(),
                cause: e.to_string(),
            })?;

        let path: String = row.get(0);
        debug!("Service {} connection search_path: {}", order.service, path);
        Ok(path)
    }

    pub fn active_pools(&self) -> usize {
        self.service_pools.len() + 1
    }
}

fn create_pool(database_url: &str, max_size: u32, options: Option<String>) -> Result<Pool> {
    let mut cfg = PoolConfig::new();
    cfg.url = Some(database_url.to_string());
    cfg.options = options;

    cfg.pool = Some(deadpool_postgres::PoolConfig {
        max_size: max_size as usize,
        timeouts: deadpool_postgres::Timeouts {
            wait: Some(Duration::from_secs(5)),
            create: Some(Duration::from_secs(5)),
            recycle: Some(Duration::from_secs(5)),
        },
        ..Default::default()
    });

    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| RouterError::Internal(format!("Failed to create pool: {}", e)))
}
