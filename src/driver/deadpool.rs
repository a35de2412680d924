//! Driver adapter backed by `deadpool-postgres`.

use std::str::FromStr;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::NoTls;

use crate::{
    driver::{Driver, PoolConfig},
    dsn::Dsn,
    error::{Error, Result},
    metrics::DriverMetrics,
};

/// A deadpool-postgres pool annotated with the host it serves.
#[derive(Clone)]
pub struct PostgresPool {
    pool: Pool,
    host: String,
}

/// [`Driver`] implementation routing to `deadpool-postgres` pools over
/// unencrypted connections.
#[derive(Clone, Copy, Debug, Default)]
pub struct PostgresDriver;

impl PostgresDriver {
    /// Creates the adapter.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    type Pool = PostgresPool;
    type Connection = deadpool_postgres::Client;

    async fn create_pool(&self, dsn: &Dsn, config: &PoolConfig) -> Result<PostgresPool> {
        let pg_config = tokio_postgres::Config::from_str(&dsn.to_string())
            .map_err(|e| Error::invalid_dsn(e.to_string()))?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(config.max_size)
            .build()
            .map_err(|e| Error::driver(e.to_string()))?;
        // Establish one connection up front so an unreachable host fails the
        // creation attempt instead of the first probe.
        pool.get().await.map_err(|e| Error::driver(e.to_string()))?;
        Ok(PostgresPool {
            pool,
            host: dsn.netloc(),
        })
    }

    async fn close_pool(&self, pool: &PostgresPool) -> Result<()> {
        pool.pool.close();
        Ok(())
    }

    async fn terminate_pool(&self, pool: &PostgresPool) -> Result<()> {
        pool.pool.resize(0);
        pool.pool.close();
        Ok(())
    }

    async fn acquire(&self, pool: &PostgresPool) -> Result<deadpool_postgres::Client> {
        pool.pool.get().await.map_err(|e| Error::driver(e.to_string()))
    }

    async fn release(
        &self,
        connection: deadpool_postgres::Client,
        _pool: &PostgresPool,
    ) -> Result<()> {
        // Dropping the client hands it back to its pool.
        drop(connection);
        Ok(())
    }

    async fn is_master(&self, connection: &mut deadpool_postgres::Client) -> Result<bool> {
        let row = connection
            .query_one("SHOW transaction_read_only", &[])
            .await
            .map_err(|e| Error::driver(e.to_string()))?;
        Ok(row.get::<_, &str>(0) == "off")
    }

    fn free_size(&self, pool: &PostgresPool) -> usize {
        pool.pool.status().available
    }

    fn is_connection_closed(&self, connection: &deadpool_postgres::Client) -> bool {
        connection.is_closed()
    }

    fn host(&self, pool: &PostgresPool) -> String {
        pool.host.clone()
    }

    fn pool_metrics(&self, pool: &PostgresPool) -> DriverMetrics {
        let status = pool.pool.status();
        DriverMetrics {
            max: status.max_size,
            min: 0,
            idle: status.available,
            used: status.size.saturating_sub(status.available),
            host: pool.host.clone(),
        }
    }
}
