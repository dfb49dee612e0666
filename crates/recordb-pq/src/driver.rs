//! PostgreSQL driver
//!
//! The driver owns everything shared between connections to the same
//! database: one client pool and one change listener per connection
//! string, and one schema cache per application. The application schema
//! is bootstrapped once per process, on first open.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use recordb_core::config::StoreConfig;
use recordb_core::conn::{AccessModel, Conn};
use recordb_core::driver::Driver;
use recordb_core::error::{Error, Result};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::connection::{schema_name, PgConn};
use crate::init::ensure_app_schema;
use crate::listener::{ChangeListener, ListenerConfig};
use crate::pool::{redact, ClientPool, PoolConfig};
use crate::schema::SchemaCache;

/// Name the driver is registered under
pub const DRIVER_NAME: &str = "pq";

/// Opens [`PgConn`]s
#[derive(Debug)]
pub struct PgDriver {
    pool_template: PoolConfig,
    listener_config: ListenerConfig,
    pools: DashMap<String, Arc<ClientPool>>,
    listeners: DashMap<String, Arc<ChangeListener>>,
    schemas: DashMap<(String, String), Arc<SchemaCache>>,
    bootstrapped: DashMap<(String, String), Arc<OnceCell<()>>>,
}

impl Default for PgDriver {
    fn default() -> Self {
        Self::new(PoolConfig::default(), ListenerConfig::default())
    }
}

impl PgDriver {
    /// Driver whose pools use `pool_template` with the url of each open
    pub fn new(pool_template: PoolConfig, listener_config: ListenerConfig) -> Self {
        Self {
            pool_template,
            listener_config,
            pools: DashMap::new(),
            listeners: DashMap::new(),
            schemas: DashMap::new(),
            bootstrapped: DashMap::new(),
        }
    }

    /// Pool for `url`, created on first use
    pub fn pool(&self, url: &str) -> Arc<ClientPool> {
        self.pools
            .entry(url.to_string())
            .or_insert_with(|| {
                debug!(url = %redact(url), "Creating client pool");
                ClientPool::new(PoolConfig {
                    url: url.to_string(),
                    ..self.pool_template.clone()
                })
            })
            .clone()
    }

    fn listener(&self, url: &str) -> Arc<ChangeListener> {
        self.listeners
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(ChangeListener::new(url, self.listener_config.clone())))
            .clone()
    }

    fn schema_cache(&self, url: &str, app_name: &str) -> Arc<SchemaCache> {
        self.schemas
            .entry((url.to_string(), app_name.to_string()))
            .or_insert_with(|| Arc::new(SchemaCache::new()))
            .clone()
    }

    fn bootstrap_cell(&self, url: &str, app_name: &str) -> Arc<OnceCell<()>> {
        self.bootstrapped
            .entry((url.to_string(), app_name.to_string()))
            .or_default()
            .clone()
    }

    /// Open a connection, returning the concrete type
    pub async fn connect(
        &self,
        app_name: &str,
        access_model: AccessModel,
        url: &str,
        config: &StoreConfig,
    ) -> Result<PgConn> {
        if app_name.is_empty() {
            return Err(Error::invalid_argument("app name must not be empty"));
        }
        let client = self.pool(url).get().await?;

        let schema = schema_name(app_name);
        self.bootstrap_cell(url, app_name)
            .get_or_try_init(|| ensure_app_schema(&client, &schema))
            .await?;

        debug!(app = %app_name, access_model = %access_model, "Opened connection");
        Ok(PgConn::new(
            client,
            app_name,
            access_model,
            config.clone(),
            self.schema_cache(url, app_name),
            self.listener(url),
        ))
    }

    /// Stop every listener and close every pool
    pub async fn shutdown(&self) {
        let listeners: Vec<_> = self.listeners.iter().map(|l| Arc::clone(l.value())).collect();
        for listener in listeners {
            listener.shutdown().await;
        }
        self.listeners.clear();
        for pool in self.pools.iter() {
            pool.close();
        }
        self.pools.clear();
        info!("PostgreSQL driver shut down");
    }
}

#[async_trait]
impl Driver for PgDriver {
    async fn open(
        &self,
        app_name: &str,
        access_model: AccessModel,
        option: &str,
        config: &StoreConfig,
    ) -> Result<Box<dyn Conn>> {
        let conn = self.connect(app_name, access_model, option, config).await?;
        Ok(Box::new(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_state_is_keyed() {
        let driver = PgDriver::default();
        let a = driver.pool("postgres://db1");
        let b = driver.pool("postgres://db1");
        let c = driver.pool("postgres://db2");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(b.config().url, "postgres://db1");

        let s1 = driver.schema_cache("postgres://db1", "app1");
        let s2 = driver.schema_cache("postgres://db1", "app2");
        assert!(!Arc::ptr_eq(&s1, &s2));
        assert!(Arc::ptr_eq(&s1, &driver.schema_cache("postgres://db1", "app1")));
    }

    #[tokio::test]
    async fn test_open_requires_app_name() {
        let driver = PgDriver::default();
        let err = driver
            .connect("", AccessModel::RoleBased, "postgres://db1", &StoreConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }
}
