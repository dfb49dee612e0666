//! Connection handle and database scopes
//!
//! A [`PgConn`] wraps one pooled client for one application. It hands out
//! [`PgDatabase`] handles for the public, private and union scopes, all
//! sharing the client and the application's schema cache.

use std::sync::Arc;

use async_trait::async_trait;
use recordb_core::config::StoreConfig;
use recordb_core::conn::{AccessModel, Conn, Database, DatabaseType, PUBLIC_DATABASE_ID};
use recordb_core::error::{Error, Result};
use recordb_core::record::RecordEvent;
use tokio::sync::mpsc;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Row, RowStream};
use tracing::{debug, warn};

use crate::builder::{table_name, Statement};
use crate::error::from_pg;
use crate::listener::ChangeListener;
use crate::pool::PooledClient;
use crate::recorddb::PgDatabase;
use crate::schema::SchemaCache;

/// Prefix of application schemas
pub const APP_SCHEMA_PREFIX: &str = "app_";

/// PostgreSQL schema holding the tables of `app_name`
pub fn schema_name(app_name: &str) -> String {
    let normalized: String = app_name
        .to_lowercase()
        .chars()
        .map(|c| if c == '.' || c == ':' { '_' } else { c })
        .collect();
    format!("{}{}", APP_SCHEMA_PREFIX, normalized)
}

/// State shared by a connection and its database handles
pub(crate) struct ConnInner {
    pub(crate) client: PooledClient,
    pub(crate) app_name: String,
    pub(crate) access_model: AccessModel,
    pub(crate) schema_name: String,
    pub(crate) config: StoreConfig,
    pub(crate) schemas: Arc<SchemaCache>,
    pub(crate) listener: Arc<ChangeListener>,
}

impl std::fmt::Debug for ConnInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnInner")
            .field("app_name", &self.app_name)
            .field("schema_name", &self.schema_name)
            .field("access_model", &self.access_model)
            .field("client", &self.client)
            .finish()
    }
}

fn param_refs(stmt: &Statement) -> Vec<&(dyn ToSql + Sync)> {
    stmt.args.iter().map(|a| a as &(dyn ToSql + Sync)).collect()
}

impl ConnInner {
    /// Quoted, schema-qualified table name
    pub(crate) fn table(&self, table: &str) -> String {
        table_name(&self.schema_name, table)
    }

    pub(crate) async fn query(&self, stmt: &Statement) -> Result<Vec<Row>> {
        debug!(app = %self.app_name, sql = %stmt.sql, "query");
        self.client
            .query(stmt.sql.as_str(), &param_refs(stmt))
            .await
            .map_err(|e| from_pg(e, &stmt.sql))
    }

    pub(crate) async fn query_opt(&self, stmt: &Statement) -> Result<Option<Row>> {
        debug!(app = %self.app_name, sql = %stmt.sql, "query");
        self.client
            .query_opt(stmt.sql.as_str(), &param_refs(stmt))
            .await
            .map_err(|e| from_pg(e, &stmt.sql))
    }

    pub(crate) async fn execute(&self, stmt: &Statement) -> Result<u64> {
        debug!(app = %self.app_name, sql = %stmt.sql, "execute");
        self.client
            .execute(stmt.sql.as_str(), &param_refs(stmt))
            .await
            .map_err(|e| from_pg(e, &stmt.sql))
    }

    pub(crate) async fn query_stream(&self, stmt: &Statement) -> Result<RowStream> {
        debug!(app = %self.app_name, sql = %stmt.sql, "query");
        self.client
            .query_raw(stmt.sql.as_str(), stmt.params())
            .await
            .map_err(|e| from_pg(e, &stmt.sql))
    }

    /// Query with literal `$n` parameters, for catalog lookups
    pub(crate) async fn query_plain(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>> {
        debug!(app = %self.app_name, sql = %sql, "query");
        self.client
            .query(sql, params)
            .await
            .map_err(|e| from_pg(e, sql))
    }

    pub(crate) async fn query_opt_plain(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>> {
        debug!(app = %self.app_name, sql = %sql, "query");
        self.client
            .query_opt(sql, params)
            .await
            .map_err(|e| from_pg(e, sql))
    }

    pub(crate) async fn execute_plain(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64> {
        debug!(app = %self.app_name, sql = %sql, "execute");
        self.client
            .execute(sql, params)
            .await
            .map_err(|e| from_pg(e, sql))
    }

    /// Run statements without parameters
    pub(crate) async fn batch(&self, sql: &str) -> Result<()> {
        debug!(app = %self.app_name, sql = %sql, "batch");
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| from_pg(e, sql))
    }

    pub(crate) async fn begin_tx(&self) -> Result<()> {
        if self.client.in_transaction() {
            return Err(Error::TxDidBegin);
        }
        self.batch("BEGIN").await?;
        self.client.set_in_transaction(true);
        Ok(())
    }

    pub(crate) async fn commit_tx(&self) -> Result<()> {
        if !self.client.in_transaction() {
            return Err(Error::TxDidNotBegin);
        }
        let result = self.batch("COMMIT").await;
        self.client.set_in_transaction(false);
        result
    }

    pub(crate) async fn rollback_tx(&self) -> Result<()> {
        if !self.client.in_transaction() {
            return Err(Error::TxDidNotBegin);
        }
        let result = self.batch("ROLLBACK").await;
        self.client.set_in_transaction(false);
        self.schemas.clear();
        result
    }

    /// Run `f` in a transaction unless one is already open
    pub(crate) async fn within_tx<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if self.client.in_transaction() {
            return f().await;
        }
        self.begin_tx().await?;
        match f().await {
            Ok(value) => {
                self.commit_tx().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.rollback_tx().await {
                    warn!(app = %self.app_name, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}

/// A connection to one application's store
#[derive(Debug, Clone)]
pub struct PgConn {
    pub(crate) inner: Arc<ConnInner>,
}

impl PgConn {
    pub(crate) fn new(
        client: PooledClient,
        app_name: &str,
        access_model: AccessModel,
        config: StoreConfig,
        schemas: Arc<SchemaCache>,
        listener: Arc<ChangeListener>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnInner {
                client,
                app_name: app_name.to_string(),
                access_model,
                schema_name: schema_name(app_name),
                config,
                schemas,
                listener,
            }),
        }
    }

    /// PostgreSQL schema of the application
    pub fn schema_name(&self) -> &str {
        &self.inner.schema_name
    }

    /// Options the connection was opened with
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Whether a transaction is open on this connection
    pub fn in_transaction(&self) -> bool {
        self.inner.client.in_transaction()
    }

    fn database(&self, database_type: DatabaseType, database_id: &str) -> Arc<dyn Database> {
        Arc::new(PgDatabase::new(
            Arc::clone(&self.inner),
            database_type,
            database_id,
        ))
    }
}

#[async_trait]
impl Conn for PgConn {
    fn app_name(&self) -> &str {
        &self.inner.app_name
    }

    fn access_model(&self) -> AccessModel {
        self.inner.access_model
    }

    async fn begin(&self) -> Result<()> {
        self.inner.begin_tx().await
    }

    async fn commit(&self) -> Result<()> {
        self.inner.commit_tx().await
    }

    async fn rollback(&self) -> Result<()> {
        self.inner.rollback_tx().await
    }

    fn public_db(&self) -> Arc<dyn Database> {
        self.database(DatabaseType::Public, PUBLIC_DATABASE_ID)
    }

    fn private_db(&self, user_key: &str) -> Arc<dyn Database> {
        self.database(DatabaseType::Private, user_key)
    }

    fn union_db(&self) -> Arc<dyn Database> {
        self.database(DatabaseType::Union, "")
    }

    async fn subscribe(&self, events: mpsc::Sender<RecordEvent>) -> Result<()> {
        let app = self
            .inner
            .schema_name
            .strip_prefix(APP_SCHEMA_PREFIX)
            .unwrap_or(&self.inner.schema_name);
        self.inner.listener.subscribe(app, events)
    }

    async fn close(&self) -> Result<()> {
        if self.inner.client.in_transaction() {
            self.inner.rollback_tx().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_name() {
        assert_eq!(schema_name("MyApp"), "app_myapp");
        assert_eq!(schema_name("io.example:app"), "app_io_example_app");
    }
}
