//! Test harness for PostgreSQL driver integration tests
//!
//! Starts one PostGIS container per test binary. Tests isolate themselves
//! by opening connections for a freshly named application, which gets
//! its own schema.

use anyhow::{Context, Result};
use std::sync::{Arc, Once};
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::time::sleep;
use tokio_postgres::NoTls;
use tracing::{debug, info};

use recordb_pq::prelude::*;

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("recordb_pq=debug".parse().unwrap())
                    .add_directive("testcontainers=info".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// PostGIS container
pub struct PostgisContainer {
    #[allow(dead_code)]
    container: ContainerAsync<Postgres>,
    pub url: String,
}

impl PostgisContainer {
    pub async fn start() -> Result<Self> {
        info!("Starting PostGIS testcontainer");
        let container = Postgres::default()
            .with_name("postgis/postgis")
            .with_tag("16-3.4")
            .start()
            .await
            .context("Failed to start PostGIS container")?;

        let host = container.get_host().await?.to_string();
        let port = container.get_host_port_ipv4(5432).await?;
        let url = format!(
            "host={} port={} user=postgres password=postgres dbname=postgres",
            host, port
        );
        let instance = Self { container, url };
        instance.wait_for_ready().await?;
        Ok(instance)
    }

    async fn wait_for_ready(&self) -> Result<()> {
        for attempt in 1..=60 {
            match tokio_postgres::connect(&self.url, NoTls).await {
                Ok((client, connection)) => {
                    tokio::spawn(connection);
                    client
                        .batch_execute("CREATE EXTENSION IF NOT EXISTS postgis")
                        .await
                        .context("Failed to enable PostGIS")?;
                    debug!("PostGIS ready after {} attempts", attempt);
                    return Ok(());
                }
                Err(e) => {
                    if attempt % 10 == 0 {
                        info!("Waiting for PostGIS (attempt {}/60): {}", attempt, e);
                    }
                    sleep(Duration::from_millis(1000)).await;
                }
            }
        }
        anyhow::bail!("PostGIS did not become ready in time")
    }
}

/// Shared container for the test binary
pub async fn shared_postgis() -> Arc<PostgisContainer> {
    static CONTAINER: tokio::sync::OnceCell<Arc<PostgisContainer>> =
        tokio::sync::OnceCell::const_new();

    CONTAINER
        .get_or_init(|| async {
            init_test_logging();
            Arc::new(
                PostgisContainer::start()
                    .await
                    .expect("Failed to start PostGIS container"),
            )
        })
        .await
        .clone()
}

/// A driver plus a connection to a fresh application
pub struct TestApp {
    pub driver: PgDriver,
    pub conn: PgConn,
    pub app_name: String,
    pub url: String,
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        let pg = shared_postgis().await;
        let app_name = format!("test_{}", uuid::Uuid::new_v4().simple());
        let driver = PgDriver::default();
        let conn = driver
            .connect(&app_name, AccessModel::RoleBased, &pg.url, &StoreConfig::default())
            .await?;
        Ok(Self {
            driver,
            conn,
            app_name,
            url: pg.url.clone(),
        })
    }

    /// A plain client outside the driver, for staging rows by hand
    pub async fn raw_client(&self) -> Result<tokio_postgres::Client> {
        let (client, connection) = tokio_postgres::connect(&self.url, NoTls).await?;
        tokio::spawn(connection);
        Ok(client)
    }

    /// Another connection to the same application
    pub async fn reconnect(&self) -> Result<PgConn> {
        Ok(self
            .driver
            .connect(&self.app_name, AccessModel::RoleBased, &self.url, &StoreConfig::default())
            .await?)
    }
}

/// Schema of the `note` record type used across tests
pub fn note_schema() -> RecordSchema {
    RecordSchema::new()
        .with_field("title", FieldType::new(DataType::String))
        .with_field("order", FieldType::new(DataType::Number))
        .with_field("category", FieldType::new(DataType::String))
}

/// A `note` owned by alice
pub fn note(key: &str, title: &str, order: f64) -> Record {
    Record::new(RecordId::new("note", key))
        .with_owner("alice")
        .with_field("title", title)
        .with_field("order", order)
        .with_field("category", "work")
}
