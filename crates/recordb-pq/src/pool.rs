//! Client pool
//!
//! One pool per connection string, owned by the driver. A [`PooledClient`]
//! is held by a connection handle for its whole lifetime and goes back to
//! the pool on drop. A client dropped with a transaction still open is
//! rolled back before it is reused.
//!
//! Concurrency is bounded by a semaphore: a permit travels with the
//! client and is released when the client is returned or discarded.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use recordb_core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

use crate::error::connect_error;

/// Pool configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connection string, URL or `key=value` form
    pub url: String,
    /// Maximum clients open at once
    pub max_size: usize,
    /// Maximum wait for a free client
    #[serde(with = "duration_ms")]
    pub acquire_timeout: Duration,
    /// Maximum wait for a new connection
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Clients older than this are closed instead of reused
    #[serde(with = "duration_ms")]
    pub max_lifetime: Duration,
    /// Clients idle longer than this are closed instead of reused
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_lifetime: Duration::from_secs(1800),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl PoolConfig {
    /// Defaults for `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the maximum pool size
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set the acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the maximum client lifetime
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Set the idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("url", &redact(&self.url))
            .field("max_size", &self.max_size)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("max_lifetime", &self.max_lifetime)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

/// Connection string with its password masked
pub fn redact(conn_str: &str) -> String {
    if let Ok(mut url) = url::Url::parse(conn_str) {
        if url.password().is_some() {
            let _ = url.set_password(Some("***"));
        }
        return url.to_string();
    }
    conn_str
        .split_whitespace()
        .map(|pair| match pair.split_once('=') {
            Some((key, _)) if key.eq_ignore_ascii_case("password") => format!("{}=***", key),
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Clients connected
    pub connections_created: u64,
    /// Clients closed
    pub connections_closed: u64,
    /// Successful acquisitions
    pub acquisitions: u64,
    /// Acquisitions that timed out
    pub exhausted_count: u64,
    /// Total time spent waiting for a client, in milliseconds
    pub total_wait_time_ms: u64,
    /// Clients discarded because they were broken
    pub health_check_failures: u64,
}

#[derive(Debug, Default)]
struct AtomicPoolStats {
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    acquisitions: AtomicU64,
    exhausted_count: AtomicU64,
    total_wait_time_ms: AtomicU64,
    health_check_failures: AtomicU64,
}

impl AtomicPoolStats {
    fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_acquisition(&self, wait_time_ms: u64) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_ms
            .fetch_add(wait_time_ms, Ordering::Relaxed);
    }

    fn record_exhausted(&self) {
        self.exhausted_count.fetch_add(1, Ordering::Relaxed);
    }

    fn record_health_check_failure(&self) {
        self.health_check_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            exhausted_count: self.exhausted_count.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
        }
    }
}

struct IdleClient {
    client: Client,
    created_at: Instant,
    last_used: Instant,
}

/// Pool of `tokio_postgres` clients for one connection string
pub struct ClientPool {
    config: PoolConfig,
    idle: Mutex<Vec<IdleClient>>,
    semaphore: Arc<Semaphore>,
    total: AtomicUsize,
    stats: AtomicPoolStats,
    closed: AtomicBool,
}

impl fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientPool")
            .field("config", &self.config)
            .field("size", &self.size())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

/// Open a client and drive its connection on a background task
pub async fn connect(url: &str, timeout: Duration) -> Result<Client> {
    let (client, connection) = tokio::time::timeout(timeout, tokio_postgres::connect(url, NoTls))
        .await
        .map_err(|_| {
            Error::timeout(format!("connecting to {} timed out after {:?}", redact(url), timeout))
        })?
        .map_err(connect_error)?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(error = %e, "PostgreSQL connection closed with error");
        }
    });
    Ok(client)
}

impl ClientPool {
    /// Empty pool; clients are connected on demand
    pub fn new(config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.max_size.max(1))),
            idle: Mutex::new(Vec::with_capacity(config.max_size)),
            total: AtomicUsize::new(0),
            stats: AtomicPoolStats::default(),
            closed: AtomicBool::new(false),
            config,
        })
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Clients currently open, idle or in use
    pub fn size(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    /// Clients waiting in the pool
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    /// Borrow a client, connecting a new one when none is idle
    pub async fn get(self: &Arc<Self>) -> Result<PooledClient> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::connection("pool is shut down"));
        }
        let start = Instant::now();

        let permit = tokio::time::timeout(
            self.config.acquire_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| {
            self.stats.record_exhausted();
            Error::timeout(format!(
                "timeout waiting for a client ({}ms)",
                self.config.acquire_timeout.as_millis()
            ))
        })?
        .map_err(|_| Error::connection("pool semaphore closed"))?;

        let (client, created_at) = match self.take_idle() {
            Some(entry) => (entry.client, entry.created_at),
            None => {
                let client = connect(&self.config.url, self.config.connect_timeout).await?;
                self.total.fetch_add(1, Ordering::Release);
                self.stats.record_created();
                debug!(size = self.size(), "Opened pooled PostgreSQL client");
                (client, Instant::now())
            }
        };

        self.stats
            .record_acquisition(start.elapsed().as_millis() as u64);

        Ok(PooledClient {
            client: Some(client),
            created_at,
            in_transaction: AtomicBool::new(false),
            pool: Arc::clone(self),
            permit: Some(permit),
        })
    }

    fn take_idle(&self) -> Option<IdleClient> {
        let mut idle = self.idle.lock();
        while let Some(entry) = idle.pop() {
            if entry.client.is_closed() {
                self.discard();
                self.stats.record_health_check_failure();
                continue;
            }
            if entry.created_at.elapsed() > self.config.max_lifetime
                || entry.last_used.elapsed() > self.config.idle_timeout
            {
                self.discard();
                continue;
            }
            return Some(entry);
        }
        None
    }

    fn discard(&self) {
        self.total.fetch_sub(1, Ordering::Release);
        self.stats.record_closed();
    }

    fn put_back(&self, client: Client, created_at: Instant) {
        if self.closed.load(Ordering::Acquire) || client.is_closed() {
            self.discard();
            return;
        }
        self.idle.lock().push(IdleClient {
            client,
            created_at,
            last_used: Instant::now(),
        });
    }

    /// Close idle clients and refuse new acquisitions
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<_> = self.idle.lock().drain(..).collect();
        for _ in drained {
            self.discard();
        }
        self.semaphore.close();
    }
}

/// A client borrowed from a [`ClientPool`]
pub struct PooledClient {
    client: Option<Client>,
    created_at: Instant,
    in_transaction: AtomicBool,
    pool: Arc<ClientPool>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledClient {
    /// Whether `BEGIN` was issued without a matching end
    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::Acquire)
    }

    /// Record the transaction state of the session
    pub fn set_in_transaction(&self, open: bool) {
        self.in_transaction.store(open, Ordering::Release);
    }
}

impl fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledClient")
            .field("in_transaction", &self.in_transaction())
            .field("age", &self.created_at.elapsed())
            .finish()
    }
}

impl Deref for PooledClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        self.client.as_ref().expect("client already returned")
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        let Some(client) = self.client.take() else {
            return;
        };
        let permit = self.permit.take();
        let pool = Arc::clone(&self.pool);
        let created_at = self.created_at;

        if !self.in_transaction() {
            pool.put_back(client, created_at);
            drop(permit);
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match client.batch_execute("ROLLBACK").await {
                        Ok(()) => pool.put_back(client, created_at),
                        Err(e) => {
                            warn!(error = %e, "Failed to roll back abandoned transaction");
                            pool.discard();
                        }
                    }
                    drop(permit);
                });
            }
            Err(_) => {
                pool.discard();
                drop(permit);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::new("postgres://localhost/test")
            .with_max_size(20)
            .with_acquire_timeout(Duration::from_secs(5))
            .with_connect_timeout(Duration::from_secs(2));

        assert_eq!(config.max_size, 20);
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = PoolConfig::new("postgres://app:s3cret@db:5432/app");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("***"));

        let kv = redact("host=db user=app password=s3cret dbname=app");
        assert_eq!(kv, "host=db user=app password=*** dbname=app");
    }

    #[test]
    fn test_config_from_json() {
        let config: PoolConfig =
            serde_json::from_str(r#"{"url": "postgres://db/app", "acquire_timeout": 250}"#).unwrap();
        assert_eq!(config.acquire_timeout, Duration::from_millis(250));
        assert_eq!(config.max_size, 10);
    }

    #[tokio::test]
    async fn test_closed_pool_refuses() {
        let pool = ClientPool::new(PoolConfig::new("postgres://localhost/none"));
        pool.close();
        let err = pool.get().await.unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.stats(), PoolStats::default());
    }
}
