//! Subscription service
//!
//! Consumes record change events of one application, finds the
//! subscriptions whose query matches each changed record and sends a
//! [`Notice`] for every match. Events are handled one at a time, in the
//! order received.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use recordb_core::config::StoreConfig;
use recordb_core::conn::{AccessModel, Conn, PUBLIC_DATABASE_ID};
use recordb_core::device::{Device, Subscription};
use recordb_core::driver::Driver;
use recordb_core::error::{Error, Result};
use recordb_core::record::{Record, RecordEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::notifier::{Notice, Notifier};

/// Bits of a sequence number holding the per-second counter
pub const SEQ_COUNTER_BITS: u32 = 28;

/// Sequence numbers of the form `unix_seconds << 28 | counter`.
///
/// The counter restarts at zero whenever the second changes.
#[derive(Debug, Default)]
pub struct SeqNumGenerator {
    state: Mutex<(i64, u64)>,
}

impl SeqNumGenerator {
    /// Fresh generator
    pub fn new() -> Self {
        Self::default()
    }

    /// Next number for the current time
    pub fn next(&self) -> u64 {
        self.next_at(chrono::Utc::now().timestamp())
    }

    /// Next number for `unix_seconds`
    pub fn next_at(&self, unix_seconds: i64) -> u64 {
        let mut state = self.state.lock();
        let (last, counter) = &mut *state;
        if unix_seconds > *last {
            *last = unix_seconds;
            *counter = 0;
        } else {
            *counter += 1;
        }
        ((*last as u64) << SEQ_COUNTER_BITS) | *counter
    }
}

/// What the service needs from an open store connection
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Subscriptions of the record's database matching the record
    async fn matching_subscriptions(&self, record: &Record) -> Result<Vec<Subscription>>;

    /// Device by id
    async fn device(&self, id: &str) -> Result<Device>;

    /// Release the connection
    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl SubscriptionStore for Box<dyn Conn> {
    async fn matching_subscriptions(&self, record: &Record) -> Result<Vec<Subscription>> {
        let db = if record.database_id == PUBLIC_DATABASE_ID {
            self.public_db()
        } else {
            self.private_db(&record.database_id)
        };
        db.get_matching_subscriptions(record).await
    }

    async fn device(&self, id: &str) -> Result<Device> {
        self.get_device(id).await
    }

    async fn close(&self) -> Result<()> {
        Conn::close(self.as_ref()).await
    }
}

/// Opens store connections for the service
#[async_trait]
pub trait ConnOpener: Send + Sync {
    /// A connection for handling one event
    async fn open(&self) -> Result<Box<dyn SubscriptionStore>>;

    /// Route the application's record changes to `events`
    async fn subscribe(&self, events: mpsc::Sender<RecordEvent>) -> Result<()>;
}

/// [`ConnOpener`] backed by a store driver
pub struct DriverOpener {
    driver: Arc<dyn Driver>,
    app_name: String,
    option: String,
    config: StoreConfig,
}

impl DriverOpener {
    /// Open connections for `app_name` through `driver`
    pub fn new(
        driver: Arc<dyn Driver>,
        app_name: impl Into<String>,
        option: impl Into<String>,
        config: StoreConfig,
    ) -> Self {
        Self {
            driver,
            app_name: app_name.into(),
            option: option.into(),
            config,
        }
    }

    async fn conn(&self) -> Result<Box<dyn Conn>> {
        self.driver
            .open(&self.app_name, AccessModel::RoleBased, &self.option, &self.config)
            .await
    }
}

impl fmt::Debug for DriverOpener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverOpener")
            .field("app_name", &self.app_name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ConnOpener for DriverOpener {
    async fn open(&self) -> Result<Box<dyn SubscriptionStore>> {
        Ok(Box::new(self.conn().await?))
    }

    async fn subscribe(&self, events: mpsc::Sender<RecordEvent>) -> Result<()> {
        let conn = self.conn().await?;
        let result = conn.subscribe(events).await;
        if let Err(e) = Conn::close(conn.as_ref()).await {
            warn!(app = %self.app_name, error = %e, "Failed to close subscribing connection");
        }
        result
    }
}

/// Service settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionServiceConfig {
    /// Application whose changes are watched
    pub app_name: String,
    /// Record events buffered before the listener waits
    pub buffer_size: usize,
}

impl Default for SubscriptionServiceConfig {
    fn default() -> Self {
        Self {
            app_name: String::new(),
            buffer_size: 100,
        }
    }
}

impl SubscriptionServiceConfig {
    /// Settings for `app_name`
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            ..Self::default()
        }
    }

    /// Set the event buffer size
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }
}

/// Lifecycle of a [`SubscriptionService`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Not started
    Idle,
    /// Handling events
    Running,
    /// Stopped; cannot be restarted
    Stopped,
}

struct Worker {
    app_name: String,
    opener: Arc<dyn ConnOpener>,
    notifier: Arc<dyn Notifier>,
    seq: SeqNumGenerator,
}

impl Worker {
    async fn run(self, mut events: mpsc::Receiver<RecordEvent>, mut stop: watch::Receiver<bool>) {
        info!(app = %self.app_name, "Subscription service running");
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => {
                        warn!(app = %self.app_name, "Record event source closed");
                        break;
                    }
                },
            }
        }
        info!(app = %self.app_name, "Subscription service stopped");
    }

    async fn handle(&self, event: RecordEvent) {
        let seq_num = self.seq.next();
        let store = match self.opener.open().await {
            Ok(store) => store,
            Err(e) => {
                error!(app = %self.app_name, error = %e, "Failed to open connection for record event");
                return;
            }
        };
        if let Err(e) = self.notify_matches(store.as_ref(), seq_num, event).await {
            error!(app = %self.app_name, seq_num, error = %e, "Failed to match subscriptions");
        }
        if let Err(e) = store.close().await {
            warn!(app = %self.app_name, error = %e, "Failed to close connection");
        }
    }

    async fn notify_matches(
        &self,
        store: &dyn SubscriptionStore,
        seq_num: u64,
        event: RecordEvent,
    ) -> Result<()> {
        let subscriptions = store.matching_subscriptions(&event.record).await?;
        debug!(
            app = %self.app_name,
            record_id = %event.record.id,
            seq_num,
            matched = subscriptions.len(),
            "Record event"
        );

        let RecordEvent { record, event } = event;
        let mut notice = Notice {
            seq_num,
            subscription_id: String::new(),
            event,
            record,
        };
        for subscription in subscriptions {
            let device = match store.device(&subscription.device_id).await {
                Ok(device) => device,
                Err(e) => {
                    warn!(
                        subscription_id = %subscription.id,
                        device_id = %subscription.device_id,
                        error = %e,
                        "Skipping subscription with unknown device"
                    );
                    continue;
                }
            };
            notice.subscription_id = subscription.id;
            if let Err(e) = self.notifier.notify(&device, &notice).await {
                warn!(
                    subscription_id = %notice.subscription_id,
                    device_id = %device.id,
                    error = %e,
                    "Failed to notify device"
                );
            }
        }
        Ok(())
    }
}

/// Watches one application's record changes and notifies subscribers
pub struct SubscriptionService {
    config: SubscriptionServiceConfig,
    opener: Arc<dyn ConnOpener>,
    notifier: Arc<dyn Notifier>,
    state: Mutex<ServiceState>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for SubscriptionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionService")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl SubscriptionService {
    /// Idle service
    pub fn new(
        config: SubscriptionServiceConfig,
        opener: Arc<dyn ConnOpener>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            config,
            opener,
            notifier,
            state: Mutex::new(ServiceState::Idle),
            stop,
            task: Mutex::new(None),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    /// Subscribe to record changes and start handling them
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != ServiceState::Idle {
                return Err(Error::internal(format!(
                    "subscription service cannot start from {:?}",
                    *state
                )));
            }
            *state = ServiceState::Running;
        }

        let (tx, rx) = mpsc::channel(self.config.buffer_size.max(1));
        if let Err(e) = self.opener.subscribe(tx).await {
            *self.state.lock() = ServiceState::Idle;
            return Err(e);
        }

        let worker = Worker {
            app_name: self.config.app_name.clone(),
            opener: Arc::clone(&self.opener),
            notifier: Arc::clone(&self.notifier),
            seq: SeqNumGenerator::new(),
        };
        let handle = tokio::spawn(worker.run(rx, self.stop.subscribe()));
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Stop after the event in hand, if any, is handled
    pub async fn stop(&self) {
        *self.state.lock() = ServiceState::Stopped;
        let _ = self.stop.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(app = %self.config.app_name, error = %e, "Subscription service task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_num_within_one_second() {
        let seq = SeqNumGenerator::new();
        let first = seq.next_at(1_700_000_000);
        let second = seq.next_at(1_700_000_000);
        assert_eq!(second, first + 1);
        assert_eq!(first, 1_700_000_000u64 << SEQ_COUNTER_BITS);
    }

    #[test]
    fn test_seq_num_resets_counter_on_new_second() {
        let seq = SeqNumGenerator::new();
        seq.next_at(100);
        seq.next_at(100);
        let next = seq.next_at(101);
        assert_eq!(next & ((1 << SEQ_COUNTER_BITS) - 1), 0);
        assert_eq!(next >> SEQ_COUNTER_BITS, 101);
    }

    #[test]
    fn test_seq_num_never_goes_back() {
        let seq = SeqNumGenerator::new();
        let a = seq.next_at(200);
        let b = seq.next_at(199);
        assert!(b > a);
    }

    #[test]
    fn test_config_defaults() {
        let config = SubscriptionServiceConfig::new("demo");
        assert_eq!(config.app_name, "demo");
        assert_eq!(config.buffer_size, 100);
    }
}
