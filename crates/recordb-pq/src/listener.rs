//! Record change listener
//!
//! Every record table carries a trigger that writes the changed row to
//! `public.pending_notification` and notifies the row id on the
//! `record_change` channel. The listener holds a dedicated connection
//! that `LISTEN`s on the channel, locks each pending row, fans the
//! decoded [`RecordEvent`] out to the subscribers of the row's
//! application and only then deletes the row. A row that cannot be
//! decoded stays staged.
//!
//! Delivery is at most once: a notification that arrives while the
//! listener is reconnecting, or whose row is locked by another
//! listener, is not delivered here.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use recordb_core::error::{Error, Result};
use recordb_core::record::{Record, RecordEvent, RecordHookEvent, RecordId};
use recordb_core::value::Value;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, Client, NoTls, Transaction};
use tracing::{debug, error, info, warn};

use crate::connection::APP_SCHEMA_PREFIX;
use crate::error::{connect_error, from_pg};
use crate::init::RECORD_CHANGE_CHANNEL;

/// Listener settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Notification channel
    pub channel: String,
    /// Interval between keep-alive queries
    #[serde(with = "crate::pool::duration_ms")]
    pub ping_interval: Duration,
    /// First delay before reconnecting
    #[serde(with = "crate::pool::duration_ms")]
    pub reconnect_backoff: Duration,
    /// Upper bound of the reconnect delay
    #[serde(with = "crate::pool::duration_ms")]
    pub max_reconnect_backoff: Duration,
    /// Notifications buffered between the connection and the dispatcher
    pub buffer_size: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            channel: RECORD_CHANGE_CHANNEL.to_string(),
            ping_interval: Duration::from_secs(90),
            reconnect_backoff: Duration::from_millis(500),
            max_reconnect_backoff: Duration::from_secs(30),
            buffer_size: 1000,
        }
    }
}

impl ListenerConfig {
    /// Default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the notification channel
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Set the keep-alive interval
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the first reconnect delay
    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Set the notification buffer size
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Delay before reconnect attempt `attempt` (0-based), doubling up to the cap
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.reconnect_backoff
            .saturating_mul(factor)
            .min(self.max_reconnect_backoff)
    }
}

/// A staged `pending_notification` row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePayload {
    /// `INSERT`, `UPDATE` or `DELETE`
    pub op: String,
    /// Schema of the changed table
    pub appname: String,
    /// Table name, i.e. the record type
    pub recordtype: String,
    /// The row as JSON
    pub record: serde_json::Value,
}

fn hook_event(op: &str) -> Result<RecordHookEvent> {
    match op {
        "INSERT" => Ok(RecordHookEvent::Created),
        "UPDATE" => Ok(RecordHookEvent::Updated),
        "DELETE" => Ok(RecordHookEvent::Deleted),
        other => Err(Error::invalid_argument(format!("unknown change operation {:?}", other))),
    }
}

fn required_str<'a>(row: &'a serde_json::Map<String, serde_json::Value>, key: &str) -> Result<&'a str> {
    row.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::invalid_argument(format!("changed row has no {}", key)))
}

/// `row_to_json` timestamps carry no zone; they are stored as UTC
fn row_timestamp(value: &serde_json::Value) -> Option<Value> {
    let text = value.as_str()?;
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|dt| Value::DateTime(dt.and_utc()))
}

impl ChangePayload {
    /// Application name, without the schema prefix
    pub fn app_name(&self) -> Result<&str> {
        self.appname.strip_prefix(APP_SCHEMA_PREFIX).ok_or_else(|| {
            Error::invalid_argument(format!(
                "schema {} is not an application schema",
                self.appname
            ))
        })
    }

    /// Decode into the application name and the event
    pub fn into_event(self) -> Result<(String, RecordEvent)> {
        let app = self.app_name()?.to_string();
        let event = hook_event(&self.op)?;
        let row = self
            .record
            .as_object()
            .ok_or_else(|| Error::invalid_argument("changed row is not an object"))?;

        let id = RecordId::new(self.recordtype.as_str(), required_str(row, "_id")?);
        let mut record = Record::new(id).with_owner(required_str(row, "_owner_id")?);

        for (key, value) in row {
            match key.as_str() {
                "_id" | "_owner_id" => {}
                "_database_id" | "_created_by" | "_updated_by" => {
                    if let Some(s) = value.as_str() {
                        record.set(key, Value::String(s.to_string()))?;
                    }
                }
                "_created_at" | "_updated_at" => {
                    if let Some(ts) = row_timestamp(value) {
                        record.set(key, ts)?;
                    }
                }
                "_access" if value.is_null() => {}
                "_access" => record.set(key, Value::Json(value.clone()))?,
                k if k.starts_with('_') => {}
                _ if value.is_null() => {}
                _ => record.set(key, Value::from_json(value.clone()))?,
            }
        }

        Ok((app, RecordEvent { record, event }))
    }
}

type Subscribers = DashMap<String, Vec<mpsc::Sender<RecordEvent>>>;

/// Listens for record changes of every application on one database
pub struct ChangeListener {
    url: String,
    config: ListenerConfig,
    subscribers: Arc<Subscribers>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for ChangeListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeListener")
            .field("url", &crate::pool::redact(&self.url))
            .field("config", &self.config)
            .field("apps", &self.subscribers.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl ChangeListener {
    /// Listener for the database at `url`; nothing runs until the first subscribe
    pub fn new(url: impl Into<String>, config: ListenerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            url: url.into(),
            config,
            subscribers: Arc::new(DashMap::new()),
            task: Mutex::new(None),
            shutdown,
        }
    }

    /// Settings
    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Whether the listening task is alive
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Deliver changes of `app` to `events`, starting the listener if needed
    pub fn subscribe(&self, app: &str, events: mpsc::Sender<RecordEvent>) -> Result<()> {
        if *self.shutdown.borrow() {
            return Err(Error::connection("change listener has been shut down"));
        }
        self.subscribers
            .entry(app.to_string())
            .or_default()
            .push(events);
        debug!(app = %app, "Subscribed to record changes");

        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::internal(format!("change listener needs a runtime: {}", e)))?;
        let worker = ListenWorker {
            url: self.url.clone(),
            config: self.config.clone(),
            subscribers: Arc::clone(&self.subscribers),
            shutdown: self.shutdown.subscribe(),
        };
        *task = Some(handle.spawn(worker.run()));
        info!(channel = %self.config.channel, "Started change listener");
        Ok(())
    }

    /// Stop listening and wait for the task to end
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Change listener task ended abnormally");
            }
        }
        self.subscribers.clear();
        info!("Change listener stopped");
    }
}

/// State owned by the listening task
struct ListenWorker {
    url: String,
    config: ListenerConfig,
    subscribers: Arc<Subscribers>,
    shutdown: watch::Receiver<bool>,
}

enum SessionEnd {
    Shutdown,
    Lost,
}

impl ListenWorker {
    async fn run(mut self) {
        let mut attempt = 0u32;
        loop {
            if *self.shutdown.borrow() {
                return;
            }
            match self.session().await {
                Ok(SessionEnd::Shutdown) => return,
                Ok(SessionEnd::Lost) => {
                    warn!(channel = %self.config.channel, "Change listener connection lost");
                    attempt = 0;
                }
                Err(e) => {
                    error!(channel = %self.config.channel, error = %e, "Change listener failed");
                }
            }

            let delay = self.config.backoff_for_attempt(attempt);
            attempt = attempt.saturating_add(1);
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting change listener");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => return,
            }
        }
    }

    /// One connection's lifetime
    async fn session(&mut self) -> Result<SessionEnd> {
        let (mut client, mut connection) = tokio_postgres::connect(&self.url, NoTls)
            .await
            .map_err(connect_error)?;

        let (tx, mut notifications) = mpsc::channel(self.config.buffer_size.max(1));
        let pump = tokio::spawn(async move {
            let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(n)) => {
                        if tx.send(n.payload().to_string()).await.is_err() {
                            break;
                        }
                    }
                    Ok(AsyncMessage::Notice(notice)) => {
                        debug!(notice = %notice.message(), "Server notice");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Change listener connection error");
                        break;
                    }
                }
            }
        });

        let listen = format!("LISTEN {}", crate::builder::quote_ident(&self.config.channel));
        client
            .batch_execute(&listen)
            .await
            .map_err(|e| from_pg(e, &listen))?;
        info!(channel = %self.config.channel, "Listening for record changes");

        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.tick().await;

        let end = loop {
            tokio::select! {
                _ = self.shutdown.changed() => break SessionEnd::Shutdown,
                _ = ping.tick() => {
                    if let Err(e) = client.simple_query("SELECT 1").await {
                        warn!(error = %e, "Change listener ping failed");
                        break SessionEnd::Lost;
                    }
                }
                payload = notifications.recv() => match payload {
                    Some(payload) => self.handle(&mut client, &payload).await,
                    None => break SessionEnd::Lost,
                },
            }
        };
        pump.abort();
        Ok(end)
    }

    async fn handle(&self, client: &mut Client, payload: &str) {
        let id: i32 = match payload.trim().parse() {
            Ok(id) => id,
            Err(_) => {
                warn!(payload = %payload, "Ignoring malformed change notification");
                return;
            }
        };

        match self.deliver(client, id).await {
            Ok(true) => {}
            Ok(false) => debug!(id, "Pending notification gone or locked elsewhere"),
            Err(e) => warn!(id, error = %e, "Record change left pending"),
        }
    }

    /// Hand the staged row `id` to subscribers, then delete it.
    ///
    /// Returns `false` when the row no longer exists or another listener
    /// holds it. On error the transaction rolls back and the row stays.
    async fn deliver(&self, client: &mut Client, id: i32) -> Result<bool> {
        let tx = client
            .transaction()
            .await
            .map_err(|e| from_pg(e, "BEGIN"))?;
        let Some(change) = fetch_pending(&tx, id).await? else {
            return Ok(false);
        };
        let (app, event) = change.into_event()?;
        self.dispatch(&app, event);

        tx.execute(DELETE_PENDING_SQL, &[&id])
            .await
            .map_err(|e| from_pg(e, DELETE_PENDING_SQL))?;
        tx.commit().await.map_err(|e| from_pg(e, "COMMIT"))?;
        Ok(true)
    }

    fn dispatch(&self, app: &str, event: RecordEvent) {
        let Some(mut senders) = self.subscribers.get_mut(app) else {
            return;
        };
        senders.retain(|s| !s.is_closed());
        debug!(app = %app, record_id = %event.record.id, subscribers = senders.len(), "Dispatching record change");
        for sender in senders.iter() {
            let sender = sender.clone();
            let event = event.clone();
            tokio::spawn(async move {
                if sender.send(event).await.is_err() {
                    debug!("Record change subscriber went away");
                }
            });
        }
    }
}

const SELECT_PENDING_SQL: &str = "SELECT op, appname, recordtype, record \
                                  FROM public.pending_notification WHERE id = $1 \
                                  FOR UPDATE SKIP LOCKED";

const DELETE_PENDING_SQL: &str = "DELETE FROM public.pending_notification WHERE id = $1";

/// Lock and read a pending notification row
async fn fetch_pending(tx: &Transaction<'_>, id: i32) -> Result<Option<ChangePayload>> {
    let Some(row) = tx
        .query_opt(SELECT_PENDING_SQL, &[&id])
        .await
        .map_err(|e| from_pg(e, SELECT_PENDING_SQL))?
    else {
        return Ok(None);
    };
    let get = |idx: usize| -> Result<String> {
        row.try_get(idx)
            .map_err(|e| Error::serialization(e.to_string()))
    };
    Ok(Some(ChangePayload {
        op: get(0)?,
        appname: get(1)?,
        recordtype: get(2)?,
        record: row
            .try_get(3)
            .map_err(|e| Error::serialization(e.to_string()))?,
    }))
}
