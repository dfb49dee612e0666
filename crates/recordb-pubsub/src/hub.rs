//! In-process topic hub
//!
//! A [`Hub`] is a handle to one dispatch task that owns the registry of
//! channels and their subscribers. Subscribing, unsubscribing and
//! broadcasting are commands queued to that task, so they take effect in
//! the order they were issued.
//!
//! A broadcast reaches each distinct subscriber of the channel once, no
//! matter how many times it subscribed. Every delivery runs on its own
//! task and waits at most [`HubConfig::timeout`] for room in the
//! subscriber's queue; with a zero timeout a full queue drops the parcel.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use recordb_core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Hub settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Longest wait for room in a subscriber's queue; zero drops instead of waiting
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
        }
    }
}

impl HubConfig {
    /// Default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delivery timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// A message on a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parcel {
    /// Channel name
    pub channel: String,
    /// Message body
    pub data: serde_json::Value,
}

impl Parcel {
    /// Parcel for `channel`
    pub fn new(channel: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            channel: channel.into(),
            data,
        }
    }
}

/// One receiving endpoint, e.g. a websocket connection.
///
/// Made by [`Hub::subscriber`]. Clones share the identity; the hub
/// deduplicates by it. Ids are unique within the hub that made them.
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: u64,
    sender: mpsc::Sender<Parcel>,
}

impl Subscriber {
    /// Identity of the endpoint
    pub fn id(&self) -> u64 {
        self.id
    }
}

enum Command {
    Subscribe(String, Subscriber),
    Unsubscribe(String, u64),
    UnsubscribeAll(u64),
    Broadcast(Parcel),
    Count(String, oneshot::Sender<usize>),
    Close,
}

/// Handle to a running hub; clones share the hub
#[derive(Debug, Clone)]
pub struct Hub {
    commands: mpsc::UnboundedSender<Command>,
    config: HubConfig,
    next_id: Arc<AtomicU64>,
}

impl Hub {
    /// Spawn the dispatch task on the current runtime
    pub fn start(config: HubConfig) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(receiver, config));
        info!(timeout_ms = config.timeout.as_millis() as u64, "Started pubsub hub");
        Self {
            commands,
            config,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Settings
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// New endpoint of this hub with room for `buffer` parcels
    pub fn subscriber(&self, buffer: usize) -> (Subscriber, mpsc::Receiver<Parcel>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        (Subscriber { id, sender }, receiver)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::internal("pubsub hub is closed"))
    }

    /// Deliver broadcasts on `channel` to `subscriber`
    pub fn subscribe(&self, channel: impl Into<String>, subscriber: &Subscriber) -> Result<()> {
        self.send(Command::Subscribe(channel.into(), subscriber.clone()))
    }

    /// Stop delivering `channel` to `subscriber`
    pub fn unsubscribe(&self, channel: impl Into<String>, subscriber: &Subscriber) -> Result<()> {
        self.send(Command::Unsubscribe(channel.into(), subscriber.id))
    }

    /// Remove `subscriber` from every channel
    pub fn unsubscribe_all(&self, subscriber: &Subscriber) -> Result<()> {
        self.send(Command::UnsubscribeAll(subscriber.id))
    }

    /// Queue `parcel` for every subscriber of its channel
    pub fn broadcast(&self, parcel: Parcel) -> Result<()> {
        self.send(Command::Broadcast(parcel))
    }

    /// Distinct subscribers of `channel`
    pub async fn subscriber_count(&self, channel: impl Into<String>) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Count(channel.into(), tx))?;
        rx.await
            .map_err(|_| Error::internal("pubsub hub is closed"))
    }

    /// Stop the dispatch task; later commands fail
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

async fn dispatch(mut commands: mpsc::UnboundedReceiver<Command>, config: HubConfig) {
    let mut channels: HashMap<String, Vec<Subscriber>> = HashMap::new();

    while let Some(command) = commands.recv().await {
        match command {
            Command::Subscribe(channel, subscriber) => {
                debug!(channel = %channel, subscriber = subscriber.id, "Subscribe");
                channels.entry(channel).or_default().push(subscriber);
            }
            Command::Unsubscribe(channel, id) => {
                if let Some(subscribers) = channels.get_mut(&channel) {
                    subscribers.retain(|s| s.id != id);
                    if subscribers.is_empty() {
                        channels.remove(&channel);
                    }
                }
            }
            Command::UnsubscribeAll(id) => {
                channels.retain(|_, subscribers| {
                    subscribers.retain(|s| s.id != id);
                    !subscribers.is_empty()
                });
            }
            Command::Broadcast(parcel) => {
                let Some(subscribers) = channels.get_mut(&parcel.channel) else {
                    debug!(channel = %parcel.channel, "Broadcast to channel without subscribers");
                    continue;
                };
                subscribers.retain(|s| !s.sender.is_closed());
                let parcel = Arc::new(parcel);
                let mut seen = HashSet::new();
                for subscriber in subscribers.iter().filter(|s| seen.insert(s.id)) {
                    tokio::spawn(deliver(
                        subscriber.clone(),
                        Arc::clone(&parcel),
                        config.timeout,
                    ));
                }
            }
            Command::Count(channel, reply) => {
                let count = channels
                    .get(&channel)
                    .map(|subscribers| {
                        subscribers.iter().map(|s| s.id).collect::<HashSet<_>>().len()
                    })
                    .unwrap_or(0);
                let _ = reply.send(count);
            }
            Command::Close => break,
        }
    }
    info!("Pubsub hub stopped");
}

async fn deliver(subscriber: Subscriber, parcel: Arc<Parcel>, timeout: Duration) {
    let parcel = Parcel::clone(&parcel);
    if timeout.is_zero() {
        if subscriber.sender.try_send(parcel).is_err() {
            debug!(subscriber = subscriber.id, "Subscriber not ready, parcel dropped");
        }
        return;
    }
    match tokio::time::timeout(timeout, subscriber.sender.send(parcel)).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => debug!(subscriber = subscriber.id, "Subscriber went away"),
        Err(_) => warn!(
            subscriber = subscriber.id,
            timeout_ms = timeout.as_millis() as u64,
            "Delivery timed out, parcel dropped"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_duplicate_subscription_delivers_once() {
        let hub = Hub::start(HubConfig::default());
        let (subscriber, mut rx) = hub.subscriber(8);
        hub.subscribe("c", &subscriber).unwrap();
        hub.subscribe("c", &subscriber).unwrap();
        assert_eq!(hub.subscriber_count("c").await.unwrap(), 1);

        hub.broadcast(Parcel::new("c", json!(1))).unwrap();
        let parcel = rx.recv().await.unwrap();
        assert_eq!(parcel.data, json!(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let hub = Hub::start(HubConfig::default());
        let (subscriber, mut rx) = hub.subscriber(8);
        hub.subscribe("c", &subscriber).unwrap();
        hub.unsubscribe("c", &subscriber).unwrap();
        hub.broadcast(Parcel::new("c", json!(1))).unwrap();

        assert_eq!(hub.subscriber_count("c").await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_hub_rejects_commands() {
        let hub = Hub::start(HubConfig::default());
        hub.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (subscriber, _rx) = hub.subscriber(1);
        assert!(hub.subscribe("c", &subscriber).is_err());
    }

    #[tokio::test]
    async fn test_subscriber_ids_are_per_hub() {
        let first = Hub::start(HubConfig::default());
        let second = Hub::start(HubConfig::default());
        let (a, _rx_a) = first.subscriber(1);
        let (b, _rx_b) = first.subscriber(1);
        let (c, _rx_c) = second.subscriber(1);
        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
        assert_eq!(c.id(), 1);

        let shared = first.clone();
        let (d, _rx_d) = shared.subscriber(1);
        assert_eq!(d.id(), 3);
    }

    #[test]
    fn test_config_serde() {
        let config: HubConfig = serde_json::from_str(r#"{"timeout": 0}"#).unwrap();
        assert!(config.timeout.is_zero());
        assert_eq!(HubConfig::default().timeout, Duration::from_secs(1));
    }
}
