//! Notifiers
//!
//! A [`Notifier`] tells one device that one of its subscriptions matched
//! a changed record. The subscriber only learns the sequence number and
//! the subscription id; it fetches the data itself.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use recordb_core::device::Device;
use recordb_core::error::Result;
use recordb_core::record::{Record, RecordHookEvent};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::hub::{Hub, Parcel};
use crate::push::{notice_payload, PushSender};

/// Prefix of the hub channel of a device
pub const DEVICE_CHANNEL_PREFIX: &str = "_sub_";

/// A subscription matched a changed record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    /// Strictly increasing per service
    pub seq_num: u64,
    /// Matched subscription
    pub subscription_id: String,
    /// What happened to the record
    pub event: RecordHookEvent,
    /// The changed record
    pub record: Record,
}

/// Delivers notices to devices
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Tell `device` about `notice`
    async fn notify(&self, device: &Device, notice: &Notice) -> Result<()>;
}

/// Notifies through push messages
#[derive(Clone)]
pub struct PushNotifier {
    sender: Arc<dyn PushSender>,
}

impl PushNotifier {
    /// Push through `sender`
    pub fn new(sender: Arc<dyn PushSender>) -> Self {
        Self { sender }
    }
}

impl fmt::Debug for PushNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushNotifier").finish_non_exhaustive()
    }
}

#[async_trait]
impl Notifier for PushNotifier {
    async fn notify(&self, device: &Device, notice: &Notice) -> Result<()> {
        debug!(device_id = %device.id, seq_num = notice.seq_num, "Push notice");
        self.sender.send(&notice_payload(notice), device).await
    }
}

/// Hub channel carrying the notices of `device_id`
pub fn device_channel(device_id: &str) -> String {
    format!("{}{}", DEVICE_CHANNEL_PREFIX, device_id)
}

/// Notifies by broadcasting on the device's hub channel
#[derive(Debug, Clone)]
pub struct HubNotifier {
    hub: Hub,
}

impl HubNotifier {
    /// Broadcast on `hub`
    pub fn new(hub: Hub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Notifier for HubNotifier {
    async fn notify(&self, device: &Device, notice: &Notice) -> Result<()> {
        let data = json!({
            "seq-num": notice.seq_num,
            "subscription-id": notice.subscription_id,
        });
        self.hub.broadcast(Parcel::new(device_channel(&device.id), data))
    }
}

/// Notifies through every inner notifier concurrently
#[derive(Clone, Default)]
pub struct MultiNotifier {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl MultiNotifier {
    /// Fan out to `notifiers`
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    /// Add a notifier
    pub fn with(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    /// Number of inner notifiers
    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    /// Whether there are no inner notifiers
    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }
}

impl fmt::Debug for MultiNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiNotifier")
            .field("notifiers", &self.notifiers.len())
            .finish()
    }
}

#[async_trait]
impl Notifier for MultiNotifier {
    /// Waits for all inner notifiers; returns the first error, if any
    async fn notify(&self, device: &Device, notice: &Notice) -> Result<()> {
        let results = join_all(self.notifiers.iter().map(|n| n.notify(device, notice))).await;
        let mut first = None;
        for err in results.into_iter().filter_map(|r| r.err()) {
            warn!(device_id = %device.id, error = %err, "Notifier failed");
            first.get_or_insert(err);
        }
        first.map_or(Ok(()), Err)
    }
}
