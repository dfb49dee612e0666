//! Push delivery contract
//!
//! Provider clients (APNs, GCM, ...) live outside this crate and plug in
//! through [`PushSender`]. A [`RouteSender`] picks the provider by the
//! device's type.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use recordb_core::device::{Device, DEVICE_TYPE_ANDROID, DEVICE_TYPE_IOS};
use recordb_core::error::{Error, Result};
use serde_json::{json, Value as Json};
use tracing::debug;

use crate::notifier::Notice;

/// Sends one push message to one device
#[async_trait]
pub trait PushSender: Send + Sync {
    /// Deliver `payload` to `device`.
    ///
    /// The payload carries one object per provider, keyed `apns`, `gcm`...;
    /// a sender reads the key of its provider.
    async fn send(&self, payload: &Json, device: &Device) -> Result<()>;
}

/// Provider payloads announcing `notice`
pub fn notice_payload(notice: &Notice) -> Json {
    json!({
        "apns": {
            "aps": { "content-available": 1 },
            "seq-num": notice.seq_num,
            "subscription-id": notice.subscription_id,
        },
        "gcm": {
            "data": {
                "seq-num": notice.seq_num,
                "subscription-id": notice.subscription_id,
            }
        }
    })
}

/// Routes by device type to the sender registered for it
#[derive(Clone, Default)]
pub struct RouteSender {
    routes: HashMap<String, Arc<dyn PushSender>>,
}

impl fmt::Debug for RouteSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.routes.keys().collect();
        types.sort();
        f.debug_struct("RouteSender").field("routes", &types).finish()
    }
}

impl RouteSender {
    /// No routes
    pub fn new() -> Self {
        Self::default()
    }

    /// Send to devices of `device_type` through `sender`
    pub fn with_route(mut self, device_type: impl Into<String>, sender: Arc<dyn PushSender>) -> Self {
        self.routes.insert(device_type.into(), sender);
        self
    }

    /// Route iOS devices to `sender`
    pub fn with_apns(self, sender: Arc<dyn PushSender>) -> Self {
        self.with_route(DEVICE_TYPE_IOS, sender)
    }

    /// Route Android devices to `sender`
    pub fn with_gcm(self, sender: Arc<dyn PushSender>) -> Self {
        self.with_route(DEVICE_TYPE_ANDROID, sender)
    }
}

#[async_trait]
impl PushSender for RouteSender {
    async fn send(&self, payload: &Json, device: &Device) -> Result<()> {
        let sender = self.routes.get(&device.device_type).ok_or_else(|| {
            Error::not_supported(format!(
                "no push sender for device type {}",
                device.device_type
            ))
        })?;
        debug!(device_id = %device.id, device_type = %device.device_type, "Routing push");
        sender.send(payload, device).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use recordb_core::record::{Record, RecordHookEvent, RecordId};

    #[derive(Default)]
    struct Recording(Mutex<Vec<String>>);

    #[async_trait]
    impl PushSender for Recording {
        async fn send(&self, _payload: &Json, device: &Device) -> Result<()> {
            self.0.lock().push(device.id.clone());
            Ok(())
        }
    }

    fn notice() -> Notice {
        Notice {
            seq_num: 42,
            subscription_id: "s1".to_string(),
            event: RecordHookEvent::Created,
            record: Record::new(RecordId::new("note", "n1")),
        }
    }

    #[test]
    fn test_notice_payload_shape() {
        let payload = notice_payload(&notice());
        assert_eq!(payload["apns"]["aps"]["content-available"], 1);
        assert_eq!(payload["apns"]["seq-num"], 42);
        assert_eq!(payload["gcm"]["data"]["subscription-id"], "s1");
    }

    #[tokio::test]
    async fn test_route_by_device_type() {
        let apns = Arc::new(Recording::default());
        let gcm = Arc::new(Recording::default());
        let router = RouteSender::new()
            .with_apns(apns.clone())
            .with_gcm(gcm.clone());
        let payload = notice_payload(&notice());

        router
            .send(&payload, &Device::new("d1", "ios", "t", "alice"))
            .await
            .unwrap();
        router
            .send(&payload, &Device::new("d2", "android", "t", "alice"))
            .await
            .unwrap();
        assert_eq!(*apns.0.lock(), vec!["d1".to_string()]);
        assert_eq!(*gcm.0.lock(), vec!["d2".to_string()]);

        let err = router
            .send(&payload, &Device::new("d3", "baidu", "t", "alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported { .. }));
    }
}
