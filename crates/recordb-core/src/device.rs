//! Devices and subscriptions
//!
//! A [`Subscription`] binds a stored [`Query`] to a device. When a record
//! change matches the query, the device is notified.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::query::Query;

/// Device type string for Apple devices
pub const DEVICE_TYPE_IOS: &str = "ios";
/// Device type string for Android devices
pub const DEVICE_TYPE_ANDROID: &str = "android";

/// A registered device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Device id
    pub id: String,
    /// `ios`, `android`, ...
    #[serde(rename = "type")]
    pub device_type: String,
    /// Push token; empty when the device has unregistered
    #[serde(default)]
    pub token: String,
    /// Owning user
    pub user_id: String,
    /// Last time the device registered
    pub last_registered_at: DateTime<Utc>,
}

impl Device {
    /// New device registered now
    pub fn new(
        id: impl Into<String>,
        device_type: impl Into<String>,
        token: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            device_type: device_type.into(),
            token: token.into(),
            user_id: user_id.into(),
            last_registered_at: Utc::now(),
        }
    }

    /// Check the fields a stored device needs
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::invalid_argument("device id cannot be empty"));
        }
        if self.device_type.is_empty() {
            return Err(Error::invalid_argument("device type cannot be empty"));
        }
        if self.user_id.is_empty() {
            return Err(Error::invalid_argument("device user id cannot be empty"));
        }
        Ok(())
    }
}

/// APNs presentation settings
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ApsSetting {
    /// Alert text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
    /// Sound file name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
    /// Whether the push wakes the app in the background
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub should_badge: bool,
    /// Silent push
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub should_send_content_available: bool,
}

/// Per-subscription notification settings
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NotificationInfo {
    /// APNs settings
    #[serde(default)]
    pub aps: ApsSetting,
}

/// A device-bound stored query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscription id, unique per device
    pub id: String,
    /// Subscription kind, e.g. `query`
    #[serde(rename = "type")]
    pub sub_type: String,
    /// Device notified on match
    pub device_id: String,
    /// Notification settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_info: Option<NotificationInfo>,
    /// Query a changed record must match
    pub query: Query,
}

impl Subscription {
    /// Query subscription for a device
    pub fn new(id: impl Into<String>, device_id: impl Into<String>, query: Query) -> Self {
        Self {
            id: id.into(),
            sub_type: "query".to_string(),
            device_id: device_id.into(),
            notification_info: None,
            query,
        }
    }

    /// Check the fields a stored subscription needs
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::invalid_argument("empty id"));
        }
        if self.sub_type.is_empty() {
            return Err(Error::invalid_argument("empty type"));
        }
        if self.query.record_type.is_empty() {
            return Err(Error::invalid_argument("empty query type"));
        }
        if self.device_id.is_empty() {
            return Err(Error::invalid_argument("empty device id"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_validate() {
        let sub = Subscription::new("s1", "d1", Query::new("note"));
        assert!(sub.validate().is_ok());

        let mut missing_type = sub.clone();
        missing_type.query.record_type.clear();
        assert!(missing_type.validate().is_err());

        let mut missing_device = sub;
        missing_device.device_id.clear();
        assert!(missing_device.validate().is_err());
    }

    #[test]
    fn test_device_json_shape() {
        let device = Device::new("d1", DEVICE_TYPE_IOS, "tok", "alice");
        let json = serde_json::to_value(&device).unwrap();
        assert_eq!(json["type"], "ios");
        assert_eq!(json["user_id"], "alice");
        assert!(Device::new("", "ios", "", "alice").validate().is_err());
    }
}
