//! # recordb-pubsub
//!
//! Change notification fan-out for recordb.
//!
//! ## Features
//!
//! - **Subscription service**: matches record change events against stored
//!   subscriptions and emits sequence-numbered notices
//! - **Notifiers**: push, topic hub and concurrent fan-out over several notifiers
//! - **Topic hub**: in-process broadcast with per-subscriber deduplication and
//!   bounded delivery waits
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use recordb_pubsub::prelude::*;
//!
//! let hub = Hub::start(HubConfig::default());
//! let notifier = MultiNotifier::default()
//!     .with(Arc::new(HubNotifier::new(hub.clone())))
//!     .with(Arc::new(PushNotifier::new(Arc::new(router))));
//!
//! let opener = DriverOpener::new(driver, "my-app", url, StoreConfig::default());
//! let service = SubscriptionService::new(
//!     SubscriptionServiceConfig::new("my-app"),
//!     Arc::new(opener),
//!     Arc::new(notifier),
//! );
//! service.start().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod hub;
pub mod notifier;
pub mod push;
pub mod subscription;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::hub::{Hub, HubConfig, Parcel, Subscriber};
    pub use crate::notifier::{
        device_channel, HubNotifier, MultiNotifier, Notice, Notifier, PushNotifier,
    };
    pub use crate::push::{notice_payload, PushSender, RouteSender};
    pub use crate::subscription::{
        ConnOpener, DriverOpener, SeqNumGenerator, ServiceState, SubscriptionService,
        SubscriptionServiceConfig, SubscriptionStore,
    };

    pub use recordb_core::prelude::*;
}

// Re-export commonly used items at crate root
pub use recordb_core::{Error, Result};
