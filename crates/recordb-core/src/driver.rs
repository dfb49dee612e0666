//! Driver registry
//!
//! Drivers are registered by name on a [`DriverRegistry`] built at start
//! up and passed to whatever needs to open connections.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::StoreConfig;
use crate::conn::{AccessModel, Conn};
use crate::error::{Error, Result};

/// Opens connections to one kind of store
#[async_trait]
pub trait Driver: Send + Sync {
    /// Open a connection for `app_name`.
    ///
    /// `option` is driver specific, e.g. a connection string.
    async fn open(
        &self,
        app_name: &str,
        access_model: AccessModel,
        option: &str,
        config: &StoreConfig,
    ) -> Result<Box<dyn Conn>>;
}

/// Named drivers
#[derive(Default)]
pub struct DriverRegistry {
    drivers: RwLock<HashMap<String, Arc<dyn Driver>>>,
}

impl DriverRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `driver` under `name`; a name can only be used once
    pub fn register(&self, name: impl Into<String>, driver: Arc<dyn Driver>) -> Result<()> {
        let name = name.into();
        let mut drivers = self.drivers.write();
        if drivers.contains_key(&name) {
            return Err(Error::DriverAlreadyRegistered { name });
        }
        debug!(driver = %name, "Registered store driver");
        drivers.insert(name, driver);
        Ok(())
    }

    /// Driver registered under `name`
    pub fn get(&self, name: &str) -> Result<Arc<dyn Driver>> {
        self.drivers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::DriverNotFound {
                name: name.to_string(),
            })
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Open a connection through the driver named `impl_name`
    pub async fn open(
        &self,
        impl_name: &str,
        app_name: &str,
        access_model: AccessModel,
        option: &str,
        config: &StoreConfig,
    ) -> Result<Box<dyn Conn>> {
        let driver = self.get(impl_name)?;
        driver.open(app_name, access_model, option, config).await
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopDriver;

    #[async_trait]
    impl Driver for NoopDriver {
        async fn open(
            &self,
            _app_name: &str,
            _access_model: AccessModel,
            _option: &str,
            _config: &StoreConfig,
        ) -> Result<Box<dyn Conn>> {
            Err(Error::connection("noop"))
        }
    }

    #[test]
    fn test_register_twice_fails() {
        let registry = DriverRegistry::new();
        registry.register("pq", Arc::new(NoopDriver)).unwrap();
        let err = registry.register("pq", Arc::new(NoopDriver)).unwrap_err();
        assert!(matches!(err, Error::DriverAlreadyRegistered { .. }));
        assert_eq!(registry.names(), vec!["pq".to_string()]);
    }

    #[tokio::test]
    async fn test_open_unknown_driver() {
        let registry = DriverRegistry::new();
        let err = registry
            .open("mysql", "app", AccessModel::RoleBased, "", &StoreConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::DriverNotFound { .. }));

        registry.register("pq", Arc::new(NoopDriver)).unwrap();
        let err = registry
            .open("pq", "app", AccessModel::RoleBased, "", &StoreConfig::default())
            .await
            .err()
            .unwrap();
        assert!(err.is_retriable());
    }
}
