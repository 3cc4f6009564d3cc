//! [`AdapterRegistry`] – driver factories and live robot adapters.
//!
//! The registry holds two maps, each behind its own read-write lock:
//!
//! | Map | Key | Value |
//! |---|---|---|
//! | drivers | driver name (`"mock"`, `"rosbridge"`, …) | [`AdapterFactory`] |
//! | robots  | robot ID | `Arc<dyn RobotAdapter>` |
//!
//! Creation is rare and lookups happen on every command, so both maps are
//! read-mostly.  No lock is held while a factory runs or while an adapter
//! is used.

use std::collections::HashMap;
use std::sync::Arc;

use fleet_types::GatewayError;
use parking_lot::RwLock;
use tracing::info;

use crate::adapter::RobotAdapter;
use crate::mock::MockAdapter;
use crate::rosbridge::RosbridgeAdapter;

/// Everything a factory needs to build one adapter instance.
#[derive(Debug, Clone, Default)]
pub struct AdapterConfig {
    pub robot_id: String,
    pub driver: String,
    /// Driver-specific settings (URLs, topic names, rates).
    pub options: HashMap<String, String>,
}

impl AdapterConfig {
    pub fn new(robot_id: impl Into<String>, driver: impl Into<String>) -> Self {
        Self {
            robot_id: robot_id.into(),
            driver: driver.into(),
            options: HashMap::new(),
        }
    }

    /// Add a driver option (builder-style).
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

/// Builds an adapter from its [`AdapterConfig`].
pub type AdapterFactory =
    Arc<dyn Fn(&AdapterConfig) -> Result<Arc<dyn RobotAdapter>, GatewayError> + Send + Sync>;

/// Central driver registry and robot-ID → adapter lookup.
///
/// # Example
///
/// ```
/// use fleet_adapters::{AdapterConfig, AdapterRegistry};
///
/// let registry = AdapterRegistry::with_builtin_drivers();
/// registry.create(AdapterConfig::new("r1", "mock")).unwrap();
///
/// assert!(registry.get("r1").is_ok());
/// assert!(registry.get("r2").is_err());
/// ```
#[derive(Default)]
pub struct AdapterRegistry {
    drivers: RwLock<HashMap<String, AdapterFactory>>,
    robots: RwLock<HashMap<String, Arc<dyn RobotAdapter>>>,
}

impl AdapterRegistry {
    /// Create a registry with no drivers and no robots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the drivers shipped in this crate:
    /// `"mock"` and `"rosbridge"`.
    pub fn with_builtin_drivers() -> Self {
        let registry = Self::new();
        registry.register_driver("mock", |cfg| {
            Ok(Arc::new(MockAdapter::from_config(cfg)?) as Arc<dyn RobotAdapter>)
        });
        registry.register_driver("rosbridge", |cfg| {
            Ok(Arc::new(RosbridgeAdapter::from_config(cfg)?) as Arc<dyn RobotAdapter>)
        });
        registry
    }

    /// Register a factory under `name`.  A factory already registered under
    /// the same name is replaced.
    pub fn register_driver<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&AdapterConfig) -> Result<Arc<dyn RobotAdapter>, GatewayError>
            + Send
            + Sync
            + 'static,
    {
        self.drivers.write().insert(name.into(), Arc::new(factory));
    }

    /// Names of all registered drivers, sorted.
    pub fn drivers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Instantiate an adapter with the factory named by `config.driver` and
    /// register it under `config.robot_id`.
    ///
    /// The adapter is not connected; call [`RobotAdapter::connect`] on the
    /// returned handle.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::UnknownDriver`] – no factory for `config.driver`.
    /// - [`GatewayError::Config`] – the robot ID is already registered.
    /// - Any error returned by the factory itself.
    pub fn create(&self, config: AdapterConfig) -> Result<Arc<dyn RobotAdapter>, GatewayError> {
        let factory = self
            .drivers
            .read()
            .get(&config.driver)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownDriver(config.driver.clone()))?;

        if self.robots.read().contains_key(&config.robot_id) {
            return Err(GatewayError::Config(format!(
                "robot '{}' is already registered",
                config.robot_id
            )));
        }

        let adapter = factory(&config)?;
        self.insert(Arc::clone(&adapter))?;
        info!(robot_id = %config.robot_id, driver = %config.driver, "adapter created");
        Ok(adapter)
    }

    /// Register an already-built adapter under its own robot ID.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Config`] when the robot ID is taken.
    pub fn insert(&self, adapter: Arc<dyn RobotAdapter>) -> Result<(), GatewayError> {
        let mut robots = self.robots.write();
        let robot_id = adapter.robot_id().to_string();
        if robots.contains_key(&robot_id) {
            return Err(GatewayError::Config(format!(
                "robot '{robot_id}' is already registered"
            )));
        }
        robots.insert(robot_id, adapter);
        Ok(())
    }

    /// Look up the adapter for `robot_id`.
    pub fn get(&self, robot_id: &str) -> Result<Arc<dyn RobotAdapter>, GatewayError> {
        self.robots
            .read()
            .get(robot_id)
            .cloned()
            .ok_or_else(|| GatewayError::RobotNotFound(robot_id.to_string()))
    }

    pub fn contains(&self, robot_id: &str) -> bool {
        self.robots.read().contains_key(robot_id)
    }

    /// Remove and return the adapter for `robot_id`.
    pub fn remove(&self, robot_id: &str) -> Option<Arc<dyn RobotAdapter>> {
        self.robots.write().remove(robot_id)
    }

    /// IDs of every registered robot, sorted.
    pub fn robot_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.robots.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshot of every registered adapter.
    pub fn adapters(&self) -> Vec<Arc<dyn RobotAdapter>> {
        self.robots.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.robots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.robots.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_types::RobotCommand;

    #[test]
    fn builtin_drivers_are_registered() {
        let registry = AdapterRegistry::with_builtin_drivers();
        assert_eq!(registry.drivers(), vec!["mock", "rosbridge"]);
    }

    #[test]
    fn create_registers_robot() {
        let registry = AdapterRegistry::with_builtin_drivers();
        let adapter = registry.create(AdapterConfig::new("r1", "mock")).unwrap();
        assert_eq!(adapter.robot_id(), "r1");
        assert!(registry.contains("r1"));
        assert_eq!(registry.robot_ids(), vec!["r1"]);
    }

    #[test]
    fn unknown_driver_is_rejected() {
        let registry = AdapterRegistry::with_builtin_drivers();
        let result = registry.create(AdapterConfig::new("r1", "grpc"));
        assert!(matches!(result, Err(GatewayError::UnknownDriver(d)) if d == "grpc"));
        assert!(registry.is_empty());
    }

    #[test]
    fn duplicate_robot_id_is_rejected() {
        let registry = AdapterRegistry::with_builtin_drivers();
        registry.create(AdapterConfig::new("r1", "mock")).unwrap();
        let result = registry.create(AdapterConfig::new("r1", "mock"));
        assert!(matches!(result, Err(GatewayError::Config(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn factory_errors_propagate() {
        let registry = AdapterRegistry::with_builtin_drivers();
        // rosbridge requires a `url` option.
        let result = registry.create(AdapterConfig::new("r1", "rosbridge"));
        assert!(matches!(result, Err(GatewayError::Config(_))));
        assert!(!registry.contains("r1"));
    }

    #[test]
    fn get_unknown_robot_is_not_found() {
        let registry = AdapterRegistry::new();
        assert!(matches!(
            registry.get("ghost"),
            Err(GatewayError::RobotNotFound(id)) if id == "ghost"
        ));
    }

    #[test]
    fn remove_unregisters_robot() {
        let registry = AdapterRegistry::with_builtin_drivers();
        registry.create(AdapterConfig::new("r1", "mock")).unwrap();
        assert!(registry.remove("r1").is_some());
        assert!(registry.remove("r1").is_none());
        assert!(registry.get("r1").is_err());
    }

    #[tokio::test]
    async fn custom_driver_plugs_in_without_other_changes() {
        let registry = AdapterRegistry::new();
        registry.register_driver("sim", |cfg| {
            Ok(Arc::new(MockAdapter::new(cfg.robot_id.clone())) as Arc<dyn RobotAdapter>)
        });

        let adapter = registry.create(AdapterConfig::new("sim-1", "sim")).unwrap();
        adapter.connect().await.unwrap();
        adapter.send_command(RobotCommand::Stop).await.unwrap();
        assert!(registry.get("sim-1").unwrap().is_connected());
    }
}
