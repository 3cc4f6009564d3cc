//! [`Gateway`] – one running gateway, assembled from a [`GatewayConfig`].
//!
//! Building a gateway:
//!
//! 1. instantiates the configured robots through the adapter registry,
//! 2. connects every adapter (a robot that cannot be reached is logged and
//!    left offline),
//! 3. starts the hub loop, the telemetry relays and the lock sweeper.
//!
//! The HTTP/WebSocket listener is separate ([`GatewayServer`]), so embedders
//! and tests can bind wherever they like.
//!
//! [`GatewayServer`]: crate::server::GatewayServer

use std::sync::Arc;

use fleet_adapters::{AdapterConfig, AdapterRegistry};
use fleet_types::GatewayError;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::auth::TokenValidator;
use crate::bridge::{BackendBridge, BridgeEvent, ChannelBridge, NoopBridge};
use crate::config::GatewayConfig;
use crate::handler::Handler;
use crate::hub::Hub;

pub struct Gateway {
    handler: Arc<Handler>,
    hub: Arc<Hub>,
    registry: Arc<AdapterRegistry>,
    hub_task: JoinHandle<()>,
    bridge_events: Mutex<Option<mpsc::Receiver<BridgeEvent>>>,
}

impl Gateway {
    /// Assemble and start a gateway.
    ///
    /// Robots already present in `registry` are kept; those listed in
    /// `config.robots` are created with the registry's drivers.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::UnknownDriver`] / [`GatewayError::Config`] for a
    ///   robot entry that cannot be instantiated.
    /// - [`GatewayError::Config`] for invalid safety limits.
    pub async fn build(
        config: &GatewayConfig,
        registry: Arc<AdapterRegistry>,
        validator: TokenValidator,
    ) -> Result<Self, GatewayError> {
        for robot in &config.robots {
            if registry.contains(&robot.id) {
                continue;
            }
            let mut adapter_config = AdapterConfig::new(robot.id.as_str(), robot.driver.as_str());
            adapter_config.options = robot.options.clone();
            registry.create(adapter_config)?;
            info!(robot_id = %robot.id, driver = %robot.driver, "robot registered");
        }

        for adapter in registry.adapters() {
            if adapter.is_connected() {
                continue;
            }
            match adapter.connect().await {
                Ok(()) => info!(robot_id = adapter.robot_id(), "robot connected"),
                Err(e) => warn!(robot_id = adapter.robot_id(), error = %e, "robot unreachable, starting offline"),
            }
        }

        let (bridge, bridge_events) = if config.recording.enabled {
            let (bridge, events) = ChannelBridge::new(config.recording.buffer);
            let bridge: Arc<dyn BackendBridge> = Arc::new(bridge);
            (bridge, Some(events))
        } else {
            let bridge: Arc<dyn BackendBridge> = Arc::new(NoopBridge);
            (bridge, None)
        };

        let hub = Hub::new();
        let hub_task = hub.spawn();
        let handler = Handler::new(
            config,
            Arc::clone(&hub),
            Arc::clone(&registry),
            Arc::new(validator),
            bridge,
        )?;
        handler.start(config.safety.lock_sweep_interval());
        info!(robots = registry.len(), "gateway started");

        Ok(Self {
            handler,
            hub,
            registry,
            hub_task,
            bridge_events: Mutex::new(bridge_events),
        })
    }

    pub fn handler(&self) -> Arc<Handler> {
        Arc::clone(&self.handler)
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    /// The receiving end of the recording queue.  `None` when recording is
    /// disabled or the receiver was already taken.
    pub fn take_bridge_events(&self) -> Option<mpsc::Receiver<BridgeEvent>> {
        self.bridge_events.lock().take()
    }

    /// Stop every robot, stop background tasks and disconnect adapters.
    pub async fn shutdown(self) {
        info!("gateway shutting down");
        self.handler.shutdown().await;
        for adapter in self.registry.adapters() {
            if let Err(e) = adapter.disconnect().await {
                warn!(robot_id = adapter.robot_id(), error = %e, "disconnect failed");
            }
        }
        self.hub_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use fleet_adapters::{MockAdapter, RobotAdapter};
    use fleet_types::RobotCommand;
    use jsonwebtoken::Algorithm;

    use crate::config::RobotConfig;

    const PUBLIC_PEM: &[u8] = include_bytes!("../tests/fixtures/test_ed25519_public.pem");

    fn validator() -> TokenValidator {
        TokenValidator::from_pem(PUBLIC_PEM, Algorithm::EdDSA).unwrap()
    }

    #[tokio::test]
    async fn builds_configured_robots_and_connects_them() {
        let mut config = GatewayConfig::default();
        config.robots.push(RobotConfig {
            id: "sim-1".into(),
            driver: "mock".into(),
            options: HashMap::new(),
        });
        let registry = Arc::new(AdapterRegistry::with_builtin_drivers());
        let gateway = Gateway::build(&config, Arc::clone(&registry), validator()).await.unwrap();

        assert!(registry.get("sim-1").unwrap().is_connected());
        assert!(gateway.take_bridge_events().is_none());
        gateway.shutdown().await;
        assert!(!registry.get("sim-1").unwrap().is_connected());
    }

    #[tokio::test]
    async fn unknown_driver_fails_the_build() {
        let mut config = GatewayConfig::default();
        config.robots.push(RobotConfig {
            id: "x".into(),
            driver: "carrier-pigeon".into(),
            options: HashMap::new(),
        });
        let registry = Arc::new(AdapterRegistry::with_builtin_drivers());
        assert!(matches!(
            Gateway::build(&config, registry, validator()).await,
            Err(GatewayError::UnknownDriver(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_robot_does_not_block_startup() {
        let mut config = GatewayConfig::default();
        config.robots.push(RobotConfig {
            id: "ros-1".into(),
            driver: "rosbridge".into(),
            options: HashMap::from([("url".to_string(), "ws://127.0.0.1:1".to_string())]),
        });
        let registry = Arc::new(AdapterRegistry::with_builtin_drivers());
        let gateway = Gateway::build(&config, Arc::clone(&registry), validator()).await.unwrap();
        assert!(!registry.get("ros-1").unwrap().is_connected());
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn recording_exposes_event_queue_once() {
        let mut config = GatewayConfig::default();
        config.recording.enabled = true;
        let gateway = Gateway::build(&config, Arc::new(AdapterRegistry::new()), validator())
            .await
            .unwrap();
        assert!(gateway.take_bridge_events().is_some());
        assert!(gateway.take_bridge_events().is_none());
    }

    #[tokio::test]
    async fn shutdown_stops_every_robot() {
        let registry = Arc::new(AdapterRegistry::new());
        let robot = Arc::new(MockAdapter::new("r1"));
        registry.insert(robot.clone()).unwrap();
        let gateway = Gateway::build(&GatewayConfig::default(), registry, validator())
            .await
            .unwrap();
        assert!(robot.is_connected());

        gateway.shutdown().await;
        assert_eq!(robot.last_command(), Some(RobotCommand::Stop));
        assert!(!robot.is_connected());
    }
}
