//! [`MockAdapter`] – an in-process simulated robot.
//!
//! Records every command it receives, integrates velocity commands into a
//! planar pose, and (optionally) publishes that pose as telemetry at a fixed
//! rate.  This lets the whole gateway run in tests and demos without a
//! physical robot.
//!
//! # Options
//!
//! | Option | Meaning | Default |
//! |---|---|---|
//! | `publish_hz` | telemetry rate; `0` disables the ticker | `0` |
//! | `battery` | initial battery percentage | `100` |
//!
//! # Example
//!
//! ```rust
//! use fleet_adapters::{MockAdapter, RobotAdapter};
//! use fleet_types::{RobotCommand, Vector3};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let robot = MockAdapter::new("r1");
//! robot.connect().await.unwrap();
//! robot
//!     .send_command(RobotCommand::Velocity {
//!         linear: Vector3::new(0.5, 0.0, 0.0),
//!         angular: Vector3::ZERO,
//!     })
//!     .await
//!     .unwrap();
//! assert_eq!(robot.commands().len(), 1);
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fleet_types::{Capabilities, GatewayError, RobotCommand, SensorData, Vector3};
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::adapter::{RobotAdapter, sensor_stream_from};
use crate::registry::AdapterConfig;

const SENSOR_CHANNEL_CAPACITY: usize = 256;

/// Planar kinematic state of the simulated robot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimState {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    pub linear: Vector3,
    pub angular: Vector3,
    pub battery: f64,
}

impl SimState {
    fn new(battery: f64) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            theta: 0.0,
            linear: Vector3::ZERO,
            angular: Vector3::ZERO,
            battery,
        }
    }

    /// Advance the unicycle model by `dt` seconds.
    fn step(&mut self, dt: f64) {
        self.theta += self.angular.z * dt;
        self.x += self.linear.x * self.theta.cos() * dt;
        self.y += self.linear.x * self.theta.sin() * dt;
        let moving = self.linear.norm() > 0.0 || self.angular.norm() > 0.0;
        if moving {
            self.battery = (self.battery - 0.01 * dt).max(0.0);
        }
    }

    fn to_json(&self) -> Value {
        json!({
            "pose": { "x": self.x, "y": self.y, "theta": self.theta },
            "velocity": {
                "linear": self.linear,
                "angular": self.angular,
            },
            "battery": self.battery,
        })
    }
}

/// Simulated robot that records commands.
pub struct MockAdapter {
    robot_id: String,
    connected: AtomicBool,
    failing: AtomicBool,
    command_latency: Mutex<Duration>,
    emergency_stops: AtomicUsize,
    commands: Mutex<Vec<RobotCommand>>,
    state: Arc<Mutex<SimState>>,
    sensor_tx: broadcast::Sender<SensorData>,
    publish_interval: Option<Duration>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl MockAdapter {
    /// Create a silent mock (no periodic telemetry).
    pub fn new(robot_id: impl Into<String>) -> Self {
        let (sensor_tx, _) = broadcast::channel(SENSOR_CHANNEL_CAPACITY);
        Self {
            robot_id: robot_id.into(),
            connected: AtomicBool::new(false),
            failing: AtomicBool::new(false),
            command_latency: Mutex::new(Duration::ZERO),
            emergency_stops: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
            state: Arc::new(Mutex::new(SimState::new(100.0))),
            sensor_tx,
            publish_interval: None,
            ticker: Mutex::new(None),
        }
    }

    /// Publish the simulated state every `interval` while connected
    /// (builder-style).
    pub fn with_publish_interval(mut self, interval: Duration) -> Self {
        self.publish_interval = Some(interval);
        self
    }

    /// Build from registry options (`publish_hz`, `battery`).
    ///
    /// # Errors
    ///
    /// [`GatewayError::Config`] when an option does not parse.
    pub fn from_config(config: &AdapterConfig) -> Result<Self, GatewayError> {
        let mut adapter = Self::new(config.robot_id.clone());

        if let Some(raw) = config.option("publish_hz") {
            let hz: f64 = raw.parse().map_err(|_| {
                GatewayError::Config(format!("mock '{}': invalid publish_hz '{raw}'", config.robot_id))
            })?;
            if hz > 0.0 {
                adapter.publish_interval = Some(Duration::from_secs_f64(1.0 / hz));
            }
        }
        if let Some(raw) = config.option("battery") {
            let battery: f64 = raw.parse().map_err(|_| {
                GatewayError::Config(format!("mock '{}': invalid battery '{raw}'", config.robot_id))
            })?;
            adapter.state.lock().battery = battery.clamp(0.0, 100.0);
        }
        Ok(adapter)
    }

    /// Make every subsequent command and emergency stop fail, simulating an
    /// unreachable robot.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every subsequent command by `latency` before it takes effect,
    /// like a slow link.  Emergency stops are not delayed.
    pub fn set_command_latency(&self, latency: Duration) {
        *self.command_latency.lock() = latency;
    }

    /// Every command received so far, oldest first.
    pub fn commands(&self) -> Vec<RobotCommand> {
        self.commands.lock().clone()
    }

    pub fn last_command(&self) -> Option<RobotCommand> {
        self.commands.lock().last().cloned()
    }

    /// Number of successful [`RobotAdapter::emergency_stop`] calls.
    pub fn emergency_stop_count(&self) -> usize {
        self.emergency_stops.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SimState {
        *self.state.lock()
    }

    /// Push an arbitrary telemetry sample to current subscribers.
    ///
    /// Returns the number of subscribers that received it.
    pub fn inject(&self, data: Value) -> usize {
        self.sensor_tx
            .send(SensorData {
                robot_id: self.robot_id.clone(),
                timestamp: Utc::now(),
                data,
            })
            .unwrap_or(0)
    }

    fn unreachable(&self, details: &str) -> GatewayError {
        GatewayError::Adapter {
            robot_id: self.robot_id.clone(),
            details: details.to_string(),
        }
    }

    fn spawn_ticker(&self, interval: Duration) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let tx = self.sensor_tx.clone();
        let robot_id = self.robot_id.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let snapshot = {
                    let mut s = state.lock();
                    s.step(interval.as_secs_f64());
                    s.to_json()
                };
                // No subscribers is a normal condition.
                let _ = tx.send(SensorData {
                    robot_id: robot_id.clone(),
                    timestamp: Utc::now(),
                    data: snapshot,
                });
            }
        })
    }
}

#[async_trait]
impl RobotAdapter for MockAdapter {
    fn robot_id(&self) -> &str {
        &self.robot_id
    }

    async fn connect(&self) -> Result<(), GatewayError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(interval) = self.publish_interval {
            *self.ticker.lock() = Some(self.spawn_ticker(interval));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), GatewayError> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_command(&self, command: RobotCommand) -> Result<(), GatewayError> {
        if !self.is_connected() {
            return Err(self.unreachable("not connected"));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(self.unreachable("simulated link failure"));
        }
        let latency = *self.command_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        {
            let mut state = self.state.lock();
            match &command {
                RobotCommand::Velocity { linear, angular } => {
                    state.linear = *linear;
                    state.angular = *angular;
                }
                RobotCommand::Stop | RobotCommand::NavCancel => {
                    state.linear = Vector3::ZERO;
                    state.angular = Vector3::ZERO;
                }
                RobotCommand::NavGoal { .. } => {}
            }
        }
        self.commands.lock().push(command);
        Ok(())
    }

    fn sensor_stream(&self) -> BoxStream<'static, SensorData> {
        sensor_stream_from(self.sensor_tx.subscribe())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            velocity: true,
            navigation: true,
            sensors: vec!["pose".to_string(), "battery".to_string()],
            max_linear: None,
            max_angular: None,
        }
    }

    /// Zeroes the simulated twist.  Works whether or not the adapter is
    /// connected; only [`MockAdapter::set_failing`] makes it fail.
    async fn emergency_stop(&self) -> Result<(), GatewayError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(self.unreachable("simulated link failure"));
        }
        {
            let mut state = self.state.lock();
            state.linear = Vector3::ZERO;
            state.angular = Vector3::ZERO;
        }
        self.emergency_stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for MockAdapter {
    fn drop(&mut self) {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn forward(speed: f64) -> RobotCommand {
        RobotCommand::Velocity {
            linear: Vector3::new(speed, 0.0, 0.0),
            angular: Vector3::ZERO,
        }
    }

    #[tokio::test]
    async fn commands_require_connection() {
        let robot = MockAdapter::new("r1");
        let result = robot.send_command(forward(0.5)).await;
        assert!(matches!(result, Err(GatewayError::Adapter { .. })));
        assert!(robot.commands().is_empty());
    }

    #[tokio::test]
    async fn records_commands_in_order() {
        let robot = MockAdapter::new("r1");
        robot.connect().await.unwrap();
        robot.send_command(forward(0.5)).await.unwrap();
        robot.send_command(RobotCommand::Stop).await.unwrap();

        assert_eq!(robot.commands(), vec![forward(0.5), RobotCommand::Stop]);
        assert_eq!(robot.last_command(), Some(RobotCommand::Stop));
    }

    #[tokio::test]
    async fn velocity_updates_state_and_stop_zeroes_it() {
        let robot = MockAdapter::new("r1");
        robot.connect().await.unwrap();
        robot.send_command(forward(0.8)).await.unwrap();
        assert!((robot.state().linear.x - 0.8).abs() < f64::EPSILON);

        robot.send_command(RobotCommand::Stop).await.unwrap();
        assert_eq!(robot.state().linear, Vector3::ZERO);
    }

    #[tokio::test]
    async fn failing_robot_rejects_commands_and_estop() {
        let robot = MockAdapter::new("r1");
        robot.connect().await.unwrap();
        robot.set_failing(true);

        assert!(robot.send_command(forward(0.1)).await.is_err());
        assert!(robot.emergency_stop().await.is_err());
        assert_eq!(robot.emergency_stop_count(), 0);

        robot.set_failing(false);
        assert!(robot.emergency_stop().await.is_ok());
        assert_eq!(robot.emergency_stop_count(), 1);
    }

    #[tokio::test]
    async fn emergency_stop_works_while_disconnected() {
        let robot = MockAdapter::new("r1");
        assert!(robot.emergency_stop().await.is_ok());
        assert_eq!(robot.emergency_stop_count(), 1);
    }

    #[tokio::test]
    async fn injected_samples_reach_subscribers() {
        let robot = MockAdapter::new("r1");
        let mut stream = robot.sensor_stream();
        assert_eq!(robot.inject(json!({ "battery": 42 })), 1);

        let sample = stream.next().await.unwrap();
        assert_eq!(sample.robot_id, "r1");
        assert_eq!(sample.data["battery"], 42);
    }

    #[tokio::test]
    async fn ticker_publishes_while_connected() {
        let robot = MockAdapter::new("r1").with_publish_interval(Duration::from_millis(10));
        let mut stream = robot.sensor_stream();
        robot.connect().await.unwrap();

        let sample = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("ticker must publish")
            .unwrap();
        assert!(sample.data["pose"].is_object());

        robot.disconnect().await.unwrap();
        assert!(!robot.is_connected());
    }

    #[test]
    fn from_config_parses_options() {
        let cfg = AdapterConfig::new("r1", "mock")
            .with_option("publish_hz", "20")
            .with_option("battery", "55");
        let robot = MockAdapter::from_config(&cfg).unwrap();
        let interval = robot.publish_interval.unwrap();
        assert!((interval.as_secs_f64() - 0.05).abs() < 1e-6);
        assert!((robot.state().battery - 55.0).abs() < f64::EPSILON);
    }

    #[test]
    fn from_config_rejects_bad_rate() {
        let cfg = AdapterConfig::new("r1", "mock").with_option("publish_hz", "fast");
        assert!(matches!(
            MockAdapter::from_config(&cfg),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn unicycle_step_moves_along_heading() {
        let mut state = SimState::new(100.0);
        state.linear = Vector3::new(1.0, 0.0, 0.0);
        state.step(1.0);
        assert!((state.x - 1.0).abs() < 1e-9);
        assert!(state.y.abs() < 1e-9);
        assert!(state.battery < 100.0);
    }
}
