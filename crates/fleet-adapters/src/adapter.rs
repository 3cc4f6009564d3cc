//! The robot adapter contract.
//!
//! The gateway publishes commands through a [`RobotAdapter`] and reads
//! telemetry from its sensor stream.  Nothing outside this crate knows which
//! protocol sits behind the trait object.
//!
//! # Overview
//!
//! - [`RobotAdapter`] – the trait every robot back-end must implement.
//! - [`MockAdapter`][crate::mock::MockAdapter] – simulated robot for tests
//!   and demos.
//! - [`RosbridgeAdapter`][crate::rosbridge::RosbridgeAdapter] – drives a
//!   ROS 2 robot through `rosbridge_server`.

use async_trait::async_trait;
use fleet_types::{Capabilities, GatewayError, RobotCommand, SensorData};
use futures_util::stream::{self, BoxStream};
use tokio::sync::broadcast;
use tracing::warn;

/// Every robot back-end must implement this trait.
///
/// # Contract
///
/// * `send_command` – receives a [`RobotCommand`] that has already passed
///   every safety interlock and translates it into the robot's protocol.
///
/// * `sensor_stream` – returns a live stream of [`SensorData`].  Each call
///   returns an independent subscription; samples produced while nobody is
///   subscribed are lost.
///
/// * `emergency_stop` – must bring the robot to rest through the most
///   direct channel the protocol offers.  It is called even when the
///   adapter believes the link is unhealthy, and it must not wait on a
///   stalled link: callers bound it with a timeout.
#[async_trait]
pub trait RobotAdapter: Send + Sync {
    /// The fleet-wide identifier of the robot behind this adapter.
    fn robot_id(&self) -> &str;

    /// Open the link to the robot.
    async fn connect(&self) -> Result<(), GatewayError>;

    /// Close the link.  Idempotent.
    async fn disconnect(&self) -> Result<(), GatewayError>;

    fn is_connected(&self) -> bool;

    /// Deliver `command` to the robot.
    async fn send_command(&self, command: RobotCommand) -> Result<(), GatewayError>;

    /// Subscribe to the robot's telemetry.
    fn sensor_stream(&self) -> BoxStream<'static, SensorData>;

    fn capabilities(&self) -> Capabilities;

    /// Physically stop the robot.
    async fn emergency_stop(&self) -> Result<(), GatewayError>;
}

/// Turn a broadcast receiver into the boxed stream returned by
/// [`RobotAdapter::sensor_stream`].
///
/// A lagging consumer skips the samples it missed and keeps going; the
/// stream ends when the sending side is dropped.
pub fn sensor_stream_from(
    receiver: broadcast::Receiver<SensorData>,
) -> BoxStream<'static, SensorData> {
    Box::pin(stream::unfold(receiver, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(sample) => return Some((sample, rx)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "sensor stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }))
}
