//! ROS 2 adapter speaking the `rosbridge_server` JSON protocol.
//!
//! [`RosbridgeAdapter`] opens one WebSocket to `rosbridge_server` per robot:
//!
//! * **Outbound (Drive)** – [`RobotCommand::Velocity`] and
//!   [`RobotCommand::Stop`] become `geometry_msgs/msg/Twist` publishes on
//!   `/cmd_vel`.
//!
//! * **Outbound (Navigation)** – [`RobotCommand::NavGoal`] becomes a
//!   `geometry_msgs/msg/PoseStamped` publish on `/goal_pose`;
//!   [`RobotCommand::NavCancel`] calls the Nav2 cancel service.
//!
//! * **Outbound (E-Stop)** – a zero twist followed by `std_msgs/msg/Bool`
//!   `true` on `/emergency_stop`.
//!
//! * **Inbound (Telemetry)** – every `publish` frame on a subscribed topic
//!   (`/odom`, `/battery_state`) becomes one [`SensorData`] sample.
//!
//! # Options
//!
//! | Option | Default |
//! |---|---|
//! | `url` | *(required)* e.g. `ws://10.0.0.7:9090` |
//! | `cmd_vel_topic` | `/cmd_vel` |
//! | `odom_topic` | `/odom` |
//! | `battery_topic` | `/battery_state` |
//! | `goal_topic` | `/goal_pose` |
//! | `estop_topic` | `/emergency_stop` |
//! | `cancel_service` | `/navigate_to_pose/_action/cancel_goal` |

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use fleet_types::{Capabilities, GatewayError, RobotCommand, SensorData, Vector3};
use futures_util::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::adapter::{RobotAdapter, sensor_stream_from};
use crate::registry::AdapterConfig;

const SENSOR_CHANNEL_CAPACITY: usize = 256;
const OUTBOUND_CAPACITY: usize = 64;

/// ROS graph names used by one robot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosTopics {
    pub cmd_vel: String,
    pub odom: String,
    pub battery: String,
    pub goal: String,
    pub estop: String,
    pub cancel_service: String,
}

impl Default for RosTopics {
    fn default() -> Self {
        Self {
            cmd_vel: "/cmd_vel".to_string(),
            odom: "/odom".to_string(),
            battery: "/battery_state".to_string(),
            goal: "/goal_pose".to_string(),
            estop: "/emergency_stop".to_string(),
            cancel_service: "/navigate_to_pose/_action/cancel_goal".to_string(),
        }
    }
}

/// Adapter that drives a ROS 2 robot through `rosbridge_server`.
pub struct RosbridgeAdapter {
    robot_id: String,
    url: String,
    topics: RosTopics,
    connected: Arc<AtomicBool>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    sensor_tx: broadcast::Sender<SensorData>,
    tasks: Mutex<Option<LinkTasks>>,
}

/// Background tasks owning the two halves of one rosbridge socket.
struct LinkTasks {
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl RosbridgeAdapter {
    /// Create an adapter for `robot_id` talking to the rosbridge endpoint at
    /// `url` with the default topic names.
    pub fn new(robot_id: impl Into<String>, url: impl Into<String>) -> Self {
        let (sensor_tx, _) = broadcast::channel(SENSOR_CHANNEL_CAPACITY);
        Self {
            robot_id: robot_id.into(),
            url: url.into(),
            topics: RosTopics::default(),
            connected: Arc::new(AtomicBool::new(false)),
            outbound: Mutex::new(None),
            sensor_tx,
            tasks: Mutex::new(None),
        }
    }

    /// Build from registry options.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Config`] when the `url` option is missing.
    pub fn from_config(config: &AdapterConfig) -> Result<Self, GatewayError> {
        let url = config.option("url").ok_or_else(|| {
            GatewayError::Config(format!(
                "rosbridge robot '{}' needs a `url` option",
                config.robot_id
            ))
        })?;
        let mut adapter = Self::new(config.robot_id.clone(), url);
        let topics = &mut adapter.topics;
        let overrides: [(&str, &mut String); 6] = [
            ("cmd_vel_topic", &mut topics.cmd_vel),
            ("odom_topic", &mut topics.odom),
            ("battery_topic", &mut topics.battery),
            ("goal_topic", &mut topics.goal),
            ("estop_topic", &mut topics.estop),
            ("cancel_service", &mut topics.cancel_service),
        ];
        for (key, slot) in overrides {
            if let Some(value) = config.option(key) {
                *slot = value.to_string();
            }
        }
        Ok(adapter)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn topics(&self) -> &RosTopics {
        &self.topics
    }

    /// Frames sent right after the WebSocket opens.
    fn setup_frames(&self) -> Vec<String> {
        vec![
            advertise_frame(&self.topics.cmd_vel, "geometry_msgs/msg/Twist"),
            advertise_frame(&self.topics.goal, "geometry_msgs/msg/PoseStamped"),
            advertise_frame(&self.topics.estop, "std_msgs/msg/Bool"),
            subscribe_frame(&self.topics.odom, "nav_msgs/msg/Odometry"),
            subscribe_frame(&self.topics.battery, "sensor_msgs/msg/BatteryState"),
        ]
    }

    fn link_error(&self, details: impl Into<String>) -> GatewayError {
        GatewayError::Adapter {
            robot_id: self.robot_id.clone(),
            details: details.into(),
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<String>, GatewayError> {
        let sender = self.outbound.lock().clone();
        sender
            .filter(|_| self.is_connected())
            .ok_or_else(|| self.link_error("rosbridge link is not connected"))
    }

    /// Queue `frame` for the writer task, waiting for room.
    async fn publish(&self, frame: String) -> Result<(), GatewayError> {
        self.sender()?
            .send(frame)
            .await
            .map_err(|_| self.link_error("rosbridge link closed"))
    }

    /// Queue `frame` without waiting.  A full queue means the socket is
    /// stalled, which is reported instead of blocking the caller.
    fn publish_now(&self, frame: String) -> Result<(), GatewayError> {
        self.sender()?.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => self.link_error("rosbridge outbound queue is full"),
            mpsc::error::TrySendError::Closed(_) => self.link_error("rosbridge link closed"),
        })
    }
}

#[async_trait]
impl RobotAdapter for RosbridgeAdapter {
    fn robot_id(&self) -> &str {
        &self.robot_id
    }

    async fn connect(&self) -> Result<(), GatewayError> {
        if self.is_connected() {
            return Ok(());
        }

        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| self.link_error(format!("connect to {}: {e}", self.url)))?;
        let (mut sink, mut source) = ws.split();

        for frame in self.setup_frames() {
            sink.send(Message::Text(frame.into()))
                .await
                .map_err(|e| self.link_error(format!("rosbridge setup: {e}")))?;
        }

        let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
        self.connected.store(true, Ordering::SeqCst);

        // ── Writer: outbound queue → rosbridge ─────────────────────────────
        let connected = Arc::clone(&self.connected);
        let robot_id = self.robot_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame.into())).await {
                    warn!(robot_id = %robot_id, error = %e, "rosbridge write failed");
                    break;
                }
            }
            let _ = sink.close().await;
            connected.store(false, Ordering::SeqCst);
        });

        // ── Reader: rosbridge → sensor channel ─────────────────────────────
        let connected = Arc::clone(&self.connected);
        let robot_id = self.robot_id.clone();
        let sensor_tx = self.sensor_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Some(sample) = parse_inbound(&robot_id, text.as_str()) {
                            let _ = sensor_tx.send(sample);
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(robot_id = %robot_id, error = %e, "rosbridge read failed");
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
            debug!(robot_id = %robot_id, "rosbridge reader finished");
        });

        *self.outbound.lock() = Some(tx);
        *self.tasks.lock() = Some(LinkTasks { writer, reader });
        info!(robot_id = %self.robot_id, url = %self.url, "rosbridge connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), GatewayError> {
        // Dropping the sender lets the writer flush and close the socket.
        self.outbound.lock().take();
        self.connected.store(false, Ordering::SeqCst);
        if let Some(tasks) = self.tasks.lock().take() {
            // The reader would otherwise wait for the peer to close.
            tasks.reader.abort();
            drop(tasks.writer);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_command(&self, command: RobotCommand) -> Result<(), GatewayError> {
        let frame = match &command {
            RobotCommand::Velocity { linear, angular } => {
                twist_frame(&self.topics.cmd_vel, *linear, *angular)
            }
            RobotCommand::Stop => twist_frame(&self.topics.cmd_vel, Vector3::ZERO, Vector3::ZERO),
            RobotCommand::NavGoal {
                x,
                y,
                theta,
                frame_id,
            } => pose_goal_frame(&self.topics.goal, *x, *y, *theta, frame_id),
            RobotCommand::NavCancel => cancel_goal_frame(&self.topics.cancel_service),
        };
        self.publish(frame).await
    }

    fn sensor_stream(&self) -> BoxStream<'static, SensorData> {
        sensor_stream_from(self.sensor_tx.subscribe())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            velocity: true,
            navigation: true,
            sensors: vec![self.topics.odom.clone(), self.topics.battery.clone()],
            max_linear: None,
            max_angular: None,
        }
    }

    async fn emergency_stop(&self) -> Result<(), GatewayError> {
        self.publish_now(twist_frame(&self.topics.cmd_vel, Vector3::ZERO, Vector3::ZERO))?;
        self.publish_now(estop_frame(&self.topics.estop, true))
    }
}

impl Drop for RosbridgeAdapter {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.get_mut().take() {
            tasks.reader.abort();
            tasks.writer.abort();
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Frame builders
// ────────────────────────────────────────────────────────────────────────────

/// `advertise` op for a topic this adapter publishes on.
pub fn advertise_frame(topic: &str, msg_type: &str) -> String {
    json!({ "op": "advertise", "topic": topic, "type": msg_type }).to_string()
}

/// `subscribe` op for a telemetry topic.
pub fn subscribe_frame(topic: &str, msg_type: &str) -> String {
    json!({ "op": "subscribe", "topic": topic, "type": msg_type }).to_string()
}

/// `geometry_msgs/msg/Twist` publish.
pub fn twist_frame(topic: &str, linear: Vector3, angular: Vector3) -> String {
    json!({
        "op": "publish",
        "topic": topic,
        "msg": {
            "linear":  { "x": linear.x,  "y": linear.y,  "z": linear.z },
            "angular": { "x": angular.x, "y": angular.y, "z": angular.z }
        }
    })
    .to_string()
}

/// `geometry_msgs/msg/PoseStamped` publish with the yaw encoded as a
/// quaternion about Z.
pub fn pose_goal_frame(topic: &str, x: f64, y: f64, theta: f64, frame_id: &str) -> String {
    let half = theta / 2.0;
    json!({
        "op": "publish",
        "topic": topic,
        "msg": {
            "header": { "frame_id": frame_id },
            "pose": {
                "position": { "x": x, "y": y, "z": 0.0 },
                "orientation": { "x": 0.0, "y": 0.0, "z": half.sin(), "w": half.cos() }
            }
        }
    })
    .to_string()
}

/// `call_service` op that cancels every active navigation goal.
pub fn cancel_goal_frame(service: &str) -> String {
    json!({ "op": "call_service", "service": service, "args": {} }).to_string()
}

/// `std_msgs/msg/Bool` publish on the hardware e-stop topic.
pub fn estop_frame(topic: &str, engaged: bool) -> String {
    json!({ "op": "publish", "topic": topic, "msg": { "data": engaged } }).to_string()
}

/// Translate an inbound rosbridge frame into a telemetry sample.
///
/// Only `publish` ops carry telemetry; everything else (status, service
/// responses, malformed JSON) yields `None`.
pub fn parse_inbound(robot_id: &str, text: &str) -> Option<SensorData> {
    let frame: Value = serde_json::from_str(text).ok()?;
    if frame.get("op").and_then(Value::as_str) != Some("publish") {
        return None;
    }
    let topic = frame.get("topic").and_then(Value::as_str)?;
    let msg = frame.get("msg").cloned().unwrap_or(Value::Null);
    Some(SensorData {
        robot_id: robot_id.to_string(),
        timestamp: Utc::now(),
        data: json!({ "topic": topic, "msg": msg }),
    })
}
