//! `fleet-types` – shared vocabulary of the fleet gateway.
//!
//! Everything that crosses a crate boundary lives here: the wire
//! [`Message`] envelope and its typed payloads, the [`RobotCommand`] and
//! [`SensorData`] values exchanged with robot adapters, and the
//! [`GatewayError`] type used by every fallible operation.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Identity of a single WebSocket connection.
pub type ClientId = Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Message envelope
// ────────────────────────────────────────────────────────────────────────────

/// Every message type understood on the `/ws` endpoint.
///
/// Client → gateway: `auth`, `velocity_cmd`, `nav_goal`, `nav_cancel`,
/// `estop`, `op_lock`, `op_unlock`, `ping`, `subscribe`, `unsubscribe`,
/// `record_start`, `record_stop`.
///
/// Gateway → client: `sensor_data`, `robot_status`, `cmd_ack`,
/// `lock_status`, `conn_status`, `error`, `pong`, `safety_alert`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Auth,
    VelocityCmd,
    NavGoal,
    NavCancel,
    Estop,
    OpLock,
    OpUnlock,
    Ping,
    Subscribe,
    Unsubscribe,
    RecordStart,
    RecordStop,
    SensorData,
    RobotStatus,
    CmdAck,
    LockStatus,
    ConnStatus,
    Error,
    Pong,
    SafetyAlert,
}

impl MessageType {
    /// Wire name of the type (`"velocity_cmd"`, `"estop"`, …).
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Auth => "auth",
            MessageType::VelocityCmd => "velocity_cmd",
            MessageType::NavGoal => "nav_goal",
            MessageType::NavCancel => "nav_cancel",
            MessageType::Estop => "estop",
            MessageType::OpLock => "op_lock",
            MessageType::OpUnlock => "op_unlock",
            MessageType::Ping => "ping",
            MessageType::Subscribe => "subscribe",
            MessageType::Unsubscribe => "unsubscribe",
            MessageType::RecordStart => "record_start",
            MessageType::RecordStop => "record_stop",
            MessageType::SensorData => "sensor_data",
            MessageType::RobotStatus => "robot_status",
            MessageType::CmdAck => "cmd_ack",
            MessageType::LockStatus => "lock_status",
            MessageType::ConnStatus => "conn_status",
            MessageType::Error => "error",
            MessageType::Pong => "pong",
            MessageType::SafetyAlert => "safety_alert",
        }
    }

    /// `true` for types an unauthenticated client is allowed to send.
    pub fn allowed_before_auth(&self) -> bool {
        matches!(self, MessageType::Auth)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The wire envelope carried in every WebSocket frame.
///
/// A `Message` is built once per frame and never mutated after decoding.
/// The `payload` is kept as raw JSON; use [`Message::payload_as`] to obtain
/// the typed payload for the message's [`MessageType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub robot_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    /// A fresh message of `msg_type` stamped with the current time.
    pub fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            robot_id: String::new(),
            user_id: String::new(),
            timestamp: Utc::now(),
            payload: Value::Null,
            error: None,
        }
    }

    pub fn with_robot(mut self, robot_id: impl Into<String>) -> Self {
        self.robot_id = robot_id.into();
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    /// Attach a typed payload.
    ///
    /// Payload types in this crate always serialize to a JSON object; a
    /// value that cannot be represented leaves the payload empty.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Self {
        self.payload = serde_json::to_value(payload).unwrap_or_default();
        self
    }

    /// Build an `error` message carrying `code` and a human-readable reason.
    pub fn error(code: ErrorCode, reason: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageType::Error).with_payload(&ErrorPayload { code });
        msg.error = Some(reason.into());
        msg
    }

    /// Deserialize the payload into `T`.
    ///
    /// A missing payload is treated as an empty object so that payload types
    /// whose fields all have defaults can still be decoded.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, GatewayError> {
        let value = if self.payload.is_null() {
            Value::Object(Default::default())
        } else {
            self.payload.clone()
        };
        serde_json::from_value(value).map_err(|e| {
            GatewayError::Decode(format!("invalid {} payload: {e}", self.msg_type))
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Payloads
// ────────────────────────────────────────────────────────────────────────────

/// `auth` – a bearer token issued by the external identity service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub token: String,
}

/// A plain 3-component vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

impl Vector3 {
    pub const ZERO: Vector3 = Vector3 { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean magnitude.
    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn scale(&self, factor: f64) -> Self {
        Self::new(self.x * factor, self.y * factor, self.z * factor)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// `velocity_cmd` – a twist in the robot's base frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VelocityCmdPayload {
    #[serde(default)]
    pub linear_x: f64,
    #[serde(default)]
    pub linear_y: f64,
    #[serde(default)]
    pub linear_z: f64,
    #[serde(default)]
    pub angular_x: f64,
    #[serde(default)]
    pub angular_y: f64,
    #[serde(default)]
    pub angular_z: f64,
}

impl VelocityCmdPayload {
    pub fn linear(&self) -> Vector3 {
        Vector3::new(self.linear_x, self.linear_y, self.linear_z)
    }

    pub fn angular(&self) -> Vector3 {
        Vector3::new(self.angular_x, self.angular_y, self.angular_z)
    }

    pub fn from_vectors(linear: Vector3, angular: Vector3) -> Self {
        Self {
            linear_x: linear.x,
            linear_y: linear.y,
            linear_z: linear.z,
            angular_x: angular.x,
            angular_y: angular.y,
            angular_z: angular.z,
        }
    }
}

fn default_frame_id() -> String {
    "map".to_string()
}

/// `nav_goal` – a 2-D pose goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavGoalPayload {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub theta: f64,
    #[serde(default = "default_frame_id")]
    pub frame_id: String,
}

/// `estop` – activate or release an emergency stop.
///
/// With `all: true` the request applies to every robot (global stop);
/// otherwise it applies to the envelope's `robot_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EStopPayload {
    pub activate: bool,
    #[serde(default)]
    pub all: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `cmd_ack` – outcome of a robot command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmdAckPayload {
    pub command: MessageType,
    pub success: bool,
    #[serde(default)]
    pub clamped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied: Option<VelocityCmdPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `lock_status` – state of a robot's operation lock as seen by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockStatusPayload {
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `conn_status` – the caller's session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnStatusPayload {
    pub client_id: ClientId,
    pub authenticated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub subscriptions: Vec<String>,
}

/// Kind of a `safety_alert`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyAlertKind {
    EstopActivated,
    EstopReleased,
}

/// `safety_alert` – broadcast to every connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyAlertPayload {
    pub alert: SafetyAlertKind,
    /// Robots affected; empty together with `global: true` for fleet-wide
    /// events.
    #[serde(default)]
    pub robots: Vec<String>,
    #[serde(default)]
    pub global: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Per-robot adapter failures encountered while applying the stop.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

/// Coarse robot state reported in `robot_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotState {
    Online,
    Offline,
    Stopped,
    EmergencyStopped,
}

/// `robot_status` – a snapshot of one robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotStatusPayload {
    pub state: RobotState,
    pub connected: bool,
    pub estop_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_holder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
}

/// `error` – machine-readable part of an error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
}

/// Stable error codes sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidMessage,
    NotAuthenticated,
    AuthFailed,
    EstopActive,
    LockHeld,
    LockRequired,
    LockNotHeld,
    InvalidCommand,
    RobotNotFound,
    AdapterError,
    RateLimited,
    Forbidden,
    Internal,
}

// ────────────────────────────────────────────────────────────────────────────
// Robot-side values
// ────────────────────────────────────────────────────────────────────────────

/// A command as delivered to a robot adapter.
///
/// By the time a command is built the safety checks have already run; the
/// adapter only translates it into its protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "params", rename_all = "snake_case")]
pub enum RobotCommand {
    /// Body-frame twist.
    Velocity { linear: Vector3, angular: Vector3 },
    /// Navigate to a 2-D pose.
    NavGoal {
        x: f64,
        y: f64,
        theta: f64,
        frame_id: String,
    },
    /// Abort the active navigation goal.
    NavCancel,
    /// Bring the robot to rest (zero twist).
    Stop,
}

impl RobotCommand {
    /// Short name used in logs and recording records.
    pub fn name(&self) -> &'static str {
        match self {
            RobotCommand::Velocity { .. } => "velocity",
            RobotCommand::NavGoal { .. } => "nav_goal",
            RobotCommand::NavCancel => "nav_cancel",
            RobotCommand::Stop => "stop",
        }
    }

    /// `true` for commands that can set a robot in motion.
    pub fn is_motion(&self) -> bool {
        matches!(self, RobotCommand::Velocity { .. } | RobotCommand::NavGoal { .. })
    }
}

/// One telemetry sample produced by an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorData {
    pub robot_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

/// What a robot back-end can do.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub velocity: bool,
    pub navigation: bool,
    #[serde(default)]
    pub sensors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_linear: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_angular: Option<f64>,
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Error type shared by every gateway crate.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Emergency stop active for robot {0}")]
    EStopActive(String),

    #[error("Robot {robot_id} is locked by another user ({holder})")]
    LockHeld { robot_id: String, holder: String },

    #[error("Robot {0} requires an operation lock")]
    LockRequired(String),

    #[error("Operation lock on robot {0} is not held by the caller")]
    LockNotHeld(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Robot not found: {0}")]
    RobotNotFound(String),

    #[error("Unknown driver: {0}")]
    UnknownDriver(String),

    #[error("Adapter error on {robot_id}: {details}")]
    Adapter { robot_id: String, details: String },

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// The [`ErrorCode`] reported to clients for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::Decode(_) | GatewayError::MessageTooLarge { .. } => {
                ErrorCode::InvalidMessage
            }
            GatewayError::NotAuthenticated => ErrorCode::NotAuthenticated,
            GatewayError::AuthFailed(_) => ErrorCode::AuthFailed,
            GatewayError::EStopActive(_) => ErrorCode::EstopActive,
            GatewayError::LockHeld { .. } => ErrorCode::LockHeld,
            GatewayError::LockRequired(_) => ErrorCode::LockRequired,
            GatewayError::LockNotHeld(_) => ErrorCode::LockNotHeld,
            GatewayError::InvalidCommand(_) => ErrorCode::InvalidCommand,
            GatewayError::RobotNotFound(_) | GatewayError::UnknownDriver(_) => {
                ErrorCode::RobotNotFound
            }
            GatewayError::Adapter { .. } => ErrorCode::AdapterError,
            GatewayError::RateLimited => ErrorCode::RateLimited,
            GatewayError::Forbidden(_) => ErrorCode::Forbidden,
            GatewayError::Channel(_) | GatewayError::Config(_) | GatewayError::Io(_) => {
                ErrorCode::Internal
            }
        }
    }
}
