//! [`BackendBridge`] – hand-off of recorded data to the backend.
//!
//! The handler publishes telemetry samples and executed commands for every
//! robot whose recording is switched on.  Publishing is fire-and-forget: it
//! never blocks the command path, and a slow consumer loses events rather
//! than slowing robots down.
//!
//! Two implementations ship with the gateway:
//!
//! - [`ChannelBridge`] – a bounded queue drained by whatever persists the
//!   data (the embedding backend, or the binary's recording log).
//! - [`NoopBridge`] – discards everything; used when recording is disabled.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// One executed command, as handed to the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandRecord {
    pub robot_id: String,
    pub user_id: String,
    pub command: String,
    pub params: Value,
    pub success: bool,
    /// Latest telemetry seen before the command went out.
    pub state_before: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// Everything a bridge can carry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeEvent {
    SensorData {
        robot_id: String,
        payload: Value,
        timestamp: DateTime<Utc>,
    },
    CommandData(CommandRecord),
}

pub trait BackendBridge: Send + Sync {
    fn publish_sensor_data(&self, robot_id: &str, payload: &Value);

    fn publish_command_data(&self, record: CommandRecord);
}

/// Bridge backed by a bounded `mpsc` queue.
pub struct ChannelBridge {
    tx: mpsc::Sender<BridgeEvent>,
}

impl ChannelBridge {
    /// Create a bridge holding at most `capacity` undelivered events.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<BridgeEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    fn offer(&self, event: BridgeEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("recording queue full, dropping event"),
            Err(TrySendError::Closed(_)) => debug!("recording consumer gone, dropping event"),
        }
    }
}

impl BackendBridge for ChannelBridge {
    fn publish_sensor_data(&self, robot_id: &str, payload: &Value) {
        self.offer(BridgeEvent::SensorData {
            robot_id: robot_id.to_string(),
            payload: payload.clone(),
            timestamp: Utc::now(),
        });
    }

    fn publish_command_data(&self, record: CommandRecord) {
        self.offer(BridgeEvent::CommandData(record));
    }
}

pub struct NoopBridge;

impl BackendBridge for NoopBridge {
    fn publish_sensor_data(&self, _robot_id: &str, _payload: &Value) {}

    fn publish_command_data(&self, _record: CommandRecord) {}
}
