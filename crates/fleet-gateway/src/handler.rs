//! [`Handler`] – what the gateway does with each client message.
//!
//! The read pump hands every frame to [`Handler::handle_frame`], which
//! decodes it and passes it on to [`Handler::handle_message`].
//! Before dispatch each frame passes three gates, in order:
//!
//! 1. the codec (malformed → `error{invalid_message}`),
//! 2. the client's inbound rate limit (`estop` is exempt),
//! 3. authentication (only `auth` is accepted before it).
//!
//! Robot commands then go through the [`SafetyGate`] and, if accepted, to
//! the robot's [`RobotAdapter`].  The sender always gets an answer:
//! `cmd_ack` for commands, `lock_status` for lock requests, `conn_status`
//! for session changes and `error` for everything else that fails.
//!
//! The handler also owns the background work tied to robots:
//!
//! - one telemetry task per robot, relaying `sensor_data` to subscribers,
//! - the lock sweeper, announcing expired locks,
//! - the watchdog callback, stopping robots that went quiet.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use fleet_adapters::{AdapterRegistry, RobotAdapter};
use fleet_safety::{
    EStopManager, OperationLock, SafetyGate, TimeoutCallback, TimeoutWatchdog, VelocityLimiter,
};
use fleet_types::{
    AuthPayload, CmdAckPayload, ConnStatusPayload, EStopPayload, ErrorCode, GatewayError,
    LockStatusPayload, Message, MessageType, NavGoalPayload, RobotCommand, RobotState,
    RobotStatusPayload, SafetyAlertKind, SafetyAlertPayload, SensorData, VelocityCmdPayload,
};
use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::TokenValidator;
use crate::bridge::{BackendBridge, CommandRecord};
use crate::client::{Client, DeliveryError};
use crate::codec;
use crate::config::GatewayConfig;
use crate::hub::Hub;

/// Which robots have recording switched on.
struct Recording {
    enabled: bool,
    all: bool,
    robots: Mutex<HashSet<String>>,
}

impl Recording {
    fn is_on(&self, robot_id: &str) -> bool {
        self.enabled && (self.all || self.robots.lock().contains(robot_id))
    }
}

pub struct Handler {
    hub: Arc<Hub>,
    registry: Arc<AdapterRegistry>,
    gate: SafetyGate,
    validator: Arc<TokenValidator>,
    bridge: Arc<dyn BackendBridge>,
    recording: Recording,
    /// Latest telemetry sample per robot.
    latest: Mutex<HashMap<String, Value>>,
    max_message_bytes: usize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Handler {
    /// Build the handler and its safety interlocks from `config`.
    ///
    /// Background tasks are not started; call [`Handler::start`].
    ///
    /// # Errors
    ///
    /// [`GatewayError::Config`] for invalid velocity limits.
    pub fn new(
        config: &GatewayConfig,
        hub: Arc<Hub>,
        registry: Arc<AdapterRegistry>,
        validator: Arc<TokenValidator>,
        bridge: Arc<dyn BackendBridge>,
    ) -> Result<Arc<Self>, GatewayError> {
        let safety = &config.safety;
        let estop = Arc::new(EStopManager::new(Arc::clone(&registry)));
        let locks = Arc::new(OperationLock::new(safety.lock_ttl()));
        let limiter = VelocityLimiter::new(safety.max_linear, safety.max_angular)?;
        let on_timeout = watchdog_callback(
            Arc::clone(&registry),
            Arc::clone(&estop),
            Arc::clone(&locks),
            Arc::clone(&hub),
        );
        let watchdog = Arc::new(TimeoutWatchdog::new(safety.watchdog_timeout(), on_timeout));
        let gate = SafetyGate::new(estop, locks, limiter, watchdog).with_require_lock(safety.require_lock);

        Ok(Arc::new(Self {
            hub,
            registry,
            gate,
            validator,
            bridge,
            recording: Recording {
                enabled: config.recording.enabled,
                all: config.recording.record_all,
                robots: Mutex::new(HashSet::new()),
            },
            latest: Mutex::new(HashMap::new()),
            max_message_bytes: config.server.max_message_bytes,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Spawn a telemetry relay for every registered robot and the lock
    /// sweeper.
    pub fn start(self: &Arc<Self>, lock_sweep_interval: std::time::Duration) {
        for adapter in self.registry.adapters() {
            self.attach_robot(adapter);
        }

        let hub = Arc::clone(&self.hub);
        let sweeper = Arc::clone(self.gate.locks()).spawn_sweeper(lock_sweep_interval, move |robot_id, _| {
            let notice = Message::new(MessageType::LockStatus)
                .with_robot(robot_id.as_str())
                .with_payload(&LockStatusPayload {
                    locked: false,
                    holder: None,
                    expires_at: None,
                    reason: Some("expired".to_string()),
                });
            if let Some(frame) = encode_or_log(&notice) {
                hub.broadcast_to_robot(&robot_id, frame);
            }
        });
        self.tasks.lock().push(sweeper);
    }

    /// Start relaying telemetry for one robot.
    pub fn attach_robot(self: &Arc<Self>, adapter: Arc<dyn RobotAdapter>) {
        let handler = Arc::downgrade(self);
        let task = tokio::spawn(relay_telemetry(handler, adapter));
        self.tasks.lock().push(task);
    }

    pub fn validator(&self) -> &Arc<TokenValidator> {
        &self.validator
    }

    pub fn gate(&self) -> &SafetyGate {
        &self.gate
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Latest telemetry sample seen for `robot_id`.
    pub fn latest_state(&self, robot_id: &str) -> Option<Value> {
        self.latest.lock().get(robot_id).cloned()
    }

    pub fn is_recording(&self, robot_id: &str) -> bool {
        self.recording.is_on(robot_id)
    }

    // ── Frame entry points ──────────────────────────────────────────────────

    /// Decode and dispatch one inbound frame from `client`.
    pub async fn handle_frame(&self, client: &Arc<Client>, frame: &[u8]) {
        let msg = match codec::decode(frame, self.max_message_bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(client_id = %client.id(), error = %e, "rejecting malformed frame");
                self.reply(client, Message::error(e.code(), e.to_string()));
                return;
            }
        };
        self.handle_message(client, msg).await;
    }

    /// Apply the rate limit and the auth gate to a decoded message, then
    /// dispatch it.
    pub async fn handle_message(&self, client: &Arc<Client>, msg: Message) {
        if msg.msg_type != MessageType::Estop && !client.allow_message() {
            warn!(client_id = %client.id(), msg_type = %msg.msg_type, "inbound rate limit exceeded");
            self.reply(client, Message::error(ErrorCode::RateLimited, GatewayError::RateLimited.to_string()));
            return;
        }

        let user_id = match client.user_id() {
            Some(user_id) => user_id,
            None if msg.msg_type.allowed_before_auth() => String::new(),
            None => {
                debug!(client_id = %client.id(), msg_type = %msg.msg_type, "message before auth");
                self.reply(
                    client,
                    Message::error(ErrorCode::NotAuthenticated, GatewayError::NotAuthenticated.to_string()),
                );
                return;
            }
        };

        self.dispatch(client, &user_id, msg).await;
    }

    /// Tell `client` its last frame was over the size limit.
    pub fn reject_oversized(&self, client: &Client, size: usize, limit: usize) {
        let err = GatewayError::MessageTooLarge { size, limit };
        self.reply(client, Message::error(err.code(), err.to_string()));
    }

    /// Remove `client` from the hub; its write pump ends once the queue
    /// drains.
    pub async fn disconnect(&self, client: &Client) {
        if let Err(e) = self.hub.unregister(client.id()).await {
            warn!(client_id = %client.id(), error = %e, "unregister failed");
        }
        info!(
            client_id = %client.id(),
            user_id = client.user_id().as_deref().unwrap_or(""),
            "client disconnected"
        );
    }

    async fn dispatch(&self, client: &Arc<Client>, user_id: &str, msg: Message) {
        match msg.msg_type {
            MessageType::Auth => self.on_auth(client, &msg),
            MessageType::VelocityCmd => {
                let reply = self.on_velocity(user_id, &msg).await;
                self.reply(client, reply);
            }
            MessageType::NavGoal => {
                let result = self.on_nav_goal(user_id, &msg).await;
                self.reply(client, ack(&msg, result.map(|()| (false, None))));
            }
            MessageType::NavCancel => {
                let result = self.on_nav_cancel(user_id, &msg).await;
                self.reply(client, ack(&msg, result.map(|()| (false, None))));
            }
            MessageType::Estop => self.on_estop(client, user_id, &msg).await,
            MessageType::OpLock => self.on_op_lock(client, user_id, &msg),
            MessageType::OpUnlock => self.on_op_unlock(client, user_id, &msg),
            MessageType::Ping => {
                let mut pong = Message::new(MessageType::Pong).with_robot(msg.robot_id.as_str());
                pong.payload = msg.payload;
                self.reply(client, pong);
            }
            MessageType::Subscribe => self.on_subscribe(client, &msg),
            MessageType::Unsubscribe => {
                client.unsubscribe(&msg.robot_id);
                self.reply(client, conn_status(client));
            }
            MessageType::RecordStart | MessageType::RecordStop => {
                let result = self.on_record(&msg);
                self.reply(client, ack(&msg, result.map(|()| (false, None))));
            }
            MessageType::SensorData
            | MessageType::RobotStatus
            | MessageType::CmdAck
            | MessageType::LockStatus
            | MessageType::ConnStatus
            | MessageType::Error
            | MessageType::Pong
            | MessageType::SafetyAlert => {
                self.reply(
                    client,
                    Message::error(
                        ErrorCode::InvalidMessage,
                        format!("{} is not accepted from clients", msg.msg_type),
                    ),
                );
            }
        }
    }

    // ── Session ─────────────────────────────────────────────────────────────

    fn on_auth(&self, client: &Client, msg: &Message) {
        let claims = msg
            .payload_as::<AuthPayload>()
            .and_then(|p| self.validator.validate(&p.token));
        match claims {
            Ok(claims) => {
                info!(client_id = %client.id(), user_id = %claims.sub, "client authenticated");
                client.authenticate(claims.sub, claims.role);
                self.reply(client, conn_status(client));
            }
            Err(e) => {
                warn!(client_id = %client.id(), error = %e, "authentication failed");
                self.reply(client, Message::error(e.code(), e.to_string()));
            }
        }
    }

    fn on_subscribe(&self, client: &Client, msg: &Message) {
        let adapter = match self.registry.get(&msg.robot_id) {
            Ok(adapter) => adapter,
            Err(e) => {
                self.reply(client, Message::error(e.code(), e.to_string()));
                return;
            }
        };
        client.subscribe(&msg.robot_id);
        self.reply(client, conn_status(client));

        let status = status_snapshot(adapter.as_ref(), self.gate.estop(), self.gate.locks());
        self.reply(
            client,
            Message::new(MessageType::RobotStatus)
                .with_robot(msg.robot_id.as_str())
                .with_payload(&status),
        );
    }

    // ── Motion commands ─────────────────────────────────────────────────────

    async fn on_velocity(&self, user_id: &str, msg: &Message) -> Message {
        let result = async {
            let request: VelocityCmdPayload = msg.payload_as()?;
            let adapter = self.registry.get(&msg.robot_id)?;
            let limited =
                self.gate
                    .check_velocity(&msg.robot_id, user_id, request.linear(), request.angular())?;
            if limited.clamped {
                debug!(robot_id = %msg.robot_id, user_id, "velocity clamped");
            }
            let command = RobotCommand::Velocity {
                linear: limited.linear,
                angular: limited.angular,
            };
            self.execute(adapter.as_ref(), user_id, command).await?;
            Ok::<_, GatewayError>((
                limited.clamped,
                Some(VelocityCmdPayload::from_vectors(limited.linear, limited.angular)),
            ))
        }
        .await;
        ack(msg, result)
    }

    async fn on_nav_goal(&self, user_id: &str, msg: &Message) -> Result<(), GatewayError> {
        let goal: NavGoalPayload = msg.payload_as()?;
        let adapter = self.registry.get(&msg.robot_id)?;
        self.gate
            .check_nav_goal(&msg.robot_id, user_id, goal.x, goal.y, goal.theta)?;
        let command = RobotCommand::NavGoal {
            x: goal.x,
            y: goal.y,
            theta: goal.theta,
            frame_id: goal.frame_id,
        };
        self.execute(adapter.as_ref(), user_id, command).await
    }

    async fn on_nav_cancel(&self, user_id: &str, msg: &Message) -> Result<(), GatewayError> {
        let adapter = self.registry.get(&msg.robot_id)?;
        self.gate.check_nav_cancel(&msg.robot_id, user_id)?;
        self.execute(adapter.as_ref(), user_id, RobotCommand::NavCancel).await
    }

    /// Send an already-gated command and record it when recording is on.
    ///
    /// A motion command re-checks the E-Stop right before it goes out.  If a
    /// stop lands while the command is in flight, the stop is sent again so
    /// it reaches the robot after the command.
    async fn execute(
        &self,
        adapter: &dyn RobotAdapter,
        user_id: &str,
        command: RobotCommand,
    ) -> Result<(), GatewayError> {
        let robot_id = adapter.robot_id();
        let recording = self.recording.is_on(robot_id);
        let state_before = if recording { self.latest_state(robot_id) } else { None };
        let params = recording.then(|| serde_json::to_value(&command).unwrap_or(Value::Null));
        let name = command.name();
        let motion = command.is_motion();
        let estop = self.gate.estop();
        if motion {
            estop.check(robot_id)?;
        }

        let mut result = adapter.send_command(command).await;
        if let Err(e) = &result {
            error!(robot_id, user_id, command = name, error = %e, "adapter rejected command");
        }
        if motion && estop.is_active(robot_id) {
            warn!(robot_id, user_id, command = name, "emergency stop raced a command, stopping again");
            if let Err(e) = estop.reapply(robot_id).await {
                error!(robot_id, error = %e, "repeat emergency stop failed");
            }
            result = Err(GatewayError::EStopActive(robot_id.to_string()));
        }
        if let Some(params) = params {
            self.bridge.publish_command_data(CommandRecord {
                robot_id: robot_id.to_string(),
                user_id: user_id.to_string(),
                command: name.to_string(),
                params,
                success: result.is_ok(),
                state_before,
                timestamp: chrono::Utc::now(),
            });
        }
        result
    }

    // ── Emergency stop ──────────────────────────────────────────────────────

    async fn on_estop(&self, client: &Client, user_id: &str, msg: &Message) {
        let request: EStopPayload = match msg.payload_as() {
            Ok(request) => request,
            Err(e) => {
                self.reply(client, ack(msg, Err(e)));
                return;
            }
        };
        let role = client.role();
        let estop = self.gate.estop();

        let result = match (request.activate, request.all) {
            (true, true) => {
                let report = estop.activate_all(user_id, request.reason.clone()).await;
                let failed = report.failures.iter().map(|(robot_id, _)| robot_id);
                for robot_id in report.stopped.iter().chain(failed) {
                    self.gate.watchdog().disarm(robot_id);
                }
                let failures: Vec<String> = report
                    .failures
                    .iter()
                    .map(|(robot_id, e)| format!("{robot_id}: {e}"))
                    .collect();
                self.broadcast_alert(SafetyAlertPayload {
                    alert: SafetyAlertKind::EstopActivated,
                    robots: report.stopped.clone(),
                    global: true,
                    reason: request.reason,
                    failures: failures.clone(),
                });
                if report.is_complete() {
                    Ok(())
                } else {
                    Err(GatewayError::Adapter {
                        robot_id: "*".to_string(),
                        details: failures.join("; "),
                    })
                }
            }
            (true, false) => {
                let robot_id = msg.robot_id.as_str();
                let result = estop.activate(robot_id, user_id, request.reason.clone()).await;
                // A failed adapter call still leaves the robot marked stopped.
                if estop.is_active(robot_id) {
                    self.gate.watchdog().disarm(robot_id);
                    self.broadcast_alert(SafetyAlertPayload {
                        alert: SafetyAlertKind::EstopActivated,
                        robots: vec![robot_id.to_string()],
                        global: false,
                        reason: request.reason,
                        failures: result.as_ref().err().map(|e| e.to_string()).into_iter().collect(),
                    });
                }
                result
            }
            (false, true) => estop.release_all(user_id, role.as_deref()).map(|cleared| {
                self.broadcast_alert(SafetyAlertPayload {
                    alert: SafetyAlertKind::EstopReleased,
                    robots: Vec::new(),
                    global: true,
                    reason: request.reason,
                    failures: Vec::new(),
                });
                debug!(user_id, cleared, "global release broadcast");
            }),
            (false, false) => {
                let robot_id = msg.robot_id.as_str();
                estop.release(robot_id, user_id, role.as_deref()).map(|released| {
                    if released {
                        self.broadcast_alert(SafetyAlertPayload {
                            alert: SafetyAlertKind::EstopReleased,
                            robots: vec![robot_id.to_string()],
                            global: false,
                            reason: request.reason,
                            failures: Vec::new(),
                        });
                    }
                })
            }
        };
        if let Err(e) = &result {
            warn!(robot_id = %msg.robot_id, user_id, error = %e, "estop request failed");
        }
        self.reply(client, ack(msg, result.map(|()| (false, None))));
    }

    fn broadcast_alert(&self, alert: SafetyAlertPayload) {
        if let Some(frame) = encode_or_log(&Message::new(MessageType::SafetyAlert).with_payload(&alert)) {
            self.hub.broadcast_to_all(frame);
        }
    }

    // ── Operation locks ─────────────────────────────────────────────────────

    fn on_op_lock(&self, client: &Client, user_id: &str, msg: &Message) {
        let robot_id = msg.robot_id.as_str();
        if !self.registry.contains(robot_id) {
            let err = GatewayError::RobotNotFound(robot_id.to_string());
            self.reply(client, Message::error(err.code(), err.to_string()));
            return;
        }
        let status = match self.gate.locks().acquire(robot_id, user_id) {
            Ok(record) => {
                client.subscribe(robot_id);
                LockStatusPayload {
                    locked: true,
                    holder: Some(record.user_id),
                    expires_at: Some(record.expires_at),
                    reason: None,
                }
            }
            Err(GatewayError::LockHeld { holder, .. }) => {
                warn!(robot_id, user_id, holder = %holder, "lock contention");
                LockStatusPayload {
                    locked: false,
                    holder: Some(holder),
                    expires_at: None,
                    reason: Some("held_by_other_user".to_string()),
                }
            }
            Err(e) => {
                self.reply(client, Message::error(e.code(), e.to_string()));
                return;
            }
        };
        self.reply(
            client,
            Message::new(MessageType::LockStatus).with_robot(robot_id).with_payload(&status),
        );
    }

    fn on_op_unlock(&self, client: &Client, user_id: &str, msg: &Message) {
        let robot_id = msg.robot_id.as_str();
        match self.gate.locks().release(robot_id, user_id) {
            Ok(()) => self.reply(
                client,
                Message::new(MessageType::LockStatus)
                    .with_robot(robot_id)
                    .with_payload(&LockStatusPayload {
                        locked: false,
                        holder: None,
                        expires_at: None,
                        reason: Some("released".to_string()),
                    }),
            ),
            Err(e) => self.reply(client, Message::error(e.code(), e.to_string())),
        }
    }

    // ── Recording ───────────────────────────────────────────────────────────

    fn on_record(&self, msg: &Message) -> Result<(), GatewayError> {
        if !self.recording.enabled {
            return Err(GatewayError::InvalidCommand("recording is disabled".to_string()));
        }
        if !self.registry.contains(&msg.robot_id) {
            return Err(GatewayError::RobotNotFound(msg.robot_id.clone()));
        }
        let mut robots = self.recording.robots.lock();
        if msg.msg_type == MessageType::RecordStart {
            robots.insert(msg.robot_id.clone());
            info!(robot_id = %msg.robot_id, "recording started");
        } else {
            robots.remove(&msg.robot_id);
            info!(robot_id = %msg.robot_id, "recording stopped");
        }
        Ok(())
    }

    // ── Telemetry ───────────────────────────────────────────────────────────

    fn on_sensor_data(&self, sample: SensorData) {
        self.latest
            .lock()
            .insert(sample.robot_id.clone(), sample.data.clone());
        if self.recording.is_on(&sample.robot_id) {
            self.bridge.publish_sensor_data(&sample.robot_id, &sample.data);
        }

        let mut msg = Message::new(MessageType::SensorData).with_robot(sample.robot_id.as_str());
        msg.timestamp = sample.timestamp;
        msg.payload = sample.data;
        if let Some(frame) = encode_or_log(&msg) {
            self.hub.broadcast_to_robot(&sample.robot_id, frame);
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────────────

    /// Stop background tasks and send `Stop` to every robot.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.gate.watchdog().shutdown();
        self.stop_all_robots().await;
    }

    /// Send `Stop` to every robot, logging failures.  Returns how many
    /// robots acknowledged it.
    pub async fn stop_all_robots(&self) -> usize {
        let mut stopped = 0;
        for adapter in self.registry.adapters() {
            match adapter.send_command(RobotCommand::Stop).await {
                Ok(()) => stopped += 1,
                Err(e) => error!(robot_id = adapter.robot_id(), error = %e, "failed to stop robot"),
            }
        }
        stopped
    }

    fn reply(&self, client: &Client, msg: Message) {
        let Some(frame) = encode_or_log(&msg) else {
            return;
        };
        match client.try_send(frame) {
            Ok(()) => {}
            Err(DeliveryError::Full) => {
                warn!(client_id = %client.id(), msg_type = %msg.msg_type, "send buffer full, dropping reply");
            }
            Err(DeliveryError::Closed) => {}
        }
    }
}

impl Drop for Handler {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Helpers
// ────────────────────────────────────────────────────────────────────────────

async fn relay_telemetry(handler: Weak<Handler>, adapter: Arc<dyn RobotAdapter>) {
    let robot_id = adapter.robot_id().to_string();
    let mut samples = adapter.sensor_stream();
    drop(adapter);
    debug!(robot_id = %robot_id, "telemetry relay started");
    while let Some(sample) = samples.next().await {
        let Some(handler) = handler.upgrade() else {
            break;
        };
        handler.on_sensor_data(sample);
    }
    debug!(robot_id = %robot_id, "telemetry relay ended");
}

/// The callback run when a robot's command watchdog expires: stop the robot
/// and tell its subscribers why.
fn watchdog_callback(
    registry: Arc<AdapterRegistry>,
    estop: Arc<EStopManager>,
    locks: Arc<OperationLock>,
    hub: Arc<Hub>,
) -> TimeoutCallback {
    Arc::new(move |robot_id: String| {
        let registry = Arc::clone(&registry);
        let estop = Arc::clone(&estop);
        let locks = Arc::clone(&locks);
        let hub = Arc::clone(&hub);
        async move {
            warn!(robot_id = %robot_id, "no command within watchdog window, stopping robot");
            let adapter = match registry.get(&robot_id) {
                Ok(adapter) => adapter,
                Err(e) => {
                    error!(robot_id = %robot_id, error = %e, "watchdog fired for unknown robot");
                    return;
                }
            };
            if let Err(e) = adapter.send_command(RobotCommand::Stop).await {
                error!(robot_id = %robot_id, error = %e, "watchdog stop failed");
            }

            let mut status = status_snapshot(adapter.as_ref(), &estop, &locks);
            if status.state == RobotState::Online {
                status.state = RobotState::Stopped;
            }
            status.reason = Some("watchdog_timeout".to_string());
            let msg = Message::new(MessageType::RobotStatus)
                .with_robot(robot_id.as_str())
                .with_payload(&status);
            if let Some(frame) = encode_or_log(&msg) {
                hub.broadcast_to_robot(&robot_id, frame);
            }
        }
        .boxed()
    })
}

fn status_snapshot(
    adapter: &dyn RobotAdapter,
    estop: &EStopManager,
    locks: &OperationLock,
) -> RobotStatusPayload {
    let connected = adapter.is_connected();
    let estop_active = estop.is_active(adapter.robot_id());
    let state = if estop_active {
        RobotState::EmergencyStopped
    } else if connected {
        RobotState::Online
    } else {
        RobotState::Offline
    };
    RobotStatusPayload {
        state,
        connected,
        estop_active,
        lock_holder: locks.holder(adapter.robot_id()).map(|r| r.user_id),
        reason: None,
        capabilities: Some(adapter.capabilities()),
    }
}

fn conn_status(client: &Client) -> Message {
    Message::new(MessageType::ConnStatus).with_payload(&ConnStatusPayload {
        client_id: client.id(),
        authenticated: client.is_authenticated(),
        user_id: client.user_id(),
        subscriptions: client.subscriptions(),
    })
}

/// `cmd_ack` for `request`.  `Ok` carries the clamp flag and the applied
/// velocity.
fn ack(request: &Message, result: Result<(bool, Option<VelocityCmdPayload>), GatewayError>) -> Message {
    let payload = match result {
        Ok((clamped, applied)) => CmdAckPayload {
            command: request.msg_type,
            success: true,
            clamped,
            applied,
            code: None,
            message: None,
        },
        Err(e) => CmdAckPayload {
            command: request.msg_type,
            success: false,
            clamped: false,
            applied: None,
            code: Some(e.code()),
            message: Some(e.to_string()),
        },
    };
    Message::new(MessageType::CmdAck)
        .with_robot(request.robot_id.as_str())
        .with_payload(&payload)
}

fn encode_or_log(msg: &Message) -> Option<bytes::Bytes> {
    codec::encode(msg)
        .map_err(|e| error!(msg_type = %msg.msg_type, error = %e, "failed to encode message"))
        .ok()
}
