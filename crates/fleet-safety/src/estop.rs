//! [`EStopManager`] – emergency-stop state for the whole fleet.
//!
//! The manager keeps one [`StopRecord`] per stopped robot plus an optional
//! global record.  A robot counts as stopped while either exists.  The mark
//! is set *before* the adapter is asked to stop, and an adapter failure
//! never clears it: a robot we could not reach is still treated as stopped.
//! Each adapter gets [`DEFAULT_STOP_TIMEOUT`] to confirm; a global stop
//! reaches every adapter concurrently, so one hung link cannot hold back
//! the others.
//!
//! # Release policy
//!
//! | Action | Allowed for |
//! |---|---|
//! | activate (one or all) | any authenticated user |
//! | release one robot | the user who stopped it, or role `admin` / `supervisor` |
//! | release all | role `admin` / `supervisor` |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_adapters::{AdapterRegistry, RobotAdapter};
use fleet_types::GatewayError;
use futures_util::future::join_all;
use parking_lot::Mutex;
use tracing::{error, info, warn};

/// Roles allowed to release stops they did not activate.
pub const RELEASE_ROLES: &[&str] = &["admin", "supervisor"];

/// How long an adapter may take to confirm an emergency stop.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Who stopped a robot, when, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct StopRecord {
    pub user_id: String,
    pub reason: Option<String>,
    pub activated_at: DateTime<Utc>,
}

/// Result of [`EStopManager::activate_all`].
#[derive(Debug, Default)]
pub struct ActivateAllReport {
    /// Robots whose adapter confirmed the stop.
    pub stopped: Vec<String>,
    /// Robots whose adapter call failed or timed out.  They are still
    /// marked stopped.
    pub failures: Vec<(String, GatewayError)>,
}

impl ActivateAllReport {
    pub fn stopped_count(&self) -> usize {
        self.stopped.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Default)]
struct EStopState {
    robots: HashMap<String, StopRecord>,
    global: Option<StopRecord>,
}

fn is_privileged(role: Option<&str>) -> bool {
    role.is_some_and(|r| RELEASE_ROLES.contains(&r))
}

/// Per-robot and global emergency stops.
pub struct EStopManager {
    registry: Arc<AdapterRegistry>,
    state: Mutex<EStopState>,
    stop_timeout: Duration,
}

impl EStopManager {
    pub fn new(registry: Arc<AdapterRegistry>) -> Self {
        Self {
            registry,
            state: Mutex::new(EStopState::default()),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// `emergency_stop` on one adapter, bounded by the stop timeout.
    async fn stop_adapter(&self, adapter: &dyn RobotAdapter) -> Result<(), GatewayError> {
        match tokio::time::timeout(self.stop_timeout, adapter.emergency_stop()).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Adapter {
                robot_id: adapter.robot_id().to_string(),
                details: format!("emergency stop not confirmed within {:?}", self.stop_timeout),
            }),
        }
    }

    /// Mark `robot_id` stopped and call its adapter's
    /// [`emergency_stop`][fleet_adapters::RobotAdapter::emergency_stop].
    ///
    /// # Errors
    ///
    /// - [`GatewayError::RobotNotFound`] – unknown robot; nothing is marked.
    /// - The adapter's error when the stop could not be delivered in time.
    ///   The robot stays marked stopped.
    pub async fn activate(
        &self,
        robot_id: &str,
        user_id: &str,
        reason: Option<String>,
    ) -> Result<(), GatewayError> {
        let adapter = self.registry.get(robot_id)?;
        self.state.lock().robots.insert(
            robot_id.to_string(),
            StopRecord {
                user_id: user_id.to_string(),
                reason: reason.clone(),
                activated_at: Utc::now(),
            },
        );
        warn!(robot_id, user_id, reason = reason.as_deref().unwrap_or(""), "emergency stop activated");

        self.stop_adapter(adapter.as_ref()).await.map_err(|e| {
            error!(robot_id, error = %e, "adapter failed to apply emergency stop");
            e
        })
    }

    /// Set the global stop and call `emergency_stop` on every registered
    /// adapter.  Partial failure is reported in the returned
    /// [`ActivateAllReport`].
    pub async fn activate_all(&self, user_id: &str, reason: Option<String>) -> ActivateAllReport {
        self.state.lock().global = Some(StopRecord {
            user_id: user_id.to_string(),
            reason: reason.clone(),
            activated_at: Utc::now(),
        });
        warn!(user_id, reason = reason.as_deref().unwrap_or(""), "global emergency stop activated");

        let adapters = self.registry.adapters();
        let stops = adapters.iter().map(|adapter| async move {
            (adapter.robot_id().to_string(), self.stop_adapter(adapter.as_ref()).await)
        });

        let mut report = ActivateAllReport::default();
        for (robot_id, result) in join_all(stops).await {
            match result {
                Ok(()) => report.stopped.push(robot_id),
                Err(e) => {
                    error!(robot_id = %robot_id, error = %e, "adapter failed to apply emergency stop");
                    report.failures.push((robot_id, e));
                }
            }
        }
        report.stopped.sort();
        report.failures.sort_by(|a, b| a.0.cmp(&b.0));
        report
    }

    /// Send `emergency_stop` again to a robot that is already stopped, for
    /// a command that may have reached it after the original stop.
    ///
    /// # Errors
    ///
    /// [`GatewayError::RobotNotFound`], or the adapter's error.
    pub async fn reapply(&self, robot_id: &str) -> Result<(), GatewayError> {
        let adapter = self.registry.get(robot_id)?;
        self.stop_adapter(adapter.as_ref()).await
    }

    /// Clear the stop on `robot_id`.
    ///
    /// Returns `false` when the robot had no per-robot stop.  A global stop
    /// is not affected; use [`EStopManager::release_all`].
    ///
    /// # Errors
    ///
    /// [`GatewayError::Forbidden`] when the caller neither activated the stop
    /// nor holds a release role.
    pub fn release(
        &self,
        robot_id: &str,
        user_id: &str,
        role: Option<&str>,
    ) -> Result<bool, GatewayError> {
        let mut state = self.state.lock();
        let Some(record) = state.robots.get(robot_id) else {
            return Ok(false);
        };
        if record.user_id != user_id && !is_privileged(role) {
            return Err(GatewayError::Forbidden(format!(
                "emergency stop on {robot_id} was activated by {}",
                record.user_id
            )));
        }
        state.robots.remove(robot_id);
        info!(robot_id, user_id, "emergency stop released");
        Ok(true)
    }

    /// Clear the global stop and every per-robot stop.
    ///
    /// Returns the number of records cleared (the global one included).
    ///
    /// # Errors
    ///
    /// [`GatewayError::Forbidden`] unless `role` is a release role.
    pub fn release_all(&self, user_id: &str, role: Option<&str>) -> Result<usize, GatewayError> {
        if !is_privileged(role) {
            return Err(GatewayError::Forbidden(
                "global release requires an admin or supervisor role".to_string(),
            ));
        }
        let mut state = self.state.lock();
        let cleared = state.robots.len() + usize::from(state.global.is_some());
        state.robots.clear();
        state.global = None;
        info!(user_id, cleared, "all emergency stops released");
        Ok(cleared)
    }

    /// `true` when `robot_id` is stopped individually or by the global stop.
    pub fn is_active(&self, robot_id: &str) -> bool {
        let state = self.state.lock();
        state.global.is_some() || state.robots.contains_key(robot_id)
    }

    pub fn is_global_active(&self) -> bool {
        self.state.lock().global.is_some()
    }

    /// # Errors
    ///
    /// [`GatewayError::EStopActive`] when [`EStopManager::is_active`].
    pub fn check(&self, robot_id: &str) -> Result<(), GatewayError> {
        if self.is_active(robot_id) {
            return Err(GatewayError::EStopActive(robot_id.to_string()));
        }
        Ok(())
    }

    /// The record that keeps `robot_id` stopped; the per-robot record wins
    /// over the global one.
    pub fn record(&self, robot_id: &str) -> Option<StopRecord> {
        let state = self.state.lock();
        state
            .robots
            .get(robot_id)
            .or(state.global.as_ref())
            .cloned()
    }

    /// Robots with a per-robot stop, sorted.
    pub fn stopped_robots(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().robots.keys().cloned().collect();
        ids.sort();
        ids
    }
}
