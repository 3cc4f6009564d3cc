//! [`SafetyGate`] – the single interception point in front of the adapters.
//!
//! Before a motion command is forwarded to a robot it must pass the gate.
//! The checks always run in the same order and the first failure wins:
//!
//! 1. **E-Stop** ([`EStopManager`]): the robot must not be stopped.
//! 2. **Operation lock** ([`OperationLock`]): no other user may hold the
//!    robot's lock (and, with `require_lock`, the caller must hold it).
//! 3. **Velocity limiter** ([`VelocityLimiter`]): twists are scaled down to
//!    the configured maxima; non-finite values are rejected.  Navigation
//!    goals only get the finiteness check.
//! 4. **Watchdog** ([`TimeoutWatchdog`]): the robot's auto-stop timer is
//!    reset, since the command is about to go out.
//!
//! | Command | E-Stop | Lock | Limiter | Watchdog |
//! |---|---|---|---|---|
//! | `velocity_cmd` | ✓ | ✓ | ✓ | ✓ |
//! | `nav_goal` | ✓ | ✓ | finite only | ✓ |
//! | `nav_cancel` | | ✓ | | |
//!
//! Cancelling navigation only ever reduces motion, so it is allowed while a
//! robot is emergency-stopped.

use std::sync::Arc;

use fleet_types::{GatewayError, Vector3};

use crate::estop::EStopManager;
use crate::operation_lock::OperationLock;
use crate::velocity_limiter::{LimitedVelocity, VelocityLimiter};
use crate::watchdog::TimeoutWatchdog;

pub struct SafetyGate {
    estop: Arc<EStopManager>,
    locks: Arc<OperationLock>,
    limiter: VelocityLimiter,
    watchdog: Arc<TimeoutWatchdog>,
    require_lock: bool,
}

impl SafetyGate {
    pub fn new(
        estop: Arc<EStopManager>,
        locks: Arc<OperationLock>,
        limiter: VelocityLimiter,
        watchdog: Arc<TimeoutWatchdog>,
    ) -> Self {
        Self {
            estop,
            locks,
            limiter,
            watchdog,
            require_lock: false,
        }
    }

    /// Reject commands from users who do not hold the robot's lock, even
    /// when nobody else holds it (builder-style).
    pub fn with_require_lock(mut self, require_lock: bool) -> Self {
        self.require_lock = require_lock;
        self
    }

    /// Gate a velocity command and return the twist that may be sent.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::EStopActive`]
    /// - [`GatewayError::LockHeld`] / [`GatewayError::LockRequired`]
    /// - [`GatewayError::InvalidCommand`] – non-finite velocity.
    pub fn check_velocity(
        &self,
        robot_id: &str,
        user_id: &str,
        linear: Vector3,
        angular: Vector3,
    ) -> Result<LimitedVelocity, GatewayError> {
        self.estop.check(robot_id)?;
        self.locks.check(robot_id, user_id, self.require_lock)?;
        let limited = self.limiter.limit(linear, angular)?;
        self.watchdog.record_command(robot_id);
        Ok(limited)
    }

    /// Gate a navigation goal.
    ///
    /// # Errors
    ///
    /// As [`SafetyGate::check_velocity`]; the goal pose is only checked
    /// for non-finite values.
    pub fn check_nav_goal(
        &self,
        robot_id: &str,
        user_id: &str,
        x: f64,
        y: f64,
        theta: f64,
    ) -> Result<(), GatewayError> {
        self.estop.check(robot_id)?;
        self.locks.check(robot_id, user_id, self.require_lock)?;
        if !(x.is_finite() && y.is_finite() && theta.is_finite()) {
            return Err(GatewayError::InvalidCommand("navigation goal must be finite".to_string()));
        }
        self.watchdog.record_command(robot_id);
        Ok(())
    }

    /// Gate a navigation cancel; only the lock is checked.
    pub fn check_nav_cancel(&self, robot_id: &str, user_id: &str) -> Result<(), GatewayError> {
        self.locks.check(robot_id, user_id, self.require_lock)
    }

    pub fn estop(&self) -> &Arc<EStopManager> {
        &self.estop
    }

    pub fn locks(&self) -> &Arc<OperationLock> {
        &self.locks
    }

    pub fn limiter(&self) -> &VelocityLimiter {
        &self.limiter
    }

    pub fn watchdog(&self) -> &Arc<TimeoutWatchdog> {
        &self.watchdog
    }

    pub fn require_lock(&self) -> bool {
        self.require_lock
    }
}
