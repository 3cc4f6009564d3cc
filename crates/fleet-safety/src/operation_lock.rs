//! [`OperationLock`] – exclusive, expiring control of a robot.
//!
//! A user who holds the lock on a robot is the only one allowed to drive it.
//! Locks expire after a fixed TTL; acquiring again before expiry refreshes
//! the deadline.  Expired records are ignored by every check and purged by
//! [`OperationLock::sweep_expired`], which a background task started with
//! [`OperationLock::spawn_sweeper`] calls periodically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use fleet_types::GatewayError;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// One robot's lock.
#[derive(Debug, Clone, PartialEq)]
pub struct LockRecord {
    pub user_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Per-robot lock table.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use fleet_safety::OperationLock;
///
/// let locks = OperationLock::new(Duration::from_secs(300));
/// locks.acquire("r1", "alice").unwrap();
///
/// assert!(locks.acquire("r1", "bob").is_err());
/// assert!(locks.acquire("r1", "alice").is_ok()); // refresh
/// ```
pub struct OperationLock {
    ttl: TimeDelta,
    locks: Mutex<HashMap<String, LockRecord>>,
}

impl OperationLock {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Grant or refresh the lock on `robot_id` for `user_id`.
    ///
    /// # Errors
    ///
    /// [`GatewayError::LockHeld`] when another user holds a lock that has not
    /// expired.
    pub fn acquire(&self, robot_id: &str, user_id: &str) -> Result<LockRecord, GatewayError> {
        let now = Utc::now();
        let mut locks = self.locks.lock();
        if let Some(existing) = locks.get(robot_id)
            && existing.user_id != user_id
            && !existing.is_expired_at(now)
        {
            return Err(GatewayError::LockHeld {
                robot_id: robot_id.to_string(),
                holder: existing.user_id.clone(),
            });
        }

        let acquired_at = match locks.get(robot_id) {
            Some(existing) if existing.user_id == user_id && !existing.is_expired_at(now) => {
                existing.acquired_at
            }
            _ => now,
        };
        let record = LockRecord {
            user_id: user_id.to_string(),
            acquired_at,
            expires_at: now
                .checked_add_signed(self.ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        locks.insert(robot_id.to_string(), record.clone());
        debug!(robot_id, user_id, expires_at = %record.expires_at, "operation lock granted");
        Ok(record)
    }

    /// Release the lock on `robot_id`.
    ///
    /// # Errors
    ///
    /// [`GatewayError::LockNotHeld`] when `user_id` does not hold a live lock
    /// on the robot.
    pub fn release(&self, robot_id: &str, user_id: &str) -> Result<(), GatewayError> {
        let now = Utc::now();
        let mut locks = self.locks.lock();
        match locks.get(robot_id) {
            Some(record) if record.user_id == user_id && !record.is_expired_at(now) => {
                locks.remove(robot_id);
                info!(robot_id, user_id, "operation lock released");
                Ok(())
            }
            _ => Err(GatewayError::LockNotHeld(robot_id.to_string())),
        }
    }

    /// The live lock on `robot_id`, if any.
    pub fn holder(&self, robot_id: &str) -> Option<LockRecord> {
        let now = Utc::now();
        self.locks
            .lock()
            .get(robot_id)
            .filter(|r| !r.is_expired_at(now))
            .cloned()
    }

    /// May `user_id` command `robot_id`?
    ///
    /// # Errors
    ///
    /// - [`GatewayError::LockHeld`] – another user holds a live lock.
    /// - [`GatewayError::LockRequired`] – `require_lock` is set and nobody
    ///   holds the lock.
    pub fn check(&self, robot_id: &str, user_id: &str, require_lock: bool) -> Result<(), GatewayError> {
        match self.holder(robot_id) {
            Some(record) if record.user_id != user_id => Err(GatewayError::LockHeld {
                robot_id: robot_id.to_string(),
                holder: record.user_id,
            }),
            Some(_) => Ok(()),
            None if require_lock => Err(GatewayError::LockRequired(robot_id.to_string())),
            None => Ok(()),
        }
    }

    /// Remove every expired record and return them keyed by robot ID.
    pub fn sweep_expired(&self) -> Vec<(String, LockRecord)> {
        let now = Utc::now();
        let mut locks = self.locks.lock();
        let expired: Vec<String> = locks
            .iter()
            .filter(|(_, r)| r.is_expired_at(now))
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| locks.remove(&id).map(|record| (id, record)))
            .collect()
    }

    /// Number of live locks.
    pub fn active_count(&self) -> usize {
        let now = Utc::now();
        self.locks
            .lock()
            .values()
            .filter(|r| !r.is_expired_at(now))
            .count()
    }

    /// Run [`OperationLock::sweep_expired`] every `interval`, calling
    /// `on_expired` for each purged lock.
    pub fn spawn_sweeper<F>(self: Arc<Self>, interval: Duration, on_expired: F) -> JoinHandle<()>
    where
        F: Fn(String, LockRecord) + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for (robot_id, record) in self.sweep_expired() {
                    info!(robot_id = %robot_id, user_id = %record.user_id, "operation lock expired");
                    on_expired(robot_id, record);
                }
            }
        })
    }
}
