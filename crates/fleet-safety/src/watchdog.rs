//! [`TimeoutWatchdog`] – command-timeout auto-stop.
//!
//! Every accepted command calls [`TimeoutWatchdog::record_command`], which
//! (re)arms a one-shot timer for that robot.  If the timer runs out before
//! the next command, the timeout callback runs once for the robot and the
//! timer is disarmed until the next command arrives.
//!
//! Each armed robot owns one tokio task.  Re-arming aborts the previous task
//! and bumps a generation counter, so a task that already woke up cannot
//! fire for a superseded deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Called with the robot ID when its window elapses.
pub type TimeoutCallback = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

type Timers = Arc<Mutex<HashMap<String, Timer>>>;

/// One auto-stop timer per robot.
pub struct TimeoutWatchdog {
    timeout: Duration,
    on_timeout: TimeoutCallback,
    timers: Timers,
    generation: AtomicU64,
}

impl TimeoutWatchdog {
    pub fn new(timeout: Duration, on_timeout: TimeoutCallback) -> Self {
        Self {
            timeout,
            on_timeout,
            timers: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Arm or reset the timer for `robot_id`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn record_command(&self, robot_id: &str) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let timers = Arc::clone(&self.timers);
        let callback = Arc::clone(&self.on_timeout);
        let timeout = self.timeout;
        let id = robot_id.to_string();

        // Spawn and insert under the lock so the task never observes the
        // map before its own entry is in place.
        let mut guard = self.timers.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            {
                let mut timers = timers.lock();
                match timers.get(&id) {
                    Some(timer) if timer.generation == generation => {
                        timers.remove(&id);
                    }
                    _ => return,
                }
            }
            warn!(robot_id = %id, timeout_ms = timeout.as_millis() as u64, "command watchdog expired");
            callback(id).await;
        });
        if let Some(previous) = guard.insert(robot_id.to_string(), Timer { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Cancel the timer for `robot_id`.  Returns `false` if none was armed.
    pub fn disarm(&self, robot_id: &str) -> bool {
        match self.timers.lock().remove(robot_id) {
            Some(timer) => {
                timer.handle.abort();
                debug!(robot_id, "command watchdog disarmed");
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, robot_id: &str) -> bool {
        self.timers.lock().contains_key(robot_id)
    }

    pub fn armed_count(&self) -> usize {
        self.timers.lock().len()
    }

    /// Cancel every timer.
    pub fn shutdown(&self) {
        for (_, timer) in self.timers.lock().drain() {
            timer.handle.abort();
        }
    }
}

impl Drop for TimeoutWatchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}
