//! `fleet-safety` – interlocks between clients and robots.
//!
//! Nothing reaches a robot adapter without passing through this crate.  It
//! does not decide what a robot should do; it decides whether a command may
//! go out at all, and in what shape.
//!
//! # Modules
//!
//! - [`estop`] – [`EStopManager`]: per-robot and fleet-wide emergency stops.
//!   An active stop blocks every motion command until an authorized user
//!   releases it.
//! - [`operation_lock`] – [`OperationLock`]: exclusive, expiring control of
//!   a robot by one user.
//! - [`velocity_limiter`] – [`VelocityLimiter`]: scales twists down to the
//!   configured maxima, preserving direction.
//! - [`watchdog`] – [`TimeoutWatchdog`]: stops a robot that has not received
//!   a command within its window.
//! - [`safety_gate`] – [`SafetyGate`]: runs the four checks above in their
//!   fixed order.

pub mod estop;
pub mod operation_lock;
pub mod safety_gate;
pub mod velocity_limiter;
pub mod watchdog;

pub use estop::{ActivateAllReport, EStopManager, StopRecord};
pub use operation_lock::{LockRecord, OperationLock};
pub use safety_gate::SafetyGate;
pub use velocity_limiter::{LimitedVelocity, VelocityLimiter};
pub use watchdog::{TimeoutCallback, TimeoutWatchdog};
