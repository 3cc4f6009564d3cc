//! `fleet-adapters` – robot back-ends behind one interface.
//!
//! The gateway never speaks a robot protocol directly.  Every back-end is a
//! [`RobotAdapter`]; the [`AdapterRegistry`] maps driver names to factories
//! and live robot IDs to instantiated adapters, so a new protocol plugs in
//! by registering one factory.
//!
//! # Modules
//!
//! - [`adapter`] – the [`RobotAdapter`] trait and the sensor-stream helper.
//! - [`registry`] – [`AdapterRegistry`], driver factories and live adapters.
//! - [`mock`] – [`MockAdapter`], an in-process simulated robot.
//! - [`rosbridge`] – [`RosbridgeAdapter`], ROS 2 over the rosbridge JSON
//!   WebSocket protocol.

pub mod adapter;
pub mod mock;
pub mod registry;
pub mod rosbridge;

pub use adapter::{RobotAdapter, sensor_stream_from};
pub use mock::MockAdapter;
pub use registry::{AdapterConfig, AdapterFactory, AdapterRegistry};
pub use rosbridge::RosbridgeAdapter;
