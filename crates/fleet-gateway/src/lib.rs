//! `fleet-gateway` – real-time hub between operators and robots.
//!
//! Clients connect over WebSocket on `/ws`, authenticate with a JWT, and
//! then drive robots, take operation locks, trigger emergency stops and
//! receive telemetry.  Every command passes the interlocks in
//! [`fleet_safety`] before it reaches a [`fleet_adapters::RobotAdapter`].
//!
//! # Modules
//!
//! - [`codec`] – JSON encoding of the [`fleet_types::Message`] envelope.
//! - [`client`] – [`Client`]: one connection's identity, outbound queue and
//!   subscriptions.
//! - [`hub`] – [`Hub`]: the set of connected clients and message fan-out.
//! - [`pumps`] – per-connection read and write tasks.
//! - [`handler`] – [`Handler`]: message dispatch, telemetry relay and the
//!   watchdog auto-stop.
//! - [`auth`] – [`TokenValidator`]: JWT verification.
//! - [`bridge`] – [`BackendBridge`]: hand-off of recorded data to the
//!   backend.
//! - [`server`] – [`GatewayServer`]: TCP accept loop, `/health` and the
//!   WebSocket upgrade.
//! - [`gateway`] – [`Gateway`]: wires the pieces together from a
//!   [`GatewayConfig`].
//! - [`config`] – TOML configuration with `FLEET_*` overrides.
//! - [`telemetry`] – tracing subscriber and optional OTLP export.

pub mod auth;
pub mod bridge;
pub mod client;
pub mod codec;
pub mod config;
pub mod gateway;
pub mod handler;
pub mod hub;
pub mod pumps;
pub mod server;
pub mod telemetry;

pub use auth::{Claims, TokenValidator};
pub use bridge::{BackendBridge, BridgeEvent, ChannelBridge, CommandRecord, NoopBridge};
pub use client::{Client, DeliveryError};
pub use config::GatewayConfig;
pub use gateway::Gateway;
pub use handler::Handler;
pub use hub::Hub;
pub use pumps::PumpSettings;
pub use server::GatewayServer;
