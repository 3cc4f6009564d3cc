//! Gateway configuration – `fleet-gateway.toml`.
//!
//! Every field has a default, so an empty or missing file yields a working
//! configuration (except for the JWT public key, which must be supplied).
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0"
//! port = 8080
//!
//! [auth]
//! public_key_path = "/etc/fleet/jwt.pub"
//! algorithm = "EdDSA"
//!
//! [safety]
//! max_linear = 1.0
//! max_angular = 2.0
//! watchdog_timeout_ms = 1000
//!
//! [[robots]]
//! id = "r1"
//! driver = "rosbridge"
//! options = { url = "ws://10.0.0.7:9090" }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fleet_types::GatewayError;
use serde::{Deserialize, Serialize};

/// Default location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "fleet-gateway.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub robots: Vec<RobotConfig>,
}

// ────────────────────────────────────────────────────────────────────────────
// Sections
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// Outbound queue depth per client.
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,
    #[serde(default = "default_write_wait_ms")]
    pub write_wait_ms: u64,
    /// Read deadline, refreshed by every transport-level pong.  Pings go out
    /// every nine tenths of this.
    #[serde(default = "default_pong_wait_ms")]
    pub pong_wait_ms: u64,
    /// Inbound messages per second per client; `0` disables the limit.
    #[serde(default = "default_max_messages_per_second")]
    pub max_messages_per_second: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_path: Option<PathBuf>,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    #[serde(default = "default_leeway_secs")]
    pub leeway_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// m/s
    #[serde(default = "default_max_linear")]
    pub max_linear: f64,
    /// rad/s
    #[serde(default = "default_max_angular")]
    pub max_angular: f64,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_lock_sweep_interval_secs")]
    pub lock_sweep_interval_secs: u64,
    #[serde(default = "default_watchdog_timeout_ms")]
    pub watchdog_timeout_ms: u64,
    /// Only lock holders may command a robot.
    #[serde(default)]
    pub require_lock: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Record every robot without waiting for `record_start`.
    #[serde(default)]
    pub record_all: bool,
    #[serde(default = "default_recording_buffer")]
    pub buffer: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotConfig {
    pub id: String,
    pub driver: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_message_bytes() -> usize {
    64 * 1024
}
fn default_send_buffer() -> usize {
    256
}
fn default_write_wait_ms() -> u64 {
    10_000
}
fn default_pong_wait_ms() -> u64 {
    60_000
}
fn default_max_messages_per_second() -> u32 {
    50
}
fn default_algorithm() -> String {
    "EdDSA".to_string()
}
fn default_leeway_secs() -> u64 {
    30
}
fn default_max_linear() -> f64 {
    1.0
}
fn default_max_angular() -> f64 {
    2.0
}
fn default_lock_ttl_secs() -> u64 {
    300
}
fn default_lock_sweep_interval_secs() -> u64 {
    10
}
fn default_watchdog_timeout_ms() -> u64 {
    1_000
}
fn default_recording_buffer() -> usize {
    1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_message_bytes: default_max_message_bytes(),
            send_buffer: default_send_buffer(),
            write_wait_ms: default_write_wait_ms(),
            pong_wait_ms: default_pong_wait_ms(),
            max_messages_per_second: default_max_messages_per_second(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            public_key_path: None,
            algorithm: default_algorithm(),
            issuer: None,
            audience: None,
            leeway_secs: default_leeway_secs(),
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_linear: default_max_linear(),
            max_angular: default_max_angular(),
            lock_ttl_secs: default_lock_ttl_secs(),
            lock_sweep_interval_secs: default_lock_sweep_interval_secs(),
            watchdog_timeout_ms: default_watchdog_timeout_ms(),
            require_lock: false,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            record_all: false,
            buffer: default_recording_buffer(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Derived values
// ────────────────────────────────────────────────────────────────────────────

impl ServerConfig {
    /// # Errors
    ///
    /// [`GatewayError::Config`] when `bind` is not an IP address.
    pub fn socket_addr(&self) -> Result<SocketAddr, GatewayError> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| GatewayError::Config(format!("invalid bind address '{}': {e}", self.bind)))
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    pub fn ping_period(&self) -> Duration {
        self.pong_wait() * 9 / 10
    }

    pub fn rate_limit(&self) -> Option<NonZeroU32> {
        NonZeroU32::new(self.max_messages_per_second)
    }
}

impl SafetyConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.lock_sweep_interval_secs)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Loading
// ────────────────────────────────────────────────────────────────────────────

impl GatewayConfig {
    /// Parse TOML text.  No environment overrides, no validation.
    pub fn from_toml_str(raw: &str) -> Result<Self, GatewayError> {
        toml::from_str(raw).map_err(|e| GatewayError::Config(format!("failed to parse config: {e}")))
    }

    /// Reject values the gateway cannot run with.
    pub fn validate(&self) -> Result<(), GatewayError> {
        let s = &self.safety;
        for (name, value) in [("safety.max_linear", s.max_linear), ("safety.max_angular", s.max_angular)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(GatewayError::Config(format!("{name} must be positive, got {value}")));
            }
        }
        let positive = [
            ("safety.watchdog_timeout_ms", s.watchdog_timeout_ms),
            ("safety.lock_ttl_secs", s.lock_ttl_secs),
            ("safety.lock_sweep_interval_secs", s.lock_sweep_interval_secs),
            ("server.write_wait_ms", self.server.write_wait_ms),
            ("server.pong_wait_ms", self.server.pong_wait_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(GatewayError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.server.send_buffer == 0 {
            return Err(GatewayError::Config("server.send_buffer must be greater than zero".to_string()));
        }
        if self.server.max_message_bytes == 0 {
            return Err(GatewayError::Config(
                "server.max_message_bytes must be greater than zero".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for robot in &self.robots {
            if robot.id.is_empty() {
                return Err(GatewayError::Config("robot id must not be empty".to_string()));
            }
            if !seen.insert(robot.id.as_str()) {
                return Err(GatewayError::Config(format!("robot '{}' is listed twice", robot.id)));
            }
        }
        Ok(())
    }
}

/// Load `path`, apply `FLEET_*` overrides and validate.
///
/// A missing file yields the defaults.
pub fn load_from(path: &Path) -> Result<GatewayConfig, GatewayError> {
    let mut cfg = if path.exists() {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("failed to read config at {}: {e}", path.display()))
        })?;
        GatewayConfig::from_toml_str(&raw)?
    } else {
        GatewayConfig::default()
    };
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// Apply `FLEET_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `FLEET_BIND` | `server.bind` |
/// | `FLEET_PORT` | `server.port` |
/// | `FLEET_PUBLIC_KEY_PATH` | `auth.public_key_path` |
/// | `FLEET_MAX_LINEAR` | `safety.max_linear` |
/// | `FLEET_MAX_ANGULAR` | `safety.max_angular` |
/// | `FLEET_WATCHDOG_TIMEOUT_MS` | `safety.watchdog_timeout_ms` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut GatewayConfig) {
    if let Ok(v) = std::env::var("FLEET_BIND") {
        cfg.server.bind = v;
    }
    if let Ok(v) = std::env::var("FLEET_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.server.port = port;
    }
    if let Ok(v) = std::env::var("FLEET_PUBLIC_KEY_PATH") {
        cfg.auth.public_key_path = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("FLEET_MAX_LINEAR")
        && let Ok(max) = v.parse::<f64>()
    {
        cfg.safety.max_linear = max;
    }
    if let Ok(v) = std::env::var("FLEET_MAX_ANGULAR")
        && let Ok(max) = v.parse::<f64>()
    {
        cfg.safety.max_angular = max;
    }
    if let Ok(v) = std::env::var("FLEET_WATCHDOG_TIMEOUT_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.safety.watchdog_timeout_ms = ms;
    }
}

/// Write `cfg` as TOML, creating parent directories.
pub fn save_to(cfg: &GatewayConfig, path: &Path) -> Result<(), GatewayError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| GatewayError::Config(format!("failed to serialize config: {e}")))?;
    std::fs::write(path, raw)?;
    Ok(())
}
