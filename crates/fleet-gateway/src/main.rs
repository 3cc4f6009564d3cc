//! `fleet-gateway` – the gateway process.
//!
//! 1. Parses the command line and initialises tracing.
//! 2. Loads `fleet-gateway.toml` (or `--config`) with `FLEET_*` overrides.
//! 3. Registers and connects the configured robots.
//! 4. Serves `/ws` and `/health` until **Ctrl-C**, then stops every robot
//!    and disconnects.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use fleet_adapters::AdapterRegistry;
use fleet_gateway::config::{self, DEFAULT_CONFIG_PATH};
use fleet_gateway::telemetry::init_tracing;
use fleet_gateway::{Gateway, GatewayServer, PumpSettings, TokenValidator};
use fleet_types::GatewayError;
use tracing::{error, info};

/// Real-time WebSocket gateway between fleet operators and robots
#[derive(Parser, Debug)]
#[command(name = "fleet-gateway", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "FLEET_GATEWAY_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override `server.port`
    #[arg(short, long)]
    port: Option<u16>,

    /// Override `server.bind`
    #[arg(long)]
    bind: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // The OTLP exporter must exist before the runtime starts.
    let _tracing = init_tracing("fleet-gateway");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "gateway exited with error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), GatewayError> {
    let mut cfg = config::load_from(&cli.config)?;
    if let Some(port) = cli.port {
        cfg.server.port = port;
    }
    if let Some(bind) = cli.bind {
        cfg.server.bind = bind;
    }
    info!(config = %cli.config.display(), robots = cfg.robots.len(), "configuration loaded");

    let validator = TokenValidator::from_config(&cfg.auth)?;
    let registry = Arc::new(AdapterRegistry::with_builtin_drivers());
    let gateway = Gateway::build(&cfg, registry, validator).await?;

    if let Some(mut events) = gateway.take_bridge_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match serde_json::to_string(&event) {
                    Ok(json) => info!(target: "fleet_gateway::recording", "{json}"),
                    Err(e) => error!(error = %e, "failed to serialize recording event"),
                }
            }
        });
    }

    let server = GatewayServer::bind(
        cfg.server.socket_addr()?,
        gateway.handler(),
        PumpSettings::from(&cfg.server),
    )
    .await?;

    let served = server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            info!("Ctrl-C received, shutting down");
        })
        .await;

    gateway.shutdown().await;
    served
}
