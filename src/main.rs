//! packetd - run a proxy participation agent from the command line
//!
//! Hosts the agent library the way an embedding app would: initialize with an
//! app key, start, log every status event, stop on Ctrl+C.

use anyhow::{Context, Result};
use clap::Parser;
use packet_agent::{Agent, AgentOptions, ControlEndpoint, SessionState, StatusCode};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = concat!(env!("GIT_TAG"), " (", env!("GIT_HASH"), ")");
const LONG_VERSION: &str = concat!(
    env!("GIT_TAG"),
    "\ncommit: ",
    env!("GIT_HASH"),
    "\nbuilt: ",
    env!("BUILD_TIME")
);

/// packetd - share bandwidth with the relay network
#[derive(Parser, Debug)]
#[command(name = "packetd")]
#[command(about = "Run a proxy participation agent")]
#[command(version = VERSION, long_version = LONG_VERSION)]
#[command(long_about = r#"
Connect to the relay network's control servers and relay traffic on their
behalf until interrupted. Reconnects automatically with backoff.

EXAMPLES:
  # Run with the built-in control endpoint
  packetd --app-key $PACKET_APP_KEY

  # Local development server without TLS
  packetd --app-key dev-key --control 127.0.0.1:7443 --no-tls

  # Options from a YAML file, endpoint overridden on the command line
  packetd --config agent.yaml --control control.example.net:7443

ENVIRONMENT VARIABLES:
  PACKET_APP_KEY   Application key
  PACKET_CONTROL   Control endpoints (comma separated)
  PACKET_CONFIG    Path to a YAML options file
"#)]
struct Cli {
    /// Application key issued for this host app
    #[arg(long, env = "PACKET_APP_KEY")]
    app_key: String,

    /// Control server address (host:port); repeat to add fallbacks
    #[arg(long = "control", env = "PACKET_CONTROL", value_delimiter = ',')]
    control: Vec<String>,

    /// YAML options file
    #[arg(long, env = "PACKET_CONFIG")]
    config: Option<PathBuf>,

    /// Connect to control servers over plain TCP (development only)
    #[arg(long)]
    no_tls: bool,

    /// Publish diagnostic events (code 900) to the status log
    #[arg(long)]
    enable_logging: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Options file (if any) with command-line overrides applied
fn load_options(cli: &Cli) -> Result<AgentOptions> {
    let mut options = match &cli.config {
        Some(path) => AgentOptions::from_yaml_file(path)
            .with_context(|| format!("Failed to load options from {}", path.display()))?,
        None => AgentOptions::default(),
    };

    if !cli.control.is_empty() {
        options.control_endpoints = cli
            .control
            .iter()
            .map(|address| {
                if cli.no_tls {
                    ControlEndpoint::plain(address.clone())
                } else {
                    ControlEndpoint::tls(address.clone())
                }
            })
            .collect();
    } else if cli.no_tls {
        for endpoint in &mut options.control_endpoints {
            endpoint.tls = false;
        }
    }

    if cli.enable_logging {
        options.enable_logging = true;
    }

    Ok(options)
}

fn log_status(code: i32, message: &str) {
    match StatusCode::from_code(code) {
        Some(StatusCode::Failed | StatusCode::RelayFailed) => {
            error!(code, "{}", message)
        }
        Some(
            StatusCode::HeartbeatMissed
            | StatusCode::Reconnecting
            | StatusCode::ListenerOverflow
            | StatusCode::AssignmentRejected,
        ) => warn!(code, "{}", message),
        _ => info!(code, "{}", message),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose);

    info!("packetd {} starting...", VERSION);

    let options = load_options(&cli)?;
    if cli.no_tls {
        warn!("TLS disabled for control connections (development only)");
    }

    let agent = Agent::new();
    agent.set_status_listener(log_status);
    agent
        .initialize(cli.app_key.clone(), options)
        .context("Failed to initialize agent")?;

    info!("Agent ID: {}", agent.agent_id());
    agent.start().context("Failed to start agent")?;

    let mut states = agent.subscribe_state();
    let failed = states.wait_for(|state| *state == SessionState::Failed);

    // Wait for Ctrl+C or terminal failure
    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        _ = failed => {
            error!("Agent failed, giving up");
            Err(anyhow::anyhow!("agent could not connect to the control server"))
        }
    };

    agent.stop().await.context("Failed to stop agent")?;

    let stats = agent.stats();
    info!(
        dropped_events = stats.dropped_events,
        "packetd stopped"
    );
    result
}
