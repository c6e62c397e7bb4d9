mod component;
mod config;
mod error;
mod runtime;
mod sandbox;
mod server;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::component::builtin;
use crate::component::EventBus;
use crate::config::Config;
use crate::runtime::HostRuntime;
use crate::sandbox::registry::{ComponentRegistry, HostContext};
use crate::sandbox::Sandbox;
use crate::server::HttpServer;

fn print_help() {
    println!(
        "\
scriptbox v{}

A sandboxed script host for browser-connected games.

USAGE:
    scriptbox [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/host.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing
                (e.g. debug, scriptbox=debug,warn)

EXAMPLES:
    scriptbox                        # uses config/host.toml
    scriptbox /etc/scriptbox.toml    # custom config path
    RUST_LOG=debug scriptbox         # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("scriptbox v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scriptbox=info")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/host.toml".to_string());

    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)?;

    info!(
        "Server: http://{}:{} (static root {})",
        config.server.host,
        config.server.port,
        config.server.base_path.display()
    );
    info!("Sandbox root: {}", config.sandbox.base_path.display());
    match &config.sandbox.entry {
        Some(entry) => info!("Entry script: {entry}"),
        None => info!("Entry script: none"),
    }

    // Wire the host-side collaborators
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let bus = EventBus::default();
    let mut registry = ComponentRegistry::new();
    builtin::register_builtins(&mut registry);
    info!("Component factories: {} registered", registry.len());

    let ctx = HostContext {
        base_path: config.sandbox.base_path.clone(),
        bus: bus.clone(),
        outbound: cmd_tx.clone(),
    };
    let sandbox = Sandbox::new(config.sandbox.clone(), &registry, &ctx)?;
    info!(
        "Sandbox ready: {} component(s) mounted",
        config.sandbox.components.len()
    );

    let runtime = HostRuntime::new(config.clone(), sandbox, bus);
    runtime.boot().await?;

    let event_rx = HttpServer::new(config.server.clone()).start(cmd_rx).await?;

    tokio::select! {
        result = runtime.run(event_rx, cmd_tx) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting");
            Ok(())
        }
    }
}
