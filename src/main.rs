//! sockwatch - TCP connection monitor
//!
//! Listens on an address and port, accepts any number of clients, and
//! prints everything they send along with connects and disconnects.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use sockwatch::config::{Config, ConfigManager, LogFormat};
use sockwatch::{EventStream, ServerController, ShutdownCoordinator};

/// CLI arguments for sockwatch
#[derive(Parser, Debug)]
#[command(name = "sockwatch")]
#[command(about = "sockwatch - accept TCP clients and show what they send")]
#[command(version)]
#[command(long_about = "
sockwatch - accept TCP clients and show what they send

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  SOCKWATCH_BIND_ADDRESS     - IPv4/IPv6 address to listen on
  SOCKWATCH_PORT             - TCP port (0 picks a free port)
  SOCKWATCH_POLL_INTERVAL    - Idle check interval (e.g., 1s, 250ms)
  SOCKWATCH_READ_BUFFER_SIZE - Read buffer size in bytes
  SOCKWATCH_SHUTDOWN_TIMEOUT - Max time to wait for clients on stop
  SOCKWATCH_LOG_LEVEL        - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "sockwatch.toml", help = "Path to configuration file")]
    pub config: PathBuf,

    /// Bind address (overrides config file)
    #[arg(short, long, help = "IPv4 or IPv6 address to listen on")]
    pub bind: Option<String>,

    /// Port to bind to (overrides config file)
    #[arg(short, long, help = "Port to listen on")]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Print events as JSON lines instead of text
    #[arg(long, help = "Print events as JSON lines")]
    pub json_events: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Defaults, then environment, then the config file, then CLI arguments
    let config_file_found = args.config.exists();
    let mut config = ConfigManager::load(&args.config)?;

    let log_level = if args.verbose {
        Some("debug")
    } else {
        args.log_level.as_deref()
    };
    config.merge_with_cli_args(args.bind.as_deref(), args.port, log_level);

    config
        .validate()
        .context("Final configuration validation failed")?;

    // Nothing is logged before this point; the subscriber depends on the config
    init_tracing(&config)?;

    if config_file_found {
        info!("Loaded configuration from {}", args.config.display());
    } else {
        warn!(
            "Configuration file not found at {}, using environment and defaults",
            args.config.display()
        );
    }
    if let Some(bind) = &args.bind {
        info!("CLI override: bind address set to {}", bind);
    }
    if let Some(port) = args.port {
        info!("CLI override: port set to {}", port);
    }
    if let Some(level) = log_level {
        info!("CLI override: log level set to {}", level);
    }

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Bind address: {}:{}", config.server.bind_address, config.server.port);
        info!("  Poll interval: {:?}", config.server.poll_interval);
        info!("  Read buffer: {} bytes", config.server.read_buffer_size);
        info!("  Shutdown timeout: {:?}", config.server.shutdown_timeout);
        return Ok(());
    }

    info!("Starting sockwatch v{}", env!("CARGO_PKG_VERSION"));

    let (controller, events) = ServerController::new(&config.server);
    let printer = spawn_event_printer(events, args.json_events);

    let local_addr = controller
        .start(&config.server.bind_address, config.server.port)
        .await
        .context("Failed to start server")?;
    info!("Listening on {} - press Ctrl+C to stop", local_addr);

    let shutdown_coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);
    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
    }

    let status = controller.status();
    info!(
        "Served {} connections, {} bytes received",
        status.total_connections, status.total_bytes_received
    );
    shutdown_coordinator.shutdown_controller(&controller).await?;

    // Closing the sink lets the printer drain the remaining events and exit
    drop(controller);
    if let Err(e) = printer.await {
        error!("Event printer failed: {}", e);
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Presentation side: write every event to stdout
fn spawn_event_printer(mut events: EventStream, json: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => error!("Failed to encode event: {}", e),
                }
            } else {
                println!("{}", event);
            }
        }
    })
}

/// Initialize tracing/logging
fn init_tracing(config: &Config) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let fmt_layer = match config.logging.format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(true)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .try_init()
        .context("Failed to initialise logging")?;

    Ok(())
}
