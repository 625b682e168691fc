#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # portgate
//!
//! Slave-side agent that exposes local serial ports and TCP endpoints on a
//! public relay server. Serial devices are bridged onto loopback TCP
//! listeners, and an external frpc-compatible forwarding client is launched
//! and supervised to publish each mapping's endpoint on its public port.
//!
//! ## Subcommands
//!
//! - `portgate serve` (default) — load config, bring up autostart mappings,
//!   run until SIGINT/SIGTERM
//! - `portgate ports` — list serial devices visible on this machine
//!
//! ## Architecture
//!
//! ```text
//! main.rs        — entry point, clap subcommands, graceful shutdown
//! manager.rs     — ConnectionManager: mapping table + state machine
//! ports.rs       — public/local port reservation bookkeeping
//! bridge.rs      — per-mapping serial↔TCP relay
//! config.rs      — TOML + env-var configuration
//! events.rs      — broadcast observer feed (state changes + log lines)
//! error.rs       — fault taxonomy
//! tunnel/
//!   writer.rs    — renders the forwarding-client INI config (temp file)
//!   supervisor.rs— owns the forwarding-client child process
//! ```

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use portgate::config::Config;
use portgate::manager::{ConnectionManager, MappingSpec};
use portgate::events;

/// Expose local serial ports and TCP endpoints on a public relay server.
#[derive(Parser)]
#[command(name = "portgate", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the mapping agent (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Print observer events as JSON lines on stdout.
        #[arg(long)]
        json: bool,
    },
    /// List serial devices visible on this machine.
    Ports,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { config, json }) => {
            run_serve(config.as_deref(), json).await;
        }
        Some(Commands::Ports) => {
            run_ports();
        }
        None => {
            // Backward compat: no subcommand but --config may be passed
            let args: Vec<String> = std::env::args().collect();
            let config_path = args
                .windows(2)
                .find(|w| w[0] == "--config")
                .map(|w| w[1].clone());
            run_serve(config_path.as_deref(), false).await;
        }
    }
}

async fn run_serve(config_path: Option<&str>, json: bool) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("portgate v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Forwarding server: {}:{}",
        config.server.addr, config.server.port
    );
    info!("Forwarding client binary: {}", config.client.binary);

    if config.server.token == "change-me" {
        warn!("Using default token — set PORTGATE_TOKEN or update config");
    }

    let (events, _) = events::channel();
    let manager = ConnectionManager::new(config.clone(), events.clone());

    // Observer feed as JSON lines for machine consumers
    let _printer_task = if json {
        let mut rx = events.subscribe();
        Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Ok(line) = serde_json::to_string(&event) {
                            println!("{line}");
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Observer feed lagged, {n} event(s) dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    } else {
        None
    };

    // Declarative mappings from config: add them all, start the autostart
    // ones. A bad entry is logged and skipped, never fatal.
    for entry in &config.mappings {
        let label = entry.name.as_deref().unwrap_or("<unnamed>");
        let spec: MappingSpec = match entry.to_spec() {
            Ok(spec) => spec,
            Err(e) => {
                warn!("Skipping mapping {label}: {e}");
                continue;
            }
        };
        let id = match manager.add_mapping(spec).await {
            Ok(id) => id,
            Err(e) => {
                warn!("Skipping mapping {label}: {e}");
                continue;
            }
        };
        if entry.autostart {
            if let Err(e) = manager.start(&id).await {
                warn!("Mapping {label} failed to start: {e}");
            }
        }
    }

    info!("Agent ready ({} mapping(s) configured)", config.mappings.len());

    // Graceful shutdown
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }

    info!("Shutting down...");
    manager.shutdown().await;
    info!("Goodbye");
}

fn run_ports() {
    match tokio_serial::available_ports() {
        Ok(ports) if ports.is_empty() => println!("No serial devices found"),
        Ok(ports) => {
            for port in ports {
                println!("{}\t{}", port.port_name, describe(&port.port_type));
            }
        }
        Err(e) => {
            eprintln!("Failed to enumerate serial devices: {e}");
            std::process::exit(1);
        }
    }
}

fn describe(port_type: &tokio_serial::SerialPortType) -> String {
    use tokio_serial::SerialPortType;
    match port_type {
        SerialPortType::UsbPort(info) => {
            let product = info.product.as_deref().unwrap_or("USB serial device");
            format!("{product} ({:04x}:{:04x})", info.vid, info.pid)
        }
        SerialPortType::PciPort => "PCI serial port".to_string(),
        SerialPortType::BluetoothPort => "Bluetooth serial port".to_string(),
        SerialPortType::Unknown => "serial port".to_string(),
    }
}
