// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of the FluxION Macropad Updater.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! FluxION Macropad Updater - command line entry point

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use macropad_updater::config::DEFAULT_CONFIG_PATH;
use macropad_updater::locator::select_port;
use macropad_updater::macros::{MacroAssignment, MacroFormat};
use macropad_updater::serial_bridge::SerialEvent;
use macropad_updater::version_resolver::VersionSource;
use macropad_updater::{
    Orchestrator, ProgressEvent, SessionRequest, SessionState, UpdateMode, load_config,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "macropad-updater")]
#[command(about = "Update, monitor and configure the ESP32-S3 macropad", long_about = None)]
struct Cli {
    /// Path to the JSON config (created with defaults if missing)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the latest published firmware version
    Check,
    /// List serial ports and the one that would be used
    Ports,
    /// Run one update session
    Update {
        #[arg(short, long, value_enum, default_value_t = ModeArg::Usb)]
        mode: ModeArg,
        /// Reinstall even when the device is up to date
        #[arg(short, long)]
        force: bool,
        /// Serial port to flash, skips discovery
        #[arg(short, long)]
        port: Option<String>,
        /// Device address for OTA, skips the network scan
        #[arg(short, long)]
        address: Option<String>,
    },
    /// Print serial output until Ctrl-C
    Monitor {
        #[arg(short, long)]
        port: String,
    },
    /// Assign macros to the two keys
    Macros {
        #[arg(short, long)]
        port: String,
        #[arg(long)]
        m1: String,
        #[arg(long)]
        m2: String,
        /// Send the JSON form instead of the query form
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Usb,
    Ota,
}

impl From<ModeArg> for UpdateMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Usb => UpdateMode::Usb,
            ModeArg::Ota => UpdateMode::Ota,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("macropad_updater=debug".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let config = load_config(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    info!(
        "Loaded config: chip={}, firmware_dir={}",
        config.chip,
        config.firmware_dir.display()
    );

    let orchestrator = Orchestrator::new(config)?;

    match cli.command {
        Command::Check => {
            let version = orchestrator.versions().remote_version().await?;
            println!("{version}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Ports => {
            list_ports(&orchestrator)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Update {
            mode,
            force,
            port,
            address,
        } => {
            let request = SessionRequest {
                mode: mode.into(),
                force,
                port,
                address,
            };
            run_update(&orchestrator, request).await
        }
        Command::Monitor { port } => {
            monitor(&orchestrator, &port).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Macros {
            port,
            m1,
            m2,
            json,
        } => {
            let bridge = orchestrator.bridge();
            bridge.open(&port, orchestrator.config().serial_baud)?;
            let format = if json {
                MacroFormat::Json
            } else {
                MacroFormat::Query
            };
            bridge.send_macros(&MacroAssignment::new(m1, m2), format)?;
            // Give the device a moment to read the line before the port closes
            tokio::time::sleep(Duration::from_millis(200)).await;
            bridge.close();
            println!("Macros sent to {port}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn list_ports(orchestrator: &Orchestrator) -> anyhow::Result<()> {
    let config = orchestrator.config();
    let ports = orchestrator.serial_locator().list()?;
    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }

    for port in &ports {
        let vid = port
            .vid
            .map_or_else(|| "----".to_owned(), |vid| format!("{vid:04X}"));
        println!(
            "{:<20} vid={vid} {}",
            port.name,
            port.description.as_deref().unwrap_or("")
        );
    }
    if let Some((port, reason)) = select_port(&ports, config.vendor_id, &config.port_hints) {
        println!("Would use {} ({reason:?})", port.name);
    }
    Ok(())
}

async fn run_update(
    orchestrator: &Orchestrator,
    request: SessionRequest,
) -> anyhow::Result<ExitCode> {
    // Subscribe first so no event of the new session is missed
    let mut events = orchestrator.subscribe();
    let handle = orchestrator.start_session(request)?;
    let id = handle.id();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Ctrl-C received, cancelling session {id}");
                handle.cancel();
            }
            event = events.recv() => match event {
                Ok(event) if event.session_id == id => {
                    render(&event);
                    if event.is_terminal() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Skipped {skipped} progress events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    let session = handle.wait().await?;
    let code = match &session.state {
        SessionState::Completed { .. } => ExitCode::SUCCESS,
        SessionState::DeviceNotFound => ExitCode::from(2),
        SessionState::Failed { kind, detail, .. } => {
            if let Some(detail) = detail {
                eprintln!("{detail}");
            }
            if kind.is_recoverable() {
                eprintln!("This may be temporary; it is safe to run the update again.");
            }
            ExitCode::FAILURE
        }
        _ => ExitCode::FAILURE,
    };
    Ok(code)
}

fn render(event: &ProgressEvent) {
    match event.error {
        Some(kind) => eprintln!("[{:>3}%] {} ({kind})", event.percent, event.message),
        None => println!("[{:>3}%] {}", event.percent, event.message),
    }
}

async fn monitor(orchestrator: &Orchestrator, port: &str) -> anyhow::Result<()> {
    let bridge = orchestrator.bridge();
    let mut lines = bridge.subscribe();
    bridge.open(port, orchestrator.config().serial_baud)?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = lines.recv() => match event {
                Ok(SerialEvent::Line { text, .. }) => println!("{text}"),
                Ok(SerialEvent::Disconnected { reason, .. }) => {
                    eprintln!("Disconnected: {reason}");
                    break;
                }
                Ok(SerialEvent::Closed { .. }) | Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Dropped {skipped} serial lines");
                }
            }
        }
    }

    bridge.close();
    Ok(())
}
