//! # autoref
//! Command-line front end for the hub.
//!
//! Starts the Orchestrator, optionally loads an autoref script, prints debug
//! log lines from the Status stream and records every Status to a log file.
//!
//! ## Flags
//! - `--vision-port`, `--gc-port`: override the vision / game-controller ports.
//!   A non-positive or out-of-range value aborts before any socket is opened.
//! - `--config <json>`: full HubConfig; port flags win over it.
//! - `--record <logfile>`: one JSON Status per line.
//! - `--metrics <csv>`: relay counters written on shutdown.
//! - `--duration <secs>`: run time; without it the hub runs until `q` on stdin.

use amun_hub::{
    CommandMsg, HubConfig, Orchestrator, Result,
    core::{config::validate_port, protocol::ScriptState},
    utils::{export::export_metrics_csv, recorder::StatusRecorder},
};
use clap::Parser;
use crossbeam::channel::{self, RecvTimeoutError};
use log::{error, info};
use std::{
    io::{BufRead, stdin},
    path::PathBuf,
    process::ExitCode,
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

#[derive(Parser, Debug)]
#[command(name = "autoref", about = "Autoref hub: vision and referee intake, strategy supervision")]
struct Args {
    /// Write every relayed Status to this file as JSON lines.
    #[arg(long, value_name = "LOGFILE")]
    record: Option<PathBuf>,

    #[arg(long, value_name = "PORT", allow_negative_numbers = true)]
    vision_port: Option<i64>,

    /// Game controller (referee) port.
    #[arg(long, value_name = "PORT", allow_negative_numbers = true)]
    gc_port: Option<i64>,

    /// Hub configuration as JSON.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Autoref script to load at startup.
    #[arg(long, value_name = "SCRIPT")]
    init_script: Option<String>,

    #[arg(long, requires = "init_script")]
    entry_point: Option<String>,

    /// Start with the built-in vision simulator as the vision source.
    #[arg(long)]
    simulator: bool,

    /// Seconds to run before shutting down.
    #[arg(long)]
    duration: Option<u64>,

    /// Export relay metrics to this CSV on shutdown.
    #[arg(long, value_name = "CSV")]
    metrics: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    // ports are checked before the hub exists, so a bad value never binds anything
    let ports = match check_ports(&args) {
        Ok(ports) => ports,
        Err(e) => {
            eprintln!("autoref: {}", e);
            return ExitCode::from(2);
        }
    };

    match run(args, ports) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("[Autoref] {}", e);
            eprintln!("autoref: {}", e);
            ExitCode::FAILURE
        }
    }
}

struct PortOverrides {
    vision: Option<u16>,
    referee: Option<u16>,
}

fn check_ports(args: &Args) -> Result<PortOverrides> {
    Ok(PortOverrides {
        vision: args
            .vision_port
            .map(|p| validate_port(p, "vision"))
            .transpose()?,
        referee: args
            .gc_port
            .map(|p| validate_port(p, "referee"))
            .transpose()?,
    })
}

fn run(args: Args, ports: PortOverrides) -> Result<()> {
    let mut config = match args.config.as_ref() {
        Some(path) => HubConfig::from_json_file(path)?,
        None => HubConfig::default(),
    };
    if let Some(port) = ports.vision {
        config.vision_port = port;
    }
    if let Some(port) = ports.referee {
        config.referee_port = port;
    }
    config.simulator_only |= args.simulator;

    let recorder = args
        .record
        .as_ref()
        .map(StatusRecorder::start)
        .transpose()?;

    info!("=== AUTOREF START ===");
    let mut hub = Orchestrator::builder(config).build()?;
    let statuses = hub.subscribe();
    hub.start()?;

    let mut startup = CommandMsg::default();
    if let Some(script) = args.init_script.as_ref() {
        startup = startup.with_script(script.clone(), args.entry_point.clone());
    }
    if !startup.interests().is_empty() {
        hub.send_command(startup)?;
    }

    let quit = quit_signal(args.duration.is_none());
    let deadline = args.duration.map(|s| Instant::now() + Duration::from_secs(s));
    let mut last_game_state: Option<String> = None;

    loop {
        if deadline.is_some_and(|d| Instant::now() >= d) || quit.try_recv().is_ok() {
            break;
        }
        let status = match statuses.recv_timeout(Duration::from_millis(100)) {
            Ok(status) => status,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        for line in &status.debug {
            println!("[{}] {}: {}", wall_clock(), line.source, line.text);
        }
        if let Some(game) = status.game_state.as_ref() {
            if last_game_state.as_deref() != Some(game.state.as_str()) {
                info!("[Autoref] game state {}", game.state);
                last_game_state = Some(game.state.clone());
            }
        }
        if let Some(strategy) = status.strategy_autoref.as_ref() {
            if strategy.state == ScriptState::Failed {
                error!("[Autoref] script {:?} failed", strategy.filename);
            }
        }
        if let Some(fault) = status
            .amun_state
            .as_ref()
            .and_then(|a| a.port_bind_error.as_ref())
        {
            error!(
                "[Autoref] cannot bind {} port {}: {}",
                fault.stream, fault.port, fault.reason
            );
        }
        if let Some(recorder) = recorder.as_ref() {
            recorder.record(status);
        }
    }

    hub.stop();
    if let Some(recorder) = recorder {
        recorder.finish();
    }
    if let Some(path) = args.metrics.as_ref() {
        export_metrics_csv(&hub.metrics().snapshot(), path)?;
    }
    info!("=== AUTOREF FINISHED ===");
    Ok(())
}

/// UTC time of day, `HH:MM:SS.mmm`.
fn wall_clock() -> String {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = since_epoch.as_secs() % 86_400;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        secs / 3600,
        secs / 60 % 60,
        secs % 60,
        since_epoch.subsec_millis()
    )
}

/// Fires when the operator types `q`. A closed stdin never fires.
fn quit_signal(interactive: bool) -> channel::Receiver<()> {
    let (tx, rx) = channel::bounded(1);
    if interactive {
        println!("Type q + Enter to stop.");
        let spawned = thread::Builder::new().name("stdin".into()).spawn(move || {
            for line in stdin().lock().lines().map_while(|l| l.ok()) {
                if matches!(line.trim(), "q" | "quit") {
                    let _ = tx.send(());
                    return;
                }
            }
        });
        if let Err(e) = spawned {
            error!("[Autoref] no stdin reader, stop with a signal: {}", e);
        }
    }
    rx
}
