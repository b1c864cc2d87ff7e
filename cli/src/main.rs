// blelink-cli: replay adapter event logs through the session orchestrator
//
// Events are read as JSON lines, dispatched over the loopback transport and the
// resulting commands and upstream events are printed per input line.

mod config;

use anyhow::{Context, Result};
use blelink_core::transport::ble::OpenOptions;
use blelink_core::{
    InMemoryBondStore, LoopbackTransport, Orchestrator, TransportCommand, TransportEvent,
    UpstreamEvent,
};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "blelink")]
#[command(about = "blelink: BLE session orchestrator tools", long_about = None)]
#[command(version)]
struct Cli {
    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSON-lines transport event log
    Replay {
        /// Event log, one transport event per line
        file: PathBuf,
        /// Surface every request instead of auto-accepting
        #[arg(long)]
        manual: bool,
        /// Make the loopback fail these commands (e.g. --fail connect)
        #[arg(long = "fail", value_name = "COMMAND")]
        fail: Vec<String>,
        /// Print upstream events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    /// Print the config file location
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;
    let _guard = init_logging(cli.log_file.as_deref(), config.log_level.as_deref())?;

    match cli.command {
        Commands::Replay {
            file,
            manual,
            fail,
            json,
        } => cmd_replay(config, &file, manual, &fail, json).await,
        Commands::Config { action } => cmd_config(config, action),
    }
}

fn init_logging(log_file: Option<&Path>, level: Option<&str>) -> Result<Option<WorkerGuard>> {
    let level = level.unwrap_or("warn");

    match log_file {
        Some(path) => {
            let filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path.file_name().context("Log file path has no file name")?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            blelink_core::init_tracing(level);
            Ok(None)
        }
    }
}

/// Parse an event log. Blank lines and `#` comments are skipped.
fn parse_event_log(contents: &str) -> Result<Vec<TransportEvent>> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("Invalid event on line {}", n + 1))
        })
        .collect()
}

async fn cmd_replay(
    config: config::Config,
    file: &Path,
    manual: bool,
    fail: &[String],
    json: bool,
) -> Result<()> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let log = parse_event_log(&contents)?;
    tracing::info!("Replaying {} events from {}", log.len(), file.display());

    let mut orchestrator_config = config.orchestrator;
    if manual {
        orchestrator_config.auto_accept_pairing = false;
        orchestrator_config.auto_accept_link_updates = false;
    }

    let transport = Arc::new(LoopbackTransport::new());
    for command in fail {
        transport.fail_on(command);
    }
    let (orchestrator, mut events) = Orchestrator::new(
        transport.clone(),
        Arc::new(InMemoryBondStore::new()),
        orchestrator_config,
    );

    if !json {
        println!(
            "{} {} ({} events)",
            "Replaying".bold(),
            file.display().to_string().bright_cyan(),
            log.len()
        );
        println!();
    }

    let mut emitted = 0;
    let mut issued = 0;

    orchestrator
        .open(&OpenOptions::default())
        .await
        .context("Failed to open loopback adapter")?;
    issued += print_commands(&transport.take_commands(), json);
    emitted += print_events(&mut events, json)?;

    for event in log {
        if !json {
            println!("{} {}", "→".bright_blue(), event.name().bold());
        }
        orchestrator.dispatch(event).await;
        issued += print_commands(&transport.take_commands(), json);
        emitted += print_events(&mut events, json)?;
    }

    // let a pending attribute batch go out before the adapter closes
    tokio::time::sleep(orchestrator.batcher().window()).await;
    let sessions: Vec<_> = orchestrator
        .addresses()
        .iter()
        .filter_map(|address| orchestrator.session(address))
        .collect();
    orchestrator.close().await?;
    issued += print_commands(&transport.take_commands(), json);
    emitted += print_events(&mut events, json)?;

    if !json {
        println!();
        println!(
            "{} {} upstream events, {} commands",
            "✓".green(),
            emitted,
            issued
        );
        if !sessions.is_empty() {
            println!();
            println!("{}", "Sessions".bold());
            for session in sessions {
                println!(
                    "  {} {} {:?} security: {}",
                    "•".bright_green(),
                    session.address.to_string().bright_cyan(),
                    session.connection,
                    session.security.state
                );
            }
        }
    }

    Ok(())
}

fn print_commands(commands: &[TransportCommand], json: bool) -> usize {
    if !json {
        for command in commands {
            println!("  {} {}", "⇢".yellow(), command.name());
        }
    }
    commands.len()
}

fn print_events(events: &mut mpsc::UnboundedReceiver<UpstreamEvent>, json: bool) -> Result<usize> {
    let mut count = 0;
    while let Ok(event) = events.try_recv() {
        count += 1;
        if json {
            println!(
                "{}",
                serde_json::to_string(&event).context("Failed to serialize event")?
            );
        } else if event.is_error() {
            println!("  {} {}", "←".red(), event.to_string().red());
        } else {
            println!("  {} {}", "←".green(), event);
        }
    }
    Ok(count)
}

fn cmd_config(mut config: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }
        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{} = {}", key.bright_cyan(), value),
            None => println!("{} Unknown key: {}", "✗".red(), key),
        },
        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<26} {}", key.bright_cyan(), value);
            }
        }
        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
    }
    Ok(())
}
