//! Dispenser synchronization daemon - Main Entry Point

use clap::{Parser, Subcommand, ValueEnum};
use dispenser_sync::config::DispenserConfig;
use dispenser_sync::model::{DoseId, DoseTime, NewDose};
use dispenser_sync::observability::init_default_logging;
use dispenser_sync::protocol::OutboundCommand;
use dispenser_sync::publisher::CommandPublisher;
use dispenser_sync::store::{DoseRepository, HistoryRepository, LocalStore};
use dispenser_sync::supervisor::{ConnectionSupervisor, SupervisorExit, SupervisorSettings};
use dispenser_sync::sync::{validate_dose, SyncEngine, SyncSettings};
use dispenser_sync::transport::mqtt::MqttSession;
use dispenser_sync::transport::Transport;
use dispenser_sync::SyncError;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Session manager and dose synchronization for an MQTT medication dispenser
#[derive(Parser)]
#[command(name = "dispenser-sync")]
#[command(about = "Keep a medication dispenser in sync with the local dose schedule")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "DISPENSER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and keep the dispenser synchronized until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Edit the local schedule without connecting; pushed on the next run
    Dose {
        #[command(subcommand)]
        action: DoseAction,
    },
    /// Connect, publish one command and disconnect
    Send {
        #[command(subcommand)]
        command: SendCommand,
    },
}

#[derive(Subcommand)]
enum DoseAction {
    List,
    Add {
        /// Time of day, HH:mm
        #[arg(long)]
        time: DoseTime,
        #[arg(long)]
        compartment: u8,
        #[arg(long)]
        medication: String,
    },
    Remove {
        id: DoseId,
    },
    /// Show the dispensing history, newest first
    History,
}

#[derive(Subcommand)]
enum SendCommand {
    StopAlarm,
    SetClock,
    Led { state: Switch },
    Buzzer { state: Switch },
    RequestDoses,
    ClearAll,
}

#[derive(Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

impl Switch {
    fn is_on(self) -> bool {
        matches!(self, Switch::On)
    }
}

impl SendCommand {
    fn into_command(self) -> OutboundCommand {
        match self {
            SendCommand::StopAlarm => OutboundCommand::StopAlarm,
            SendCommand::SetClock => OutboundCommand::set_clock_now(),
            SendCommand::Led { state } => OutboundCommand::TestLed(state.is_on()),
            SendCommand::Buzzer { state } => OutboundCommand::TestBuzzer(state.is_on()),
            SendCommand::RequestDoses => OutboundCommand::RequestActiveDoses,
            SendCommand::ClearAll => OutboundCommand::ClearAll,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_daemon(config).await,
        Commands::Config { show } => handle_config_command(config, show),
        Commands::Dose { action } => handle_dose_command(config, action).await,
        Commands::Send { command } => handle_send_command(config, command).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<DispenserConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(DispenserConfig::load_from_file(path)?);
    }

    for path_str in ["dispenser.toml", "config/dispenser.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(DispenserConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create dispenser.toml".into())
}

async fn open_store(config: &DispenserConfig) -> Result<Arc<LocalStore>, Box<dyn std::error::Error>> {
    let store = match &config.store.path {
        Some(path) => LocalStore::open(path).await?,
        None => {
            warn!("No store path configured, schedule will not survive a restart");
            LocalStore::in_memory()
        }
    };
    Ok(Arc::new(store))
}

async fn run_daemon(config: DispenserConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        broker = %config.broker.broker_url,
        client_id = %config.broker.client_id,
        "Starting dispenser sync"
    );

    let store = open_store(&config).await?;
    let session = Arc::new(MqttSession::from_config(&config)?);
    let engine = Arc::new(SyncEngine::new(
        session.clone(),
        store,
        SyncSettings::from(&config),
    ));
    let engine_task = engine.start().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = ConnectionSupervisor::new(engine.clone(), SupervisorSettings::from(&config));
    let mut supervisor_task = tokio::spawn(supervisor.run(shutdown_rx));

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Dispenser sync is running");

    let exit = tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
            None
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
            None
        }
        exit = &mut supervisor_task => Some(exit?),
    };

    let exit = match exit {
        Some(exit) => exit,
        None => {
            shutdown_tx.send_replace(true);
            supervisor_task.await?
        }
    };

    engine.publisher().flush().await;
    engine_task.abort();
    info!(?exit, "Application shutdown complete");

    match exit {
        SupervisorExit::MaxAttemptsExceeded => Err("broker unreachable, retries exhausted".into()),
        SupervisorExit::Shutdown | SupervisorExit::TransportClosed => Ok(()),
    }
}

fn handle_config_command(
    config: DispenserConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

async fn handle_dose_command(
    config: DispenserConfig,
    action: DoseAction,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(&config).await?;

    match action {
        DoseAction::List => {
            for dose in store.list_doses().await? {
                println!(
                    "{:>4}  {}  compartment {}  {}{}",
                    dose.id,
                    dose.time,
                    dose.compartment,
                    dose.medication,
                    if dose.active { "" } else { "  (inactive)" }
                );
            }
        }
        DoseAction::Add {
            time,
            compartment,
            medication,
        } => {
            validate_dose(config.dispenser.compartments, compartment, &medication)?;
            if store.get_dose_by_compartment(compartment).await?.is_some() {
                return Err(SyncError::CompartmentOccupied { compartment }.into());
            }
            let dose = store
                .insert_dose(NewDose::new(time, compartment, medication))
                .await?;
            println!("Added dose {} in compartment {}", dose.id, dose.compartment);
        }
        DoseAction::Remove { id } => {
            if !store.delete_dose(id).await? {
                return Err(SyncError::DoseNotFound { id }.into());
            }
            println!("Removed dose {id}");
        }
        DoseAction::History => {
            for record in store.list_history().await? {
                println!(
                    "{}  compartment {}  {}  {}",
                    record.timestamp.to_rfc3339(),
                    record.compartment,
                    record.medication,
                    record.outcome
                );
            }
        }
    }
    Ok(())
}

async fn handle_send_command(
    config: DispenserConfig,
    command: SendCommand,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = Arc::new(MqttSession::from_config(&config)?);
    session.connect().await?;

    let publisher = CommandPublisher::new(session.clone());
    let command = command.into_command();
    let topic = command.topic().path();
    let published = publisher.send(command).published().await;

    session.disconnect().await?;
    if !published {
        return Err(format!("command on {topic} was not published").into());
    }
    println!("Published on {topic}");
    Ok(())
}
