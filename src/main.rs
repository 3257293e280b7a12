use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::sync::{broadcast, mpsc};

mod assets;
mod config;
mod estimator;
mod manager;
mod messages;
mod mqtt;
mod rooms;
mod scanner;

use assets::{AssetField, AssetStore as _, Editor, JsonFileStore};
use messages::ScanCommand;
use rooms::RoomLabel;

/// Locate tracked equipment by the BLE beacons around it.
#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan continuously, logging and publishing every room change
    Track,
    /// Scan for a while and print the estimated room
    Locate {
        #[arg(short, long)]
        seconds: Option<u64>,
    },
    /// Look up the asset behind a scanned code
    Lookup { code: String },
    /// List assets, optionally filtered by name, level or room
    List {
        #[arg(short, long)]
        search: Option<String>,
        #[arg(long, conflicts_with = "room")]
        level: Option<String>,
        #[arg(long)]
        room: Option<String>,
    },
    /// Move the asset behind a scanned code into the estimated room
    Move {
        code: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        upi: String,
        #[arg(short, long)]
        seconds: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let cli = Cli::parse();
    let config = config::AppConfig::load(&cli.config)?;

    match cli.command {
        Command::Track => track(&config).await,
        Command::Locate { seconds } => {
            let room = locate(&config, scan_period(&config, seconds)).await?;
            println!("{room}");
            Ok(())
        }
        Command::Lookup { code } => {
            let store = JsonFileStore::open(config.assets_path())?;
            log_scan(&config, &code);
            match assets::resolve_code(&store, &code)? {
                Some(asset) => {
                    println!("{}: {}, {}", asset.name, asset.level, asset.room);
                    println!(
                        "Last updated by: {} / {}",
                        asset.last_updated_by_name, asset.last_updated_by_upi
                    );
                    Ok(())
                }
                None => anyhow::bail!("no asset matches scanned code {code:?}"),
            }
        }
        Command::List {
            search,
            level,
            room,
        } => {
            let store = JsonFileStore::open(config.assets_path())?;
            let mut found = match (level, room) {
                (Some(level), _) => store.query(AssetField::Level, &level)?,
                (None, Some(room)) => store.query(AssetField::Room, &room)?,
                (None, None) => store.search("")?,
            };
            if let Some(search) = search {
                let search = search.to_lowercase();
                found.retain(|asset| asset.name.to_lowercase().contains(&search));
            }
            for asset in found {
                println!("{}\t{}\t{}, {}", asset.id, asset.name, asset.level, asset.room);
            }
            Ok(())
        }
        Command::Move {
            code,
            name,
            upi,
            seconds,
        } => {
            let mut store = JsonFileStore::open(config.assets_path())?;
            log_scan(&config, &code);
            let asset = assets::resolve_code(&store, &code)?
                .with_context(|| format!("no asset matches scanned code {code:?}"))?;

            let room = locate(&config, scan_period(&config, seconds)).await?;
            let record = assets::finish_move(&mut store, &asset.id, room, Editor { name, upi })?;
            println!("{} moved to {}", record.name, record.room);
            Ok(())
        }
    }
}

fn log_scan(config: &config::AppConfig, code: &str) {
    let path = config.scan_log_path();
    if let Err(err) = assets::record_scan(&path, code) {
        warn!("Error saving scanned code to {}: {}", path.display(), err);
    }
}

fn scan_period(config: &config::AppConfig, seconds: Option<u64>) -> Duration {
    seconds
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.locate_duration())
}

async fn locate(config: &config::AppConfig, period: Duration) -> anyhow::Result<RoomLabel> {
    let estimator = estimator::RoomEstimator::new(config.estimator_config()?);
    let adapter = scanner::first_adapter().await?;

    let (sample_tx, sample_rx) = mpsc::channel(64);
    let (_command_tx, command_rx) = broadcast::channel(10);

    let forwarder = tokio::spawn(scanner::forward_advertisements(adapter.clone(), sample_tx));

    let core = manager::Manager::new(
        adapter,
        estimator,
        sample_rx,
        command_rx,
        config.rescan_interval(),
    );
    let room = core.run_for(period).await?;
    forwarder.abort();

    info!("Estimated room after {:?}: {}", period, room);
    Ok(room)
}

async fn track(config: &config::AppConfig) -> anyhow::Result<()> {
    let estimator = estimator::RoomEstimator::new(config.estimator_config()?);
    let adapter = scanner::first_adapter().await?;

    let (sample_tx, sample_rx) = mpsc::channel(64);
    let (command_tx, command_rx) = broadcast::channel(10);

    let forwarder_adapter = adapter.clone();
    let forwarder = tokio::spawn(async move {
        if let Err(err) = scanner::forward_advertisements(forwarder_adapter, sample_tx).await {
            error!("Error handling BTLE events: {:?}", err);
        }
    });

    let shutdown_tx = command_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            if let Err(err) = shutdown_tx.send(ScanCommand::Shutdown) {
                error!("Error requesting shutdown: {:?}", err);
            }
        }
    });

    let core = manager::Manager::new(
        adapter,
        estimator,
        sample_rx,
        command_rx,
        config.rescan_interval(),
    );
    let rooms = core.subscribe();

    let mqtt_client = match &config.mqtt {
        Some(mqtt_config) => {
            let (mqtt_client, mut eventloop) = mqtt::MqttClient::new(mqtt_config);
            mqtt_client.subscribe().await?;

            // Remote start/stop requests
            let event_client = mqtt_client.clone();
            let tx = command_tx.clone();
            tokio::spawn(async move {
                event_client.event_loop(&mut eventloop, tx).await;
            });

            let announcer = mqtt_client.clone();
            tokio::spawn(async move {
                announcer.announce_rooms(rooms).await;
            });

            Some(mqtt_client)
        }
        None => {
            info!("No MQTT broker configured, room changes are only logged");
            None
        }
    };
    drop(command_tx);

    let room = core.run_loop().await?;
    info!("Exiting manager event loop, last room: {}", room);
    forwarder.abort();

    if let Some(mqtt_client) = mqtt_client {
        mqtt_client.disconnect().await?;
    }

    Ok(())
}
