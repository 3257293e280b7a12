use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use log::warn;
use serde_derive::Deserialize;

use crate::estimator::{DEFAULT_WINDOW, EstimatorConfig, FallbackPolicy};
use crate::rooms::{BeaconPair, DEFAULT_BEACONS, RoomLabel, RoomTable};

#[derive(Deserialize, Debug, Default, Clone)]
pub struct AppConfig {
    pub mqtt: Option<MqttConfig>,
    pub beacons: Option<BeaconConfig>,
    pub scan: Option<ScanConfig>,
    pub assets: Option<AssetsConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct BeaconConfig {
    pub allow: Option<Vec<String>>,
    pub window: Option<usize>,
    pub initial_room: Option<String>,
    pub fallback: Option<FallbackPolicy>,
    pub rooms: Option<Vec<RoomMapping>>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RoomMapping {
    pub pair: [String; 2],
    pub room: String,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ScanConfig {
    pub rescan_interval_ms: Option<u64>,
    pub locate_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct AssetsConfig {
    pub path: Option<PathBuf>,
    pub scan_log: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("beacon pair {0} maps a beacon to itself")]
    DegeneratePair(BeaconPair),
    #[error("smoothing window must hold at least one sample")]
    EmptyWindow,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config = toml::de::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    pub fn estimator_config(&self) -> Result<EstimatorConfig, ConfigError> {
        self.beacons.clone().unwrap_or_default().estimator_config()
    }

    pub fn rescan_interval(&self) -> Duration {
        let millis = self
            .scan
            .as_ref()
            .and_then(|s| s.rescan_interval_ms)
            .unwrap_or(1000);
        Duration::from_millis(millis.max(1))
    }

    pub fn locate_duration(&self) -> Duration {
        let seconds = self
            .scan
            .as_ref()
            .and_then(|s| s.locate_seconds)
            .unwrap_or(10);
        Duration::from_secs(seconds)
    }

    pub fn assets_path(&self) -> PathBuf {
        self.assets
            .as_ref()
            .and_then(|a| a.path.clone())
            .unwrap_or_else(|| PathBuf::from("assets.json"))
    }

    /// Scan history, kept next to the asset catalog unless configured.
    pub fn scan_log_path(&self) -> PathBuf {
        self.assets
            .as_ref()
            .and_then(|a| a.scan_log.clone())
            .unwrap_or_else(|| self.assets_path().with_file_name("scans.json"))
    }
}

impl BeaconConfig {
    pub fn estimator_config(&self) -> Result<EstimatorConfig, ConfigError> {
        let window = self.window.unwrap_or(DEFAULT_WINDOW);
        if window == 0 {
            return Err(ConfigError::EmptyWindow);
        }

        let allowed: HashSet<String> = match &self.allow {
            Some(allow) => allow.iter().cloned().collect(),
            None => DEFAULT_BEACONS.iter().map(|b| b.to_string()).collect(),
        };

        let table = match &self.rooms {
            Some(rooms) => {
                let mut table = RoomTable::new();
                for mapping in rooms {
                    let [a, b] = &mapping.pair;
                    let pair = BeaconPair::new(a, b);
                    if pair.is_degenerate() {
                        return Err(ConfigError::DegeneratePair(pair));
                    }
                    table.insert(a, b, mapping.room.clone());
                }
                if table.is_empty() {
                    warn!("No beacon pairs mapped to rooms, every estimate will fall back");
                }
                table
            }
            None => RoomTable::building_405(),
        };

        Ok(EstimatorConfig {
            allowed,
            table,
            fallback: self.fallback.unwrap_or_default(),
            window,
            initial_room: self
                .initial_room
                .clone()
                .map(RoomLabel::from)
                .unwrap_or_default(),
        })
    }
}
