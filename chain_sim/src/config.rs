use std::{
    env, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::{contour::ContourMode, grid::GridOptions, normalizer::DEFAULT_MAX_RELIEF};

pub const BUILTIN_CHAIN_CONFIG: &str = include_str!("data/chain_config.json");
pub const CHAIN_CONFIG_ENV: &str = "CHAIN_CONFIG_PATH";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub topics: TopicConfig,
    pub grid: GridOptions,
    pub relief: ReliefOptions,
    pub flood: FloodSimConfig,
    pub relief_sim: ReliefSimConfig,
    pub power: PowerSimConfig,
    pub care: CareSimConfig,
}

impl ChainConfig {
    pub fn builtin() -> Arc<Self> {
        Arc::new(
            serde_json::from_str(BUILTIN_CHAIN_CONFIG).expect("builtin chain config should parse"),
        )
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_file(path: &Path) -> Result<Self, ChainConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ChainConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = ChainConfig::from_json_str(&contents)?;
        Ok(config)
    }
}

#[derive(Debug, Error)]
pub enum ChainConfigError {
    #[error("failed to parse chain config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read chain config from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub lifecycle: String,
    pub time: String,
    pub flood: String,
    pub water_height: String,
    pub water_contour: String,
    pub power: String,
    pub care: String,
    pub alerts: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            lifecycle: "chain_scenario".to_string(),
            time: "chain_time".to_string(),
            flood: "chain_flood".to_string(),
            water_height: "chain_waterheight".to_string(),
            water_contour: "chain_watercontour".to_string(),
            power: "chain_power".to_string(),
            care: "chain_care".to_string(),
            alerts: "chain_alerts".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReliefOptions {
    pub max_relief: f64,
    pub contour_mode: ContourMode,
    pub base_retry_limit: u32,
    pub base_retry_delay_ms: u64,
}

impl ReliefOptions {
    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }
}

impl Default for ReliefOptions {
    fn default() -> Self {
        Self {
            max_relief: DEFAULT_MAX_RELIEF,
            contour_mode: ContourMode::CellPolygons,
            base_retry_limit: 10,
            base_retry_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FloodSimConfig {
    pub id: String,
    pub scenario_id: String,
    pub interval_ms: i64,
    /// Folder of grid files, relative to the data folder.
    pub folder: String,
}

impl Default for FloodSimConfig {
    fn default() -> Self {
        Self {
            id: "FloodSim".to_string(),
            scenario_id: "demo".to_string(),
            interval_ms: 3_600_000,
            folder: "FloodSim".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReliefSimConfig {
    pub id: String,
    pub flood_source: String,
}

impl Default for ReliefSimConfig {
    fn default() -> Self {
        Self {
            id: "ReliefSim".to_string(),
            flood_source: "FloodSim".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PowerSimConfig {
    pub id: String,
    pub water_source: String,
    pub id_prefix: String,
    pub inventory: String,
    /// Sender named on status alerts.
    pub alert_sender: String,
}

impl Default for PowerSimConfig {
    fn default() -> Self {
        Self {
            id: "PowerSim".to_string(),
            water_source: "ReliefSim".to_string(),
            id_prefix: "POW".to_string(),
            inventory: "PowerSim/PowerSim.json".to_string(),
            alert_sender: "STEDIN".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CareSimConfig {
    pub id: String,
    pub water_source: String,
    pub power_source: String,
    pub id_prefix: String,
    pub inventory: String,
}

impl Default for CareSimConfig {
    fn default() -> Self {
        Self {
            id: "CareSim".to_string(),
            water_source: "ReliefSim".to_string(),
            power_source: "PowerSim".to_string(),
            id_prefix: "CARE".to_string(),
            inventory: "CareSim/CareSim.json".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChainConfigMetadata {
    path: Option<PathBuf>,
}

impl ChainConfigMetadata {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }
}

/// Load the chain config from `CHAIN_CONFIG_PATH`, falling back to the
/// builtin copy when the variable is unset or the file cannot be loaded.
pub fn load_chain_config_from_env() -> (Arc<ChainConfig>, ChainConfigMetadata) {
    let Some(path) = env::var(CHAIN_CONFIG_ENV).ok().map(PathBuf::from) else {
        tracing::info!(target: "chain_effect::config", "chain_config.loaded=builtin");
        return (ChainConfig::builtin(), ChainConfigMetadata::new(None));
    };

    match ChainConfig::from_file(&path) {
        Ok(config) => {
            tracing::info!(
                target: "chain_effect::config",
                path = %path.display(),
                "chain_config.loaded=file"
            );
            (Arc::new(config), ChainConfigMetadata::new(Some(path)))
        }
        Err(err) => {
            tracing::warn!(
                target: "chain_effect::config",
                path = %path.display(),
                error = %err,
                "chain_config.load_failed"
            );
            (ChainConfig::builtin(), ChainConfigMetadata::new(None))
        }
    }
}
