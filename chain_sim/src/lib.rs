//! Core crate for the chain-effect flood cascade simulator.
//!
//! Flood level grids are normalized against a per-scenario base grid, traced
//! into contours and pushed through a chain of infrastructure actors that fail
//! when flooded or blacked out. Actors talk over a topic bus and run on the
//! tokio [`runtime`].

pub mod bus;
pub mod config;
pub mod contour;
pub mod failure;
pub mod feature;
pub mod grid;
pub mod lifecycle;
pub mod metrics;
pub mod normalizer;
pub mod projection;
pub mod runtime;
pub mod scenario;
pub mod simulator;
pub mod simulators;

pub use bus::{BusError, Handler, InMemoryBus, MessageBus};
pub use config::{load_chain_config_from_env, ChainConfig, ChainConfigError, ChainConfigMetadata};
pub use contour::{contours, ContourMode, Contours};
pub use failure::FailureEngine;
pub use feature::{
    ChangeEvent, FailureMode, Feature, FeatureCollection, Geometry, InfrastructureState,
};
pub use grid::{parse_grid, parse_header, Grid, GridError, GridOptions, GridParameters};
pub use lifecycle::{LifecyclePhase, ScenarioLifecycle};
pub use metrics::SimulatorMetrics;
pub use normalizer::{normalize, relief_grid_text};
pub use runtime::ActorRuntime;
pub use scenario::{Layer, ScenarioRecord, ScenarioStore};
pub use simulator::{DataFolderError, Effect, Recheck, Simulator};
pub use simulators::{CareSim, FloodSim, PowerSim, ReliefSim};
