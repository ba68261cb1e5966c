//! Wire envelopes exchanged between chain simulators.
//!
//! Every message on the bus carries a timestamped data layer
//! ([`ChainDataMessage`]), a scenario lifecycle signal ([`ChainScenario`]), a
//! time-control instruction ([`TimeControl`]) or an operator-facing
//! [`StatusAlert`]. Field names follow the camelCase JSON convention used by
//! the other simulators on the bus.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Timestamp reserved for the reference layer of a scenario (the base grid).
pub const BASE_TIMESTAMP: i64 = 0;

/// Timestamp reserved for an actor's static initial layer.
pub const INITIAL_LAYER_TIMESTAMP: i64 = -1;

/// Scenario id used for static layers announced outside any scenario.
pub const STATIC_LAYER_ID: &str = "base";

/// A timestamped layer published by a simulator.
///
/// `data` is either ESRI ASCII grid text or a serialized GeoJSON
/// `FeatureCollection`, depending on the topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainDataMessage {
    pub id: String,
    pub simulator: String,
    pub timestamp: i64,
    #[serde(default)]
    pub is_final: bool,
    pub data: String,
}

impl ChainDataMessage {
    pub fn new(
        id: impl Into<String>,
        simulator: impl Into<String>,
        timestamp: i64,
        is_final: bool,
        data: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            simulator: simulator.into(),
            timestamp,
            is_final,
            data: data.into(),
        }
    }

    /// True for the timestamp-0 reference layer of a scenario.
    pub fn is_base(&self) -> bool {
        self.timestamp == BASE_TIMESTAMP
    }

    /// True for an actor's static initial layer (timestamp -1).
    pub fn is_initial_layer(&self) -> bool {
        self.timestamp == INITIAL_LAYER_TIMESTAMP
    }
}

/// Scenario progress as announced by one simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SimStatus {
    Initial,
    Update,
    Finished,
}

impl fmt::Display for SimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SimStatus::Initial => "INITIAL",
            SimStatus::Update => "UPDATE",
            SimStatus::Finished => "FINISHED",
        };
        f.write_str(label)
    }
}

/// Lifecycle envelope carried on the scenario topic.
///
/// `timestamp` is only set on [`SimStatus::Update`] and names the data layer
/// the update refers to, so consumers can tell which layers an upstream
/// simulator has announced even when signals are redelivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainScenario {
    pub scenario_id: String,
    pub sim_id: String,
    pub sim_status: SimStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl ChainScenario {
    pub fn initial(scenario_id: impl Into<String>, sim_id: impl Into<String>) -> Self {
        Self {
            scenario_id: scenario_id.into(),
            sim_id: sim_id.into(),
            sim_status: SimStatus::Initial,
            timestamp: None,
        }
    }

    pub fn update(
        scenario_id: impl Into<String>,
        sim_id: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            scenario_id: scenario_id.into(),
            sim_id: sim_id.into(),
            sim_status: SimStatus::Update,
            timestamp: Some(timestamp),
        }
    }

    pub fn finished(scenario_id: impl Into<String>, sim_id: impl Into<String>) -> Self {
        Self {
            scenario_id: scenario_id.into(),
            sim_id: sim_id.into(),
            sim_status: SimStatus::Finished,
            timestamp: None,
        }
    }
}

/// State of the shared trial clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeState {
    Initialization,
    Started,
    Paused,
    Stopped,
    Reset,
}

/// Time-control instruction broadcast to every simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeControl {
    pub state: TimeState,
    /// Simulated time in milliseconds.
    #[serde(default)]
    pub trial_time: i64,
}

impl TimeControl {
    pub fn new(state: TimeState, trial_time: i64) -> Self {
        Self { state, trial_time }
    }
}

/// Short status notice for operators, e.g. how many stations failed.
///
/// `timestamp` names the data layer the notice describes; it is absent for
/// notices about the scenario as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusAlert {
    pub sender: String,
    pub scenario_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    pub headline: String,
    pub description: String,
}

impl StatusAlert {
    pub fn new(
        sender: impl Into<String>,
        scenario_id: impl Into<String>,
        timestamp: Option<i64>,
        headline: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            scenario_id: scenario_id.into(),
            timestamp,
            headline: headline.into(),
            description: description.into(),
        }
    }
}

/// Payload variants that may travel on a bus topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum Payload {
    Data(ChainDataMessage),
    Scenario(ChainScenario),
    Time(TimeControl),
    Alert(StatusAlert),
}

impl From<ChainDataMessage> for Payload {
    fn from(value: ChainDataMessage) -> Self {
        Payload::Data(value)
    }
}

impl From<ChainScenario> for Payload {
    fn from(value: ChainScenario) -> Self {
        Payload::Scenario(value)
    }
}

impl From<TimeControl> for Payload {
    fn from(value: TimeControl) -> Self {
        Payload::Time(value)
    }
}

impl From<StatusAlert> for Payload {
    fn from(value: StatusAlert) -> Self {
        Payload::Alert(value)
    }
}

/// A payload addressed to a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Payload,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("failed to encode bus message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode bus message: {0}")]
    Decode(#[source] serde_json::Error),
}

pub fn encode_message_json(message: &BusMessage) -> Result<String, ProtoError> {
    serde_json::to_string(message).map_err(ProtoError::Encode)
}

pub fn decode_message_json(data: &str) -> Result<BusMessage, ProtoError> {
    serde_json::from_str(data).map_err(ProtoError::Decode)
}
