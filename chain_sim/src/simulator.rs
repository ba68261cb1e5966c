//! Capability interface shared by every chain actor.
//!
//! Handlers never touch the bus directly: they return [`Effect`]s that the
//! runtime applies in order before the next inbox item is handled.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use chain_proto::{BusMessage, ChainDataMessage, ChainScenario, Payload, TimeControl};
use thiserror::Error;

use crate::feature::{FailureMode, FeatureCollection, InfrastructureState};

/// Delayed wake-up for work that is waiting on missing input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recheck {
    pub scenario: String,
    pub timestamp: i64,
    pub attempt: u32,
    /// Reset generation the re-check was scheduled in.
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Publish(BusMessage),
    Schedule { delay: Duration, recheck: Recheck },
}

impl Effect {
    pub fn publish(topic: &str, payload: impl Into<Payload>) -> Self {
        Effect::Publish(BusMessage::new(topic, payload))
    }
}

pub trait Simulator: Send {
    fn id(&self) -> &str;

    fn consumer_topics(&self) -> Vec<String>;

    fn producer_topics(&self) -> Vec<String>;

    /// Effects applied once, after every actor has subscribed.
    fn startup(&mut self) -> Vec<Effect> {
        Vec::new()
    }

    fn on_message(&mut self, topic: &str, message: &ChainDataMessage) -> Vec<Effect>;

    fn on_lifecycle(&mut self, signal: &ChainScenario) -> Vec<Effect>;

    fn on_time(&mut self, control: &TimeControl) -> Vec<Effect>;

    fn on_recheck(&mut self, _recheck: &Recheck) -> Vec<Effect> {
        Vec::new()
    }

    fn handle(&mut self, message: &BusMessage) -> Vec<Effect> {
        match &message.payload {
            Payload::Data(data) => self.on_message(&message.topic, data),
            Payload::Scenario(signal) => self.on_lifecycle(signal),
            Payload::Time(control) => self.on_time(control),
            Payload::Alert(_) => Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DataFolderError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse feature collection {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Read an inventory collection and give every feature the id
/// `<prefix>_<index>` and state `Ok`.
pub fn load_inventory(path: &Path, prefix: &str) -> Result<FeatureCollection, DataFolderError> {
    let contents = fs::read_to_string(path).map_err(|source| DataFolderError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let collection =
        FeatureCollection::from_json(&contents).map_err(|source| DataFolderError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    let collection = prepare_inventory(collection, prefix);
    tracing::info!(
        target: "chain_effect::inventory",
        path = %path.display(),
        features = collection.len(),
        "inventory.loaded"
    );
    Ok(collection)
}

pub fn prepare_inventory(mut collection: FeatureCollection, prefix: &str) -> FeatureCollection {
    for (index, feature) in collection.features.iter_mut().enumerate() {
        feature.id = Some(format!("{prefix}_{index}").into());
        feature.set_state(InfrastructureState::Ok, FailureMode::empty());
    }
    collection
}

/// `collection` as layer text; an empty collection if encoding fails.
pub(crate) fn collection_text(collection: &FeatureCollection) -> String {
    match collection.to_json() {
        Ok(text) => text,
        Err(err) => {
            tracing::error!(
                target: "chain_effect::simulator",
                error = %err,
                "layer.encode_failed"
            );
            r#"{"type":"FeatureCollection","features":[]}"#.to_string()
        }
    }
}
