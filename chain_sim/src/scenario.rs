use std::collections::{BTreeMap, BTreeSet, HashMap};

use chain_proto::ChainDataMessage;

use crate::{feature::FeatureCollection, lifecycle::ScenarioLifecycle};

/// A feature collection computed for one scenario timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub id: String,
    pub timestamp: i64,
    pub is_final: bool,
    pub collection: FeatureCollection,
}

/// Everything an actor remembers about one scenario.
#[derive(Debug, Clone)]
pub struct ScenarioRecord {
    pub lifecycle: ScenarioLifecycle,
    history: Vec<Layer>,
    inputs: HashMap<String, BTreeMap<i64, ChainDataMessage>>,
    deferred: BTreeSet<i64>,
    awaiting: BTreeSet<i64>,
}

impl ScenarioRecord {
    pub fn new(dependencies: Vec<String>) -> Self {
        Self {
            lifecycle: ScenarioLifecycle::new(dependencies),
            history: Vec::new(),
            inputs: HashMap::new(),
            deferred: BTreeSet::new(),
            awaiting: BTreeSet::new(),
        }
    }

    /// Insert `layer` keeping the history ordered by timestamp. A layer for an
    /// existing timestamp replaces it.
    pub fn push_layer(&mut self, layer: Layer) {
        match self
            .history
            .binary_search_by_key(&layer.timestamp, |existing| existing.timestamp)
        {
            Ok(index) => self.history[index] = layer,
            Err(index) => self.history.insert(index, layer),
        }
    }

    pub fn history(&self) -> &[Layer] {
        &self.history
    }

    /// Newest layer strictly older than `timestamp`.
    pub fn latest_before(&self, timestamp: i64) -> Option<&Layer> {
        self.history
            .iter()
            .rev()
            .find(|layer| layer.timestamp < timestamp)
    }

    pub fn newest_timestamp(&self) -> Option<i64> {
        self.history.last().map(|layer| layer.timestamp)
    }

    pub fn store_input(&mut self, dependency: &str, message: ChainDataMessage) {
        self.inputs
            .entry(dependency.to_string())
            .or_default()
            .insert(message.timestamp, message);
    }

    pub fn input(&self, dependency: &str, timestamp: i64) -> Option<&ChainDataMessage> {
        self.inputs.get(dependency)?.get(&timestamp)
    }

    /// Inputs of `dependency` up to and including `timestamp`, oldest first.
    pub fn inputs_through(
        &self,
        dependency: &str,
        timestamp: i64,
    ) -> impl Iterator<Item = &ChainDataMessage> {
        self.inputs
            .get(dependency)
            .into_iter()
            .flat_map(move |inputs| inputs.range(..=timestamp).map(|(_, message)| message))
    }

    pub fn defer(&mut self, timestamp: i64) {
        self.deferred.insert(timestamp);
    }

    /// Deferred timestamps in ascending order; the buffer is emptied.
    pub fn take_deferred(&mut self) -> Vec<i64> {
        std::mem::take(&mut self.deferred).into_iter().collect()
    }

    pub fn await_recheck(&mut self, timestamp: i64) {
        self.awaiting.insert(timestamp);
    }

    pub fn is_awaiting(&self, timestamp: i64) -> bool {
        self.awaiting.contains(&timestamp)
    }

    pub fn resolve_recheck(&mut self, timestamp: i64) -> bool {
        self.awaiting.remove(&timestamp)
    }

    pub fn awaiting(&self) -> Vec<i64> {
        self.awaiting.iter().copied().collect()
    }

    /// Deferred or re-checked work is still outstanding.
    pub fn has_outstanding(&self) -> bool {
        !self.deferred.is_empty() || !self.awaiting.is_empty()
    }
}

/// An actor's scenarios keyed by scenario id.
#[derive(Debug, Clone, Default)]
pub struct ScenarioStore {
    dependencies: Vec<String>,
    records: HashMap<String, ScenarioRecord>,
}

impl ScenarioStore {
    pub fn new(dependencies: Vec<String>) -> Self {
        Self {
            dependencies,
            records: HashMap::new(),
        }
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn contains(&self, scenario: &str) -> bool {
        self.records.contains_key(scenario)
    }

    pub fn get(&self, scenario: &str) -> Option<&ScenarioRecord> {
        self.records.get(scenario)
    }

    pub fn get_mut(&mut self, scenario: &str) -> Option<&mut ScenarioRecord> {
        self.records.get_mut(scenario)
    }

    pub fn get_or_create(&mut self, scenario: &str) -> &mut ScenarioRecord {
        let dependencies = &self.dependencies;
        self.records
            .entry(scenario.to_string())
            .or_insert_with(|| ScenarioRecord::new(dependencies.clone()))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(timestamp: i64) -> Layer {
        Layer {
            id: "demo".to_string(),
            timestamp,
            is_final: false,
            collection: FeatureCollection::default(),
        }
    }

    #[test]
    fn history_stays_sorted_and_finds_predecessor() {
        let mut record = ScenarioRecord::new(vec!["ReliefSim".to_string()]);
        record.push_layer(layer(-1));
        record.push_layer(layer(7_200_000));
        record.push_layer(layer(0));
        let timestamps: Vec<i64> = record.history().iter().map(|l| l.timestamp).collect();
        assert_eq!(timestamps, vec![-1, 0, 7_200_000]);

        assert_eq!(record.latest_before(3_600_000).map(|l| l.timestamp), Some(0));
        assert_eq!(record.latest_before(0).map(|l| l.timestamp), Some(-1));
        assert!(record.latest_before(-1).is_none());
        assert_eq!(record.newest_timestamp(), Some(7_200_000));
    }

    #[test]
    fn deferred_timestamps_come_back_in_order() {
        let mut record = ScenarioRecord::new(vec![]);
        record.defer(30);
        record.defer(10);
        record.defer(20);
        assert!(record.has_outstanding());
        assert_eq!(record.take_deferred(), vec![10, 20, 30]);
        assert!(!record.has_outstanding());
    }

    #[test]
    fn inputs_through_is_bounded_and_ordered() {
        let mut record = ScenarioRecord::new(vec!["PowerSim".to_string()]);
        for timestamp in [20, 0, 10] {
            record.store_input(
                "PowerSim",
                ChainDataMessage::new("demo", "PowerSim", timestamp, false, ""),
            );
        }
        let seen: Vec<i64> = record
            .inputs_through("PowerSim", 10)
            .map(|message| message.timestamp)
            .collect();
        assert_eq!(seen, vec![0, 10]);
        assert_eq!(record.inputs_through("ReliefSim", 10).count(), 0);
    }

    #[test]
    fn store_creates_records_with_its_dependencies() {
        let mut store = ScenarioStore::new(vec!["FloodSim".to_string()]);
        assert!(store.get_or_create("demo").lifecycle.depends_on("FloodSim"));
        assert!(store.contains("demo"));
        store.clear();
        assert!(store.is_empty());
    }
}
