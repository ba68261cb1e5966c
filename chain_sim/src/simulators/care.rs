use std::path::Path;

use chain_proto::{ChainDataMessage, ChainScenario, TimeControl, TimeState};

use crate::{
    config::{ChainConfig, TopicConfig},
    failure::{flooding, FailureEngine},
    feature::{ChangeEvent, FeatureCollection},
    grid::{parse_grid, parse_header, GridOptions},
    metrics::SimulatorMetrics,
    simulator::{load_inventory, DataFolderError, Effect, Simulator},
    simulators::inventory::{Admission, InventoryActor},
};

/// Care facilities that fail when flooded or when they end up inside a
/// blackout area. Water and power layers are joined per timestamp.
#[derive(Debug)]
pub struct CareSim {
    actor: InventoryActor,
    water_source: String,
    power_source: String,
    topics: TopicConfig,
    grid: GridOptions,
    engine: FailureEngine,
}

impl CareSim {
    pub fn new(config: &ChainConfig, inventory: FeatureCollection) -> Self {
        let care = &config.care;
        Self {
            actor: InventoryActor::new(
                care.id.clone(),
                config.topics.care.clone(),
                config.topics.lifecycle.clone(),
                vec![care.water_source.clone(), care.power_source.clone()],
                inventory,
            ),
            water_source: care.water_source.clone(),
            power_source: care.power_source.clone(),
            topics: config.topics.clone(),
            grid: config.grid.clone(),
            engine: FailureEngine::new(),
        }
    }

    pub fn from_data_folder(config: &ChainConfig, data: &Path) -> Result<Self, DataFolderError> {
        let inventory = load_inventory(&data.join(&config.care.inventory), &config.care.id_prefix)?;
        Ok(Self::new(config, inventory))
    }

    pub fn metrics(&self) -> &SimulatorMetrics {
        &self.actor.metrics
    }

    /// Power features published up to `timestamp`, later versions replacing
    /// earlier ones.
    fn power_state(&self, scenario: &str, timestamp: i64) -> FeatureCollection {
        let mut state = FeatureCollection::default();
        let Some(record) = self.actor.store.get(scenario) else {
            return state;
        };
        for message in record.inputs_through(&self.power_source, timestamp) {
            match FeatureCollection::from_json(&message.data) {
                Ok(layer) => layer
                    .features
                    .into_iter()
                    .for_each(|feature| state.upsert(feature)),
                Err(err) => tracing::warn!(
                    target: "chain_effect::care",
                    scenario,
                    timestamp = message.timestamp,
                    error = %err,
                    "care.power_layer.invalid"
                ),
            }
        }
        state
    }

    fn compute(&mut self, scenario: &str, timestamp: i64) -> Vec<Effect> {
        let Some(record) = self.actor.store.get(scenario) else {
            return Vec::new();
        };
        let Some(water) = record.input(&self.water_source, timestamp).cloned() else {
            return Vec::new();
        };
        let Some(mut state) = record
            .latest_before(timestamp)
            .map(|layer| layer.collection.clone())
        else {
            tracing::warn!(
                target: "chain_effect::care",
                scenario,
                timestamp,
                "care.previous_layer.missing"
            );
            return self
                .actor
                .publish_result(scenario, timestamp, water.is_final, None, &[]);
        };

        let flooded = match parse_header(&water.data, &self.grid) {
            Ok(params) => flooding(&parse_grid(&water.data, &params), &mut state),
            Err(err) => {
                tracing::warn!(
                    target: "chain_effect::care",
                    scenario,
                    timestamp,
                    error = %err,
                    "care.water_grid.invalid"
                );
                Vec::new()
            }
        };

        let power = self.power_state(scenario, timestamp);
        let layer_id = format!("{scenario}/{}", self.power_source);
        let blacked_out = self.engine.blackout(&layer_id, &power, &mut state, timestamp);
        let changes = merge_changes(flooded, blacked_out);

        self.actor
            .publish_result(scenario, timestamp, water.is_final, Some(state), &changes)
    }
}

/// Concatenate change sets, keeping one entry per feature with its latest value.
fn merge_changes(mut first: Vec<ChangeEvent>, second: Vec<ChangeEvent>) -> Vec<ChangeEvent> {
    for change in second {
        match first.iter_mut().find(|existing| existing.id == change.id) {
            Some(existing) => *existing = change,
            None => first.push(change),
        }
    }
    first
}

impl Simulator for CareSim {
    fn id(&self) -> &str {
        &self.actor.id
    }

    fn consumer_topics(&self) -> Vec<String> {
        vec![
            self.topics.water_height.clone(),
            self.topics.power.clone(),
            self.topics.lifecycle.clone(),
            self.topics.time.clone(),
        ]
    }

    fn producer_topics(&self) -> Vec<String> {
        vec![self.topics.care.clone(), self.topics.lifecycle.clone()]
    }

    fn startup(&mut self) -> Vec<Effect> {
        vec![self.actor.static_layer()]
    }

    fn on_message(&mut self, _topic: &str, message: &ChainDataMessage) -> Vec<Effect> {
        if !self.actor.depends_on(&message.simulator) {
            return Vec::new();
        }
        let mut effects = Vec::new();
        if self.actor.admit(message, &mut effects) == Admission::Ready {
            effects.extend(self.compute(&message.id, message.timestamp));
        }
        effects.extend(self.actor.try_finish(&message.id));
        effects
    }

    fn on_lifecycle(&mut self, signal: &ChainScenario) -> Vec<Effect> {
        let (mut effects, deferred) = self.actor.on_upstream_signal(signal);
        if !self.actor.depends_on(&signal.sim_id) {
            return effects;
        }
        for timestamp in deferred {
            effects.extend(self.compute(&signal.scenario_id, timestamp));
        }
        effects.extend(self.actor.try_finish(&signal.scenario_id));
        effects
    }

    fn on_time(&mut self, control: &TimeControl) -> Vec<Effect> {
        match control.state {
            TimeState::Reset => {
                self.actor.reset();
                self.engine.clear();
                Vec::new()
            }
            TimeState::Initialization => vec![self.actor.static_layer()],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chain_proto::{Payload, SimStatus};

    use super::*;
    use crate::feature::{
        FailureMode, Feature, Geometry, InfrastructureState, AFFECTED_AREA_TYPE,
        FEATURE_TYPE_PROPERTY,
    };
    use crate::simulator::prepare_inventory;

    const DRY: &str = "ncols 2\nnrows 2\nxllcorner 0\nyllcorner 0\ncellsize 1\n0 0\n0 0\n";
    const WET: &str = "ncols 2\nnrows 2\nxllcorner 0\nyllcorner 0\ncellsize 1\n0 0\n0 3\n";

    fn care_sim() -> CareSim {
        let inventory = prepare_inventory(
            FeatureCollection::new(vec![
                Feature::new("hospital", Geometry::Point(vec![5.5, 5.5])),
                Feature::new("clinic", Geometry::Point(vec![1.5, 0.5])),
                Feature::new("school", Geometry::Point(vec![20.0, 20.0])),
            ]),
            "CARE",
        );
        CareSim::new(&ChainConfig::builtin(), inventory)
    }

    fn relief(timestamp: i64, data: &str) -> ChainDataMessage {
        ChainDataMessage::new("demo", "ReliefSim", timestamp, timestamp > 0, data)
    }

    fn power(timestamp: i64, layer: &FeatureCollection) -> ChainDataMessage {
        ChainDataMessage::new(
            "demo",
            "PowerSim",
            timestamp,
            false,
            layer.to_json().expect("layer"),
        )
    }

    fn blackout_layer() -> FeatureCollection {
        let area = Geometry::Polygon(vec![vec![
            vec![5.0, 5.0],
            vec![6.0, 5.0],
            vec![6.0, 6.0],
            vec![5.0, 6.0],
            vec![5.0, 5.0],
        ]]);
        FeatureCollection::new(vec![Feature::new("psa_POW_0", area)
            .with_property(FEATURE_TYPE_PROPERTY, AFFECTED_AREA_TYPE)])
    }

    fn care_layers(effects: &[Effect]) -> Vec<ChainDataMessage> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Publish(message) => match &message.payload {
                    Payload::Data(data) if message.topic == "chain_care" => Some(data.clone()),
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    fn finished(effects: &[Effect]) -> bool {
        effects.iter().any(|effect| {
            matches!(effect, Effect::Publish(message) if matches!(
                &message.payload,
                Payload::Scenario(signal) if signal.sim_status == SimStatus::Finished
            ))
        })
    }

    #[test]
    fn waits_for_both_layers_of_a_timestamp() {
        let mut sim = care_sim();
        let first = sim.on_message("chain_waterheight", &relief(0, DRY));
        // only the initial layer so far
        assert_eq!(care_layers(&first).len(), 1);
        let joined = sim.on_message("chain_power", &power(0, &FeatureCollection::default()));
        let layers = care_layers(&joined);
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].timestamp, 0);
    }

    #[test]
    fn flooding_and_blackout_combine_in_one_change_set() {
        let mut sim = care_sim();
        sim.on_message("chain_waterheight", &relief(0, DRY));
        sim.on_message("chain_power", &power(0, &FeatureCollection::default()));

        sim.on_message("chain_power", &power(3_600_000, &blackout_layer()));
        let effects = sim.on_message("chain_waterheight", &relief(3_600_000, WET));
        let layers = care_layers(&effects);
        assert_eq!(layers.len(), 1);
        assert!(layers[0].is_final);

        let changes = FeatureCollection::from_json(&layers[0].data).expect("layer");
        assert_eq!(changes.len(), 2);
        let hospital = changes.find("CARE_0").expect("hospital changed");
        assert_eq!(hospital.state(), InfrastructureState::Failed);
        assert!(hospital.failure_mode().contains(FailureMode::NO_BACKUP_POWER));
        let clinic = changes.find("CARE_1").expect("clinic changed");
        assert!(clinic.failure_mode().contains(FailureMode::FLOODED));
        assert!(changes.find("CARE_2").is_none());
    }

    #[test]
    fn blackout_area_from_earlier_power_layer_still_applies() {
        let mut sim = care_sim();
        sim.on_message("chain_power", &power(0, &blackout_layer()));
        let effects = sim.on_message("chain_waterheight", &relief(0, DRY));
        let changes = FeatureCollection::from_json(&care_layers(&effects)[0].data).expect("layer");
        assert!(changes.find("CARE_0").is_some_and(Feature::is_failed));

        sim.on_message("chain_power", &power(3_600_000, &FeatureCollection::default()));
        let effects = sim.on_message("chain_waterheight", &relief(3_600_000, DRY));
        let changes = FeatureCollection::from_json(&care_layers(&effects)[0].data).expect("layer");
        assert!(changes.is_empty());
    }

    #[test]
    fn finishes_only_when_both_dependencies_finish() {
        let mut sim = care_sim();
        sim.on_message("chain_waterheight", &relief(0, DRY));
        sim.on_lifecycle(&ChainScenario::update("demo", "ReliefSim", 0));
        assert!(!finished(&sim.on_lifecycle(&ChainScenario::finished("demo", "ReliefSim"))));

        sim.on_lifecycle(&ChainScenario::update("demo", "PowerSim", 0));
        assert!(!finished(&sim.on_lifecycle(&ChainScenario::finished("demo", "PowerSim"))));

        let effects = sim.on_message("chain_power", &power(0, &FeatureCollection::default()));
        assert_eq!(care_layers(&effects).len(), 1);
        assert!(finished(&effects));
    }

    #[test]
    fn older_timestamp_joined_after_both_upstreams_finished_completes_scenario() {
        let mut sim = care_sim();
        let empty = FeatureCollection::default();
        sim.on_message("chain_waterheight", &relief(0, DRY));
        sim.on_message("chain_power", &power(0, &empty));
        sim.on_message("chain_waterheight", &relief(7_200_000, DRY));
        sim.on_message("chain_power", &power(7_200_000, &empty));
        for source in ["ReliefSim", "PowerSim"] {
            for timestamp in [0, 3_600_000, 7_200_000] {
                sim.on_lifecycle(&ChainScenario::update("demo", source, timestamp));
            }
            assert!(!finished(&sim.on_lifecycle(&ChainScenario::finished("demo", source))));
        }

        let waiting = sim.on_message("chain_waterheight", &relief(3_600_000, WET));
        assert!(care_layers(&waiting).is_empty());
        let effects = sim.on_message("chain_power", &power(3_600_000, &empty));
        let layers = care_layers(&effects);
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].timestamp, 3_600_000);
        let changes = FeatureCollection::from_json(&layers[0].data).expect("layer");
        assert!(changes.find("CARE_1").is_some_and(Feature::is_failed));
        assert!(finished(&effects));
    }

    #[test]
    fn own_and_unrelated_signals_are_ignored() {
        let mut sim = care_sim();
        assert!(sim
            .on_lifecycle(&ChainScenario::initial("demo", "CareSim"))
            .is_empty());
        assert!(sim
            .on_message("chain_power", &ChainDataMessage::new("demo", "Other", 0, false, ""))
            .is_empty());
    }
}
