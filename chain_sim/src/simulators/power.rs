use std::path::Path;

use chain_proto::{ChainDataMessage, ChainScenario, StatusAlert, TimeControl, TimeState};

use crate::{
    config::{ChainConfig, TopicConfig},
    failure::{flooding, update_power_supply_areas},
    feature::{ChangeEvent, FeatureCollection, AFFECTED_AREA_TYPE},
    grid::{parse_grid, parse_header, GridOptions},
    metrics::SimulatorMetrics,
    simulator::{load_inventory, DataFolderError, Effect, Simulator},
    simulators::inventory::{Admission, InventoryActor},
};

const ALERT_HEADLINE: &str = "Power network status";

/// Power stations that fail in water and black out their supply area.
///
/// Besides the layers it reports the station count when a scenario starts
/// and the number of failed stations per step on the alerts topic.
#[derive(Debug)]
pub struct PowerSim {
    actor: InventoryActor,
    water_source: String,
    alert_sender: String,
    topics: TopicConfig,
    grid: GridOptions,
}

impl PowerSim {
    pub fn new(config: &ChainConfig, inventory: FeatureCollection) -> Self {
        let power = &config.power;
        Self {
            actor: InventoryActor::new(
                power.id.clone(),
                config.topics.power.clone(),
                config.topics.lifecycle.clone(),
                vec![power.water_source.clone()],
                inventory,
            ),
            water_source: power.water_source.clone(),
            alert_sender: power.alert_sender.clone(),
            topics: config.topics.clone(),
            grid: config.grid.clone(),
        }
    }

    pub fn from_data_folder(config: &ChainConfig, data: &Path) -> Result<Self, DataFolderError> {
        let inventory = load_inventory(&data.join(&config.power.inventory), &config.power.id_prefix)?;
        Ok(Self::new(config, inventory))
    }

    pub fn metrics(&self) -> &SimulatorMetrics {
        &self.actor.metrics
    }

    fn alert(&self, scenario: &str, timestamp: Option<i64>, description: String) -> Effect {
        Effect::publish(
            &self.topics.alerts,
            StatusAlert::new(
                &self.alert_sender,
                scenario,
                timestamp,
                ALERT_HEADLINE,
                description,
            ),
        )
    }

    /// Station count notice, only for a scenario that was just activated.
    fn activation_alert(&self, scenario: &str, known: bool) -> Option<Effect> {
        if known || !self.actor.store.contains(scenario) {
            return None;
        }
        Some(self.alert(
            scenario,
            None,
            format!(
                "There are {} power stations in this area",
                self.actor.inventory.len()
            ),
        ))
    }

    fn compute(&mut self, scenario: &str, timestamp: i64) -> Vec<Effect> {
        let Some(record) = self.actor.store.get(scenario) else {
            return Vec::new();
        };
        let Some(water) = record.input(&self.water_source, timestamp) else {
            return Vec::new();
        };
        let is_final = water.is_final;
        let Some(previous) = record.latest_before(timestamp) else {
            tracing::warn!(
                target: "chain_effect::power",
                scenario,
                timestamp,
                "power.previous_layer.missing"
            );
            return self
                .actor
                .publish_result(scenario, timestamp, is_final, None, &[]);
        };
        tracing::debug!(
            target: "chain_effect::power",
            scenario,
            timestamp,
            previous = previous.timestamp,
            "power.previous_layer.found"
        );
        let mut state = previous.collection.clone();

        let changes = match parse_header(&water.data, &self.grid) {
            Ok(params) => {
                let water = parse_grid(&water.data, &params);
                let failed = flooding(&water, &mut state);
                update_power_supply_areas(failed, &mut state)
            }
            Err(err) => {
                tracing::warn!(
                    target: "chain_effect::power",
                    scenario,
                    timestamp,
                    error = %err,
                    "power.water_grid.invalid"
                );
                Vec::new()
            }
        };
        let failed = failed_stations(&changes);
        let mut effects = self
            .actor
            .publish_result(scenario, timestamp, is_final, Some(state), &changes);
        if failed > 0 {
            effects.push(self.alert(
                scenario,
                Some(timestamp),
                format!("{failed} power stations failed"),
            ));
        }
        effects
    }
}

/// Stations in a change set that ended up failed; blackout areas excluded.
fn failed_stations(changes: &[ChangeEvent]) -> usize {
    changes
        .iter()
        .filter(|change| {
            change.value.is_failed() && change.value.feature_type_id() != Some(AFFECTED_AREA_TYPE)
        })
        .count()
}

impl Simulator for PowerSim {
    fn id(&self) -> &str {
        &self.actor.id
    }

    fn consumer_topics(&self) -> Vec<String> {
        vec![
            self.topics.water_height.clone(),
            self.topics.lifecycle.clone(),
            self.topics.time.clone(),
        ]
    }

    fn producer_topics(&self) -> Vec<String> {
        vec![
            self.topics.power.clone(),
            self.topics.lifecycle.clone(),
            self.topics.alerts.clone(),
        ]
    }

    fn startup(&mut self) -> Vec<Effect> {
        vec![self.actor.static_layer()]
    }

    fn on_message(&mut self, _topic: &str, message: &ChainDataMessage) -> Vec<Effect> {
        if message.simulator != self.water_source {
            return Vec::new();
        }
        let known = self.actor.store.contains(&message.id);
        let mut effects = Vec::new();
        let admission = self.actor.admit(message, &mut effects);
        effects.extend(self.activation_alert(&message.id, known));
        if admission == Admission::Ready {
            effects.extend(self.compute(&message.id, message.timestamp));
        }
        effects.extend(self.actor.try_finish(&message.id));
        effects
    }

    fn on_lifecycle(&mut self, signal: &ChainScenario) -> Vec<Effect> {
        let known = self.actor.store.contains(&signal.scenario_id);
        let (mut effects, deferred) = self.actor.on_upstream_signal(signal);
        if !self.actor.depends_on(&signal.sim_id) {
            return effects;
        }
        effects.extend(self.activation_alert(&signal.scenario_id, known));
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
                Vec::new()
            }
            TimeState::Initialization => vec![self.actor.static_layer()],
            _ => Vec::new(),
        }
    }
}
