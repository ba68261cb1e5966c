use std::collections::HashMap;

use chain_proto::{ChainDataMessage, ChainScenario, SimStatus, TimeControl, TimeState};

use crate::{
    config::{ChainConfig, ReliefOptions, TopicConfig},
    contour::contours,
    feature::FeatureCollection,
    grid::{header_lines, parse_grid, parse_header, Grid, GridOptions},
    lifecycle::Acceptance,
    metrics::SimulatorMetrics,
    normalizer::{normalize, relief_grid_text},
    scenario::ScenarioStore,
    simulator::{collection_text, Effect, Recheck, Simulator},
};

/// Reference surface of a scenario, taken from its timestamp-0 grid.
#[derive(Debug, Clone)]
struct BaseGrid {
    grid: Grid,
    header: Vec<String>,
}

/// Turns absolute flood levels into water height above the scenario's base
/// grid and traces the wet area as vector contours.
#[derive(Debug)]
pub struct ReliefSim {
    id: String,
    flood_source: String,
    topics: TopicConfig,
    grid: GridOptions,
    relief: ReliefOptions,
    bases: HashMap<String, BaseGrid>,
    store: ScenarioStore,
    epoch: u64,
    metrics: SimulatorMetrics,
}

impl ReliefSim {
    pub fn new(config: &ChainConfig) -> Self {
        Self {
            id: config.relief_sim.id.clone(),
            flood_source: config.relief_sim.flood_source.clone(),
            topics: config.topics.clone(),
            grid: config.grid.clone(),
            relief: config.relief.clone(),
            bases: HashMap::new(),
            store: ScenarioStore::new(vec![config.relief_sim.flood_source.clone()]),
            epoch: 0,
            metrics: SimulatorMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &SimulatorMetrics {
        &self.metrics
    }

    pub fn has_base(&self, scenario: &str) -> bool {
        self.bases.contains_key(scenario)
    }

    fn activate(&mut self, scenario: &str) -> Vec<Effect> {
        if !self.store.get_or_create(scenario).lifecycle.activate() {
            return Vec::new();
        }
        tracing::info!(
            target: "chain_effect::relief",
            simulator = %self.id,
            scenario,
            "scenario.initialized"
        );
        vec![Effect::publish(
            &self.topics.lifecycle,
            ChainScenario::initial(scenario, &self.id),
        )]
    }

    fn input(&self, scenario: &str, timestamp: i64) -> Option<ChainDataMessage> {
        self.store
            .get(scenario)?
            .input(&self.flood_source, timestamp)
            .cloned()
    }

    /// Keep the timestamp-0 grid as the scenario's base. Returns false when
    /// the grid cannot be read.
    fn create_base(&mut self, scenario: &str, text: &str) -> bool {
        let params = match parse_header(text, &self.grid) {
            Ok(params) => params,
            Err(err) => {
                tracing::warn!(
                    target: "chain_effect::relief",
                    scenario,
                    error = %err,
                    "relief.base_grid.invalid"
                );
                return false;
            }
        };
        let base = BaseGrid {
            grid: parse_grid(text, &params),
            header: header_lines(text, &params),
        };
        tracing::info!(
            target: "chain_effect::relief",
            scenario,
            rows = base.grid.rows(),
            columns = base.grid.columns(),
            "relief.base_grid.created"
        );
        self.bases.insert(scenario.to_string(), base);
        true
    }

    /// Normalize the stored input at `timestamp` against the base and publish
    /// the relief grid plus its contours.
    fn process(&mut self, scenario: &str, timestamp: i64) -> Vec<Effect> {
        let Some(message) = self.input(scenario, timestamp) else {
            return Vec::new();
        };
        let Some(base) = self.bases.get(scenario) else {
            return Vec::new();
        };
        let raw = match parse_header(&message.data, &self.grid) {
            Ok(params) => parse_grid(&message.data, &params),
            Err(err) => {
                tracing::warn!(
                    target: "chain_effect::relief",
                    scenario,
                    timestamp,
                    error = %err,
                    "relief.flood_grid.invalid"
                );
                Grid::from_cells(base.grid.params.clone(), Vec::new())
            }
        };
        let relief = normalize(&raw, &base.grid, self.relief.max_relief);
        let text = relief_grid_text(&base.header, &relief);
        let contours = contours(&relief, self.relief.contour_mode);
        tracing::debug!(
            target: "chain_effect::relief",
            scenario,
            timestamp,
            description = %contours.description,
            "relief.contours.traced"
        );
        self.publish(scenario, timestamp, message.is_final, text, &contours.collection)
    }

    fn publish(
        &mut self,
        scenario: &str,
        timestamp: i64,
        is_final: bool,
        grid_text: String,
        contours: &FeatureCollection,
    ) -> Vec<Effect> {
        let Some(record) = self.store.get_mut(scenario) else {
            return Vec::new();
        };
        record.lifecycle.record_sent();
        self.metrics.record_layer(contours.len());
        tracing::info!(
            target: "chain_effect::relief",
            scenario,
            timestamp,
            contours = contours.len(),
            "scenario.update.published"
        );
        vec![
            Effect::publish(
                &self.topics.water_height,
                ChainDataMessage::new(scenario, &self.id, timestamp, is_final, grid_text),
            ),
            Effect::publish(
                &self.topics.water_contour,
                ChainDataMessage::new(
                    scenario,
                    &self.id,
                    timestamp,
                    is_final,
                    collection_text(contours),
                ),
            ),
            Effect::publish(
                &self.topics.lifecycle,
                ChainScenario::update(scenario, &self.id, timestamp),
            ),
        ]
    }

    /// Give up on the base grid: publish the raw header with no contours.
    fn publish_without_base(&mut self, scenario: &str, timestamp: i64) -> Vec<Effect> {
        let Some(message) = self.input(scenario, timestamp) else {
            return Vec::new();
        };
        if let Some(record) = self.store.get_mut(scenario) {
            record.resolve_recheck(timestamp);
        }
        let header = parse_header(&message.data, &self.grid)
            .map(|params| header_lines(&message.data, &params).join("\n"))
            .unwrap_or_default();
        self.publish(
            scenario,
            timestamp,
            message.is_final,
            header,
            &FeatureCollection::default(),
        )
    }

    /// Park `timestamp` until the base grid arrives, or give up once the
    /// retry budget is spent.
    fn wait_for_base(&mut self, scenario: &str, timestamp: i64, attempt: u32) -> Vec<Effect> {
        if attempt > self.relief.base_retry_limit {
            tracing::warn!(
                target: "chain_effect::relief",
                scenario,
                timestamp,
                attempts = self.relief.base_retry_limit,
                "relief.base_grid.exhausted"
            );
            return self.publish_without_base(scenario, timestamp);
        }
        let Some(record) = self.store.get_mut(scenario) else {
            return Vec::new();
        };
        record.await_recheck(timestamp);
        tracing::debug!(
            target: "chain_effect::relief",
            scenario,
            timestamp,
            attempt,
            "relief.base_grid.waiting"
        );
        vec![Effect::Schedule {
            delay: self.relief.base_retry_delay(),
            recheck: Recheck {
                scenario: scenario.to_string(),
                timestamp,
                attempt,
                epoch: self.epoch,
            },
        }]
    }

    /// Process every timestamp that was parked waiting for the base grid.
    fn flush_awaiting(&mut self, scenario: &str) -> Vec<Effect> {
        let Some(record) = self.store.get_mut(scenario) else {
            return Vec::new();
        };
        let awaiting = record.awaiting();
        let mut effects = Vec::new();
        for timestamp in awaiting {
            if let Some(record) = self.store.get_mut(scenario) {
                record.resolve_recheck(timestamp);
            }
            effects.extend(self.process(scenario, timestamp));
        }
        effects
    }

    fn try_finish(&mut self, scenario: &str) -> Vec<Effect> {
        let Some(record) = self.store.get_mut(scenario) else {
            return Vec::new();
        };
        if !record.lifecycle.ready_to_finish(record.has_outstanding()) {
            return Vec::new();
        }
        record.lifecycle.mark_finished();
        self.metrics.report_finished(&self.id, scenario);
        vec![Effect::publish(
            &self.topics.lifecycle,
            ChainScenario::finished(scenario, &self.id),
        )]
    }

    fn reset(&mut self) {
        self.bases.clear();
        self.store.clear();
        self.metrics.reset();
        self.epoch += 1;
        tracing::warn!(
            target: "chain_effect::relief",
            simulator = %self.id,
            epoch = self.epoch,
            "simulator.reset"
        );
    }
}

impl Simulator for ReliefSim {
    fn id(&self) -> &str {
        &self.id
    }

    fn consumer_topics(&self) -> Vec<String> {
        vec![
            self.topics.flood.clone(),
            self.topics.lifecycle.clone(),
            self.topics.time.clone(),
        ]
    }

    fn producer_topics(&self) -> Vec<String> {
        vec![
            self.topics.water_height.clone(),
            self.topics.water_contour.clone(),
            self.topics.lifecycle.clone(),
        ]
    }

    fn on_message(&mut self, _topic: &str, message: &ChainDataMessage) -> Vec<Effect> {
        if message.simulator != self.flood_source {
            return Vec::new();
        }
        self.metrics.record_message();
        if message.timestamp < 0 {
            return Vec::new();
        }
        let scenario = message.id.as_str();
        let timestamp = message.timestamp;
        let mut effects = self.activate(scenario);

        let Some(record) = self.store.get_mut(scenario) else {
            return effects;
        };
        match record.lifecycle.accept(&message.simulator, timestamp) {
            Acceptance::Closed => {
                self.metrics.record_closed();
                tracing::warn!(
                    target: "chain_effect::relief",
                    scenario,
                    timestamp,
                    "scenario.update.after_finish"
                );
                return effects;
            }
            Acceptance::Duplicate => {
                self.metrics.record_duplicate();
                tracing::warn!(
                    target: "chain_effect::relief",
                    scenario,
                    timestamp,
                    "scenario.update.duplicate"
                );
                return effects;
            }
            Acceptance::Accepted { .. } => record.store_input(&message.simulator, message.clone()),
        }

        if message.is_base() && !self.has_base(scenario) {
            if self.create_base(scenario, &message.data) {
                effects.extend(self.process(scenario, timestamp));
                effects.extend(self.flush_awaiting(scenario));
            } else {
                effects.extend(self.publish_without_base(scenario, timestamp));
            }
        } else if self.has_base(scenario) {
            effects.extend(self.process(scenario, timestamp));
        } else {
            effects.extend(self.wait_for_base(scenario, timestamp, 1));
        }
        effects.extend(self.try_finish(scenario));
        effects
    }

    fn on_lifecycle(&mut self, signal: &ChainScenario) -> Vec<Effect> {
        if signal.sim_id != self.flood_source {
            return Vec::new();
        }
        let scenario = signal.scenario_id.as_str();
        let mut effects = self.activate(scenario);
        if let Some(record) = self.store.get_mut(scenario) {
            match signal.sim_status {
                SimStatus::Initial => {}
                SimStatus::Update => {
                    if let Some(timestamp) = signal.timestamp {
                        record.lifecycle.announce(&signal.sim_id, timestamp);
                    }
                }
                SimStatus::Finished => {
                    record.lifecycle.finish_dependency(&signal.sim_id);
                }
            }
        }
        effects.extend(self.try_finish(scenario));
        effects
    }

    fn on_time(&mut self, control: &TimeControl) -> Vec<Effect> {
        if matches!(control.state, TimeState::Stopped | TimeState::Reset) {
            self.reset();
        }
        Vec::new()
    }

    fn on_recheck(&mut self, recheck: &Recheck) -> Vec<Effect> {
        if recheck.epoch != self.epoch {
            tracing::trace!(
                target: "chain_effect::relief",
                scenario = %recheck.scenario,
                epoch = recheck.epoch,
                "relief.recheck.stale"
            );
            return Vec::new();
        }
        let scenario = recheck.scenario.as_str();
        let awaiting = self
            .store
            .get(scenario)
            .is_some_and(|record| record.is_awaiting(recheck.timestamp));
        if !awaiting {
            return Vec::new();
        }
        let mut effects = if self.has_base(scenario) {
            if let Some(record) = self.store.get_mut(scenario) {
                record.resolve_recheck(recheck.timestamp);
            }
            self.process(scenario, recheck.timestamp)
        } else {
            self.wait_for_base(scenario, recheck.timestamp, recheck.attempt + 1)
        };
        effects.extend(self.try_finish(scenario));
        effects
    }
}

#[cfg(test)]
mod tests {
    use chain_proto::Payload;

    use super::*;
    use crate::feature::{FeatureCollection, Geometry};

    const BASE: &str = "ncols 2\nnrows 2\nxllcorner 0\nyllcorner 0\ncellsize 1\n0 0\n0 0\n";
    const FLOOD: &str = "ncols 2\nnrows 2\nxllcorner 0\nyllcorner 0\ncellsize 1\n5 5\n5 5\n";

    fn relief_sim() -> ReliefSim {
        ReliefSim::new(&ChainConfig::builtin())
    }

    fn flood(timestamp: i64, data: &str) -> ChainDataMessage {
        ChainDataMessage::new("demo", "FloodSim", timestamp, timestamp > 0, data)
    }

    fn data_on<'a>(effects: &'a [Effect], topic: &str) -> Vec<&'a ChainDataMessage> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Publish(message) if message.topic == topic => match &message.payload {
                    Payload::Data(data) => Some(data),
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    fn statuses(effects: &[Effect]) -> Vec<SimStatus> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Publish(message) => match &message.payload {
                    Payload::Scenario(signal) => Some(signal.sim_status),
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    fn rechecks(effects: &[Effect]) -> Vec<Recheck> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Schedule { recheck, .. } => Some(recheck.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn base_grid_yields_zero_relief() {
        let mut sim = relief_sim();
        let effects = sim.on_message("chain_flood", &flood(0, BASE));
        assert!(sim.has_base("demo"));
        assert_eq!(statuses(&effects), vec![SimStatus::Initial, SimStatus::Update]);
        let grid = data_on(&effects, "chain_waterheight");
        assert_eq!(grid.len(), 1);
        assert!(grid[0].data.starts_with("ncols 2\nnrows 2\n"));
        assert!(grid[0].data.ends_with("0 0\n0 0"));
    }

    #[test]
    fn flood_above_base_produces_cell_polygons() {
        let mut sim = relief_sim();
        sim.on_message("chain_flood", &flood(0, BASE));
        let effects = sim.on_message("chain_flood", &flood(3_600_000, FLOOD));

        let grid = data_on(&effects, "chain_waterheight");
        assert!(grid[0].data.ends_with("5 5\n5 5"));
        assert!(grid[0].is_final);

        let contours = data_on(&effects, "chain_watercontour");
        let collection = FeatureCollection::from_json(&contours[0].data).expect("contours");
        assert_eq!(collection.len(), 4);
        for feature in &collection.features {
            assert!(matches!(feature.geometry, Some(Geometry::Polygon(_))));
            assert_eq!(feature.properties.get("v"), Some(&serde_json::json!(5.0)));
        }
    }

    #[test]
    fn update_before_base_waits_and_is_flushed_when_base_arrives() {
        let mut sim = relief_sim();
        let early = sim.on_message("chain_flood", &flood(3_600_000, FLOOD));
        assert!(data_on(&early, "chain_waterheight").is_empty());
        let scheduled = rechecks(&early);
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].attempt, 1);

        let effects = sim.on_message("chain_flood", &flood(0, BASE));
        let timestamps: Vec<i64> = data_on(&effects, "chain_waterheight")
            .iter()
            .map(|message| message.timestamp)
            .collect();
        assert_eq!(timestamps, vec![0, 3_600_000]);

        // the timer still fires later and finds nothing to do
        assert!(sim.on_recheck(&scheduled[0]).is_empty());
    }

    #[test]
    fn exhausted_retries_publish_the_raw_header() {
        let mut config = (*ChainConfig::builtin()).clone();
        config.relief.base_retry_limit = 2;
        let mut sim = ReliefSim::new(&config);

        let first = rechecks(&sim.on_message("chain_flood", &flood(3_600_000, FLOOD)));
        let second = rechecks(&sim.on_recheck(&first[0]));
        assert_eq!(second[0].attempt, 2);

        let effects = sim.on_recheck(&second[0]);
        assert!(rechecks(&effects).is_empty());
        let grid = data_on(&effects, "chain_waterheight");
        assert_eq!(grid[0].data, "ncols 2\nnrows 2\nxllcorner 0\nyllcorner 0\ncellsize 1");
        let contours = data_on(&effects, "chain_watercontour");
        assert!(FeatureCollection::from_json(&contours[0].data)
            .expect("contours")
            .is_empty());
        assert_eq!(statuses(&effects), vec![SimStatus::Update]);
    }

    #[test]
    fn stale_recheck_after_reset_is_ignored() {
        let mut sim = relief_sim();
        let scheduled = rechecks(&sim.on_message("chain_flood", &flood(3_600_000, FLOOD)));
        sim.on_time(&TimeControl::new(TimeState::Reset, 0));
        assert!(sim.on_recheck(&scheduled[0]).is_empty());
    }

    #[test]
    fn stopped_discards_base_grids() {
        let mut sim = relief_sim();
        sim.on_message("chain_flood", &flood(0, BASE));
        sim.on_time(&TimeControl::new(TimeState::Stopped, 0));
        assert!(!sim.has_base("demo"));
        let again = sim.on_message("chain_flood", &flood(0, BASE));
        assert_eq!(statuses(&again), vec![SimStatus::Initial, SimStatus::Update]);
    }

    #[test]
    fn duplicate_flood_grid_is_dropped() {
        let mut sim = relief_sim();
        sim.on_message("chain_flood", &flood(0, BASE));
        let repeat = sim.on_message("chain_flood", &flood(0, BASE));
        assert!(repeat.is_empty());
        assert_eq!(sim.metrics().duplicates_dropped, 1);
    }

    #[test]
    fn finishes_after_flood_finishes_and_nothing_is_waiting() {
        let mut sim = relief_sim();
        sim.on_lifecycle(&ChainScenario::initial("demo", "FloodSim"));
        sim.on_message("chain_flood", &flood(0, BASE));
        sim.on_lifecycle(&ChainScenario::update("demo", "FloodSim", 0));
        sim.on_lifecycle(&ChainScenario::update("demo", "FloodSim", 3_600_000));

        let early = sim.on_lifecycle(&ChainScenario::finished("demo", "FloodSim"));
        assert!(!statuses(&early).contains(&SimStatus::Finished));

        let effects = sim.on_message("chain_flood", &flood(3_600_000, FLOOD));
        assert_eq!(statuses(&effects), vec![SimStatus::Update, SimStatus::Finished]);
    }
}
