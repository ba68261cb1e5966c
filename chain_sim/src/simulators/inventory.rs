//! Scenario bookkeeping shared by the actors that own an infrastructure
//! inventory (power stations, care facilities).

use chain_proto::{
    ChainDataMessage, ChainScenario, SimStatus, INITIAL_LAYER_TIMESTAMP, STATIC_LAYER_ID,
};

use crate::{
    failure::changed_features,
    feature::{ChangeEvent, FeatureCollection},
    lifecycle::Acceptance,
    metrics::SimulatorMetrics,
    scenario::{Layer, ScenarioStore},
    simulator::{collection_text, Effect},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Every dependency delivered the timestamp and it is not older than the
    /// newest computed layer, or upstream has already finished.
    Ready,
    /// Waiting for another dependency to deliver the same timestamp.
    Waiting,
    /// Older than the newest computed layer while upstream is still running;
    /// computed when upstream finishes.
    Deferred,
    Dropped,
}

#[derive(Debug)]
pub(crate) struct InventoryActor {
    pub id: String,
    pub output_topic: String,
    pub lifecycle_topic: String,
    pub inventory: FeatureCollection,
    pub store: ScenarioStore,
    pub metrics: SimulatorMetrics,
}

impl InventoryActor {
    pub fn new(
        id: String,
        output_topic: String,
        lifecycle_topic: String,
        dependencies: Vec<String>,
        inventory: FeatureCollection,
    ) -> Self {
        Self {
            id,
            output_topic,
            lifecycle_topic,
            inventory,
            store: ScenarioStore::new(dependencies),
            metrics: SimulatorMetrics::default(),
        }
    }

    pub fn depends_on(&self, simulator: &str) -> bool {
        self.store
            .dependencies()
            .iter()
            .any(|dependency| dependency == simulator)
    }

    /// The inventory announced outside any scenario.
    pub fn static_layer(&self) -> Effect {
        Effect::publish(
            &self.output_topic,
            ChainDataMessage::new(
                STATIC_LAYER_ID,
                &self.id,
                INITIAL_LAYER_TIMESTAMP,
                false,
                collection_text(&self.inventory),
            ),
        )
    }

    /// Allocate the scenario on first contact: seed history with the
    /// inventory, publish it and announce INITIAL.
    pub fn activate(&mut self, scenario: &str) -> Vec<Effect> {
        let record = self.store.get_or_create(scenario);
        if !record.lifecycle.activate() {
            return Vec::new();
        }
        record.push_layer(Layer {
            id: scenario.to_string(),
            timestamp: INITIAL_LAYER_TIMESTAMP,
            is_final: false,
            collection: self.inventory.clone(),
        });
        tracing::info!(
            target: "chain_effect::scenario",
            simulator = %self.id,
            scenario,
            features = self.inventory.len(),
            "scenario.initialized"
        );
        vec![
            Effect::publish(
                &self.output_topic,
                ChainDataMessage::new(
                    scenario,
                    &self.id,
                    INITIAL_LAYER_TIMESTAMP,
                    false,
                    collection_text(&self.inventory),
                ),
            ),
            Effect::publish(
                &self.lifecycle_topic,
                ChainScenario::initial(scenario, &self.id),
            ),
        ]
    }

    /// Register an upstream layer and decide whether it can be computed now.
    pub fn admit(
        &mut self,
        message: &ChainDataMessage,
        effects: &mut Vec<Effect>,
    ) -> Admission {
        self.metrics.record_message();
        if message.is_initial_layer() {
            tracing::trace!(
                target: "chain_effect::scenario",
                simulator = %self.id,
                source = %message.simulator,
                "scenario.static_layer.ignored"
            );
            return Admission::Dropped;
        }
        if message.timestamp < 0 {
            tracing::warn!(
                target: "chain_effect::scenario",
                simulator = %self.id,
                source = %message.simulator,
                timestamp = message.timestamp,
                "scenario.update.invalid_timestamp"
            );
            return Admission::Dropped;
        }
        effects.extend(self.activate(&message.id));

        let Some(record) = self.store.get_mut(&message.id) else {
            return Admission::Dropped;
        };
        match record.lifecycle.accept(&message.simulator, message.timestamp) {
            Acceptance::Closed => {
                self.metrics.record_closed();
                tracing::warn!(
                    target: "chain_effect::scenario",
                    simulator = %self.id,
                    scenario = %message.id,
                    timestamp = message.timestamp,
                    "scenario.update.after_finish"
                );
                Admission::Dropped
            }
            Acceptance::Duplicate => {
                self.metrics.record_duplicate();
                tracing::warn!(
                    target: "chain_effect::scenario",
                    simulator = %self.id,
                    scenario = %message.id,
                    source = %message.simulator,
                    timestamp = message.timestamp,
                    "scenario.update.duplicate"
                );
                Admission::Dropped
            }
            Acceptance::Accepted { joined } => {
                record.store_input(&message.simulator, message.clone());
                if !joined {
                    Admission::Waiting
                } else if record.newest_timestamp() > Some(message.timestamp)
                    && !record.lifecycle.all_dependencies_finished()
                {
                    record.defer(message.timestamp);
                    tracing::info!(
                        target: "chain_effect::scenario",
                        simulator = %self.id,
                        scenario = %message.id,
                        timestamp = message.timestamp,
                        "scenario.update.deferred"
                    );
                    Admission::Deferred
                } else {
                    Admission::Ready
                }
            }
        }
    }

    /// Record a computed step: store the full state (when there is one),
    /// publish the change set and announce UPDATE.
    pub fn publish_result(
        &mut self,
        scenario: &str,
        timestamp: i64,
        is_final: bool,
        state: Option<FeatureCollection>,
        changes: &[ChangeEvent],
    ) -> Vec<Effect> {
        let Some(record) = self.store.get_mut(scenario) else {
            return Vec::new();
        };
        if let Some(collection) = state {
            record.push_layer(Layer {
                id: scenario.to_string(),
                timestamp,
                is_final,
                collection,
            });
        }
        record.lifecycle.record_sent();
        self.metrics.record_layer(changes.len());
        tracing::info!(
            target: "chain_effect::scenario",
            simulator = %self.id,
            scenario,
            timestamp,
            changed = changes.len(),
            "scenario.update.published"
        );

        vec![
            Effect::publish(
                &self.output_topic,
                ChainDataMessage::new(
                    scenario,
                    &self.id,
                    timestamp,
                    is_final,
                    collection_text(&changed_features(changes)),
                ),
            ),
            Effect::publish(
                &self.lifecycle_topic,
                ChainScenario::update(scenario, &self.id, timestamp),
            ),
        ]
    }

    /// Apply an upstream lifecycle signal. Returns the effects plus the
    /// deferred timestamps that must now be computed, oldest first.
    pub fn on_upstream_signal(&mut self, signal: &ChainScenario) -> (Vec<Effect>, Vec<i64>) {
        if !self.depends_on(&signal.sim_id) {
            return (Vec::new(), Vec::new());
        }
        let effects = self.activate(&signal.scenario_id);
        let Some(record) = self.store.get_mut(&signal.scenario_id) else {
            return (effects, Vec::new());
        };
        let mut flush = Vec::new();
        match signal.sim_status {
            SimStatus::Initial => {}
            SimStatus::Update => {
                if let Some(timestamp) = signal.timestamp {
                    record.lifecycle.announce(&signal.sim_id, timestamp);
                }
            }
            SimStatus::Finished => {
                record.lifecycle.finish_dependency(&signal.sim_id);
                if !record.lifecycle.is_finished() {
                    flush = record.take_deferred();
                }
            }
        }
        (effects, flush)
    }

    pub fn try_finish(&mut self, scenario: &str) -> Vec<Effect> {
        let Some(record) = self.store.get_mut(scenario) else {
            return Vec::new();
        };
        if !record.lifecycle.ready_to_finish(record.has_outstanding()) {
            return Vec::new();
        }
        record.lifecycle.mark_finished();
        self.metrics.report_finished(&self.id, scenario);
        vec![Effect::publish(
            &self.lifecycle_topic,
            ChainScenario::finished(scenario, &self.id),
        )]
    }

    pub fn reset(&mut self) {
        self.store.clear();
        self.metrics.reset();
        tracing::warn!(
            target: "chain_effect::scenario",
            simulator = %self.id,
            "simulator.reset"
        );
    }
}
