/// Counters kept by each simulator for the lifetime of a run (until reset).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimulatorMetrics {
    pub messages_received: u64,
    pub duplicates_dropped: u64,
    pub closed_dropped: u64,
    pub layers_published: u64,
    pub features_changed: u64,
    pub scenarios_finished: u64,
}

impl SimulatorMetrics {
    pub fn record_message(&mut self) {
        self.messages_received += 1;
    }

    pub fn record_duplicate(&mut self) {
        self.duplicates_dropped += 1;
    }

    pub fn record_closed(&mut self) {
        self.closed_dropped += 1;
    }

    pub fn record_layer(&mut self, changed_features: usize) {
        self.layers_published += 1;
        self.features_changed += changed_features as u64;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Log the counters when `scenario` finishes.
    pub fn report_finished(&mut self, simulator: &str, scenario: &str) {
        self.scenarios_finished += 1;
        tracing::info!(
            target: "chain_effect::metrics",
            simulator,
            scenario,
            messages = self.messages_received,
            duplicates = self.duplicates_dropped,
            closed = self.closed_dropped,
            layers = self.layers_published,
            changed_features = self.features_changed,
            "scenario.finished"
        );
    }
}
