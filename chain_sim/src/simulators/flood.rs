use std::{fs, path::Path};

use chain_proto::{ChainDataMessage, ChainScenario, TimeControl, TimeState};

use crate::{
    config::{ChainConfig, FloodSimConfig, TopicConfig},
    metrics::SimulatorMetrics,
    simulator::{DataFolderError, Effect, Simulator},
};

/// Replays a folder of absolute flood level grids as one scenario, one file
/// per interval of trial time.
#[derive(Debug)]
pub struct FloodSim {
    config: FloodSimConfig,
    topics: TopicConfig,
    files: Vec<String>,
    started_at: Option<i64>,
    next_index: usize,
    immediate: bool,
    metrics: SimulatorMetrics,
}

impl FloodSim {
    pub fn new(config: &ChainConfig, files: Vec<String>) -> Self {
        Self {
            config: config.flood.clone(),
            topics: config.topics.clone(),
            files,
            started_at: None,
            next_index: 0,
            immediate: false,
            metrics: SimulatorMetrics::default(),
        }
    }

    /// Load every file of `<data>/<folder>` in name order.
    pub fn from_data_folder(config: &ChainConfig, data: &Path) -> Result<Self, DataFolderError> {
        let folder = data.join(&config.flood.folder);
        let read_error = |source| DataFolderError::Read {
            path: folder.clone(),
            source,
        };
        let mut paths = Vec::new();
        for entry in fs::read_dir(&folder).map_err(read_error)? {
            let path = entry.map_err(read_error)?.path();
            if path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut files = Vec::with_capacity(paths.len());
        for path in &paths {
            let contents = fs::read_to_string(path).map_err(|source| DataFolderError::Read {
                path: path.clone(),
                source,
            })?;
            files.push(contents);
        }
        tracing::info!(
            target: "chain_effect::flood",
            folder = %folder.display(),
            files = files.len(),
            "flood.files.loaded"
        );
        Ok(Self::new(config, files))
    }

    /// Publish every file at startup instead of waiting for time control.
    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    pub fn metrics(&self) -> &SimulatorMetrics {
        &self.metrics
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn timestamp_of(&self, index: usize) -> i64 {
        index as i64 * self.config.interval_ms
    }

    fn begin(&mut self, trial_time: i64) -> Vec<Effect> {
        self.started_at = Some(trial_time);
        tracing::info!(
            target: "chain_effect::flood",
            scenario = %self.config.scenario_id,
            files = self.files.len(),
            "scenario.initialized"
        );
        let mut effects = vec![Effect::publish(
            &self.topics.lifecycle,
            ChainScenario::initial(&self.config.scenario_id, &self.config.id),
        )];
        if self.files.is_empty() {
            effects.extend(self.finish());
        }
        effects
    }

    fn publish_next(&mut self) -> Vec<Effect> {
        let index = self.next_index;
        let Some(data) = self.files.get(index).cloned() else {
            return Vec::new();
        };
        self.next_index += 1;
        let timestamp = self.timestamp_of(index);
        let is_final = self.next_index == self.files.len();
        self.metrics.record_layer(0);
        tracing::info!(
            target: "chain_effect::flood",
            scenario = %self.config.scenario_id,
            index,
            timestamp,
            is_final,
            "flood.file.published"
        );

        let scenario = &self.config.scenario_id;
        let mut effects = vec![
            Effect::publish(
                &self.topics.flood,
                ChainDataMessage::new(scenario, &self.config.id, timestamp, is_final, data),
            ),
            Effect::publish(
                &self.topics.lifecycle,
                ChainScenario::update(scenario, &self.config.id, timestamp),
            ),
        ];
        if is_final {
            effects.extend(self.finish());
        }
        effects
    }

    fn finish(&mut self) -> Vec<Effect> {
        self.metrics
            .report_finished(&self.config.id, &self.config.scenario_id);
        vec![Effect::publish(
            &self.topics.lifecycle,
            ChainScenario::finished(&self.config.scenario_id, &self.config.id),
        )]
    }

    /// Files whose offset from the start has elapsed at `trial_time`.
    fn publish_due(&mut self, trial_time: i64) -> Vec<Effect> {
        let Some(started_at) = self.started_at else {
            return Vec::new();
        };
        let mut effects = Vec::new();
        while self.next_index < self.files.len()
            && trial_time - started_at >= self.timestamp_of(self.next_index)
        {
            effects.extend(self.publish_next());
        }
        effects
    }

    /// Replay every remaining file in series.
    pub fn publish_all(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.started_at.is_none() {
            effects.extend(self.begin(0));
        }
        while self.next_index < self.files.len() {
            effects.extend(self.publish_next());
        }
        effects
    }

    fn rewind(&mut self) {
        self.started_at = None;
        self.next_index = 0;
        self.metrics.reset();
        tracing::warn!(
            target: "chain_effect::flood",
            simulator = %self.config.id,
            "simulator.reset"
        );
    }
}

impl Simulator for FloodSim {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn consumer_topics(&self) -> Vec<String> {
        vec![self.topics.time.clone()]
    }

    fn producer_topics(&self) -> Vec<String> {
        vec![self.topics.flood.clone(), self.topics.lifecycle.clone()]
    }

    fn startup(&mut self) -> Vec<Effect> {
        if self.immediate {
            self.publish_all()
        } else {
            Vec::new()
        }
    }

    fn on_message(&mut self, _topic: &str, _message: &ChainDataMessage) -> Vec<Effect> {
        Vec::new()
    }

    fn on_lifecycle(&mut self, _signal: &ChainScenario) -> Vec<Effect> {
        Vec::new()
    }

    fn on_time(&mut self, control: &TimeControl) -> Vec<Effect> {
        match control.state {
            TimeState::Started => {
                let mut effects = Vec::new();
                if self.started_at.is_none() {
                    effects.extend(self.begin(control.trial_time));
                }
                effects.extend(self.publish_due(control.trial_time));
                effects
            }
            TimeState::Stopped | TimeState::Reset => {
                self.rewind();
                Vec::new()
            }
            TimeState::Initialization | TimeState::Paused => Vec::new(),
        }
    }
}
