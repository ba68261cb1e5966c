use std::path::PathBuf;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use anyhow::Context;
use chain_proto::{BusMessage, ChainDataMessage, ChainScenario, Payload, SimStatus};
use chain_sim::{InMemoryBus, MessageBus};
use tokio::sync::mpsc::{self, UnboundedReceiver};

static INIT: Once = Once::new();

pub const SETTLE: Duration = Duration::from_secs(10);

pub fn ensure_test_config() {
    INIT.call_once(|| {
        let config_path = fixtures().join("test_chain_config.json");

        debug_assert!(
            config_path.exists(),
            "missing test chain config at {}",
            config_path.display()
        );

        std::env::set_var("CHAIN_CONFIG_PATH", &config_path);
    });
}

pub fn fixtures() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

pub fn fixture_data() -> PathBuf {
    fixtures().join("data")
}

/// Keeps every message published on the attached topics.
#[derive(Clone, Default)]
pub struct Recorder {
    messages: Arc<Mutex<Vec<BusMessage>>>,
}

impl Recorder {
    pub fn attach(bus: &InMemoryBus, topics: &[&str]) -> Self {
        let recorder = Recorder::default();
        for topic in topics {
            let messages = Arc::clone(&recorder.messages);
            bus.subscribe(
                topic,
                Arc::new(move |message: BusMessage| {
                    messages.lock().expect("recorder lock").push(message);
                }),
            )
            .expect("recorder subscribe");
        }
        recorder
    }

    pub fn data(&self, topic: &str) -> Vec<ChainDataMessage> {
        self.messages
            .lock()
            .expect("recorder lock")
            .iter()
            .filter(|message| message.topic == topic)
            .filter_map(|message| match &message.payload {
                Payload::Data(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn layer(&self, topic: &str, scenario: &str, timestamp: i64) -> Option<ChainDataMessage> {
        self.data(topic)
            .into_iter()
            .find(|data| data.id == scenario && data.timestamp == timestamp)
    }

    pub fn signals(&self, sim_id: &str) -> Vec<ChainScenario> {
        self.messages
            .lock()
            .expect("recorder lock")
            .iter()
            .filter_map(|message| match &message.payload {
                Payload::Scenario(signal) if signal.sim_id == sim_id => Some(signal.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Scenario ids announced FINISHED by `sim_id`.
pub fn watch_finished(bus: &InMemoryBus, lifecycle: &str, sim_id: &str) -> UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    let sim_id = sim_id.to_string();
    bus.subscribe(
        lifecycle,
        Arc::new(move |message: BusMessage| {
            if let Payload::Scenario(signal) = &message.payload {
                if signal.sim_id == sim_id && signal.sim_status == SimStatus::Finished {
                    let _ = tx.send(signal.scenario_id.clone());
                }
            }
        }),
    )
    .expect("watch subscribe");
    rx
}

pub async fn wait_finished(finished: &mut UnboundedReceiver<String>) -> anyhow::Result<String> {
    tokio::time::timeout(SETTLE, finished.recv())
        .await
        .context("timed out waiting for FINISHED")?
        .context("lifecycle watch closed")
}
