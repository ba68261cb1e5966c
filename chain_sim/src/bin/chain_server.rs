use std::{
    fs::{self, File},
    io::{LineWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use chain_proto::{
    decode_message_json, encode_message_json, BusMessage, Payload, SimStatus, TimeControl,
    TimeState,
};
use clap::Parser;
use tracing::{info, warn};

use chain_sim::{
    load_chain_config_from_env, ActorRuntime, CareSim, ChainConfig, FloodSim, InMemoryBus,
    MessageBus, PowerSim, ReliefSim,
};

/// Run the flood cascade over a data folder until the care layer finishes.
#[derive(Debug, Parser)]
#[command(name = "chain_server")]
struct Args {
    /// Folder holding the FloodSim grids and the PowerSim/CareSim inventories.
    #[arg(long, default_value = "data")]
    data: PathBuf,
    /// Chain config JSON. Without it `CHAIN_CONFIG_PATH` or the builtin copy is used.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Publish every flood grid at startup instead of following trial time.
    #[arg(long)]
    immediate: bool,
    /// Trial time advanced per tick, in milliseconds.
    #[arg(long, default_value_t = 3_600_000)]
    tick_ms: i64,
    /// Wall-clock pause between ticks, in milliseconds.
    #[arg(long, default_value_t = 250)]
    tick_interval_ms: u64,
    /// Append every bus message to this file as JSON lines.
    #[arg(long)]
    record: Option<PathBuf>,
    /// Replay the flood traffic of a recorded JSON lines file instead of
    /// reading the flood grid folder.
    #[arg(long)]
    replay: Option<PathBuf>,
}

/// Subscribe a JSON lines writer to every chain topic.
fn record_bus(bus: &InMemoryBus, config: &ChainConfig, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let writer = Arc::new(Mutex::new(LineWriter::new(file)));
    let topics = &config.topics;
    for topic in [
        &topics.lifecycle,
        &topics.time,
        &topics.flood,
        &topics.water_height,
        &topics.water_contour,
        &topics.power,
        &topics.care,
        &topics.alerts,
    ] {
        let writer = Arc::clone(&writer);
        bus.subscribe(
            topic,
            Arc::new(move |message: BusMessage| {
                let line = match encode_message_json(&message) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(target: "chain_effect::server", error = %err, "record.encode_failed");
                        return;
                    }
                };
                let written = writer
                    .lock()
                    .map_err(|_| std::io::Error::other("record writer poisoned"))
                    .and_then(|mut writer| writeln!(writer, "{line}"));
                if let Err(err) = written {
                    warn!(target: "chain_effect::server", error = %err, "record.write_failed");
                }
            }),
        )?;
    }
    info!(target: "chain_effect::server", path = %path.display(), "record.started");
    Ok(())
}

/// Flood data and flood lifecycle signals from a recording, in file order.
fn load_replay(path: &Path, config: &ChainConfig) -> Result<Vec<BusMessage>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("reading replay {}", path.display()))?;
    let mut messages = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let message = decode_message_json(line)
            .with_context(|| format!("{}:{}", path.display(), index + 1))?;
        let from_flood = match &message.payload {
            Payload::Data(data) => data.simulator == config.flood.id,
            Payload::Scenario(signal) => signal.sim_id == config.flood.id,
            Payload::Time(_) | Payload::Alert(_) => false,
        };
        if from_flood {
            messages.push(message);
        }
    }
    Ok(messages)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let (config, config_path) = match &args.config {
        Some(path) => (
            Arc::new(
                ChainConfig::from_file(path)
                    .with_context(|| format!("loading chain config {}", path.display()))?,
            ),
            Some(path.clone()),
        ),
        None => {
            let (config, metadata) = load_chain_config_from_env();
            (config, metadata.path().cloned())
        }
    };
    info!(
        target: "chain_effect::server",
        path = %config_path
            .as_ref()
            .map_or_else(|| "builtin".to_string(), |path| path.display().to_string()),
        "chain_config.source"
    );

    let bus = Arc::new(InMemoryBus::new());
    if let Some(path) = &args.record {
        record_bus(&bus, &config, path)?;
    }
    let (finished_tx, mut finished_rx) = tokio::sync::mpsc::unbounded_channel();
    let care_id = config.care.id.clone();
    bus.subscribe(
        &config.topics.lifecycle,
        Arc::new(move |message: BusMessage| {
            if let Payload::Scenario(signal) = &message.payload {
                if signal.sim_id == care_id && signal.sim_status == SimStatus::Finished {
                    let _ = finished_tx.send(signal.scenario_id.clone());
                }
            }
        }),
    )?;

    let replay = args
        .replay
        .as_deref()
        .map(|path| load_replay(path, &config))
        .transpose()?;
    let power = PowerSim::from_data_folder(&config, &args.data).context("loading power stations")?;
    let care = CareSim::from_data_folder(&config, &args.data).context("loading care objects")?;

    let mut runtime = ActorRuntime::new(bus.clone());
    runtime.register(Box::new(ReliefSim::new(&config)))?;
    runtime.register(Box::new(power))?;
    runtime.register(Box::new(care))?;
    if replay.is_none() {
        let flood = FloodSim::from_data_folder(&config, &args.data)
            .context("loading flood grids")?
            .immediate(args.immediate);
        runtime.register(Box::new(flood))?;
    }
    runtime.start();

    info!(
        target: "chain_effect::server",
        data = %args.data.display(),
        immediate = args.immediate,
        replay = replay.is_some(),
        actors = runtime.running(),
        "chain_server.ready"
    );

    if let Some(messages) = replay {
        info!(target: "chain_effect::server", messages = messages.len(), "replay.started");
        for message in messages {
            bus.publish(message)?;
        }
    }

    let clock = (!args.immediate && args.replay.is_none()).then(|| {
        let bus = bus.clone();
        let topic = config.topics.time.clone();
        let tick_ms = args.tick_ms;
        let pause = Duration::from_millis(args.tick_interval_ms);
        tokio::spawn(async move {
            let mut trial_time = 0;
            loop {
                let control = TimeControl::new(TimeState::Started, trial_time);
                if let Err(err) = bus.publish(BusMessage::new(&topic, control)) {
                    warn!(target: "chain_effect::server", error = %err, "clock.publish_failed");
                }
                trial_time += tick_ms;
                tokio::time::sleep(pause).await;
            }
        })
    });

    let scenario = finished_rx
        .recv()
        .await
        .context("care simulator stopped before finishing a scenario")?;
    info!(target: "chain_effect::server", scenario = %scenario, "chain_server.finished");

    if let Some(clock) = clock {
        clock.abort();
    }
    runtime.shutdown().await;
    Ok(())
}
