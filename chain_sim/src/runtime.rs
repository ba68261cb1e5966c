//! Runs every simulator on its own tokio task.
//!
//! Bus handlers only push into the actor's inbox; the task handles one inbox
//! item at a time and applies the resulting effects in order before taking the
//! next one.

use std::sync::Arc;

use chain_proto::BusMessage;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};

use crate::{
    bus::{BusError, MessageBus},
    simulator::{Effect, Recheck, Simulator},
};

#[derive(Debug)]
enum Envelope {
    Bus(BusMessage),
    Recheck(Recheck),
}

struct Actor {
    simulator: Box<dyn Simulator>,
    inbox: UnboundedReceiver<Envelope>,
    sender: UnboundedSender<Envelope>,
}

pub struct ActorRuntime {
    bus: Arc<dyn MessageBus>,
    pending: Vec<Actor>,
    tasks: Vec<JoinHandle<()>>,
}

impl ActorRuntime {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            pending: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn bus(&self) -> Arc<dyn MessageBus> {
        Arc::clone(&self.bus)
    }

    /// Subscribe `simulator`'s inbox to its consumer topics. Messages queue
    /// up until [`ActorRuntime::start`].
    pub fn register(&mut self, simulator: Box<dyn Simulator>) -> Result<(), BusError> {
        let (sender, inbox) = mpsc::unbounded_channel();
        for topic in simulator.consumer_topics() {
            let inbox_sender = sender.clone();
            let actor_id = simulator.id().to_string();
            self.bus.subscribe(
                &topic,
                Arc::new(move |message: BusMessage| {
                    if inbox_sender.send(Envelope::Bus(message)).is_err() {
                        tracing::trace!(
                            target: "chain_effect::runtime",
                            actor = %actor_id,
                            "runtime.inbox.closed"
                        );
                    }
                }),
            )?;
        }
        tracing::info!(
            target: "chain_effect::runtime",
            actor = simulator.id(),
            consumes = ?simulator.consumer_topics(),
            produces = ?simulator.producer_topics(),
            "runtime.actor.registered"
        );
        self.pending.push(Actor {
            simulator,
            inbox,
            sender,
        });
        Ok(())
    }

    /// Spawn a task per registered actor. Must run inside a tokio runtime.
    pub fn start(&mut self) {
        for actor in self.pending.drain(..) {
            let bus = Arc::clone(&self.bus);
            self.tasks.push(tokio::spawn(run_actor(actor, bus)));
        }
    }

    pub fn running(&self) -> usize {
        self.tasks.len()
    }

    /// Close the bus, then stop every actor task.
    pub async fn shutdown(self) {
        self.bus.close();
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn run_actor(actor: Actor, bus: Arc<dyn MessageBus>) {
    let Actor {
        mut simulator,
        mut inbox,
        sender,
    } = actor;
    let id = simulator.id().to_string();
    apply_effects(&id, simulator.startup(), bus.as_ref(), &sender);

    while let Some(envelope) = inbox.recv().await {
        let effects = match &envelope {
            Envelope::Bus(message) => simulator.handle(message),
            Envelope::Recheck(recheck) => simulator.on_recheck(recheck),
        };
        apply_effects(&id, effects, bus.as_ref(), &sender);
    }
    tracing::debug!(target: "chain_effect::runtime", actor = %id, "runtime.actor.stopped");
}

fn apply_effects(
    id: &str,
    effects: Vec<Effect>,
    bus: &dyn MessageBus,
    sender: &UnboundedSender<Envelope>,
) {
    for effect in effects {
        match effect {
            Effect::Publish(message) => {
                if let Err(err) = bus.publish(message) {
                    tracing::error!(
                        target: "chain_effect::runtime",
                        actor = id,
                        error = %err,
                        "runtime.publish.failed"
                    );
                }
            }
            Effect::Schedule { delay, recheck } => {
                let sender = sender.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = sender.send(Envelope::Recheck(recheck));
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chain_proto::{ChainDataMessage, ChainScenario, Payload, TimeControl};

    use super::*;
    use crate::bus::InMemoryBus;

    /// Echoes each input after one re-check round trip.
    struct Echo;

    impl Simulator for Echo {
        fn id(&self) -> &str {
            "Echo"
        }

        fn consumer_topics(&self) -> Vec<String> {
            vec!["in".to_string()]
        }

        fn producer_topics(&self) -> Vec<String> {
            vec!["out".to_string()]
        }

        fn startup(&mut self) -> Vec<Effect> {
            vec![Effect::publish(
                "out",
                ChainDataMessage::new("demo", "Echo", -1, false, "ready"),
            )]
        }

        fn on_message(&mut self, _topic: &str, message: &ChainDataMessage) -> Vec<Effect> {
            vec![Effect::Schedule {
                delay: Duration::from_millis(5),
                recheck: Recheck {
                    scenario: message.id.clone(),
                    timestamp: message.timestamp,
                    attempt: 1,
                    epoch: 0,
                },
            }]
        }

        fn on_lifecycle(&mut self, _signal: &ChainScenario) -> Vec<Effect> {
            Vec::new()
        }

        fn on_time(&mut self, _control: &TimeControl) -> Vec<Effect> {
            Vec::new()
        }

        fn on_recheck(&mut self, recheck: &Recheck) -> Vec<Effect> {
            vec![Effect::publish(
                "out",
                ChainDataMessage::new(&recheck.scenario, "Echo", recheck.timestamp, true, "echo"),
            )]
        }
    }

    #[tokio::test]
    async fn actor_publishes_startup_then_rechecked_output() {
        let bus = Arc::new(InMemoryBus::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(
            "out",
            Arc::new(move |message: BusMessage| {
                let _ = tx.send(message);
            }),
        )
        .expect("subscribe");

        let mut runtime = ActorRuntime::new(bus.clone());
        runtime.register(Box::new(Echo)).expect("register");
        bus.publish(BusMessage::new(
            "in",
            ChainDataMessage::new("demo", "Test", 7, false, ""),
        ))
        .expect("publish");
        runtime.start();
        assert_eq!(runtime.running(), 1);

        let mut received = Vec::new();
        for _ in 0..2 {
            let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timely")
                .expect("open");
            match message.payload {
                Payload::Data(data) => received.push((data.timestamp, data.data)),
                other => panic!("unexpected payload {other:?}"),
            }
        }
        assert_eq!(
            received,
            vec![(-1, "ready".to_string()), (7, "echo".to_string())]
        );
        runtime.shutdown().await;
        let late = bus.publish(BusMessage::new(
            "in",
            ChainDataMessage::new("demo", "Test", 8, false, ""),
        ));
        assert!(matches!(late, Err(BusError::Closed(_))));
    }
}
