//! Per-scenario bookkeeping that decides when an actor may announce FINISHED.
//!
//! Upstream layers arrive unordered and possibly twice. The lifecycle counts a
//! timestamp as received once every dependency delivered it, remembers which
//! timestamps each dependency announced, and reports completion only when the
//! two sides agree.

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Uninitialized,
    Active,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// New timestamp for this dependency. `joined` is set once every
    /// dependency has delivered it.
    Accepted { joined: bool },
    Duplicate,
    /// The scenario already finished.
    Closed,
}

#[derive(Debug, Clone)]
pub struct ScenarioLifecycle {
    dependencies: Vec<String>,
    phase: LifecyclePhase,
    received: usize,
    sent: usize,
    finished_dependencies: BTreeSet<String>,
    processed: HashMap<String, BTreeSet<i64>>,
    announced: HashMap<String, BTreeSet<i64>>,
}

impl ScenarioLifecycle {
    pub fn new(dependencies: Vec<String>) -> Self {
        Self {
            dependencies,
            phase: LifecyclePhase::Uninitialized,
            received: 0,
            sent: 0,
            finished_dependencies: BTreeSet::new(),
            processed: HashMap::new(),
            announced: HashMap::new(),
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn is_finished(&self) -> bool {
        self.phase == LifecyclePhase::Finished
    }

    pub fn depends_on(&self, simulator: &str) -> bool {
        self.dependencies.iter().any(|dependency| dependency == simulator)
    }

    /// Move to `Active`. Returns true only on the first call.
    pub fn activate(&mut self) -> bool {
        if self.phase != LifecyclePhase::Uninitialized {
            return false;
        }
        self.phase = LifecyclePhase::Active;
        true
    }

    pub fn accept(&mut self, dependency: &str, timestamp: i64) -> Acceptance {
        if self.is_finished() {
            return Acceptance::Closed;
        }
        let fresh = self
            .processed
            .entry(dependency.to_string())
            .or_default()
            .insert(timestamp);
        if !fresh {
            return Acceptance::Duplicate;
        }
        let joined = self.is_joined(timestamp);
        if joined {
            self.received += 1;
        }
        Acceptance::Accepted { joined }
    }

    /// True when every dependency has delivered `timestamp`.
    pub fn is_joined(&self, timestamp: i64) -> bool {
        self.dependencies.iter().all(|dependency| {
            self.processed
                .get(dependency)
                .is_some_and(|seen| seen.contains(&timestamp))
        })
    }

    pub fn record_sent(&mut self) {
        self.sent += 1;
    }

    pub fn announce(&mut self, dependency: &str, timestamp: i64) {
        self.announced
            .entry(dependency.to_string())
            .or_default()
            .insert(timestamp);
    }

    pub fn finish_dependency(&mut self, dependency: &str) -> bool {
        self.finished_dependencies.insert(dependency.to_string())
    }

    pub fn all_dependencies_finished(&self) -> bool {
        self.dependencies
            .iter()
            .all(|dependency| self.finished_dependencies.contains(dependency))
    }

    fn announced_received(&self) -> bool {
        self.announced.iter().all(|(dependency, timestamps)| {
            let seen = self.processed.get(dependency);
            timestamps
                .iter()
                .all(|timestamp| seen.is_some_and(|seen| seen.contains(timestamp)))
        })
    }

    /// Whether FINISHED may be announced. `outstanding` is set while the
    /// actor still holds deferred or re-checked work for this scenario.
    pub fn ready_to_finish(&self, outstanding: bool) -> bool {
        self.phase == LifecyclePhase::Active
            && !outstanding
            && self.all_dependencies_finished()
            && self.received == self.sent
            && self.announced_received()
    }

    pub fn mark_finished(&mut self) {
        self.phase = LifecyclePhase::Finished;
    }
}
