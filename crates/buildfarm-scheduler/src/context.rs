//! Builder and worker state shared by the selector, matcher and controller.

use buildfarm_config::{BuilderConfig, SchedulerConfig};
use buildfarm_core::BuildRequestId;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Default)]
struct WorkerState {
    connected: bool,
    /// Request whose attempt currently owns the worker.
    busy_with: Option<BuildRequestId>,
}

/// Pool membership of every builder plus the live state of workers and
/// resource locks.
///
/// Workers and locks are only taken and given back through [`acquire`] and
/// [`release`], on behalf of a single attempt.
///
/// [`acquire`]: SchedulerContext::acquire
/// [`release`]: SchedulerContext::release
#[derive(Debug, Default)]
pub struct SchedulerContext {
    builders: BTreeMap<String, BuilderConfig>,
    workers: HashMap<String, WorkerState>,
    locks: HashMap<String, BuildRequestId>,
}

impl SchedulerContext {
    pub fn new(builders: impl IntoIterator<Item = BuilderConfig>) -> Self {
        Self {
            builders: builders
                .into_iter()
                .map(|b| (b.name.clone(), b))
                .collect(),
            ..Self::default()
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.builders.iter().cloned())
    }

    pub fn builder(&self, name: &str) -> Option<&BuilderConfig> {
        self.builders.get(name)
    }

    /// Returns true if the worker was not connected before.
    pub fn connect_worker(&mut self, name: &str) -> bool {
        let state = self.workers.entry(name.to_string()).or_default();
        let was_connected = state.connected;
        state.connected = true;
        !was_connected
    }

    /// Mark a worker gone. An attempt running on it keeps ownership until
    /// its controller releases it.
    pub fn disconnect_worker(&mut self, name: &str) -> Option<BuildRequestId> {
        let state = self.workers.get_mut(name)?;
        state.connected = false;
        state.busy_with
    }

    /// Connected and idle.
    pub fn is_worker_available(&self, name: &str) -> bool {
        self.workers
            .get(name)
            .is_some_and(|w| w.connected && w.busy_with.is_none())
    }

    pub fn busy_with(&self, name: &str) -> Option<BuildRequestId> {
        self.workers.get(name).and_then(|w| w.busy_with)
    }

    pub fn locks_free(&self, locks: &[String]) -> bool {
        locks.iter().all(|l| !self.locks.contains_key(l))
    }

    pub fn lock_owner(&self, lock: &str) -> Option<BuildRequestId> {
        self.locks.get(lock).copied()
    }

    /// Take a worker and the given locks for one attempt, all or nothing.
    pub fn acquire(&mut self, worker: &str, brid: BuildRequestId, locks: &[String]) -> bool {
        if !self.is_worker_available(worker) || !self.locks_free(locks) {
            return false;
        }
        if let Some(state) = self.workers.get_mut(worker) {
            state.busy_with = Some(brid);
        }
        for lock in locks {
            self.locks.insert(lock.clone(), brid);
        }
        true
    }

    /// Give back the worker and every lock held by `brid`'s attempt.
    pub fn release(&mut self, worker: &str, brid: BuildRequestId) {
        if let Some(state) = self.workers.get_mut(worker) {
            if state.busy_with == Some(brid) {
                state.busy_with = None;
            }
        }
        self.locks.retain(|_, owner| *owner != brid);
    }
}
