//! Build request distribution for the buildfarm coordinator.
//!
//! Selects queued and paused requests, matches them to workers, claims
//! them in the shared store and drives each build through start, pause,
//! resume and finish. Several coordinators may share one store; the claim
//! decides which of them runs a request.
//!
//! This crate is embedded by the coordinator service that owns the
//! workers. It supplies a [`buildfarm_core::BuildExecutor`], reports worker
//! connections and build progress to the distributor, and drives it with
//! [`BuildRequestDistributor::run`]:
//!
//! ```ignore
//! let distributor = Arc::new(BuildRequestDistributor::new(&config, store, executor));
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let handle = tokio::spawn(distributor.clone().run(shutdown_rx));
//! ```

pub mod aggregator;
pub mod context;
pub mod controller;
pub mod distributor;
pub mod error;
pub mod events;
pub mod matcher;
pub mod merge;
pub mod selector;
pub mod submit;
pub mod triggers;

#[cfg(test)]
mod testing;

pub use aggregator::BuildSetAggregator;
pub use context::SchedulerContext;
pub use controller::{BuildController, CancelOutcome, ChainStopOutcome};
pub use distributor::BuildRequestDistributor;
pub use error::{SchedulerError, SchedulerResult};
pub use events::SchedulerEvent;
pub use matcher::SlaveMatcher;
pub use merge::MergeEngine;
pub use selector::{BuilderLoad, PrioritySelector, Urgency, WaitDepthUrgency};
pub use submit::{BuildSetRequest, Submission};
pub use triggers::QueueTriggers;
