//! Events emitted while distributing and running builds.

use buildfarm_core::{BuildRequestId, BuildResult, BuildSetId, PoolHint};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    BuildStarted {
        brid: BuildRequestId,
        number: i32,
        worker: String,
    },
    BuildResumed {
        brid: BuildRequestId,
        number: i32,
        worker: String,
    },
    BuildPaused {
        brid: BuildRequestId,
        resume_pool: Option<PoolHint>,
    },
    BuildFinished {
        brid: BuildRequestId,
        results: BuildResult,
    },
    /// Fires once per buildset.
    BuildSetCompleted {
        bsid: BuildSetId,
        results: BuildResult,
    },
}
