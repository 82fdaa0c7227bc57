//! Buildset completion.

use buildfarm_core::{BuildRequest, BuildResult, BuildSetCompletion, BuildSetId};
use buildfarm_db::RequestStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::SchedulerResult;
use crate::events::SchedulerEvent;

/// The children a buildset's completion and result are judged on: those
/// neither merged nor cancelled, or all of them when none qualify.
pub fn counted_requests(requests: &[BuildRequest]) -> Vec<&BuildRequest> {
    let counted: Vec<&BuildRequest> = requests
        .iter()
        .filter(|r| !r.is_merged() && r.results != Some(BuildResult::Canceled))
        .collect();
    if counted.is_empty() {
        requests.iter().collect()
    } else {
        counted
    }
}

/// Completes buildsets once their requests are done.
pub struct BuildSetAggregator {
    store: Arc<dyn RequestStore>,
    events: broadcast::Sender<SchedulerEvent>,
}

impl BuildSetAggregator {
    pub fn new(store: Arc<dyn RequestStore>, events: broadcast::Sender<SchedulerEvent>) -> Self {
        Self { store, events }
    }

    /// Complete `bsid` if every counted child is complete.
    ///
    /// Returns `None` while children are outstanding. Only the call that
    /// flips the buildset emits [`SchedulerEvent::BuildSetCompleted`].
    pub async fn maybe_complete_buildset(
        &self,
        bsid: BuildSetId,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<BuildSetCompletion>> {
        let requests = self.store.get_requests_for_buildset(bsid).await?;
        let counted = counted_requests(&requests);
        if counted.is_empty() || counted.iter().any(|r| !r.complete) {
            return Ok(None);
        }

        let results = BuildResult::worst_of(counted.iter().filter_map(|r| r.results))
            .unwrap_or(BuildResult::Success);

        let completion = self.store.complete_buildset(bsid, results, now).await?;
        match completion {
            BuildSetCompletion::Completed => {
                info!(bsid = %bsid, results = %results, "Buildset complete");
                let _ = self
                    .events
                    .send(SchedulerEvent::BuildSetCompleted { bsid, results });
            }
            BuildSetCompletion::AlreadyComplete => {
                debug!(bsid = %bsid, "Buildset already completed by a sibling");
            }
        }
        Ok(Some(completion))
    }
}
