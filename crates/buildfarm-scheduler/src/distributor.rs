//! The dispatch loop.
//!
//! Each queue runs its own loop: select a request and a worker, claim the
//! request, then start or resume it. A loop sleeps until a trigger fires
//! (worker connected or freed, request submitted or paused) or the poll
//! interval elapses.

use buildfarm_config::{BuilderConfig, SchedulerConfig};
use buildfarm_core::{BuildExecutor, BuildRequestId, BuildResult, ClaimOutcome, CoordinatorId, QueueKind};
use buildfarm_db::RequestStore;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::aggregator::BuildSetAggregator;
use crate::context::SchedulerContext;
use crate::controller::BuildController;
use crate::error::SchedulerResult;
use crate::events::SchedulerEvent;
use crate::selector::{PrioritySelector, Urgency, WaitDepthUrgency};
use crate::submit::{self, BuildSetRequest, Submission};
use crate::triggers::QueueTriggers;

const EVENT_CAPACITY: usize = 256;

pub struct BuildRequestDistributor {
    store: Arc<dyn RequestStore>,
    ctx: Arc<Mutex<SchedulerContext>>,
    builders: Vec<BuilderConfig>,
    controller: Arc<BuildController>,
    aggregator: Arc<BuildSetAggregator>,
    selector: PrioritySelector,
    triggers: Arc<QueueTriggers>,
    events: broadcast::Sender<SchedulerEvent>,
    coordinator: CoordinatorId,
    poll_interval: Duration,
}

impl BuildRequestDistributor {
    pub fn new(
        config: &SchedulerConfig,
        store: Arc<dyn RequestStore>,
        executor: Arc<dyn BuildExecutor>,
    ) -> Self {
        let coordinator = config
            .coordinator
            .as_deref()
            .map(CoordinatorId::new)
            .unwrap_or_else(CoordinatorId::generate);
        let ctx = Arc::new(Mutex::new(SchedulerContext::from_config(config)));
        let triggers = Arc::new(QueueTriggers::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let aggregator = Arc::new(BuildSetAggregator::new(store.clone(), events.clone()));
        let controller = Arc::new(
            BuildController::new(
                store.clone(),
                executor,
                ctx.clone(),
                aggregator.clone(),
                triggers.clone(),
                events.clone(),
                coordinator.clone(),
            )
            .with_chain_stop_retries(config.chain_stop_retries),
        );

        Self {
            store,
            ctx,
            builders: config.builders.clone(),
            controller,
            aggregator,
            selector: PrioritySelector::new(Arc::new(WaitDepthUrgency::new(config.urgency))),
            triggers,
            events,
            coordinator,
            poll_interval: config.poll_interval,
        }
    }

    /// Replace the builder urgency function.
    pub fn with_urgency(mut self, urgency: Arc<dyn Urgency>) -> Self {
        self.selector = PrioritySelector::new(urgency);
        self
    }

    pub fn coordinator(&self) -> &CoordinatorId {
        &self.coordinator
    }

    pub fn controller(&self) -> &Arc<BuildController> {
        &self.controller
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub async fn is_worker_available(&self, name: &str) -> bool {
        self.ctx.lock().await.is_worker_available(name)
    }

    /// Dispatch as many requests of `queue` as workers allow. Returns the
    /// number started or resumed.
    ///
    /// Losing a claim race is not an error; the request is skipped. A
    /// failed start gives the claim back so the request is picked up again
    /// on a later tick.
    pub async fn tick(&self, queue: QueueKind) -> SchedulerResult<usize> {
        let ready = self.store.select_ready_requests(queue, &[]).await?;
        if ready.is_empty() {
            return Ok(0);
        }

        let mut tried = HashSet::new();
        let mut dispatched = 0;
        loop {
            let selection = {
                let ctx = self.ctx.lock().await;
                self.selector
                    .select_next(queue, &ready, &ctx, &tried, Utc::now())
            };
            let Some(selection) = selection else {
                break;
            };
            let request = &selection.request;
            tried.insert(request.id);

            match self
                .store
                .claim_request(request.id, &self.coordinator, Utc::now())
                .await?
            {
                ClaimOutcome::AlreadyClaimed => {
                    debug!(brid = %request.id, "Request claimed by another coordinator");
                    continue;
                }
                ClaimOutcome::Claimed => {}
            }

            let result = match queue {
                QueueKind::Unclaimed => self.controller.start(request, &selection.worker).await,
                QueueKind::Paused => self.controller.resume(request, &selection.worker).await,
            };
            match result {
                Ok(()) => dispatched += 1,
                Err(e) => {
                    warn!(
                        brid = %request.id,
                        worker = %selection.worker,
                        error = %e,
                        "Failed to dispatch request; releasing claim"
                    );
                    if let Err(e) = self.store.release_claim(request.id, &self.coordinator).await {
                        error!(brid = %request.id, error = %e, "Failed to release claim");
                    }
                }
            }
        }
        Ok(dispatched)
    }

    /// Run both dispatch loops until `shutdown` turns true or its sender is
    /// dropped.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(coordinator = %self.coordinator, "Starting build request distributor");
        let unclaimed = tokio::spawn(
            self.clone()
                .run_queue(QueueKind::Unclaimed, shutdown.clone()),
        );
        let paused = tokio::spawn(self.clone().run_queue(QueueKind::Paused, shutdown));

        let (unclaimed, paused) = tokio::join!(unclaimed, paused);
        for result in [unclaimed, paused] {
            if let Err(e) = result {
                error!(error = %e, "Dispatch loop aborted");
            }
        }
        info!(coordinator = %self.coordinator, "Build request distributor stopped");
    }

    async fn run_queue(self: Arc<Self>, queue: QueueKind, mut shutdown: watch::Receiver<bool>) {
        debug!(queue = %queue, "Dispatch loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.tick(queue).await {
                Ok(0) => {}
                Ok(dispatched) => debug!(queue = %queue, dispatched, "Dispatched requests"),
                Err(e) => warn!(queue = %queue, error = %e, "Dispatch tick failed"),
            }

            tokio::select! {
                _ = self.triggers.notified(queue) => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(queue = %queue, "Dispatch loop stopped");
    }

    /// Submit a buildset, merging duplicates into existing requests.
    pub async fn submit_build_set(&self, request: BuildSetRequest) -> SchedulerResult<Submission> {
        let submission = submit::submit_build_set(
            self.store.as_ref(),
            &self.builders,
            &self.coordinator,
            request,
            Utc::now(),
        )
        .await?;

        for (buildername, target) in &submission.merged {
            if let Some(&brid) = submission.buildset.brids.get(buildername) {
                self.follow_completed_target(brid, *target).await?;
            }
        }
        self.triggers.notify(QueueKind::Unclaimed);
        Ok(submission)
    }

    /// A merge target may complete between merge planning and insertion;
    /// its new merged request then takes the target's result directly.
    async fn follow_completed_target(
        &self,
        brid: BuildRequestId,
        target: BuildRequestId,
    ) -> SchedulerResult<()> {
        let target = self.store.get_request(target).await?;
        if !target.complete {
            return Ok(());
        }
        let results = target.results.unwrap_or(BuildResult::Success);
        let now = Utc::now();
        self.store.complete_requests(&[brid], results, now).await?;
        if let Some(number) = self.store.get_build_number_for_request(target.id).await? {
            self.store
                .finish_merged_builds(target.id, &[brid], number)
                .await?;
        }
        debug!(brid = %brid, target = %target.id, "Merged into a target that already completed");

        let request = self.store.get_request(brid).await?;
        self.aggregator
            .maybe_complete_buildset(request.buildset_id, now)
            .await?;
        Ok(())
    }

    /// Wake the queue a request waits in.
    pub async fn on_request_submitted(&self, brid: BuildRequestId) -> SchedulerResult<()> {
        let request = self.store.get_request(brid).await?;
        if let Some(queue) = request.queue() {
            self.triggers.notify(queue);
        }
        Ok(())
    }

    pub async fn on_worker_connected(&self, name: &str) {
        if self.ctx.lock().await.connect_worker(name) {
            info!(worker = %name, "Worker connected");
        }
        self.triggers.notify_all();
    }

    pub async fn on_worker_disconnected(&self, name: &str) {
        if let Some(brid) = self.ctx.lock().await.disconnect_worker(name) {
            warn!(worker = %name, brid = %brid, "Worker disconnected while running a build");
        } else {
            info!(worker = %name, "Worker disconnected");
        }
    }

    /// A worker finished whatever it was doing outside this coordinator.
    pub fn on_worker_available(&self, name: &str) {
        debug!(worker = %name, "Worker available");
        self.triggers.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::MergeEngine;
    use crate::testing::{Harness, stamps};
    use buildfarm_core::{PoolHint, Properties};
    use buildfarm_db::{
        BuildRepo, BuildRequestRepo, BuildSetRepo, NewBuildRequest, NewBuildSet, SourceStampRepo,
    };
    use serde_json::json;

    fn b1() -> BuilderConfig {
        BuilderConfig::new("b1", &["w1"]).with_resume_pool(&["w2"])
    }

    async fn submit(h: &Harness, builders: &[&str]) -> Submission {
        h.distributor
            .submit_build_set(BuildSetRequest::new(
                stamps(&h.store, Some("abc")).await,
                "test",
                builders,
            ))
            .await
            .unwrap()
    }

    fn drain(rx: &mut broadcast::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_merged_request_shares_build_number() {
        let h = Harness::new(vec![b1()]).await;
        h.distributor.on_worker_connected("w1").await;

        let first = h
            .distributor
            .submit_build_set(
                BuildSetRequest::new(stamps(&h.store, Some("abc")).await, "first", &["b1"])
                    .with_property("priority", json!("high"), "test"),
            )
            .await
            .unwrap();
        assert_eq!(h.distributor.tick(QueueKind::Unclaimed).await.unwrap(), 1);

        let second = h
            .distributor
            .submit_build_set(
                BuildSetRequest::new(stamps(&h.store, Some("abc")).await, "second", &["b1"])
                    .with_property("priority", json!("high"), "test"),
            )
            .await
            .unwrap();
        let (first, second) = (first.buildset.brids["b1"], second.buildset.brids["b1"]);

        let number = h.store.get_build_number_for_request(first).await.unwrap();
        assert!(number.is_some());
        assert_eq!(
            h.store.get_build_number_for_request(second).await.unwrap(),
            number
        );
        assert_eq!(
            h.store.get_request(second).await.unwrap().merge_brid,
            Some(first)
        );

        // no independent build for the merged request
        assert_eq!(h.distributor.tick(QueueKind::Unclaimed).await.unwrap(), 0);
        assert_eq!(h.executor.started().len(), 1);
    }

    #[tokio::test]
    async fn test_pinned_to_missing_worker_stays_queued() {
        let h = Harness::new(vec![BuilderConfig::new("b1", &["w1", "w-gone"])]).await;
        h.distributor.on_worker_connected("w1").await;
        let submission = h
            .distributor
            .submit_build_set(
                BuildSetRequest::new(stamps(&h.store, Some("abc")).await, "pinned", &["b1"])
                    .with_property("selected_worker", json!("w-gone"), "test"),
            )
            .await
            .unwrap();
        let brid = submission.buildset.brids["b1"];

        for _ in 0..5 {
            assert_eq!(h.distributor.tick(QueueKind::Unclaimed).await.unwrap(), 0);
        }
        let request = h.store.get_request(brid).await.unwrap();
        assert!(!request.complete);
        assert!(h.store.get_claim(brid).await.unwrap().is_none());
        assert!(h.executor.started().is_empty());
    }

    #[tokio::test]
    async fn test_pause_resume_round_trip() {
        let h = Harness::new(vec![b1()]).await;
        let mut rx = h.distributor.subscribe();
        h.distributor.on_worker_connected("w1").await;
        let submission = submit(&h, &["b1"]).await;
        let brid = submission.buildset.brids["b1"];

        assert_eq!(h.distributor.tick(QueueKind::Unclaimed).await.unwrap(), 1);
        let controller = h.distributor.controller();
        controller.step_started(brid, 3).await.unwrap();
        controller.pause_current_build(brid, None).await.unwrap();

        let request = h.store.get_request(brid).await.unwrap();
        assert!(!request.complete);
        assert_eq!(request.results, Some(BuildResult::Resume));
        assert!(h.distributor.is_worker_available("w1").await);

        let builds = h.store.get_builds_for_request(brid).await.unwrap();
        assert_eq!(builds.len(), 1);
        assert!(builds[0].start_time.is_none());
        let history = h.store.get_resume_history(builds[0].id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].last_step, 3);
        assert_eq!(history[0].worker, "w1");

        let paused = h
            .store
            .select_ready_requests(QueueKind::Paused, &[])
            .await
            .unwrap();
        assert_eq!(paused.len(), 1);

        // only the resume pool may pick it up
        assert_eq!(h.distributor.tick(QueueKind::Paused).await.unwrap(), 0);
        h.distributor.on_worker_connected("w2").await;
        assert_eq!(h.distributor.tick(QueueKind::Paused).await.unwrap(), 1);

        let resumed = h.executor.resumed();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].resume_from, Some(3));
        assert_eq!(resumed[0].worker, "w2");
        assert_eq!(resumed[0].number, builds[0].number);

        controller
            .finish_build(brid, BuildResult::Success)
            .await
            .unwrap();
        let request = h.store.get_request(brid).await.unwrap();
        assert!(request.complete);
        assert_eq!(request.results, Some(BuildResult::Success));

        let events = drain(&mut rx);
        assert!(events.contains(&SchedulerEvent::BuildPaused {
            brid,
            resume_pool: None
        }));
        assert!(events.contains(&SchedulerEvent::BuildSetCompleted {
            bsid: submission.buildset.bsid,
            results: BuildResult::Success
        }));
    }

    #[tokio::test]
    async fn test_resume_pool_hint_start() {
        let h = Harness::new(vec![b1()]).await;
        h.distributor.on_worker_connected("w1").await;
        let brid = submit(&h, &["b1"]).await.buildset.brids["b1"];
        assert_eq!(h.distributor.tick(QueueKind::Unclaimed).await.unwrap(), 1);

        h.distributor
            .controller()
            .pause_current_build(brid, Some(PoolHint::Start))
            .await
            .unwrap();
        assert_eq!(h.distributor.tick(QueueKind::Paused).await.unwrap(), 1);
        assert_eq!(h.executor.resumed()[0].worker, "w1");
    }

    #[tokio::test]
    async fn test_corrupt_resume_state_finishes_retry() {
        let h = Harness::new(vec![b1()]).await;
        h.distributor.on_worker_connected("w1").await;
        h.distributor.on_worker_connected("w2").await;
        let submission = submit(&h, &["b1"]).await;
        let brid = submission.buildset.brids["b1"];
        assert_eq!(h.distributor.tick(QueueKind::Unclaimed).await.unwrap(), 1);
        h.distributor
            .controller()
            .pause_current_build(brid, None)
            .await
            .unwrap();

        h.executor.corrupt_resumes();
        h.distributor.tick(QueueKind::Paused).await.unwrap();

        let request = h.store.get_request(brid).await.unwrap();
        assert!(request.complete);
        assert_eq!(request.results, Some(BuildResult::Retry));
        assert!(h.distributor.is_worker_available("w2").await);
        let buildset = h.store.get_buildset(submission.buildset.bsid).await.unwrap();
        assert_eq!(buildset.results, Some(BuildResult::Retry));

        // never offered again
        assert_eq!(h.distributor.tick(QueueKind::Paused).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_coordinators_dispatch_once() {
        let a = Harness::new(vec![b1()]).await;
        let b = Harness::with_store(a.store.clone(), "coord-b", vec![b1()]).await;
        a.distributor.on_worker_connected("w1").await;
        b.distributor.on_worker_connected("w1").await;
        let brid = submit(&a, &["b1"]).await.buildset.brids["b1"];

        let (x, y) = futures::join!(
            a.distributor.tick(QueueKind::Unclaimed),
            b.distributor.tick(QueueKind::Unclaimed)
        );
        assert_eq!(x.unwrap() + y.unwrap(), 1);
        assert_eq!(a.executor.started().len() + b.executor.started().len(), 1);
        assert_eq!(a.store.get_builds_for_request(brid).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_build_insert_releases_claim_and_worker() {
        let h = Harness::new(vec![b1().with_locks(&["db"])]).await;
        h.distributor.on_worker_connected("w1").await;
        let brid = submit(&h, &["b1"]).await.buildset.brids["b1"];

        h.store.fail_next_build_insert();
        assert_eq!(h.distributor.tick(QueueKind::Unclaimed).await.unwrap(), 0);
        assert!(h.store.get_claim(brid).await.unwrap().is_none());
        assert!(h.distributor.is_worker_available("w1").await);

        assert_eq!(h.distributor.tick(QueueKind::Unclaimed).await.unwrap(), 1);
        assert_eq!(h.executor.started().len(), 1);
    }

    #[tokio::test]
    async fn test_executor_start_failure_finishes_exception() {
        let h = Harness::new(vec![b1()]).await;
        h.distributor.on_worker_connected("w1").await;
        let brid = submit(&h, &["b1"]).await.buildset.brids["b1"];

        h.executor.fail_starts();
        assert_eq!(h.distributor.tick(QueueKind::Unclaimed).await.unwrap(), 1);
        let request = h.store.get_request(brid).await.unwrap();
        assert_eq!(request.results, Some(BuildResult::Exception));
        assert!(h.distributor.is_worker_available("w1").await);
    }

    #[tokio::test]
    async fn test_failed_finish_after_start_keeps_claim() {
        let h = Harness::new(vec![b1()]).await;
        h.distributor.on_worker_connected("w1").await;
        let brid = submit(&h, &["b1"]).await.buildset.brids["b1"];

        h.executor.fail_starts();
        h.store.fail_next_build_finish();
        assert_eq!(h.distributor.tick(QueueKind::Unclaimed).await.unwrap(), 1);

        let claim = h.store.get_claim(brid).await.unwrap().unwrap();
        assert_eq!(&claim.coordinator, h.distributor.coordinator());
        assert!(!h.store.get_request(brid).await.unwrap().complete);

        // a second pass must not start another build for the same request
        assert_eq!(h.distributor.tick(QueueKind::Unclaimed).await.unwrap(), 0);
        assert_eq!(h.store.get_builds_for_request(brid).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_pause_keeps_build_running() {
        let h = Harness::new(vec![b1()]).await;
        h.distributor.on_worker_connected("w1").await;
        let brid = submit(&h, &["b1"]).await.buildset.brids["b1"];
        assert_eq!(h.distributor.tick(QueueKind::Unclaimed).await.unwrap(), 1);
        let controller = h.distributor.controller();
        controller.step_started(brid, 2).await.unwrap();

        h.store.fail_next_requeue();
        assert!(controller.pause_current_build(brid, None).await.is_err());
        assert!(controller.is_running(brid).await);
        assert!(!h.distributor.is_worker_available("w1").await);
        assert!(
            h.store
                .select_ready_requests(QueueKind::Paused, &[])
                .await
                .unwrap()
                .is_empty()
        );

        controller.pause_current_build(brid, None).await.unwrap();
        assert!(!controller.is_running(brid).await);
        assert!(h.distributor.is_worker_available("w1").await);
        let paused = h
            .store
            .select_ready_requests(QueueKind::Paused, &[])
            .await
            .unwrap();
        assert_eq!(paused.len(), 1);

        let builds = h.store.get_builds_for_request(brid).await.unwrap();
        let history = h.store.get_resume_history(builds[0].id).await.unwrap();
        assert_eq!(history.last().map(|r| r.last_step), Some(2));
    }

    #[tokio::test]
    async fn test_merge_planned_before_target_start_shares_build() {
        let h = Harness::new(vec![b1()]).await;
        h.distributor.on_worker_connected("w1").await;
        let target = submit(&h, &["b1"]).await.buildset.brids["b1"];

        // merge decided while the target is still queued
        let ssid = stamps(&h.store, Some("abc")).await;
        let new_stamps = h.store.get_sourcestamps(ssid).await.unwrap();
        let candidates = h.store.select_merge_candidates("b1").await.unwrap();
        let merge = MergeEngine
            .find_merge_target("b1", &new_stamps, &candidates)
            .map(MergeEngine::merge_into)
            .unwrap();
        assert_eq!(merge.target, target);

        assert_eq!(h.distributor.tick(QueueKind::Unclaimed).await.unwrap(), 1);

        let submitted = h
            .store
            .add_buildset(NewBuildSet {
                sourcestampset_id: ssid,
                reason: "late".to_string(),
                properties: Properties::new(),
                external_idstring: None,
                triggered_by: None,
                requests: vec![NewBuildRequest {
                    buildername: "b1".to_string(),
                    merge: Some(merge),
                }],
                submitted_at: Utc::now(),
                coordinator: h.distributor.coordinator().clone(),
            })
            .await
            .unwrap();
        let merged = submitted.brids["b1"];

        let number = h.store.get_build_number_for_request(target).await.unwrap();
        assert!(number.is_some());
        assert_eq!(
            h.store.get_build_number_for_request(merged).await.unwrap(),
            number
        );

        h.distributor
            .controller()
            .finish_build(target, BuildResult::Success)
            .await
            .unwrap();
        let request = h.store.get_request(merged).await.unwrap();
        assert!(request.complete);
        assert_eq!(request.results, Some(BuildResult::Success));
        let builds = h.store.get_builds_for_request(merged).await.unwrap();
        assert!(builds[0].finish_time.is_some());
        let bs = h.store.get_buildset(submitted.bsid).await.unwrap();
        assert_eq!(bs.results, Some(BuildResult::Success));
    }

    #[tokio::test]
    async fn test_one_worker_serves_one_request_per_tick() {
        let h = Harness::new(vec![b1()]).await;
        h.distributor.on_worker_connected("w1").await;
        submit(&h, &["b1"]).await;
        h.distributor
            .submit_build_set(BuildSetRequest::new(
                stamps(&h.store, Some("def")).await,
                "other revision",
                &["b1"],
            ))
            .await
            .unwrap();

        assert_eq!(h.distributor.tick(QueueKind::Unclaimed).await.unwrap(), 1);
        assert_eq!(h.distributor.tick(QueueKind::Unclaimed).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_buildset_completes_once_after_all_builders() {
        let h = Harness::new(vec![
            BuilderConfig::new("b1", &["w1"]),
            BuilderConfig::new("b2", &["w2"]),
        ])
        .await;
        let mut rx = h.distributor.subscribe();
        h.distributor.on_worker_connected("w1").await;
        h.distributor.on_worker_connected("w2").await;
        let submission = submit(&h, &["b1", "b2"]).await;
        assert_eq!(h.distributor.tick(QueueKind::Unclaimed).await.unwrap(), 2);

        let controller = h.distributor.controller();
        controller
            .finish_build(submission.buildset.brids["b1"], BuildResult::Success)
            .await
            .unwrap();
        assert!(!h.store.get_buildset(submission.buildset.bsid).await.unwrap().complete);
        controller
            .finish_build(submission.buildset.brids["b2"], BuildResult::Failure)
            .await
            .unwrap();

        let completions: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, SchedulerEvent::BuildSetCompleted { .. }))
            .collect();
        assert_eq!(
            completions,
            vec![SchedulerEvent::BuildSetCompleted {
                bsid: submission.buildset.bsid,
                results: BuildResult::Failure
            }]
        );
    }

    #[tokio::test]
    async fn test_run_dispatches_on_trigger_and_stops() {
        let h = Harness::new(vec![b1()]).await;
        let mut rx = h.distributor.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(h.distributor.clone().run(shutdown_rx));

        let brid = submit(&h, &["b1"]).await.buildset.brids["b1"];
        h.distributor.on_worker_connected("w1").await;

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, SchedulerEvent::BuildStarted { brid: b, .. } if b == brid));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
