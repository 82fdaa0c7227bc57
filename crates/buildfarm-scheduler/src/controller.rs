//! Build lifecycle: start, resume, pause, finish, cancel and chain stop.
//!
//! The controller owns every running attempt of this coordinator. Workers
//! and builder locks are acquired when an attempt starts or resumes and are
//! released only here, when it pauses, finishes or is cancelled.

use async_recursion::async_recursion;
use buildfarm_core::{
    Build, BuildExecutor, BuildId, BuildRequest, BuildRequestId, BuildResult, BuildSpec,
    ClaimOutcome, CoordinatorId, PoolHint, Properties, QueueKind, ResumeRecord, SourceStamp,
};
use buildfarm_db::RequestStore;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, info, warn};

use crate::aggregator::BuildSetAggregator;
use crate::context::SchedulerContext;
use crate::error::{SchedulerError, SchedulerResult};
use crate::events::SchedulerEvent;
use crate::triggers::QueueTriggers;

/// An attempt running on this coordinator.
#[derive(Debug, Clone)]
struct RunningAttempt {
    build_id: BuildId,
    number: i32,
    worker: String,
    started_at: DateTime<Utc>,
    last_step: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// A running build was stopped.
    Stopped,
    /// A queued, paused or merged request was retired.
    Cancelled,
    AlreadyComplete,
    /// Another coordinator holds the request.
    NotOwned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainStopOutcome {
    /// Chain members stopped or cancelled.
    pub cancelled: usize,
    /// Walks over the chain.
    pub passes: u32,
    /// False when members were still incomplete after the last pass.
    pub converged: bool,
}

pub struct BuildController {
    store: Arc<dyn RequestStore>,
    executor: Arc<dyn BuildExecutor>,
    ctx: Arc<Mutex<SchedulerContext>>,
    aggregator: Arc<BuildSetAggregator>,
    triggers: Arc<QueueTriggers>,
    events: broadcast::Sender<SchedulerEvent>,
    coordinator: CoordinatorId,
    chain_stop_retries: u32,
    running: Mutex<HashMap<BuildRequestId, RunningAttempt>>,
}

impl BuildController {
    pub fn new(
        store: Arc<dyn RequestStore>,
        executor: Arc<dyn BuildExecutor>,
        ctx: Arc<Mutex<SchedulerContext>>,
        aggregator: Arc<BuildSetAggregator>,
        triggers: Arc<QueueTriggers>,
        events: broadcast::Sender<SchedulerEvent>,
        coordinator: CoordinatorId,
    ) -> Self {
        Self {
            store,
            executor,
            ctx,
            aggregator,
            triggers,
            events,
            coordinator,
            chain_stop_retries: buildfarm_config::system::DEFAULT_CHAIN_STOP_RETRIES,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_chain_stop_retries(mut self, retries: u32) -> Self {
        self.chain_stop_retries = retries.max(1);
        self
    }

    pub fn coordinator(&self) -> &CoordinatorId {
        &self.coordinator
    }

    pub async fn is_running(&self, brid: BuildRequestId) -> bool {
        self.running.lock().await.contains_key(&brid)
    }

    /// Start a claimed request on `worker`.
    ///
    /// An error means nothing durable was written: the worker and locks are
    /// already released and the caller should drop its claim. Once the
    /// build row exists this returns `Ok` and the claim stays: executor
    /// failures finish the build as EXCEPTION, and a failure to record
    /// that is only logged.
    pub async fn start(&self, request: &BuildRequest, worker: &str) -> SchedulerResult<()> {
        let (sourcestamps, properties) = self.load_inputs(request).await?;
        self.acquire(request, worker).await?;

        let build = match self.store.add_build(request.id, worker, Utc::now()).await {
            Ok(build) => build,
            Err(e) => {
                self.release(worker, request.id).await;
                return Err(e.into());
            }
        };

        self.attach_merged_builds(request.id, &build).await;
        self.running.lock().await.insert(
            request.id,
            RunningAttempt {
                build_id: build.id,
                number: build.number,
                worker: worker.to_string(),
                started_at: build.start_time.unwrap_or_else(Utc::now),
                last_step: 0,
            },
        );

        info!(
            brid = %request.id,
            builder = %request.buildername,
            worker = %worker,
            number = build.number,
            "Starting build"
        );
        let _ = self.events.send(SchedulerEvent::BuildStarted {
            brid: request.id,
            number: build.number,
            worker: worker.to_string(),
        });

        let spec = self.spec(request, &build, worker, sourcestamps, properties, None);
        if let Err(e) = self.executor.start_build(spec).await {
            error!(brid = %request.id, error = %e, "Executor failed to start build");
            self.finish_after_executor_error(request.id, BuildResult::Exception)
                .await;
        }
        Ok(())
    }

    /// Resume a claimed, paused request on `worker` from its last recorded
    /// step.
    ///
    /// A paused request whose saved state is missing or rejected by the
    /// executor is finished as RETRY and never resumed again.
    pub async fn resume(&self, request: &BuildRequest, worker: &str) -> SchedulerResult<()> {
        let now = Utc::now();
        let Some(build) = self.store.get_builds_for_request(request.id).await?.pop() else {
            error!(brid = %request.id, "Paused request has no build to resume");
            self.finalize(request, BuildResult::Retry, None, now).await?;
            return Ok(());
        };
        let Some(record) = self.store.get_resume_history(build.id).await?.pop() else {
            error!(brid = %request.id, bid = %build.id, "Paused build has no resume history");
            self.store.finish_builds(&[build.id], now).await?;
            self.finalize(request, BuildResult::Retry, Some(build.number), now)
                .await?;
            return Ok(());
        };

        let (sourcestamps, properties) = self.load_inputs(request).await?;
        self.acquire(request, worker).await?;

        let build = match self.store.restart_build(build.id, worker, now).await {
            Ok(build) => build,
            Err(e) => {
                self.release(worker, request.id).await;
                return Err(e.into());
            }
        };

        self.running.lock().await.insert(
            request.id,
            RunningAttempt {
                build_id: build.id,
                number: build.number,
                worker: worker.to_string(),
                started_at: now,
                last_step: record.last_step,
            },
        );

        info!(
            brid = %request.id,
            builder = %request.buildername,
            worker = %worker,
            number = build.number,
            step = record.last_step,
            "Resuming build"
        );
        let _ = self.events.send(SchedulerEvent::BuildResumed {
            brid: request.id,
            number: build.number,
            worker: worker.to_string(),
        });

        let spec = self.spec(
            request,
            &build,
            worker,
            sourcestamps,
            properties,
            Some(record.last_step),
        );
        match self.executor.resume_build(spec).await {
            Ok(()) => {}
            Err(buildfarm_core::Error::CorruptResumeState(reason)) => {
                error!(brid = %request.id, reason = %reason, "Cannot reload paused build");
                self.finish_after_executor_error(request.id, BuildResult::Retry)
                    .await;
            }
            Err(e) => {
                error!(brid = %request.id, error = %e, "Executor failed to resume build");
                self.finish_after_executor_error(request.id, BuildResult::Exception)
                    .await;
            }
        }
        Ok(())
    }

    /// Finish an attempt the executor refused. The build row exists, so the
    /// request keeps its claim even when the finish cannot be recorded.
    async fn finish_after_executor_error(&self, brid: BuildRequestId, results: BuildResult) {
        if let Err(e) = self.finish_build(brid, results).await {
            error!(
                brid = %brid,
                results = %results,
                error = %e,
                "Failed to finish build after executor error; request stays claimed"
            );
        }
    }

    /// Record that a running build reached `step`.
    pub async fn step_started(&self, brid: BuildRequestId, step: u32) -> SchedulerResult<()> {
        let mut running = self.running.lock().await;
        let attempt = running
            .get_mut(&brid)
            .ok_or(SchedulerError::NotRunning(brid))?;
        attempt.last_step = step;
        debug!(brid = %brid, step, "Step started");
        Ok(())
    }

    /// Suspend a running build and put its request into the paused queue.
    ///
    /// The request stays incomplete. Its attempt is recorded in the resume
    /// history and its build row reads as not yet run until it resumes.
    /// If a store write fails the build is still running here on its worker.
    pub async fn pause_current_build(
        &self,
        brid: BuildRequestId,
        resume_pool: Option<PoolHint>,
    ) -> SchedulerResult<()> {
        let attempt = self
            .running
            .lock()
            .await
            .get(&brid)
            .cloned()
            .ok_or(SchedulerError::NotRunning(brid))?;

        let now = Utc::now();
        let record = ResumeRecord {
            start: attempt.started_at,
            finish: now,
            worker: attempt.worker.clone(),
            last_step: attempt.last_step,
            resume_pool,
            elapsed: now - attempt.started_at,
        };
        self.store
            .append_resume_record(attempt.build_id, &record)
            .await?;
        self.store.clear_build_times(attempt.build_id).await?;
        let requeued = self.store.requeue_paused(brid, resume_pool).await?;

        // the attempt keeps its worker until the pause is durable
        self.running.lock().await.remove(&brid);
        self.release(&attempt.worker, brid).await;

        if !requeued {
            warn!(brid = %brid, "Request completed while its build was pausing");
            return Ok(());
        }

        info!(
            brid = %brid,
            worker = %attempt.worker,
            step = attempt.last_step,
            resume_pool = ?resume_pool,
            "Build paused"
        );
        let _ = self
            .events
            .send(SchedulerEvent::BuildPaused { brid, resume_pool });
        self.triggers.notify(QueueKind::Paused);
        Ok(())
    }

    /// Finish a running build with `results`, completing its request and
    /// every request merged into it.
    pub async fn finish_build(
        &self,
        brid: BuildRequestId,
        results: BuildResult,
    ) -> SchedulerResult<()> {
        if results == BuildResult::Resume {
            return Err(SchedulerError::InvalidState(format!(
                "build {} cannot finish as resume; pause it instead",
                brid
            )));
        }
        let attempt = self
            .running
            .lock()
            .await
            .remove(&brid)
            .ok_or(SchedulerError::NotRunning(brid))?;
        self.release(&attempt.worker, brid).await;

        let now = Utc::now();
        self.store.finish_builds(&[attempt.build_id], now).await?;
        let request = self.store.get_request(brid).await?;
        self.finalize(&request, results, Some(attempt.number), now)
            .await
    }

    /// Cancel a request wherever it is.
    ///
    /// Running builds of this coordinator are stopped. Queued and paused
    /// requests are claimed first, so a request another coordinator is
    /// acting on is left alone.
    pub async fn cancel(&self, brid: BuildRequestId) -> SchedulerResult<CancelOutcome> {
        if self.is_running(brid).await {
            if let Err(e) = self.executor.stop_build(brid, "cancelled").await {
                warn!(brid = %brid, error = %e, "Executor failed to stop build");
            }
            match self.finish_build(brid, BuildResult::Canceled).await {
                Ok(()) => return Ok(CancelOutcome::Stopped),
                // finished on its own in the meantime
                Err(SchedulerError::NotRunning(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let request = self.store.get_request(brid).await?;
        if request.complete {
            return Ok(CancelOutcome::AlreadyComplete);
        }

        let now = Utc::now();
        if request.is_merged() {
            self.finish_open_builds(brid, now).await?;
            self.store
                .complete_requests(&[brid], BuildResult::Canceled, now)
                .await?;
            info!(brid = %brid, "Cancelled merged request");
            let _ = self.events.send(SchedulerEvent::BuildFinished {
                brid,
                results: BuildResult::Canceled,
            });
            self.aggregator
                .maybe_complete_buildset(request.buildset_id, now)
                .await?;
            return Ok(CancelOutcome::Cancelled);
        }

        match self.store.claim_request(brid, &self.coordinator, now).await? {
            ClaimOutcome::AlreadyClaimed => {
                debug!(brid = %brid, "Request claimed elsewhere; not cancelling");
                Ok(CancelOutcome::NotOwned)
            }
            ClaimOutcome::Claimed => {
                let request = self.store.get_request(brid).await?;
                if request.complete {
                    return Ok(CancelOutcome::AlreadyComplete);
                }
                let number = self.finish_open_builds(brid, now).await?;
                self.finalize(&request, BuildResult::Canceled, number, now)
                    .await?;
                Ok(CancelOutcome::Cancelled)
            }
        }
    }

    /// Stop `brid` and everything it transitively triggered.
    ///
    /// Each pass walks the incomplete chain depth first from `brid`. The
    /// chain is read again after every pass since the scheduler may start
    /// or finish members concurrently.
    pub async fn stop_build_chain(&self, brid: BuildRequestId) -> SchedulerResult<ChainStopOutcome> {
        let mut cancelled = 0;
        for pass in 1..=self.chain_stop_retries {
            let chain = self.store.get_incomplete_build_chain(brid).await?;
            if chain.is_empty() {
                return Ok(ChainStopOutcome {
                    cancelled,
                    passes: pass - 1,
                    converged: true,
                });
            }
            debug!(brid = %brid, pass, members = chain.len(), "Stopping build chain");
            self.stop_chain_pass(brid, &chain, &mut cancelled).await;
        }

        let remaining = self.store.get_incomplete_build_chain(brid).await?;
        let converged = remaining.is_empty();
        if !converged {
            warn!(
                brid = %brid,
                remaining = remaining.len(),
                passes = self.chain_stop_retries,
                "Giving up stopping build chain; members are still incomplete"
            );
        } else {
            info!(brid = %brid, cancelled, "Build chain stopped");
        }
        Ok(ChainStopOutcome {
            cancelled,
            passes: self.chain_stop_retries,
            converged,
        })
    }

    async fn stop_chain_pass(
        &self,
        brid: BuildRequestId,
        chain: &[BuildRequest],
        cancelled: &mut usize,
    ) {
        let members: HashSet<BuildRequestId> = chain.iter().map(|r| r.id).collect();
        let mut children: HashMap<BuildRequestId, Vec<BuildRequest>> = HashMap::new();
        let mut roots = Vec::new();
        for request in chain {
            match request.triggered_by {
                Some(parent) if members.contains(&parent) => {
                    children.entry(parent).or_default().push(request.clone());
                }
                _ => roots.push(request),
            }
        }
        // the requested brid first, then orphans whose parent completed
        roots.sort_by_key(|r| (r.id != brid, r.id));

        for root in roots {
            self.stop_subtree(root, &children, cancelled).await;
        }
    }

    #[async_recursion]
    async fn stop_subtree(
        &self,
        request: &BuildRequest,
        children: &HashMap<BuildRequestId, Vec<BuildRequest>>,
        cancelled: &mut usize,
    ) {
        match self.cancel(request.id).await {
            Ok(CancelOutcome::Stopped | CancelOutcome::Cancelled) => *cancelled += 1,
            Ok(outcome) => {
                debug!(brid = %request.id, outcome = ?outcome, "Chain member not stopped");
            }
            Err(e) => {
                warn!(brid = %request.id, error = %e, "Failed to stop chain member");
            }
        }
        if let Some(triggered) = children.get(&request.id) {
            for child in triggered {
                self.stop_subtree(child, children, cancelled).await;
            }
        }
    }

    /// Complete a request and the requests merged into it, then their
    /// buildsets.
    async fn finalize(
        &self,
        request: &BuildRequest,
        results: BuildResult,
        number: Option<i32>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let merged = self.store.get_merged_requests(request.id).await?;
        let merged_ids: Vec<BuildRequestId> = merged.iter().map(|r| r.id).collect();

        let mut brids = vec![request.id];
        brids.extend(&merged_ids);
        let changed = self.store.complete_requests(&brids, results, now).await?;
        if changed.is_empty() {
            debug!(brid = %request.id, "Request was already complete");
        }

        if let Some(number) = number {
            if !merged_ids.is_empty() {
                self.store
                    .finish_merged_builds(request.id, &merged_ids, number)
                    .await?;
            }
        }

        info!(
            brid = %request.id,
            results = %results,
            merged = merged_ids.len(),
            "Build request complete"
        );
        let _ = self.events.send(SchedulerEvent::BuildFinished {
            brid: request.id,
            results,
        });

        let buildsets: BTreeSet<_> = std::iter::once(request.buildset_id)
            .chain(merged.iter().map(|r| r.buildset_id))
            .collect();
        for bsid in buildsets {
            self.aggregator.maybe_complete_buildset(bsid, now).await?;
        }
        Ok(())
    }

    /// Give requests already merged into `brid` a build sharing its number.
    async fn attach_merged_builds(&self, brid: BuildRequestId, build: &Build) {
        let merged = match self.store.get_merged_requests(brid).await {
            Ok(merged) => merged,
            Err(e) => {
                warn!(brid = %brid, error = %e, "Failed to list merged requests");
                return;
            }
        };
        for request in merged {
            match self.store.get_build_number_for_request(request.id).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    if let Err(e) = self.store.add_merged_build(request.id, build).await {
                        warn!(brid = %request.id, error = %e, "Failed to attach merged build");
                    }
                }
                Err(e) => {
                    warn!(brid = %request.id, error = %e, "Failed to read merged build");
                }
            }
        }
    }

    /// Set a finish time on builds of `brid` that have none. Returns the
    /// request's build number, if it has builds.
    async fn finish_open_builds(
        &self,
        brid: BuildRequestId,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<i32>> {
        let builds = self.store.get_builds_for_request(brid).await?;
        let open: Vec<BuildId> = builds
            .iter()
            .filter(|b| b.finish_time.is_none())
            .map(|b| b.id)
            .collect();
        if !open.is_empty() {
            self.store.finish_builds(&open, now).await?;
        }
        Ok(builds.iter().map(|b| b.number).max())
    }

    async fn load_inputs(
        &self,
        request: &BuildRequest,
    ) -> SchedulerResult<(Vec<SourceStamp>, Properties)> {
        let buildset = self.store.get_buildset(request.buildset_id).await?;
        let sourcestamps = self
            .store
            .get_sourcestamps(buildset.sourcestampset_id)
            .await?;
        let properties = self.store.get_buildset_properties(buildset.id).await?;
        Ok((sourcestamps, properties))
    }

    fn spec(
        &self,
        request: &BuildRequest,
        build: &Build,
        worker: &str,
        sourcestamps: Vec<SourceStamp>,
        properties: Properties,
        resume_from: Option<u32>,
    ) -> BuildSpec {
        BuildSpec {
            brid: request.id,
            build_id: build.id,
            number: build.number,
            buildername: request.buildername.clone(),
            worker: worker.to_string(),
            sourcestamps,
            properties,
            artifact_brid: request.artifact_brid,
            resume_from,
        }
    }

    async fn acquire(&self, request: &BuildRequest, worker: &str) -> SchedulerResult<()> {
        let mut ctx = self.ctx.lock().await;
        let locks = ctx
            .builder(&request.buildername)
            .map(|b| b.locks.clone())
            .unwrap_or_default();
        if ctx.acquire(worker, request.id, &locks) {
            Ok(())
        } else {
            Err(SchedulerError::ResourcesUnavailable(format!(
                "worker '{}' or locks of builder '{}'",
                worker, request.buildername
            )))
        }
    }

    async fn release(&self, worker: &str, brid: BuildRequestId) {
        self.ctx.lock().await.release(worker, brid);
        self.triggers.notify_all();
    }
}
