//! In-process request store.
//!
//! Every operation runs under one lock, which gives it the same atomicity
//! the PostgreSQL store gets from its transactions and unique claim key.

use async_trait::async_trait;
use buildfarm_core::{
    Build, BuildId, BuildRequest, BuildRequestId, BuildResult, BuildSet, BuildSetCompletion,
    BuildSetId, Claim, ClaimOutcome, CoordinatorId, PoolHint, Properties, QueueKind, ResumeRecord,
    SourceStamp, SourceStampSetId,
};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use super::build::BuildRepo;
use super::buildrequest::{BuildRequestRepo, MergeCandidate};
use super::buildset::{
    BuildSetRepo, NewBuildSet, SubmittedBuildSet, check_unique_builders, request_attributes,
};
use super::sourcestamp::SourceStampRepo;
use crate::{DbError, DbResult};

#[derive(Default)]
struct State {
    last_id: i64,
    stampsets: HashMap<i64, Vec<SourceStamp>>,
    buildsets: BTreeMap<i64, BuildSet>,
    properties: HashMap<i64, Properties>,
    requests: BTreeMap<i64, BuildRequest>,
    claims: HashMap<i64, Claim>,
    builds: BTreeMap<i64, Build>,
    resumes: HashMap<i64, Vec<ResumeRecord>>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn request(&self, brid: BuildRequestId) -> DbResult<&BuildRequest> {
        self.requests
            .get(&brid.get())
            .ok_or_else(|| DbError::NotFound(format!("build request {}", brid)))
    }

    fn next_build_number(&self, buildername: &str) -> i32 {
        self.builds
            .values()
            .filter(|b| {
                self.requests
                    .get(&b.brid.get())
                    .is_some_and(|r| r.buildername == buildername)
            })
            .map(|b| b.number)
            .max()
            .unwrap_or(0)
            + 1
    }

    fn latest_build(&self, brid: BuildRequestId) -> Option<&Build> {
        self.builds
            .values()
            .filter(|b| b.brid == brid)
            .max_by_key(|b| (b.number, b.id))
    }
}

/// Request store kept in memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    fail_next_build_insert: AtomicBool,
    fail_next_build_finish: AtomicBool,
    fail_next_requeue: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `add_build` fail as if the database went away.
    pub fn fail_next_build_insert(&self) {
        self.fail_next_build_insert.store(true, Ordering::SeqCst);
    }

    /// Make the next `finish_builds` fail.
    pub fn fail_next_build_finish(&self) {
        self.fail_next_build_finish.store(true, Ordering::SeqCst);
    }

    /// Make the next `requeue_paused` fail.
    pub fn fail_next_requeue(&self) {
        self.fail_next_requeue.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SourceStampRepo for MemoryStore {
    async fn add_sourcestamp_set(&self, stamps: &[SourceStamp]) -> DbResult<SourceStampSetId> {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        let mut stamps = stamps.to_vec();
        stamps.sort_by(|a, b| a.codebase.cmp(&b.codebase));
        state.stampsets.insert(id, stamps);
        Ok(SourceStampSetId::new(id))
    }

    async fn get_sourcestamps(&self, id: SourceStampSetId) -> DbResult<Vec<SourceStamp>> {
        let state = self.state.lock().await;
        Ok(state.stampsets.get(&id.get()).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl BuildSetRepo for MemoryStore {
    async fn add_buildset(&self, new: NewBuildSet) -> DbResult<SubmittedBuildSet> {
        check_unique_builders(&new.requests)?;
        let (priority, selected_worker) = request_attributes(&new.properties);

        let mut state = self.state.lock().await;
        if !state.stampsets.contains_key(&new.sourcestampset_id.get()) {
            return Err(DbError::NotFound(format!(
                "source stamp set {}",
                new.sourcestampset_id
            )));
        }
        for merge in new.requests.iter().filter_map(|r| r.merge.as_ref()) {
            state.request(merge.target)?;
        }

        let bsid = state.next_id();
        state.buildsets.insert(
            bsid,
            BuildSet {
                id: BuildSetId::new(bsid),
                sourcestampset_id: new.sourcestampset_id,
                submitted_at: new.submitted_at,
                reason: new.reason.clone(),
                complete: false,
                complete_at: None,
                results: None,
                external_idstring: new.external_idstring.clone(),
            },
        );
        state.properties.insert(bsid, new.properties.clone());

        let start_brid = new.triggered_by.map(|parent| {
            state
                .requests
                .get(&parent.get())
                .and_then(|p| p.start_brid)
                .unwrap_or(parent)
        });

        let mut brids = BTreeMap::new();
        for request in &new.requests {
            let brid = BuildRequestId::new(state.next_id());
            state.requests.insert(
                brid.get(),
                BuildRequest {
                    id: brid,
                    buildset_id: BuildSetId::new(bsid),
                    buildername: request.buildername.clone(),
                    priority,
                    submitted_at: new.submitted_at,
                    complete: false,
                    complete_at: None,
                    results: None,
                    triggered_by: new.triggered_by,
                    start_brid,
                    merge_brid: request.merge.as_ref().map(|m| m.target),
                    artifact_brid: request.merge.as_ref().map(|m| m.artifact_brid),
                    selected_worker: selected_worker.clone(),
                    resume_pool: None,
                },
            );

            if let Some(merge) = &request.merge {
                state.claims.insert(
                    brid.get(),
                    Claim {
                        brid,
                        coordinator: new.coordinator.clone(),
                        claimed_at: new.submitted_at,
                    },
                );
                if let Some(build) = state.latest_build(merge.target).cloned() {
                    let bid = state.next_id();
                    state.builds.insert(
                        bid,
                        Build {
                            id: BuildId::new(bid),
                            brid,
                            ..build
                        },
                    );
                }
            }

            brids.insert(request.buildername.clone(), brid);
        }

        Ok(SubmittedBuildSet {
            bsid: BuildSetId::new(bsid),
            brids,
        })
    }

    async fn get_buildset(&self, bsid: BuildSetId) -> DbResult<BuildSet> {
        let state = self.state.lock().await;
        state
            .buildsets
            .get(&bsid.get())
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("buildset {}", bsid)))
    }

    async fn get_buildset_properties(&self, bsid: BuildSetId) -> DbResult<Properties> {
        let state = self.state.lock().await;
        Ok(state.properties.get(&bsid.get()).cloned().unwrap_or_default())
    }

    async fn complete_buildset(
        &self,
        bsid: BuildSetId,
        results: BuildResult,
        at: DateTime<Utc>,
    ) -> DbResult<BuildSetCompletion> {
        let mut state = self.state.lock().await;
        let buildset = state
            .buildsets
            .get_mut(&bsid.get())
            .ok_or_else(|| DbError::NotFound(format!("buildset {}", bsid)))?;
        if buildset.complete {
            return Ok(BuildSetCompletion::AlreadyComplete);
        }
        buildset.complete = true;
        buildset.complete_at = Some(at);
        buildset.results = Some(results);
        Ok(BuildSetCompletion::Completed)
    }
}

#[async_trait]
impl BuildRequestRepo for MemoryStore {
    async fn get_request(&self, brid: BuildRequestId) -> DbResult<BuildRequest> {
        let state = self.state.lock().await;
        state.request(brid).cloned()
    }

    async fn get_requests_for_buildset(&self, bsid: BuildSetId) -> DbResult<Vec<BuildRequest>> {
        let state = self.state.lock().await;
        Ok(state
            .requests
            .values()
            .filter(|r| r.buildset_id == bsid)
            .cloned()
            .collect())
    }

    async fn select_ready_requests(
        &self,
        queue: QueueKind,
        builders: &[String],
    ) -> DbResult<Vec<BuildRequest>> {
        let state = self.state.lock().await;
        let mut ready: Vec<BuildRequest> = state
            .requests
            .values()
            .filter(|r| r.queue() == Some(queue))
            .filter(|r| !state.claims.contains_key(&r.id.get()))
            .filter(|r| builders.is_empty() || builders.contains(&r.buildername))
            .cloned()
            .collect();
        ready.sort_by_key(|r| (Reverse(r.priority), r.submitted_at, r.id));
        Ok(ready)
    }

    async fn select_merge_candidates(&self, buildername: &str) -> DbResult<Vec<MergeCandidate>> {
        let state = self.state.lock().await;
        let mut candidates: Vec<MergeCandidate> = state
            .requests
            .values()
            .filter(|r| r.buildername == buildername && !r.complete && !r.is_merged())
            .map(|request| {
                let sourcestamps = state
                    .buildsets
                    .get(&request.buildset_id.get())
                    .and_then(|bs| state.stampsets.get(&bs.sourcestampset_id.get()))
                    .cloned()
                    .unwrap_or_default();
                MergeCandidate {
                    sourcestamps,
                    request: request.clone(),
                }
            })
            .collect();
        candidates.sort_by_key(|c| (c.request.submitted_at, c.request.id));
        Ok(candidates)
    }

    async fn claim_request(
        &self,
        brid: BuildRequestId,
        coordinator: &CoordinatorId,
        at: DateTime<Utc>,
    ) -> DbResult<ClaimOutcome> {
        let mut state = self.state.lock().await;
        state.request(brid)?;
        if state.claims.contains_key(&brid.get()) {
            return Ok(ClaimOutcome::AlreadyClaimed);
        }
        state.claims.insert(
            brid.get(),
            Claim {
                brid,
                coordinator: coordinator.clone(),
                claimed_at: at,
            },
        );
        Ok(ClaimOutcome::Claimed)
    }

    async fn release_claim(
        &self,
        brid: BuildRequestId,
        coordinator: &CoordinatorId,
    ) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        let owned = state
            .claims
            .get(&brid.get())
            .is_some_and(|c| &c.coordinator == coordinator);
        if owned {
            state.claims.remove(&brid.get());
        }
        Ok(owned)
    }

    async fn get_claim(&self, brid: BuildRequestId) -> DbResult<Option<Claim>> {
        let state = self.state.lock().await;
        Ok(state.claims.get(&brid.get()).cloned())
    }

    async fn complete_requests(
        &self,
        brids: &[BuildRequestId],
        results: BuildResult,
        at: DateTime<Utc>,
    ) -> DbResult<Vec<BuildRequestId>> {
        let mut state = self.state.lock().await;
        let mut changed = Vec::new();
        for brid in brids {
            if let Some(request) = state.requests.get_mut(&brid.get()) {
                if !request.complete {
                    request.complete = true;
                    request.complete_at = Some(at);
                    request.results = Some(results);
                    changed.push(*brid);
                }
            }
        }
        Ok(changed)
    }

    async fn requeue_paused(
        &self,
        brid: BuildRequestId,
        hint: Option<PoolHint>,
    ) -> DbResult<bool> {
        if self.fail_next_requeue.swap(false, Ordering::SeqCst) {
            return Err(DbError::Database(sqlx::Error::PoolTimedOut));
        }
        let mut state = self.state.lock().await;
        let request = state
            .requests
            .get_mut(&brid.get())
            .ok_or_else(|| DbError::NotFound(format!("build request {}", brid)))?;
        if request.complete {
            return Ok(false);
        }
        request.results = Some(BuildResult::Resume);
        request.resume_pool = hint;
        state.claims.remove(&brid.get());
        Ok(true)
    }

    async fn get_merged_requests(&self, target: BuildRequestId) -> DbResult<Vec<BuildRequest>> {
        let state = self.state.lock().await;
        Ok(state
            .requests
            .values()
            .filter(|r| r.merge_brid == Some(target) && !r.complete)
            .cloned()
            .collect())
    }

    async fn get_incomplete_build_chain(
        &self,
        brid: BuildRequestId,
    ) -> DbResult<Vec<BuildRequest>> {
        let state = self.state.lock().await;
        let mut chain = Vec::new();
        let mut pending = vec![brid];
        while let Some(current) = pending.pop() {
            let Some(request) = state.requests.get(&current.get()) else {
                continue;
            };
            chain.push(request.clone());
            pending.extend(
                state
                    .requests
                    .values()
                    .filter(|r| r.triggered_by == Some(current))
                    .map(|r| r.id),
            );
        }
        chain.retain(|r| !r.complete);
        chain.sort_by_key(|r| r.id);
        Ok(chain)
    }
}

#[async_trait]
impl BuildRepo for MemoryStore {
    async fn add_build(
        &self,
        brid: BuildRequestId,
        slavename: &str,
        at: DateTime<Utc>,
    ) -> DbResult<Build> {
        if self.fail_next_build_insert.swap(false, Ordering::SeqCst) {
            return Err(DbError::Database(sqlx::Error::PoolTimedOut));
        }
        let mut state = self.state.lock().await;
        let buildername = state.request(brid)?.buildername.clone();
        let number = state.next_build_number(&buildername);
        let bid = state.next_id();
        let build = Build {
            id: BuildId::new(bid),
            brid,
            number,
            slavename: Some(slavename.to_string()),
            start_time: Some(at),
            finish_time: None,
        };
        state.builds.insert(bid, build.clone());
        Ok(build)
    }

    async fn add_merged_build(&self, brid: BuildRequestId, build: &Build) -> DbResult<Build> {
        let mut state = self.state.lock().await;
        state.request(brid)?;
        let bid = state.next_id();
        let shared = Build {
            id: BuildId::new(bid),
            brid,
            number: build.number,
            slavename: build.slavename.clone(),
            start_time: build.start_time,
            finish_time: None,
        };
        state.builds.insert(bid, shared.clone());
        Ok(shared)
    }

    async fn get_builds_for_request(&self, brid: BuildRequestId) -> DbResult<Vec<Build>> {
        let state = self.state.lock().await;
        let mut builds: Vec<Build> = state
            .builds
            .values()
            .filter(|b| b.brid == brid)
            .cloned()
            .collect();
        builds.sort_by_key(|b| (b.number, b.id));
        Ok(builds)
    }

    async fn get_build_number_for_request(&self, brid: BuildRequestId) -> DbResult<Option<i32>> {
        let state = self.state.lock().await;
        Ok(state.latest_build(brid).map(|b| b.number))
    }

    async fn finish_builds(&self, bids: &[BuildId], at: DateTime<Utc>) -> DbResult<()> {
        if self.fail_next_build_finish.swap(false, Ordering::SeqCst) {
            return Err(DbError::Database(sqlx::Error::PoolTimedOut));
        }
        let mut state = self.state.lock().await;
        for bid in bids {
            if let Some(build) = state.builds.get_mut(&bid.get()) {
                build.finish_time = Some(at);
            }
        }
        Ok(())
    }

    async fn finish_merged_builds(
        &self,
        target: BuildRequestId,
        merged: &[BuildRequestId],
        number: i32,
    ) -> DbResult<u64> {
        let mut state = self.state.lock().await;
        let finish = state
            .builds
            .values()
            .filter(|b| b.brid == target && b.number == number)
            .filter_map(|b| b.finish_time.map(|t| (b.id, t)))
            .max_by_key(|(id, _)| *id)
            .map(|(_, t)| t);
        let Some(finish) = finish else {
            return Ok(0);
        };

        let mut changed = 0;
        for build in state.builds.values_mut() {
            if merged.contains(&build.brid) && build.number == number && build.finish_time.is_none()
            {
                build.finish_time = Some(finish);
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn clear_build_times(&self, bid: BuildId) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let build = state
            .builds
            .get_mut(&bid.get())
            .ok_or_else(|| DbError::NotFound(format!("build {}", bid)))?;
        build.start_time = None;
        build.finish_time = None;
        Ok(())
    }

    async fn restart_build(
        &self,
        bid: BuildId,
        slavename: &str,
        at: DateTime<Utc>,
    ) -> DbResult<Build> {
        let mut state = self.state.lock().await;
        let build = state
            .builds
            .get_mut(&bid.get())
            .ok_or_else(|| DbError::NotFound(format!("build {}", bid)))?;
        build.slavename = Some(slavename.to_string());
        build.start_time = Some(at);
        build.finish_time = None;
        Ok(build.clone())
    }

    async fn append_resume_record(&self, bid: BuildId, record: &ResumeRecord) -> DbResult<()> {
        let mut state = self.state.lock().await;
        if !state.builds.contains_key(&bid.get()) {
            return Err(DbError::NotFound(format!("build {}", bid)));
        }
        state
            .resumes
            .entry(bid.get())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn get_resume_history(&self, bid: BuildId) -> DbResult<Vec<ResumeRecord>> {
        let state = self.state.lock().await;
        Ok(state.resumes.get(&bid.get()).cloned().unwrap_or_default())
    }
}
