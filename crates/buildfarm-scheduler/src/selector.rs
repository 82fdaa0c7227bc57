//! Priority selection across builders.
//!
//! Each builder offers its first matchable request in priority then FIFO
//! order. Builders are ranked by that request's priority tier, then by
//! builder urgency, then by submission time and brid.

use buildfarm_config::UrgencyWeights;
use buildfarm_core::{BuildRequest, BuildRequestId, QueueKind};
use chrono::{DateTime, Duration, Utc};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::context::SchedulerContext;
use crate::matcher::SlaveMatcher;

/// Ready-queue shape of one builder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuilderLoad {
    /// How long the oldest ready request has waited.
    pub oldest_wait: Duration,
    /// Number of ready requests.
    pub depth: usize,
}

/// Breaks ties between builders within a priority tier. Higher is served
/// first.
pub trait Urgency: Send + Sync {
    fn urgency(&self, buildername: &str, load: &BuilderLoad) -> f64;
}

/// `wait_weight * seconds_waited + depth_weight * depth`.
#[derive(Debug, Clone, Copy)]
pub struct WaitDepthUrgency {
    weights: UrgencyWeights,
}

impl WaitDepthUrgency {
    pub fn new(weights: UrgencyWeights) -> Self {
        Self { weights }
    }
}

impl Default for WaitDepthUrgency {
    fn default() -> Self {
        Self::new(UrgencyWeights::default())
    }
}

impl Urgency for WaitDepthUrgency {
    fn urgency(&self, _buildername: &str, load: &BuilderLoad) -> f64 {
        let waited = load.oldest_wait.num_milliseconds().max(0) as f64 / 1000.0;
        self.weights.wait_weight * waited + self.weights.depth_weight * load.depth as f64
    }
}

/// A request chosen to run together with the worker it matched.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub request: BuildRequest,
    pub worker: String,
}

struct Candidate<'a> {
    request: &'a BuildRequest,
    worker: String,
    urgency: f64,
}

impl Candidate<'_> {
    fn rank(&self, other: &Self) -> Ordering {
        other
            .request
            .priority
            .cmp(&self.request.priority)
            .then_with(|| other.urgency.total_cmp(&self.urgency))
            .then_with(|| self.request.submitted_at.cmp(&other.request.submitted_at))
            .then_with(|| self.request.id.cmp(&other.request.id))
    }
}

pub struct PrioritySelector {
    urgency: Arc<dyn Urgency>,
    matcher: SlaveMatcher,
}

impl PrioritySelector {
    pub fn new(urgency: Arc<dyn Urgency>) -> Self {
        Self {
            urgency,
            matcher: SlaveMatcher,
        }
    }

    /// Pick the next request of `queue` to act on, or `None` when nothing
    /// ready has a usable worker.
    ///
    /// `ready` holds the queue's unclaimed requests; those in `skip` were
    /// already tried this tick.
    pub fn select_next(
        &self,
        queue: QueueKind,
        ready: &[BuildRequest],
        ctx: &SchedulerContext,
        skip: &HashSet<BuildRequestId>,
        now: DateTime<Utc>,
    ) -> Option<Selection> {
        let mut by_builder: BTreeMap<&str, Vec<&BuildRequest>> = BTreeMap::new();
        for request in ready.iter().filter(|r| r.queue() == Some(queue)) {
            by_builder
                .entry(request.buildername.as_str())
                .or_default()
                .push(request);
        }

        let mut best: Option<Candidate<'_>> = None;
        for (buildername, mut requests) in by_builder {
            requests.sort_by_key(|r| (Reverse(r.priority), r.submitted_at, r.id));

            let load = BuilderLoad {
                oldest_wait: requests
                    .iter()
                    .map(|r| now - r.submitted_at)
                    .max()
                    .unwrap_or_else(Duration::zero),
                depth: requests.len(),
            };

            let offered = requests
                .iter()
                .filter(|r| !skip.contains(&r.id))
                .find_map(|r| {
                    self.matcher
                        .match_worker(r, queue, ctx)
                        .map(|worker| (*r, worker))
                });
            let Some((request, worker)) = offered else {
                continue;
            };

            let candidate = Candidate {
                request,
                worker,
                urgency: self.urgency.urgency(buildername, &load),
            };
            best = match best {
                Some(current) if current.rank(&candidate) != Ordering::Greater => Some(current),
                _ => Some(candidate),
            };
        }

        best.map(|c| Selection {
            request: c.request.clone(),
            worker: c.worker,
        })
    }
}

impl Default for PrioritySelector {
    fn default() -> Self {
        Self::new(Arc::new(WaitDepthUrgency::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildfarm_config::BuilderConfig;
    use buildfarm_core::{BuildResult, BuildSetId, Priority};

    fn request(id: i64, builder: &str, priority: Priority, submitted_at: DateTime<Utc>) -> BuildRequest {
        BuildRequest {
            id: BuildRequestId::new(id),
            buildset_id: BuildSetId::new(id),
            buildername: builder.to_string(),
            priority,
            submitted_at,
            complete: false,
            complete_at: None,
            results: None,
            triggered_by: None,
            start_brid: None,
            merge_brid: None,
            artifact_brid: None,
            selected_worker: None,
            resume_pool: None,
        }
    }

    fn shared_worker_context() -> SchedulerContext {
        SchedulerContext::new([
            BuilderConfig::new("a", &["w1"]),
            BuilderConfig::new("b", &["w1"]),
        ])
    }

    #[test]
    fn test_emergency_beats_deep_default_queue() {
        let mut ctx = shared_worker_context();
        let now = Utc::now();
        let mut ready: Vec<BuildRequest> = (0..500)
            .map(|i| request(i + 1, "b", Priority::Default, now - Duration::hours(2)))
            .collect();
        ready.push(request(1000, "a", Priority::Emergency, now));
        let selector = PrioritySelector::default();

        // no idle worker for either builder
        assert!(
            selector
                .select_next(QueueKind::Unclaimed, &ready, &ctx, &HashSet::new(), now)
                .is_none()
        );

        ctx.connect_worker("w1");
        let selection = selector
            .select_next(QueueKind::Unclaimed, &ready, &ctx, &HashSet::new(), now)
            .unwrap();
        assert_eq!(selection.request.id, BuildRequestId::new(1000));
        assert_eq!(selection.worker, "w1");
    }

    #[test]
    fn test_urgency_breaks_ties_within_tier() {
        let mut ctx = shared_worker_context();
        ctx.connect_worker("w1");
        let now = Utc::now();
        let ready = vec![
            request(1, "a", Priority::High, now - Duration::seconds(10)),
            request(2, "b", Priority::High, now - Duration::seconds(5)),
            request(3, "b", Priority::High, now - Duration::seconds(4)),
            request(4, "b", Priority::High, now - Duration::seconds(3)),
        ];
        let selection = PrioritySelector::default()
            .select_next(QueueKind::Unclaimed, &ready, &ctx, &HashSet::new(), now)
            .unwrap();
        // three queued on b outweigh five extra seconds of waiting on a
        assert_eq!(selection.request.id, BuildRequestId::new(2));
    }

    struct Flat;

    impl Urgency for Flat {
        fn urgency(&self, _buildername: &str, _load: &BuilderLoad) -> f64 {
            0.0
        }
    }

    #[test]
    fn test_fifo_then_brid_when_urgency_ties() {
        let mut ctx = shared_worker_context();
        ctx.connect_worker("w1");
        let now = Utc::now();
        let selector = PrioritySelector::new(Arc::new(Flat));

        let ready = vec![
            request(7, "b", Priority::Default, now - Duration::seconds(1)),
            request(3, "a", Priority::Default, now - Duration::seconds(2)),
        ];
        let selection = selector
            .select_next(QueueKind::Unclaimed, &ready, &ctx, &HashSet::new(), now)
            .unwrap();
        assert_eq!(selection.request.id, BuildRequestId::new(3));

        let same_time = vec![
            request(9, "a", Priority::Default, now),
            request(8, "b", Priority::Default, now),
        ];
        let selection = selector
            .select_next(QueueKind::Unclaimed, &same_time, &ctx, &HashSet::new(), now)
            .unwrap();
        assert_eq!(selection.request.id, BuildRequestId::new(8));
    }

    #[test]
    fn test_unmatchable_request_does_not_block_builder() {
        let mut ctx = shared_worker_context();
        ctx.connect_worker("w1");
        let now = Utc::now();
        let mut pinned = request(1, "a", Priority::Default, now - Duration::seconds(30));
        pinned.selected_worker = Some("w-gone".to_string());
        let ready = vec![pinned, request(2, "a", Priority::Default, now)];

        let selection = PrioritySelector::default()
            .select_next(QueueKind::Unclaimed, &ready, &ctx, &HashSet::new(), now)
            .unwrap();
        assert_eq!(selection.request.id, BuildRequestId::new(2));
    }

    #[test]
    fn test_skipped_and_wrong_queue_requests_are_ignored() {
        let mut ctx = shared_worker_context();
        ctx.connect_worker("w1");
        let now = Utc::now();
        let mut paused = request(1, "a", Priority::Emergency, now);
        paused.results = Some(BuildResult::Resume);
        let ready = vec![paused, request(2, "a", Priority::Default, now)];
        let selector = PrioritySelector::default();

        let selection = selector
            .select_next(QueueKind::Unclaimed, &ready, &ctx, &HashSet::new(), now)
            .unwrap();
        assert_eq!(selection.request.id, BuildRequestId::new(2));

        let skip = HashSet::from([BuildRequestId::new(2)]);
        assert!(
            selector
                .select_next(QueueKind::Unclaimed, &ready, &ctx, &skip, now)
                .is_none()
        );

        let selection = selector
            .select_next(QueueKind::Paused, &ready, &ctx, &HashSet::new(), now)
            .unwrap();
        assert_eq!(selection.request.id, BuildRequestId::new(1));
    }

    #[test]
    fn test_wait_depth_urgency() {
        let urgency = WaitDepthUrgency::new(UrgencyWeights {
            wait_weight: 2.0,
            depth_weight: 10.0,
        });
        let load = BuilderLoad {
            oldest_wait: Duration::seconds(5),
            depth: 3,
        };
        assert_eq!(urgency.urgency("b", &load), 40.0);
    }
}
