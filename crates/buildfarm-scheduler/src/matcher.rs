//! Worker matching for selected requests.

use buildfarm_core::{BuildRequest, QueueKind};

use crate::context::SchedulerContext;

/// Finds an idle, connected worker allowed to run a request.
///
/// Matching is first-usable in pool order. A request pinned to a worker
/// only ever matches that worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlaveMatcher;

impl SlaveMatcher {
    pub fn match_worker(
        &self,
        request: &BuildRequest,
        queue: QueueKind,
        ctx: &SchedulerContext,
    ) -> Option<String> {
        let builder = ctx.builder(&request.buildername)?;
        if !ctx.locks_free(&builder.locks) {
            return None;
        }

        let pool = match queue {
            QueueKind::Unclaimed => builder.start_pool.as_slice(),
            QueueKind::Paused => builder.pool_for_resume(request.resume_pool),
        };

        match &request.selected_worker {
            Some(pinned) => pool
                .iter()
                .find(|w| *w == pinned && ctx.is_worker_available(w))
                .cloned(),
            None => pool.iter().find(|w| ctx.is_worker_available(w)).cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildfarm_config::BuilderConfig;
    use buildfarm_core::{BuildRequestId, BuildResult, BuildSetId, PoolHint, Priority};
    use chrono::Utc;

    fn request(builder: &str) -> BuildRequest {
        BuildRequest {
            id: BuildRequestId::new(1),
            buildset_id: BuildSetId::new(1),
            buildername: builder.to_string(),
            priority: Priority::Default,
            submitted_at: Utc::now(),
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

    fn context() -> SchedulerContext {
        let mut ctx = SchedulerContext::new([
            BuilderConfig::new("b1", &["w1", "w2"]).with_resume_pool(&["w3"]),
            BuilderConfig::new("b2", &["w2"]).with_locks(&["db"]),
        ]);
        for w in ["w1", "w2", "w3"] {
            ctx.connect_worker(w);
        }
        ctx
    }

    #[test]
    fn test_first_usable_worker_in_start_pool() {
        let mut ctx = context();
        let matcher = SlaveMatcher;
        let br = request("b1");
        assert_eq!(
            matcher.match_worker(&br, QueueKind::Unclaimed, &ctx),
            Some("w1".to_string())
        );

        ctx.acquire("w1", BuildRequestId::new(99), &[]);
        assert_eq!(
            matcher.match_worker(&br, QueueKind::Unclaimed, &ctx),
            Some("w2".to_string())
        );
    }

    #[test]
    fn test_paused_requests_use_resume_pool() {
        let ctx = context();
        let matcher = SlaveMatcher;
        let mut br = request("b1");
        br.results = Some(BuildResult::Resume);
        assert_eq!(
            matcher.match_worker(&br, QueueKind::Paused, &ctx),
            Some("w3".to_string())
        );

        br.resume_pool = Some(PoolHint::Start);
        assert_eq!(
            matcher.match_worker(&br, QueueKind::Paused, &ctx),
            Some("w1".to_string())
        );
    }

    #[test]
    fn test_resume_pool_defaults_to_start_pool() {
        let ctx = context();
        let br = request("b2");
        assert_eq!(
            SlaveMatcher.match_worker(&br, QueueKind::Paused, &ctx),
            Some("w2".to_string())
        );
    }

    #[test]
    fn test_pinned_worker_has_no_fallback() {
        let ctx = context();
        let mut br = request("b1");
        br.selected_worker = Some("w2".to_string());
        assert_eq!(
            SlaveMatcher.match_worker(&br, QueueKind::Unclaimed, &ctx),
            Some("w2".to_string())
        );

        br.selected_worker = Some("w-gone".to_string());
        assert_eq!(SlaveMatcher.match_worker(&br, QueueKind::Unclaimed, &ctx), None);
    }

    #[test]
    fn test_held_lock_blocks_matching() {
        let mut ctx = context();
        ctx.connect_worker("w9");
        ctx.acquire("w9", BuildRequestId::new(42), &["db".to_string()]);
        assert_eq!(
            SlaveMatcher.match_worker(&request("b2"), QueueKind::Unclaimed, &ctx),
            None
        );
    }

    #[test]
    fn test_unknown_builder_never_matches() {
        let ctx = context();
        assert_eq!(
            SlaveMatcher.match_worker(&request("nope"), QueueKind::Unclaimed, &ctx),
            None
        );
    }
}
