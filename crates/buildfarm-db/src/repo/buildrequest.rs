//! Build request and claim repository.

use async_trait::async_trait;
use buildfarm_core::{
    BuildRequest, BuildRequestId, BuildResult, BuildSetId, Claim, ClaimOutcome,
    CoordinatorId, PoolHint, Priority, QueueKind, SourceStamp,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::PgStore;
use super::sourcestamp::SourceStampRecord;
use crate::{DbError, DbResult};

/// A build request row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct BuildRequestRecord {
    pub id: i64,
    pub buildsetid: i64,
    pub buildername: String,
    pub priority: i32,
    pub submitted_at: DateTime<Utc>,
    pub complete: bool,
    pub complete_at: Option<DateTime<Utc>>,
    pub results: i32,
    pub triggeredbybrid: Option<i64>,
    pub startbrid: Option<i64>,
    pub mergebrid: Option<i64>,
    pub artifactbrid: Option<i64>,
    pub selected_worker: Option<String>,
    pub resume_pool: Option<String>,
}

impl TryFrom<BuildRequestRecord> for BuildRequest {
    type Error = DbError;

    fn try_from(row: BuildRequestRecord) -> DbResult<Self> {
        Ok(BuildRequest {
            id: BuildRequestId::new(row.id),
            buildset_id: BuildSetId::new(row.buildsetid),
            buildername: row.buildername,
            priority: Priority::from_code(row.priority)?,
            submitted_at: row.submitted_at,
            complete: row.complete,
            complete_at: row.complete_at,
            results: BuildResult::from_optional_code(row.results)?,
            triggered_by: row.triggeredbybrid.map(BuildRequestId::new),
            start_brid: row.startbrid.map(BuildRequestId::new),
            merge_brid: row.mergebrid.map(BuildRequestId::new),
            artifact_brid: row.artifactbrid.map(BuildRequestId::new),
            selected_worker: row.selected_worker,
            resume_pool: row
                .resume_pool
                .as_deref()
                .map(str::parse::<PoolHint>)
                .transpose()?,
        })
    }
}

/// A claim row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct ClaimRecord {
    brid: i64,
    coordinator: String,
    claimed_at: DateTime<Utc>,
}

/// A request that a new duplicate may fold into, with what the merge
/// engine needs to judge it.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeCandidate {
    pub request: BuildRequest,
    pub sourcestamps: Vec<SourceStamp>,
}

/// Persisted `results` value identifying each queue.
pub(crate) fn queue_results_code(queue: QueueKind) -> i32 {
    match queue {
        QueueKind::Unclaimed => BuildResult::optional_code(None),
        QueueKind::Paused => BuildResult::Resume.code(),
    }
}

#[async_trait]
pub trait BuildRequestRepo: Send + Sync {
    async fn get_request(&self, brid: BuildRequestId) -> DbResult<BuildRequest>;

    async fn get_requests_for_buildset(&self, bsid: BuildSetId) -> DbResult<Vec<BuildRequest>>;

    /// Unclaimed, incomplete, unmerged requests waiting in `queue`, ordered by
    /// priority (highest first), then submission time, then id.
    ///
    /// An empty `builders` slice means every builder.
    async fn select_ready_requests(
        &self,
        queue: QueueKind,
        builders: &[String],
    ) -> DbResult<Vec<BuildRequest>>;

    /// Incomplete, unmerged requests on a builder, oldest first.
    async fn select_merge_candidates(&self, buildername: &str) -> DbResult<Vec<MergeCandidate>>;

    /// Atomically insert a claim. A uniqueness violation means another
    /// coordinator got there first.
    async fn claim_request(
        &self,
        brid: BuildRequestId,
        coordinator: &CoordinatorId,
        at: DateTime<Utc>,
    ) -> DbResult<ClaimOutcome>;

    /// Drop a claim this coordinator holds. Returns false if it held none.
    async fn release_claim(
        &self,
        brid: BuildRequestId,
        coordinator: &CoordinatorId,
    ) -> DbResult<bool>;

    async fn get_claim(&self, brid: BuildRequestId) -> DbResult<Option<Claim>>;

    /// Mark requests complete. Only incomplete ones change; their ids are
    /// returned.
    async fn complete_requests(
        &self,
        brids: &[BuildRequestId],
        results: BuildResult,
        at: DateTime<Utc>,
    ) -> DbResult<Vec<BuildRequestId>>;

    /// Put a suspended request into the paused queue: results become RESUME,
    /// the pool hint is recorded and its claim is dropped, in one
    /// transaction. Returns false if the request was already complete.
    async fn requeue_paused(&self, brid: BuildRequestId, hint: Option<PoolHint>)
    -> DbResult<bool>;

    /// Incomplete requests folded into `target`.
    async fn get_merged_requests(&self, target: BuildRequestId) -> DbResult<Vec<BuildRequest>>;

    /// `brid` and every request it transitively triggered, limited to
    /// incomplete ones.
    async fn get_incomplete_build_chain(&self, brid: BuildRequestId)
    -> DbResult<Vec<BuildRequest>>;
}

fn into_requests(rows: Vec<BuildRequestRecord>) -> DbResult<Vec<BuildRequest>> {
    rows.into_iter().map(BuildRequest::try_from).collect()
}

fn ids(brids: &[BuildRequestId]) -> Vec<i64> {
    brids.iter().map(|b| b.get()).collect()
}

#[async_trait]
impl BuildRequestRepo for PgStore {
    async fn get_request(&self, brid: BuildRequestId) -> DbResult<BuildRequest> {
        let row =
            sqlx::query_as::<_, BuildRequestRecord>("SELECT * FROM buildrequests WHERE id = $1")
                .bind(brid.get())
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("build request {}", brid)))?;
        row.try_into()
    }

    async fn get_requests_for_buildset(&self, bsid: BuildSetId) -> DbResult<Vec<BuildRequest>> {
        let rows = sqlx::query_as::<_, BuildRequestRecord>(
            "SELECT * FROM buildrequests WHERE buildsetid = $1 ORDER BY id",
        )
        .bind(bsid.get())
        .fetch_all(&self.pool)
        .await?;
        into_requests(rows)
    }

    async fn select_ready_requests(
        &self,
        queue: QueueKind,
        builders: &[String],
    ) -> DbResult<Vec<BuildRequest>> {
        let rows = sqlx::query_as::<_, BuildRequestRecord>(
            r#"
            SELECT br.* FROM buildrequests br
            WHERE br.complete = FALSE
              AND br.mergebrid IS NULL
              AND br.results = $1
              AND (cardinality($2::text[]) = 0 OR br.buildername = ANY($2))
              AND NOT EXISTS (SELECT 1 FROM buildrequest_claims c WHERE c.brid = br.id)
            ORDER BY br.priority DESC, br.submitted_at ASC, br.id ASC
            "#,
        )
        .bind(queue_results_code(queue))
        .bind(builders.to_vec())
        .fetch_all(&self.pool)
        .await?;
        into_requests(rows)
    }

    async fn select_merge_candidates(&self, buildername: &str) -> DbResult<Vec<MergeCandidate>> {
        let requests = into_requests(
            sqlx::query_as::<_, BuildRequestRecord>(
                r#"
                SELECT * FROM buildrequests
                WHERE buildername = $1 AND complete = FALSE AND mergebrid IS NULL
                ORDER BY submitted_at, id
                "#,
            )
            .bind(buildername)
            .fetch_all(&self.pool)
            .await?,
        )?;
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let brids: Vec<i64> = requests.iter().map(|r| r.id.get()).collect();

        #[derive(sqlx::FromRow)]
        struct StampRow {
            brid: i64,
            #[sqlx(flatten)]
            stamp: SourceStampRecord,
        }

        let stamp_rows = sqlx::query_as::<_, StampRow>(
            r#"
            SELECT br.id AS brid, ss.codebase, ss.repository, ss.branch, ss.revision
            FROM buildrequests br
            JOIN buildsets bs ON bs.id = br.buildsetid
            JOIN sourcestamps ss ON ss.sourcestampsetid = bs.sourcestampsetid
            WHERE br.id = ANY($1)
            ORDER BY ss.codebase, ss.id
            "#,
        )
        .bind(brids)
        .fetch_all(&self.pool)
        .await?;

        let mut stamps: HashMap<i64, Vec<SourceStamp>> = HashMap::new();
        for row in stamp_rows {
            stamps.entry(row.brid).or_default().push(row.stamp.into());
        }

        Ok(requests
            .into_iter()
            .map(|request| {
                MergeCandidate {
                    sourcestamps: stamps.remove(&request.id.get()).unwrap_or_default(),
                    request,
                }
            })
            .collect())
    }

    async fn claim_request(
        &self,
        brid: BuildRequestId,
        coordinator: &CoordinatorId,
        at: DateTime<Utc>,
    ) -> DbResult<ClaimOutcome> {
        let result = sqlx::query(
            "INSERT INTO buildrequest_claims (brid, coordinator, claimed_at) VALUES ($1, $2, $3)",
        )
        .bind(brid.get())
        .bind(coordinator.as_str())
        .bind(at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(ClaimOutcome::Claimed),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Ok(ClaimOutcome::AlreadyClaimed)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn release_claim(
        &self,
        brid: BuildRequestId,
        coordinator: &CoordinatorId,
    ) -> DbResult<bool> {
        let result =
            sqlx::query("DELETE FROM buildrequest_claims WHERE brid = $1 AND coordinator = $2")
                .bind(brid.get())
                .bind(coordinator.as_str())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_claim(&self, brid: BuildRequestId) -> DbResult<Option<Claim>> {
        let row = sqlx::query_as::<_, ClaimRecord>(
            "SELECT brid, coordinator, claimed_at FROM buildrequest_claims WHERE brid = $1",
        )
        .bind(brid.get())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| Claim {
            brid: BuildRequestId::new(row.brid),
            coordinator: CoordinatorId::new(row.coordinator),
            claimed_at: row.claimed_at,
        }))
    }

    async fn complete_requests(
        &self,
        brids: &[BuildRequestId],
        results: BuildResult,
        at: DateTime<Utc>,
    ) -> DbResult<Vec<BuildRequestId>> {
        if brids.is_empty() {
            return Ok(Vec::new());
        }
        let changed: Vec<i64> = sqlx::query_scalar(
            r#"
            UPDATE buildrequests
            SET complete = TRUE, results = $2, complete_at = $3
            WHERE id = ANY($1) AND complete = FALSE
            RETURNING id
            "#,
        )
        .bind(ids(brids))
        .bind(results.code())
        .bind(at)
        .fetch_all(&self.pool)
        .await?;
        Ok(changed.into_iter().map(BuildRequestId::new).collect())
    }

    async fn requeue_paused(
        &self,
        brid: BuildRequestId,
        hint: Option<PoolHint>,
    ) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE buildrequests SET results = $2, resume_pool = $3
            WHERE id = $1 AND complete = FALSE
            "#,
        )
        .bind(brid.get())
        .bind(BuildResult::Resume.code())
        .bind(hint.map(|h| h.to_string()))
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            // Distinguish a missing request from one that already completed.
            self.get_request(brid).await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM buildrequest_claims WHERE brid = $1")
            .bind(brid.get())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn get_merged_requests(&self, target: BuildRequestId) -> DbResult<Vec<BuildRequest>> {
        let rows = sqlx::query_as::<_, BuildRequestRecord>(
            "SELECT * FROM buildrequests WHERE mergebrid = $1 AND complete = FALSE ORDER BY id",
        )
        .bind(target.get())
        .fetch_all(&self.pool)
        .await?;
        into_requests(rows)
    }

    async fn get_incomplete_build_chain(
        &self,
        brid: BuildRequestId,
    ) -> DbResult<Vec<BuildRequest>> {
        let rows = sqlx::query_as::<_, BuildRequestRecord>(
            r#"
            WITH RECURSIVE chain AS (
                SELECT * FROM buildrequests WHERE id = $1
                UNION ALL
                SELECT br.* FROM buildrequests br
                JOIN chain ON br.triggeredbybrid = chain.id
            )
            SELECT * FROM chain WHERE complete = FALSE ORDER BY id
            "#,
        )
        .bind(brid.get())
        .fetch_all(&self.pool)
        .await?;
        into_requests(rows)
    }
}
