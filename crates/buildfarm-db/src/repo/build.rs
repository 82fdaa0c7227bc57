//! Build repository.

use async_trait::async_trait;
use buildfarm_core::{Build, BuildId, BuildRequestId, PoolHint, ResumeRecord};
use chrono::{DateTime, Duration, Utc};

use super::PgStore;
use crate::{DbError, DbResult};

/// A build row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct BuildRecord {
    pub id: i64,
    pub number: i32,
    pub brid: i64,
    pub slavename: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
}

impl From<BuildRecord> for Build {
    fn from(row: BuildRecord) -> Self {
        Build {
            id: BuildId::new(row.id),
            brid: BuildRequestId::new(row.brid),
            number: row.number,
            slavename: row.slavename,
            start_time: row.start_time,
            finish_time: row.finish_time,
        }
    }
}

/// A resume history row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct ResumeRecordRow {
    start_time: DateTime<Utc>,
    finish_time: DateTime<Utc>,
    slavename: String,
    last_step: i32,
    resume_pool: Option<String>,
    elapsed_ms: i64,
}

impl TryFrom<ResumeRecordRow> for ResumeRecord {
    type Error = DbError;

    fn try_from(row: ResumeRecordRow) -> DbResult<Self> {
        Ok(ResumeRecord {
            start: row.start_time,
            finish: row.finish_time,
            worker: row.slavename,
            last_step: u32::try_from(row.last_step)
                .map_err(|_| DbError::Corrupt(format!("negative step index {}", row.last_step)))?,
            resume_pool: row
                .resume_pool
                .as_deref()
                .map(str::parse::<PoolHint>)
                .transpose()?,
            elapsed: Duration::milliseconds(row.elapsed_ms),
        })
    }
}

#[async_trait]
pub trait BuildRepo: Send + Sync {
    /// Insert a build for a request, numbered after the last build of the
    /// request's builder.
    async fn add_build(
        &self,
        brid: BuildRequestId,
        slavename: &str,
        at: DateTime<Utc>,
    ) -> DbResult<Build>;

    /// Attach a copy of `build` (number, worker, start time) to a request
    /// merged into the build's request.
    async fn add_merged_build(&self, brid: BuildRequestId, build: &Build) -> DbResult<Build>;

    async fn get_builds_for_request(&self, brid: BuildRequestId) -> DbResult<Vec<Build>>;

    /// Highest build number attached to a request.
    async fn get_build_number_for_request(&self, brid: BuildRequestId) -> DbResult<Option<i32>>;

    async fn finish_builds(&self, bids: &[BuildId], at: DateTime<Utc>) -> DbResult<()>;

    /// Copy the finish time of `target`'s build `number` onto the unfinished
    /// builds of the requests merged into it. Returns the rows changed.
    async fn finish_merged_builds(
        &self,
        target: BuildRequestId,
        merged: &[BuildRequestId],
        number: i32,
    ) -> DbResult<u64>;

    /// Reset an attempt's timestamps so it reads as not yet run.
    async fn clear_build_times(&self, bid: BuildId) -> DbResult<()>;

    /// Start a new attempt on an existing build row.
    async fn restart_build(
        &self,
        bid: BuildId,
        slavename: &str,
        at: DateTime<Utc>,
    ) -> DbResult<Build>;

    async fn append_resume_record(&self, bid: BuildId, record: &ResumeRecord) -> DbResult<()>;

    /// Resume history of a build, oldest first.
    async fn get_resume_history(&self, bid: BuildId) -> DbResult<Vec<ResumeRecord>>;
}

#[async_trait]
impl BuildRepo for PgStore {
    async fn add_build(
        &self,
        brid: BuildRequestId,
        slavename: &str,
        at: DateTime<Utc>,
    ) -> DbResult<Build> {
        let mut tx = self.pool.begin().await?;

        // the request row lock orders this against merges resolving the
        // request's build in `add_buildset`
        let buildername: String =
            sqlx::query_scalar("SELECT buildername FROM buildrequests WHERE id = $1 FOR UPDATE")
                .bind(brid.get())
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("build request {}", brid)))?;

        // numbers are allocated one builder at a time
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&buildername)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query_as::<_, BuildRecord>(
            r#"
            INSERT INTO builds (number, brid, slavename, start_time)
            SELECT COALESCE(MAX(b.number), 0) + 1, $1, $2, $3
            FROM builds b
            JOIN buildrequests r ON r.id = b.brid
            WHERE r.buildername = $4
            RETURNING *
            "#,
        )
        .bind(brid.get())
        .bind(slavename)
        .bind(at)
        .bind(&buildername)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row.into())
    }

    async fn add_merged_build(&self, brid: BuildRequestId, build: &Build) -> DbResult<Build> {
        let row = sqlx::query_as::<_, BuildRecord>(
            r#"
            INSERT INTO builds (number, brid, slavename, start_time)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(build.number)
        .bind(brid.get())
        .bind(&build.slavename)
        .bind(build.start_time)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn get_builds_for_request(&self, brid: BuildRequestId) -> DbResult<Vec<Build>> {
        let rows = sqlx::query_as::<_, BuildRecord>(
            "SELECT * FROM builds WHERE brid = $1 ORDER BY number, id",
        )
        .bind(brid.get())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Build::from).collect())
    }

    async fn get_build_number_for_request(&self, brid: BuildRequestId) -> DbResult<Option<i32>> {
        let number: Option<i32> = sqlx::query_scalar("SELECT MAX(number) FROM builds WHERE brid = $1")
            .bind(brid.get())
            .fetch_one(&self.pool)
            .await?;
        Ok(number)
    }

    async fn finish_builds(&self, bids: &[BuildId], at: DateTime<Utc>) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        // split the bids into batches to keep parameter lists bounded
        for batch in bids.chunks(100) {
            let batch: Vec<i64> = batch.iter().map(|b| b.get()).collect();
            sqlx::query("UPDATE builds SET finish_time = $2 WHERE id = ANY($1)")
                .bind(batch)
                .bind(at)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn finish_merged_builds(
        &self,
        target: BuildRequestId,
        merged: &[BuildRequestId],
        number: i32,
    ) -> DbResult<u64> {
        if merged.is_empty() {
            return Ok(0);
        }
        let merged: Vec<i64> = merged.iter().map(|b| b.get()).collect();
        let result = sqlx::query(
            r#"
            UPDATE builds SET finish_time = (
                SELECT finish_time FROM builds
                WHERE brid = $1 AND number = $3 AND finish_time IS NOT NULL
                ORDER BY id DESC LIMIT 1
            )
            WHERE brid = ANY($2) AND number = $3 AND finish_time IS NULL
              AND EXISTS (
                SELECT 1 FROM builds
                WHERE brid = $1 AND number = $3 AND finish_time IS NOT NULL
              )
            "#,
        )
        .bind(target.get())
        .bind(merged)
        .bind(number)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn clear_build_times(&self, bid: BuildId) -> DbResult<()> {
        let result =
            sqlx::query("UPDATE builds SET start_time = NULL, finish_time = NULL WHERE id = $1")
                .bind(bid.get())
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("build {}", bid)));
        }
        Ok(())
    }

    async fn restart_build(
        &self,
        bid: BuildId,
        slavename: &str,
        at: DateTime<Utc>,
    ) -> DbResult<Build> {
        let row = sqlx::query_as::<_, BuildRecord>(
            r#"
            UPDATE builds SET slavename = $2, start_time = $3, finish_time = NULL
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(bid.get())
        .bind(slavename)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("build {}", bid)))?;
        Ok(row.into())
    }

    async fn append_resume_record(&self, bid: BuildId, record: &ResumeRecord) -> DbResult<()> {
        let last_step = i32::try_from(record.last_step)
            .map_err(|_| DbError::Corrupt(format!("step index {} too large", record.last_step)))?;
        sqlx::query(
            r#"
            INSERT INTO build_resumes
                (bid, start_time, finish_time, slavename, last_step, resume_pool, elapsed_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(bid.get())
        .bind(record.start)
        .bind(record.finish)
        .bind(&record.worker)
        .bind(last_step)
        .bind(record.resume_pool.map(|h| h.to_string()))
        .bind(record.elapsed.num_milliseconds())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_resume_history(&self, bid: BuildId) -> DbResult<Vec<ResumeRecord>> {
        let rows = sqlx::query_as::<_, ResumeRecordRow>(
            r#"
            SELECT start_time, finish_time, slavename, last_step, resume_pool, elapsed_ms
            FROM build_resumes WHERE bid = $1 ORDER BY id
            "#,
        )
        .bind(bid.get())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ResumeRecord::try_from).collect()
    }
}
