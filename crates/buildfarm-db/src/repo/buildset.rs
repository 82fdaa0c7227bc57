//! Buildset repository.

use async_trait::async_trait;
use buildfarm_core::request::SELECTED_WORKER_PROPERTY;
use buildfarm_core::{
    BuildRequestId, BuildResult, BuildSet, BuildSetCompletion, BuildSetId, CoordinatorId,
    Priority, Properties, SourceStampSetId,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};

use super::PgStore;
use crate::{DbError, DbResult};

/// A buildset to insert together with one request per builder.
#[derive(Debug, Clone)]
pub struct NewBuildSet {
    pub sourcestampset_id: SourceStampSetId,
    pub reason: String,
    pub properties: Properties,
    pub external_idstring: Option<String>,
    pub triggered_by: Option<BuildRequestId>,
    pub requests: Vec<NewBuildRequest>,
    pub submitted_at: DateTime<Utc>,
    /// Owner of the claims created for merged requests.
    pub coordinator: CoordinatorId,
}

#[derive(Debug, Clone)]
pub struct NewBuildRequest {
    pub buildername: String,
    /// Set when the request folds into an existing one at creation.
    pub merge: Option<MergeInto>,
}

/// Where a new request merges to.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeInto {
    pub target: BuildRequestId,
    /// Already flattened: never points at a request that itself reuses
    /// another's artifacts.
    pub artifact_brid: BuildRequestId,
}

/// Ids assigned at submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedBuildSet {
    pub bsid: BuildSetId,
    pub brids: BTreeMap<String, BuildRequestId>,
}

/// A buildset row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct BuildSetRecord {
    id: i64,
    sourcestampsetid: i64,
    submitted_at: DateTime<Utc>,
    reason: String,
    complete: bool,
    complete_at: Option<DateTime<Utc>>,
    results: i32,
    external_idstring: Option<String>,
}

impl TryFrom<BuildSetRecord> for BuildSet {
    type Error = DbError;

    fn try_from(row: BuildSetRecord) -> DbResult<Self> {
        Ok(BuildSet {
            id: BuildSetId::new(row.id),
            sourcestampset_id: SourceStampSetId::new(row.sourcestampsetid),
            submitted_at: row.submitted_at,
            reason: row.reason,
            complete: row.complete,
            complete_at: row.complete_at,
            results: BuildResult::from_optional_code(row.results)?,
            external_idstring: row.external_idstring,
        })
    }
}

/// Priority and pinned worker that every request of a buildset inherits
/// from its properties.
pub(crate) fn request_attributes(properties: &Properties) -> (Priority, Option<String>) {
    let priority = Priority::from_property(
        properties
            .get(buildfarm_core::request::PRIORITY_PROPERTY)
            .map(|(value, _)| value),
    );
    let selected_worker = properties
        .get(SELECTED_WORKER_PROPERTY)
        .and_then(|(value, _)| value.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from);
    (priority, selected_worker)
}

pub(crate) fn check_unique_builders(requests: &[NewBuildRequest]) -> DbResult<()> {
    let mut seen = HashSet::new();
    for request in requests {
        if !seen.insert(request.buildername.as_str()) {
            return Err(DbError::Duplicate(format!(
                "builder '{}' listed twice in one buildset",
                request.buildername
            )));
        }
    }
    Ok(())
}

#[async_trait]
pub trait BuildSetRepo: Send + Sync {
    /// Insert a buildset, its properties and its requests atomically.
    ///
    /// Merged requests get their merge target, flattened artifact request,
    /// an immediate claim and, when the target has started, a build row
    /// sharing the target's number and start time.
    async fn add_buildset(&self, new: NewBuildSet) -> DbResult<SubmittedBuildSet>;

    async fn get_buildset(&self, bsid: BuildSetId) -> DbResult<BuildSet>;

    /// Properties as given at submission. Empty for an unknown buildset.
    async fn get_buildset_properties(&self, bsid: BuildSetId) -> DbResult<Properties>;

    /// Mark a buildset complete unless it already is.
    ///
    /// When the conditional update changes nothing the row is re-read: a
    /// sibling completion is reported as `AlreadyComplete`.
    async fn complete_buildset(
        &self,
        bsid: BuildSetId,
        results: BuildResult,
        at: DateTime<Utc>,
    ) -> DbResult<BuildSetCompletion>;
}

#[async_trait]
impl BuildSetRepo for PgStore {
    async fn add_buildset(&self, new: NewBuildSet) -> DbResult<SubmittedBuildSet> {
        check_unique_builders(&new.requests)?;
        let (priority, selected_worker) = request_attributes(&new.properties);

        let mut tx = self.pool.begin().await?;

        // insert the buildset itself
        let bsid: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO buildsets
                (sourcestampsetid, submitted_at, reason, complete, results, external_idstring)
            VALUES ($1, $2, $3, FALSE, $4, $5)
            RETURNING id
            "#,
        )
        .bind(new.sourcestampset_id.get())
        .bind(new.submitted_at)
        .bind(&new.reason)
        .bind(BuildResult::optional_code(None))
        .bind(&new.external_idstring)
        .fetch_one(&mut *tx)
        .await?;

        for (name, (value, source)) in &new.properties {
            sqlx::query(
                r#"
                INSERT INTO buildset_properties (buildsetid, property_name, property_value)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(bsid)
            .bind(name)
            .bind(serde_json::json!([value, source]))
            .execute(&mut *tx)
            .await?;
        }

        // requests inherit the chain root of the request that triggered them
        let start_brid = match new.triggered_by {
            Some(parent) => {
                let parent_start: Option<Option<i64>> =
                    sqlx::query_scalar("SELECT startbrid FROM buildrequests WHERE id = $1")
                        .bind(parent.get())
                        .fetch_optional(&mut *tx)
                        .await?;
                Some(parent_start.flatten().unwrap_or(parent.get()))
            }
            None => None,
        };

        let mut brids = BTreeMap::new();
        for request in &new.requests {
            let brid: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO buildrequests
                    (buildsetid, buildername, priority, submitted_at, complete, results,
                     triggeredbybrid, startbrid, mergebrid, artifactbrid, selected_worker)
                VALUES ($1, $2, $3, $4, FALSE, $5, $6, $7, $8, $9, $10)
                RETURNING id
                "#,
            )
            .bind(bsid)
            .bind(&request.buildername)
            .bind(priority.code())
            .bind(new.submitted_at)
            .bind(BuildResult::optional_code(None))
            .bind(new.triggered_by.map(|b| b.get()))
            .bind(start_brid)
            .bind(request.merge.as_ref().map(|m| m.target.get()))
            .bind(request.merge.as_ref().map(|m| m.artifact_brid.get()))
            .bind(&selected_worker)
            .fetch_one(&mut *tx)
            .await?;

            if let Some(merge) = &request.merge {
                // merged requests are never dispatched on their own
                sqlx::query(
                    r#"
                    INSERT INTO buildrequest_claims (brid, coordinator, claimed_at)
                    VALUES ($1, $2, $3)
                    "#,
                )
                .bind(brid)
                .bind(new.coordinator.as_str())
                .bind(new.submitted_at)
                .execute(&mut *tx)
                .await?;

                // the target row lock orders this against `add_build` on the
                // target, so a build started meanwhile is seen here
                sqlx::query("SELECT id FROM buildrequests WHERE id = $1 FOR UPDATE")
                    .bind(merge.target.get())
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| DbError::NotFound(format!("build request {}", merge.target)))?;

                sqlx::query(
                    r#"
                    INSERT INTO builds (number, brid, slavename, start_time, finish_time)
                    SELECT number, $1, slavename, start_time, finish_time FROM builds
                    WHERE brid = $2
                    ORDER BY number DESC, id DESC
                    LIMIT 1
                    "#,
                )
                .bind(brid)
                .bind(merge.target.get())
                .execute(&mut *tx)
                .await?;
            }

            brids.insert(request.buildername.clone(), BuildRequestId::new(brid));
        }

        tx.commit().await?;

        Ok(SubmittedBuildSet {
            bsid: BuildSetId::new(bsid),
            brids,
        })
    }

    async fn get_buildset(&self, bsid: BuildSetId) -> DbResult<BuildSet> {
        let row = sqlx::query_as::<_, BuildSetRecord>("SELECT * FROM buildsets WHERE id = $1")
            .bind(bsid.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("buildset {}", bsid)))?;
        row.try_into()
    }

    async fn get_buildset_properties(&self, bsid: BuildSetId) -> DbResult<Properties> {
        let rows: Vec<(String, serde_json::Value)> = sqlx::query_as(
            "SELECT property_name, property_value FROM buildset_properties WHERE buildsetid = $1",
        )
        .bind(bsid.get())
        .fetch_all(&self.pool)
        .await?;

        let mut properties = Properties::new();
        for (name, value) in rows {
            // stored as [value, source]; skip anything else
            if let serde_json::Value::Array(mut pair) = value {
                if pair.len() == 2 {
                    let source = pair.pop().and_then(|s| s.as_str().map(String::from));
                    let value = pair.pop();
                    if let (Some(value), Some(source)) = (value, source) {
                        properties.insert(name, (value, source));
                    }
                }
            }
        }
        Ok(properties)
    }

    async fn complete_buildset(
        &self,
        bsid: BuildSetId,
        results: BuildResult,
        at: DateTime<Utc>,
    ) -> DbResult<BuildSetCompletion> {
        let updated = sqlx::query(
            r#"
            UPDATE buildsets SET complete = TRUE, results = $2, complete_at = $3
            WHERE id = $1 AND complete = FALSE
            "#,
        )
        .bind(bsid.get())
        .bind(results.code())
        .bind(at)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() > 0 {
            return Ok(BuildSetCompletion::Completed);
        }

        // maybe another build completed the buildset
        let complete: Option<bool> =
            sqlx::query_scalar("SELECT complete FROM buildsets WHERE id = $1")
                .bind(bsid.get())
                .fetch_optional(&self.pool)
                .await?;
        match complete {
            Some(true) => Ok(BuildSetCompletion::AlreadyComplete),
            Some(false) => Err(DbError::Corrupt(format!(
                "buildset {} did not complete and is not complete",
                bsid
            ))),
            None => Err(DbError::NotFound(format!("buildset {}", bsid))),
        }
    }
}
