//! Source stamp repository.

use async_trait::async_trait;
use buildfarm_core::{SourceStamp, SourceStampSetId};

use super::PgStore;
use crate::DbResult;

/// A source stamp row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct SourceStampRecord {
    pub codebase: String,
    pub repository: String,
    pub branch: Option<String>,
    pub revision: Option<String>,
}

impl From<SourceStampRecord> for SourceStamp {
    fn from(row: SourceStampRecord) -> Self {
        SourceStamp {
            codebase: row.codebase,
            repository: row.repository,
            branch: row.branch,
            revision: row.revision,
        }
    }
}

#[async_trait]
pub trait SourceStampRepo: Send + Sync {
    /// Store a set of per-codebase source stamps.
    async fn add_sourcestamp_set(&self, stamps: &[SourceStamp]) -> DbResult<SourceStampSetId>;

    /// Source stamps of a set, ordered by codebase.
    async fn get_sourcestamps(&self, id: SourceStampSetId) -> DbResult<Vec<SourceStamp>>;
}

#[async_trait]
impl SourceStampRepo for PgStore {
    async fn add_sourcestamp_set(&self, stamps: &[SourceStamp]) -> DbResult<SourceStampSetId> {
        let mut tx = self.pool.begin().await?;

        let id: i64 =
            sqlx::query_scalar("INSERT INTO sourcestampsets DEFAULT VALUES RETURNING id")
                .fetch_one(&mut *tx)
                .await?;

        for stamp in stamps {
            sqlx::query(
                r#"
                INSERT INTO sourcestamps (sourcestampsetid, codebase, repository, branch, revision)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(id)
            .bind(&stamp.codebase)
            .bind(&stamp.repository)
            .bind(&stamp.branch)
            .bind(&stamp.revision)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(SourceStampSetId::new(id))
    }

    async fn get_sourcestamps(&self, id: SourceStampSetId) -> DbResult<Vec<SourceStamp>> {
        let rows = sqlx::query_as::<_, SourceStampRecord>(
            r#"
            SELECT codebase, repository, branch, revision
            FROM sourcestamps
            WHERE sourcestampsetid = $1
            ORDER BY codebase, id
            "#,
        )
        .bind(id.get())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(SourceStamp::from).collect())
    }
}
