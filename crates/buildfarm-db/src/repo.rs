//! Repository traits and implementations.

pub mod build;
pub mod buildrequest;
pub mod buildset;
pub mod memory;
pub mod sourcestamp;

pub use build::BuildRepo;
pub use buildrequest::{BuildRequestRepo, MergeCandidate};
pub use buildset::{BuildSetRepo, MergeInto, NewBuildRequest, NewBuildSet, SubmittedBuildSet};
pub use memory::MemoryStore;
pub use sourcestamp::SourceStampRepo;

use sqlx::PgPool;

/// Everything the scheduler needs from the request store.
pub trait RequestStore: SourceStampRepo + BuildSetRepo + BuildRequestRepo + BuildRepo {}

impl<T> RequestStore for T where T: SourceStampRepo + BuildSetRepo + BuildRequestRepo + BuildRepo {}

/// PostgreSQL implementation of the request store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}
