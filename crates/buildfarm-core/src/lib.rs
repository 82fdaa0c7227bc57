//! Core domain types and traits for the buildfarm coordinator.
//!
//! This crate contains:
//! - Typed row identifiers and coordinator identity
//! - Build requests, buildsets, builds, claims and priorities
//! - Build results and their severity order
//! - Source stamps
//! - The executor trait used to run builds on workers

pub mod error;
pub mod executor;
pub mod id;
pub mod request;
pub mod results;
pub mod sourcestamp;

pub use error::{Error, Result};
pub use executor::{BuildExecutor, BuildSpec};
pub use id::{BuildId, BuildRequestId, BuildSetId, CoordinatorId, SourceStampSetId};
pub use request::{
    Build, BuildRequest, BuildSet, BuildSetCompletion, Claim, ClaimOutcome, PoolHint, Priority,
    Properties, QueueKind, ResumeRecord,
};
pub use results::BuildResult;
pub use sourcestamp::SourceStamp;
