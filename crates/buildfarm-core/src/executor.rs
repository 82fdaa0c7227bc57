//! Executor trait and build launch types.
//!
//! An executor runs a build on a worker. It is told when to start, resume or
//! stop a build and reports progress back to the scheduler's build controller
//! (step started, pause requested, finished).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::id::{BuildId, BuildRequestId};
use crate::request::Properties;
use crate::sourcestamp::SourceStamp;
use crate::Result;

/// Everything an executor needs to launch one attempt of a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSpec {
    pub brid: BuildRequestId,
    pub build_id: BuildId,
    /// Build number, stable across pause/resume.
    pub number: i32,
    pub buildername: String,
    /// Worker the attempt was matched to.
    pub worker: String,
    pub sourcestamps: Vec<SourceStamp>,
    pub properties: Properties,
    /// Request whose artifacts may be reused.
    pub artifact_brid: Option<BuildRequestId>,
    /// Step index to continue from when resuming a paused build.
    pub resume_from: Option<u32>,
}

/// Runs builds on workers.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    /// Executor name (e.g., "local", "remote").
    fn name(&self) -> &'static str;

    /// Launch a fresh attempt. Returns once the build is running.
    async fn start_build(&self, spec: BuildSpec) -> Result<()>;

    /// Continue a paused build from `spec.resume_from`.
    ///
    /// Fails with [`crate::Error::CorruptResumeState`] when the saved
    /// state of the build cannot be loaded.
    async fn resume_build(&self, spec: BuildSpec) -> Result<()>;

    /// Interrupt a running build.
    async fn stop_build(&self, brid: BuildRequestId, reason: &str) -> Result<()>;
}
