//! Build requests, buildsets, builds and claims.

use chrono::{DateTime, Duration, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::id::{BuildId, BuildRequestId, BuildSetId, CoordinatorId, SourceStampSetId};
use crate::results::BuildResult;
use crate::{Error, Result};

/// Buildset property carrying the priority of its requests.
pub const PRIORITY_PROPERTY: &str = "priority";
/// Buildset property pinning its requests to a single worker.
pub const SELECTED_WORKER_PROPERTY: &str = "selected_worker";

/// Scheduling tier of a request. Higher tiers are always served first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    #[default]
    #[display("default")]
    Default = 0,
    #[display("high")]
    High = 1,
    #[display("very-high")]
    VeryHigh = 2,
    #[display("emergency")]
    Emergency = 3,
}

impl Priority {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(Priority::Default),
            1 => Ok(Priority::High),
            2 => Ok(Priority::VeryHigh),
            3 => Ok(Priority::Emergency),
            other => Err(Error::InvalidInput(format!("unknown priority {}", other))),
        }
    }

    /// Read the priority from a buildset property value.
    ///
    /// Accepts a tier code or a tier name. Anything missing, non-positive or
    /// unrecognised yields `Default`.
    pub fn from_property(value: Option<&serde_json::Value>) -> Self {
        let Some(value) = value else {
            return Priority::Default;
        };
        let parsed = match value {
            serde_json::Value::Number(n) => n
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .and_then(|n| Self::from_code(n).ok()),
            serde_json::Value::String(s) => s
                .parse::<i32>()
                .ok()
                .and_then(|n| Self::from_code(n).ok())
                .or_else(|| s.parse().ok()),
            _ => None,
        };
        parsed.unwrap_or_default()
    }
}

impl std::str::FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "default" => Ok(Priority::Default),
            "high" => Ok(Priority::High),
            "very-high" | "veryhigh" => Ok(Priority::VeryHigh),
            "emergency" => Ok(Priority::Emergency),
            other => Err(Error::InvalidInput(format!("unknown priority '{}'", other))),
        }
    }
}

/// The two independently scheduled queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum QueueKind {
    /// Fresh requests that have never run.
    #[display("unclaimed")]
    Unclaimed,
    /// Requests whose build suspended itself and waits to be resumed.
    #[display("paused")]
    Paused,
}

/// Which of a builder's worker pools a paused build should resume on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
pub enum PoolHint {
    #[display("start")]
    Start,
    #[display("resume")]
    Resume,
}

impl std::str::FromStr for PoolHint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(PoolHint::Start),
            "resume" => Ok(PoolHint::Resume),
            other => Err(Error::InvalidInput(format!("unknown pool hint '{}'", other))),
        }
    }
}

/// Buildset properties: name -> (value, source).
pub type Properties = BTreeMap<String, (serde_json::Value, String)>;

/// A queued unit of work against one builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub id: BuildRequestId,
    pub buildset_id: BuildSetId,
    pub buildername: String,
    pub priority: Priority,
    pub submitted_at: DateTime<Utc>,
    pub complete: bool,
    pub complete_at: Option<DateTime<Utc>>,
    /// Unset until complete, except RESUME while the request sits paused.
    pub results: Option<BuildResult>,
    /// Causal parent.
    pub triggered_by: Option<BuildRequestId>,
    /// Root of the trigger chain.
    pub start_brid: Option<BuildRequestId>,
    /// Target this request was folded into.
    pub merge_brid: Option<BuildRequestId>,
    /// Request whose artifacts this one reuses.
    pub artifact_brid: Option<BuildRequestId>,
    /// Worker this request is pinned to, if any.
    pub selected_worker: Option<String>,
    /// Pool hint recorded when the request was paused.
    pub resume_pool: Option<PoolHint>,
}

impl BuildRequest {
    pub fn is_merged(&self) -> bool {
        self.merge_brid.is_some()
    }

    /// The queue this request waits in when nobody holds a claim on it.
    pub fn queue(&self) -> Option<QueueKind> {
        if self.complete || self.is_merged() {
            return None;
        }
        match self.results {
            None => Some(QueueKind::Unclaimed),
            Some(BuildResult::Resume) => Some(QueueKind::Paused),
            Some(_) => None,
        }
    }
}

/// A group of requests submitted together against one source stamp set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSet {
    pub id: BuildSetId,
    pub sourcestampset_id: SourceStampSetId,
    pub submitted_at: DateTime<Utc>,
    pub reason: String,
    pub complete: bool,
    pub complete_at: Option<DateTime<Utc>>,
    pub results: Option<BuildResult>,
    pub external_idstring: Option<String>,
}

/// One executed attempt of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub brid: BuildRequestId,
    /// Sequential per builder. Merged requests share their target's number.
    pub number: i32,
    pub slavename: Option<String>,
    /// Cleared while the attempt is paused.
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
}

/// Lease giving one coordinator the right to act on a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub brid: BuildRequestId,
    pub coordinator: CoordinatorId,
    pub claimed_at: DateTime<Utc>,
}

/// Result of trying to insert a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Another coordinator owns the request; do nothing.
    AlreadyClaimed,
}

/// Result of the conditional buildset completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildSetCompletion {
    /// This call flipped the buildset to complete.
    Completed,
    /// A sibling completion got there first.
    AlreadyComplete,
}

/// History entry written each time an attempt suspends itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub start: DateTime<Utc>,
    pub finish: DateTime<Utc>,
    pub worker: String,
    /// Index of the step to continue from.
    pub last_step: u32,
    pub resume_pool: Option<PoolHint>,
    #[serde(with = "elapsed_millis")]
    pub elapsed: Duration,
}

mod elapsed_millis {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(d.num_milliseconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::milliseconds(i64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_order() {
        assert!(Priority::Emergency > Priority::VeryHigh);
        assert!(Priority::VeryHigh > Priority::High);
        assert!(Priority::High > Priority::Default);
    }

    #[test]
    fn test_priority_from_property() {
        assert_eq!(Priority::from_property(None), Priority::Default);
        assert_eq!(Priority::from_property(Some(&json!(3))), Priority::Emergency);
        assert_eq!(Priority::from_property(Some(&json!("2"))), Priority::VeryHigh);
        assert_eq!(Priority::from_property(Some(&json!("high"))), Priority::High);
        assert_eq!(Priority::from_property(Some(&json!(-4))), Priority::Default);
        assert_eq!(Priority::from_property(Some(&json!("urgent"))), Priority::Default);
        assert_eq!(Priority::from_property(Some(&json!(true))), Priority::Default);
    }

    #[test]
    fn test_request_queue_membership() {
        let mut br = BuildRequest {
            id: BuildRequestId::new(1),
            buildset_id: BuildSetId::new(1),
            buildername: "b1".to_string(),
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
        };
        assert_eq!(br.queue(), Some(QueueKind::Unclaimed));

        br.results = Some(BuildResult::Resume);
        assert_eq!(br.queue(), Some(QueueKind::Paused));

        br.merge_brid = Some(BuildRequestId::new(7));
        assert_eq!(br.queue(), None);
    }
}
