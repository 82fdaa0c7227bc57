//! Build outcomes and their severity order.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Outcome of a step, build, build request or buildset.
///
/// The discriminants are the persisted result codes. An unset result is
/// represented as `None` and stored as `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
pub enum BuildResult {
    #[display("success")]
    Success = 0,
    #[display("warnings")]
    Warnings = 1,
    #[display("failure")]
    Failure = 2,
    #[display("skipped")]
    Skipped = 3,
    #[display("exception")]
    Exception = 4,
    #[display("retry")]
    Retry = 5,
    #[display("canceled")]
    Canceled = 6,
    #[display("not-rebuilt")]
    NotRebuilt = 7,
    #[display("dependency-failure")]
    DependencyFailure = 8,
    /// The attempt suspended itself and went back to the paused queue.
    #[display("resume")]
    Resume = 9,
    #[display("merged")]
    Merged = 10,
    #[display("interrupted")]
    Interrupted = 11,
}

/// Persisted value of an unset result.
pub const UNSET_RESULT: i32 = -1;

impl BuildResult {
    pub const ALL: [BuildResult; 12] = [
        BuildResult::Success,
        BuildResult::Warnings,
        BuildResult::Failure,
        BuildResult::Skipped,
        BuildResult::Exception,
        BuildResult::Retry,
        BuildResult::Canceled,
        BuildResult::NotRebuilt,
        BuildResult::DependencyFailure,
        BuildResult::Resume,
        BuildResult::Merged,
        BuildResult::Interrupted,
    ];

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|r| r.code() == code)
            .ok_or_else(|| Error::InvalidInput(format!("unknown result code {}", code)))
    }

    /// Decode a nullable persisted code, where `-1` means unset.
    pub fn from_optional_code(code: i32) -> Result<Option<Self>> {
        if code == UNSET_RESULT {
            Ok(None)
        } else {
            Self::from_code(code).map(Some)
        }
    }

    pub fn optional_code(result: Option<Self>) -> i32 {
        result.map(Self::code).unwrap_or(UNSET_RESULT)
    }

    /// Rank in the severity order; larger is worse.
    ///
    /// RESUME and MERGED are bookkeeping states rather than outcomes and sit
    /// below SUCCESS so they never mask a real result.
    fn severity(self) -> u8 {
        match self {
            BuildResult::Merged => 0,
            BuildResult::Resume => 1,
            BuildResult::Success => 2,
            BuildResult::NotRebuilt => 3,
            BuildResult::Skipped => 4,
            BuildResult::Warnings => 5,
            BuildResult::Failure => 6,
            BuildResult::DependencyFailure => 7,
            BuildResult::Exception => 8,
            BuildResult::Interrupted => 9,
            BuildResult::Canceled => 10,
            BuildResult::Retry => 11,
        }
    }

    /// The more severe of two results.
    ///
    /// RETRY is the worst so consumers never see another failure mask it.
    pub fn worst(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// Fold a sequence of results with [`BuildResult::worst`].
    pub fn worst_of<I>(results: I) -> Option<Self>
    where
        I: IntoIterator<Item = Self>,
    {
        results.into_iter().reduce(Self::worst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst_examples() {
        assert_eq!(
            BuildResult::Success.worst(BuildResult::Failure),
            BuildResult::Failure
        );
        for r in BuildResult::ALL {
            assert_eq!(BuildResult::Retry.worst(r), BuildResult::Retry);
            assert_eq!(r.worst(BuildResult::Retry), BuildResult::Retry);
        }
    }

    #[test]
    fn test_worst_is_commutative_associative_idempotent() {
        for a in BuildResult::ALL {
            assert_eq!(a.worst(a), a);
            for b in BuildResult::ALL {
                assert_eq!(a.worst(b), b.worst(a));
                for c in BuildResult::ALL {
                    assert_eq!(a.worst(b).worst(c), a.worst(b.worst(c)));
                }
            }
        }
    }

    #[test]
    fn test_severity_chain_matches_documented_order() {
        let order = [
            BuildResult::Retry,
            BuildResult::Canceled,
            BuildResult::Interrupted,
            BuildResult::Exception,
            BuildResult::DependencyFailure,
            BuildResult::Failure,
            BuildResult::Warnings,
            BuildResult::Skipped,
            BuildResult::NotRebuilt,
            BuildResult::Success,
        ];
        for pair in order.windows(2) {
            assert_eq!(pair[0].worst(pair[1]), pair[0]);
        }
    }

    #[test]
    fn test_worst_of_steps() {
        let steps = [
            BuildResult::Success,
            BuildResult::Warnings,
            BuildResult::Skipped,
        ];
        assert_eq!(BuildResult::worst_of(steps), Some(BuildResult::Warnings));
        assert_eq!(BuildResult::worst_of([]), None);
    }

    #[test]
    fn test_codes() {
        for r in BuildResult::ALL {
            assert_eq!(BuildResult::from_code(r.code()).unwrap(), r);
        }
        assert_eq!(BuildResult::from_optional_code(-1).unwrap(), None);
        assert!(BuildResult::from_code(42).is_err());
        assert_eq!(BuildResult::Resume.code(), 9);
    }
}
