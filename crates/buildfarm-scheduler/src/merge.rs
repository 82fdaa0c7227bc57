//! Duplicate request detection at submission time.

use buildfarm_core::SourceStamp;
use buildfarm_db::{MergeCandidate, MergeInto};
use std::collections::BTreeMap;

/// Decides whether a new request folds into an existing one.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeEngine;

impl MergeEngine {
    /// Whether a request on `new` stamps may merge into one on `target`
    /// stamps.
    ///
    /// Both must cover the same codebases. Per codebase the stamps are equal,
    /// or the target still builds the latest revision of the same branch
    /// while the new one names a revision.
    pub fn stamps_compatible(new: &[SourceStamp], target: &[SourceStamp]) -> bool {
        let new_by_codebase: BTreeMap<&str, &SourceStamp> =
            new.iter().map(|s| (s.codebase.as_str(), s)).collect();
        let target_by_codebase: BTreeMap<&str, &SourceStamp> =
            target.iter().map(|s| (s.codebase.as_str(), s)).collect();

        if new_by_codebase.len() != new.len()
            || target_by_codebase.len() != target.len()
            || new_by_codebase.len() != target_by_codebase.len()
        {
            return false;
        }

        new_by_codebase.iter().all(|(codebase, new)| {
            let Some(target) = target_by_codebase.get(codebase) else {
                return false;
            };
            if new == target {
                return true;
            }
            !target.is_resolved()
                && new.is_resolved()
                && new.repository == target.repository
                && new.branch == target.branch
        })
    }

    /// The oldest candidate the new request may merge into.
    ///
    /// Candidates are incomplete requests on the same builder in submission
    /// order. Requests that are themselves merged never qualify.
    pub fn find_merge_target<'a>(
        &self,
        buildername: &str,
        stamps: &[SourceStamp],
        candidates: &'a [MergeCandidate],
    ) -> Option<&'a MergeCandidate> {
        candidates.iter().find(|c| {
            c.request.buildername == buildername
                && !c.request.complete
                && !c.request.is_merged()
                && Self::stamps_compatible(stamps, &c.sourcestamps)
        })
    }

    /// How a request merges into `target`. Artifacts resolve in one hop.
    pub fn merge_into(target: &MergeCandidate) -> MergeInto {
        MergeInto {
            target: target.request.id,
            artifact_brid: target.request.artifact_brid.unwrap_or(target.request.id),
        }
    }
}
