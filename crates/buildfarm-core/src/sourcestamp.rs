//! Source stamps: what a request builds, per codebase.

use serde::{Deserialize, Serialize};

/// Per-codebase identity of the source to build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceStamp {
    pub codebase: String,
    pub repository: String,
    pub branch: Option<String>,
    /// `None` means "latest", resolved when the build runs.
    pub revision: Option<String>,
}

impl SourceStamp {
    pub fn new(
        codebase: impl Into<String>,
        repository: impl Into<String>,
        branch: Option<&str>,
        revision: Option<&str>,
    ) -> Self {
        Self {
            codebase: codebase.into(),
            repository: repository.into(),
            branch: branch.map(String::from),
            revision: revision.map(String::from),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.revision.is_some()
    }
}
