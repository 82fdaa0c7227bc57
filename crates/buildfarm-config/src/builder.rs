//! Builder configuration parsing.

use crate::{ConfigError, ConfigResult};
use buildfarm_core::PoolHint;
use kdl::KdlNode;
use serde::{Deserialize, Serialize};

/// A named job template and the workers allowed to run it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuilderConfig {
    pub name: String,
    /// Workers that may start fresh requests.
    pub start_pool: Vec<String>,
    /// Workers that may resume paused builds. Falls back to `start_pool`.
    pub resume_pool: Option<Vec<String>>,
    /// Exclusive locks held by every attempt of this builder.
    pub locks: Vec<String>,
    /// Whether duplicate requests fold into an existing one.
    pub merge_requests: bool,
}

impl BuilderConfig {
    pub fn new(name: impl Into<String>, start_pool: &[&str]) -> Self {
        Self {
            name: name.into(),
            start_pool: start_pool.iter().map(|w| w.to_string()).collect(),
            resume_pool: None,
            locks: Vec::new(),
            merge_requests: true,
        }
    }

    pub fn with_resume_pool(mut self, workers: &[&str]) -> Self {
        self.resume_pool = Some(workers.iter().map(|w| w.to_string()).collect());
        self
    }

    pub fn with_locks(mut self, locks: &[&str]) -> Self {
        self.locks = locks.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn without_merging(mut self) -> Self {
        self.merge_requests = false;
        self
    }

    /// The pool a paused build resumes on for the given hint.
    pub fn pool_for_resume(&self, hint: Option<PoolHint>) -> &[String] {
        match hint {
            Some(PoolHint::Start) => &self.start_pool,
            Some(PoolHint::Resume) | None => {
                self.resume_pool.as_deref().unwrap_or(self.start_pool.as_slice())
            }
        }
    }
}

pub(crate) fn parse_builder(node: &KdlNode) -> ConfigResult<BuilderConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("builder name".to_string()))?;

    let merge_requests = get_bool_prop(node, "merge").unwrap_or(true);

    let mut start_pool = Vec::new();
    let mut resume_pool = None;
    let mut locks = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "workers" => start_pool.extend(get_all_string_args(child)),
                "resume-workers" => {
                    resume_pool
                        .get_or_insert_with(Vec::new)
                        .extend(get_all_string_args(child));
                }
                "locks" => locks.extend(get_all_string_args(child)),
                other => {
                    return Err(ConfigError::InvalidValue {
                        field: format!("builder '{}'", name),
                        message: format!("unknown setting '{}'", other),
                    });
                }
            }
        }
    }

    Ok(BuilderConfig {
        name,
        start_pool,
        resume_pool,
        locks,
        merge_requests,
    })
}

// Helper functions for extracting values from KDL nodes

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

pub(crate) fn get_number_prop(node: &KdlNode, name: &str) -> Option<f64> {
    node.get(name)
        .and_then(|v| v.as_float().or_else(|| v.as_integer().map(|i| i as f64)))
}

pub(crate) fn get_integer_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    match node.get(name) {
        None => Ok(None),
        Some(v) => v
            .as_integer()
            .and_then(|i| u64::try_from(i).ok())
            .filter(|i| *i > 0)
            .map(Some)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: name.to_string(),
                message: "expected a positive integer".to_string(),
            }),
    }
}
