//! Buildset submission with merge planning.

use buildfarm_config::BuilderConfig;
use buildfarm_core::{BuildRequestId, CoordinatorId, Properties, SourceStampSetId};
use buildfarm_db::{NewBuildRequest, NewBuildSet, RequestStore, SubmittedBuildSet};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::error::SchedulerResult;
use crate::merge::MergeEngine;

/// What a caller asks to build.
#[derive(Debug, Clone)]
pub struct BuildSetRequest {
    pub sourcestampset_id: SourceStampSetId,
    pub reason: String,
    pub properties: Properties,
    pub builder_names: Vec<String>,
    pub triggered_by: Option<BuildRequestId>,
    pub external_idstring: Option<String>,
}

impl BuildSetRequest {
    pub fn new(
        sourcestampset_id: SourceStampSetId,
        reason: impl Into<String>,
        builder_names: &[&str],
    ) -> Self {
        Self {
            sourcestampset_id,
            reason: reason.into(),
            properties: Properties::new(),
            builder_names: builder_names.iter().map(|b| b.to_string()).collect(),
            triggered_by: None,
            external_idstring: None,
        }
    }

    pub fn with_property(
        mut self,
        name: impl Into<String>,
        value: serde_json::Value,
        source: impl Into<String>,
    ) -> Self {
        self.properties.insert(name.into(), (value, source.into()));
        self
    }

    pub fn triggered_by(mut self, brid: BuildRequestId) -> Self {
        self.triggered_by = Some(brid);
        self
    }
}

/// Ids of a submitted buildset and the merges decided for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub buildset: SubmittedBuildSet,
    /// Builder name to merge target, for requests that were folded.
    pub merged: BTreeMap<String, BuildRequestId>,
}

/// Plan merges for each requested builder, then insert the buildset.
pub async fn submit_build_set(
    store: &dyn RequestStore,
    builders: &[BuilderConfig],
    coordinator: &CoordinatorId,
    request: BuildSetRequest,
    now: DateTime<Utc>,
) -> SchedulerResult<Submission> {
    let stamps = store.get_sourcestamps(request.sourcestampset_id).await?;
    let engine = MergeEngine;

    let mut requests = Vec::with_capacity(request.builder_names.len());
    let mut merged = BTreeMap::new();
    for buildername in &request.builder_names {
        let merge_enabled = builders
            .iter()
            .find(|b| &b.name == buildername)
            .is_none_or(|b| b.merge_requests);
        let merge = if merge_enabled {
            let candidates = store.select_merge_candidates(buildername).await?;
            engine
                .find_merge_target(buildername, &stamps, &candidates)
                .map(MergeEngine::merge_into)
        } else {
            None
        };

        if let Some(merge) = &merge {
            debug!(builder = %buildername, target = %merge.target, "Merging new request");
            merged.insert(buildername.clone(), merge.target);
        }
        requests.push(NewBuildRequest {
            buildername: buildername.clone(),
            merge,
        });
    }

    let buildset = store
        .add_buildset(NewBuildSet {
            sourcestampset_id: request.sourcestampset_id,
            reason: request.reason,
            properties: request.properties,
            external_idstring: request.external_idstring,
            triggered_by: request.triggered_by,
            requests,
            submitted_at: now,
            coordinator: coordinator.clone(),
        })
        .await?;

    info!(
        bsid = %buildset.bsid,
        requests = buildset.brids.len(),
        merged = merged.len(),
        "Submitted buildset"
    );

    Ok(Submission { buildset, merged })
}
