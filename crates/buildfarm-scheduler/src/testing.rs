//! Test support: a recording executor and a distributor over a memory store.

use async_trait::async_trait;
use buildfarm_config::{BuilderConfig, SchedulerConfig};
use buildfarm_core::{
    BuildExecutor, BuildRequestId, BuildSpec, CoordinatorId, Error, Result, SourceStamp,
    SourceStampSetId,
};
use buildfarm_db::{MemoryStore, SourceStampRepo};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::distributor::BuildRequestDistributor;

#[derive(Default)]
pub struct MockExecutor {
    started: Mutex<Vec<BuildSpec>>,
    resumed: Mutex<Vec<BuildSpec>>,
    stopped: Mutex<Vec<BuildRequestId>>,
    corrupt_resume: AtomicBool,
    fail_start: AtomicBool,
}

impl MockExecutor {
    pub fn started(&self) -> Vec<BuildSpec> {
        self.started.lock().unwrap().clone()
    }

    pub fn resumed(&self) -> Vec<BuildSpec> {
        self.resumed.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<BuildRequestId> {
        self.stopped.lock().unwrap().clone()
    }

    pub fn corrupt_resumes(&self) {
        self.corrupt_resume.store(true, Ordering::SeqCst);
    }

    pub fn fail_starts(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl BuildExecutor for MockExecutor {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn start_build(&self, spec: BuildSpec) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::ExecutionFailed("worker refused build".to_string()));
        }
        self.started.lock().unwrap().push(spec);
        Ok(())
    }

    async fn resume_build(&self, spec: BuildSpec) -> Result<()> {
        if self.corrupt_resume.load(Ordering::SeqCst) {
            return Err(Error::CorruptResumeState("missing step state".to_string()));
        }
        self.resumed.lock().unwrap().push(spec);
        Ok(())
    }

    async fn stop_build(&self, brid: BuildRequestId, _reason: &str) -> Result<()> {
        self.stopped.lock().unwrap().push(brid);
        Ok(())
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub executor: Arc<MockExecutor>,
    pub distributor: Arc<BuildRequestDistributor>,
}

impl Harness {
    pub async fn new(builders: Vec<BuilderConfig>) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), "coord-a", builders).await
    }

    /// A second coordinator process sharing `store`.
    pub async fn with_store(
        store: Arc<MemoryStore>,
        coordinator: &str,
        builders: Vec<BuilderConfig>,
    ) -> Self {
        let config = SchedulerConfig {
            coordinator: Some(coordinator.to_string()),
            builders,
            ..SchedulerConfig::default()
        };
        let executor = Arc::new(MockExecutor::default());
        let distributor = Arc::new(BuildRequestDistributor::new(
            &config,
            store.clone(),
            executor.clone(),
        ));
        assert_eq!(distributor.coordinator(), &CoordinatorId::new(coordinator));
        Self {
            store,
            executor,
            distributor,
        }
    }
}

pub async fn stamps(store: &MemoryStore, revision: Option<&str>) -> SourceStampSetId {
    store
        .add_sourcestamp_set(&[SourceStamp::new("main", "r", Some("m"), revision)])
        .await
        .unwrap()
}
