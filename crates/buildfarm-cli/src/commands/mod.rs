//! CLI command implementations.

pub mod buildsets;
pub mod requests;

use anyhow::{Context, Result};
use async_trait::async_trait;
use buildfarm_config::SchedulerConfig;
use buildfarm_core::{BuildExecutor, BuildRequestId, BuildSpec, Error};
use buildfarm_db::PgStore;
use buildfarm_scheduler::BuildRequestDistributor;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

pub async fn migrate(database_url: &str) -> Result<()> {
    let pool = buildfarm_db::create_pool(database_url).await?;
    buildfarm_db::run_migrations(&pool).await?;
    println!("Migrations applied");
    Ok(())
}

pub fn validate(path: &str) -> Result<()> {
    match buildfarm_config::load_system_config(path) {
        Ok(config) => {
            println!("Configuration is valid");
            for builder in &config.builders {
                println!(
                    "  {} workers={:?} resume-workers={:?} locks={:?} merge={}",
                    builder.name,
                    builder.start_pool,
                    builder.pool_for_resume(None),
                    builder.locks,
                    builder.merge_requests
                );
            }
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Executor for a CLI invocation, which never runs builds itself. Requests
/// it would have to start stay with the coordinators that own workers.
struct OfflineExecutor;

#[async_trait]
impl BuildExecutor for OfflineExecutor {
    fn name(&self) -> &'static str {
        "offline"
    }

    async fn start_build(&self, spec: BuildSpec) -> buildfarm_core::Result<()> {
        Err(Error::WorkerUnavailable(spec.worker))
    }

    async fn resume_build(&self, spec: BuildSpec) -> buildfarm_core::Result<()> {
        Err(Error::WorkerUnavailable(spec.worker))
    }

    async fn stop_build(&self, brid: BuildRequestId, _reason: &str) -> buildfarm_core::Result<()> {
        Err(Error::ExecutionFailed(format!(
            "build request {} is not running here",
            brid
        )))
    }
}

/// A distributor with no workers, used to submit and cancel from the CLI.
async fn distributor(
    database_url: &str,
    config_path: &str,
) -> Result<(Arc<PgStore>, BuildRequestDistributor)> {
    let config = load_config(config_path)?;
    let store = connect(database_url).await?;
    let distributor = BuildRequestDistributor::new(&config, store.clone(), Arc::new(OfflineExecutor));
    Ok((store, distributor))
}

async fn connect(database_url: &str) -> Result<Arc<PgStore>> {
    let pool = buildfarm_db::create_pool(database_url)
        .await
        .context("failed to connect to database")?;
    Ok(Arc::new(PgStore::new(pool)))
}

/// Load the coordinator configuration, falling back to defaults when the
/// file does not exist.
fn load_config(path: &str) -> Result<SchedulerConfig> {
    if !Path::new(path).exists() {
        warn!(path = %path, "Configuration file not found; using defaults");
        return Ok(SchedulerConfig::default());
    }
    buildfarm_config::load_system_config(path)
        .with_context(|| format!("failed to load configuration from {}", path))
}
