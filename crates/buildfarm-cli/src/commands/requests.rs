//! Build request commands.

use anyhow::Result;
use buildfarm_core::{BuildRequestId, QueueKind};
use buildfarm_db::{BuildRepo, BuildRequestRepo};
use buildfarm_scheduler::CancelOutcome;

pub async fn queue(database_url: &str, paused: bool) -> Result<()> {
    let store = super::connect(database_url).await?;
    let queue = if paused {
        QueueKind::Paused
    } else {
        QueueKind::Unclaimed
    };

    let requests = store.select_ready_requests(queue, &[]).await?;
    if requests.is_empty() {
        println!("No {} requests", queue);
        return Ok(());
    }
    println!(
        "{:<8} {:<20} {:<10} {:<25} {}",
        "BRID", "BUILDER", "PRIORITY", "SUBMITTED", "WORKER"
    );
    for request in requests {
        println!(
            "{:<8} {:<20} {:<10} {:<25} {}",
            request.id.to_string(),
            request.buildername,
            request.priority.to_string(),
            request.submitted_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            request.selected_worker.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

pub async fn show(database_url: &str, brid: BuildRequestId) -> Result<()> {
    let store = super::connect(database_url).await?;
    let request = store.get_request(brid).await?;
    let builds = store.get_builds_for_request(brid).await?;

    let mut history = Vec::new();
    for build in &builds {
        history.extend(store.get_resume_history(build.id).await?);
    }
    let merged = store.get_merged_requests(brid).await?;
    let claim = store.get_claim(brid).await?;

    let report = serde_json::json!({
        "request": request,
        "claimed_by": claim.map(|c| c.coordinator),
        "builds": builds,
        "resume_history": history,
        "merged": merged.iter().map(|r| r.id).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub async fn cancel(database_url: &str, config_path: &str, brid: BuildRequestId) -> Result<()> {
    let (_store, distributor) = super::distributor(database_url, config_path).await?;
    match distributor.controller().cancel(brid).await? {
        CancelOutcome::Cancelled | CancelOutcome::Stopped => {
            println!("Cancelled build request {}", brid)
        }
        CancelOutcome::AlreadyComplete => println!("Build request {} is already complete", brid),
        CancelOutcome::NotOwned => {
            println!(
                "Build request {} is claimed by a running coordinator; cancel it there",
                brid
            );
            std::process::exit(1);
        }
    }
    Ok(())
}

pub async fn stop_chain(database_url: &str, config_path: &str, brid: BuildRequestId) -> Result<()> {
    let (_store, distributor) = super::distributor(database_url, config_path).await?;
    let outcome = distributor.controller().stop_build_chain(brid).await?;
    println!(
        "Stopped {} requests in {} passes",
        outcome.cancelled, outcome.passes
    );
    if !outcome.converged {
        println!("Some requests in the chain are still running on other coordinators");
        std::process::exit(1);
    }
    Ok(())
}
