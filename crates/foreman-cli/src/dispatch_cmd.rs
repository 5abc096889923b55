//! `foreman dispatch` command: force-dispatch one work item in-process and
//! wait for its stage to finish.

use std::time::Duration;

use anyhow::{Context, Result};

use foreman_core::{Foreman, HarnessConfig};
use foreman_db::models::WorkItemStatus;
use foreman_db::queries::runs::list_runs_for_work_item;
use foreman_db::queries::work_items::get_work_item;

/// Run the dispatch command.
///
/// Opening the harness runs startup recovery, so this must not point at a
/// database a `foreman serve` process is using; use
/// `POST /work-items/{id}/dispatch` there instead.
pub async fn run_dispatch(config: HarnessConfig, id: i64) -> Result<()> {
    let foreman = Foreman::open(config).await?;

    let accepted = foreman
        .dispatcher
        .dispatch_now(id)
        .await
        .with_context(|| format!("failed to dispatch work item {id}"))?;
    println!(
        "Dispatching work item #{id} ({} stage, was {})",
        accepted.stage, accepted.previous_status
    );

    // Ctrl+C leaves the run to the next startup's recovery.
    tokio::select! {
        _ = foreman.dispatcher.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nInterrupted; the run will be marked failed on next startup.");
            std::process::exit(130);
        }
    }
    // Let the worker's final writes land before reading back.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let item = get_work_item(&foreman.pool, id)
        .await?
        .with_context(|| format!("work item {id} not found"))?;
    println!("Status: {}", item.status);
    for run in list_runs_for_work_item(&foreman.pool, id).await? {
        let error = run.error_text.as_deref().unwrap_or("");
        println!(
            "  run {:<6} {:<8} attempt {} {:<12} {error}",
            run.id,
            run.stage.as_str(),
            run.attempt,
            run.status.as_str()
        );
        if let Some(log) = &run.log_path {
            println!("    log: {log}");
        }
    }

    foreman.pool.close().await;
    if item.status == WorkItemStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}
