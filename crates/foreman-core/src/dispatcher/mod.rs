//! Dispatcher loop: a cancellable ticker that claims work items and hands
//! them to semaphore-bounded worker tasks.
//!
//! Stopping cancels the ticker only; workers already running finish their
//! stage. Every per-item error is caught at the worker boundary.

mod policy;
mod worker;

pub use policy::FailurePolicy;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use foreman_db::models::{Stage, WorkItemStatus};
use foreman_db::queries::events::insert_event;
use foreman_db::queries::findings::has_open_blocking_findings;
use foreman_db::queries::runs::has_passed_run;
use foreman_db::queries::work_items::{
    ClaimedWorkItem, claim_next_work_item, claim_work_item, get_work_item,
};

use crate::agents::AgentRegistry;
use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::executor::StageExecutor;
use crate::projection::refresh_projection_best_effort;
use crate::state::{WorkItemStateMachine, release_unblocked_work_items};

/// Shared state handed to every worker.
#[derive(Debug)]
pub struct DispatchContext {
    pub pool: SqlitePool,
    pub config: Arc<HarnessConfig>,
    pub registry: Arc<AgentRegistry>,
    pub executor: StageExecutor,
}

/// Loop status as reported by `/loop/status`.
#[derive(Debug, Clone, Serialize)]
pub struct LoopStatus {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub ticks: u64,
    pub in_flight: usize,
    pub max_parallel_runs: usize,
    pub poll_interval_ms: u64,
}

/// Accepted force-dispatch request.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchAccepted {
    pub work_item_id: i64,
    pub previous_status: WorkItemStatus,
    pub stage: Stage,
}

#[derive(Default)]
struct LoopState {
    cancel: Option<CancellationToken>,
    started_at: Option<DateTime<Utc>>,
    last_tick_at: Option<DateTime<Utc>>,
}

/// The dispatcher.
pub struct Dispatcher {
    ctx: Arc<DispatchContext>,
    permits: Arc<Semaphore>,
    max_parallel: usize,
    state: Mutex<LoopState>,
    ticks: AtomicU64,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("max_parallel", &self.max_parallel)
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(ctx: DispatchContext) -> Arc<Self> {
        let max_parallel = ctx.config.max_parallel_runs.max(1);
        Arc::new(Self {
            ctx: Arc::new(ctx),
            permits: Arc::new(Semaphore::new(max_parallel)),
            max_parallel,
            state: Mutex::new(LoopState::default()),
            ticks: AtomicU64::new(0),
        })
    }

    pub fn context(&self) -> &Arc<DispatchContext> {
        &self.ctx
    }

    fn in_flight(&self) -> usize {
        self.max_parallel - self.permits.available_permits()
    }

    pub async fn status(&self) -> LoopStatus {
        let state = self.state.lock().await;
        LoopStatus {
            running: state.cancel.is_some(),
            started_at: state.started_at,
            last_tick_at: state.last_tick_at,
            ticks: self.ticks.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
            max_parallel_runs: self.max_parallel,
            poll_interval_ms: self.ctx.config.poll_interval.as_millis() as u64,
        }
    }

    /// Start the ticker. Starting a running loop is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<LoopStatus> {
        {
            let mut state = self.state.lock().await;
            if state.cancel.is_none() {
                let cancel = CancellationToken::new();
                state.cancel = Some(cancel.clone());
                state.started_at = Some(Utc::now());

                let this = Arc::clone(self);
                tokio::spawn(async move { this.run_loop(cancel).await });

                insert_event(&self.ctx.pool, "loop_started", "dispatcher", None, json!({}))
                    .await?;
                info!(
                    max_parallel = self.max_parallel,
                    poll_interval_ms = self.ctx.config.poll_interval.as_millis() as u64,
                    "dispatcher started"
                );
            }
        }
        Ok(self.status().await)
    }

    /// Cancel the ticker. In-flight workers keep running.
    pub async fn stop(&self) -> Result<LoopStatus> {
        {
            let mut state = self.state.lock().await;
            if let Some(cancel) = state.cancel.take() {
                cancel.cancel();
                state.started_at = None;
                insert_event(
                    &self.ctx.pool,
                    "loop_stopped",
                    "dispatcher",
                    None,
                    json!({ "in_flight": self.in_flight() }),
                )
                .await?;
                info!(in_flight = self.in_flight(), "dispatcher stopped");
            }
        }
        Ok(self.status().await)
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.ctx.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %format!("{e:#}"), "dispatcher tick failed");
                    }
                }
            }
        }
        debug!("dispatcher loop exited");
    }

    /// One pass: release unblocked items, fill free permits with claims,
    /// refresh the projection. Returns the number of workers spawned.
    pub async fn tick(self: &Arc<Self>) -> Result<usize> {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.state.lock().await.last_tick_at = Some(Utc::now());

        release_unblocked_work_items(&self.ctx.pool).await?;

        let mut spawned = 0;
        loop {
            // Permit first, so the cap holds even if a claim succeeds.
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                break;
            };
            let Some(claimed) = claim_next_work_item(&self.ctx.pool).await? else {
                break;
            };
            self.spawn_worker(claimed, permit);
            spawned += 1;
        }

        refresh_projection_best_effort(&self.ctx.pool, &self.ctx.config.queue_dir).await;
        Ok(spawned)
    }

    /// Dispatch one item now, outside the ticker.
    ///
    /// `needs_input` and `failed` items are put back in the queue first
    /// (`planned` if their plan already passed, else `triaged`). Blocked
    /// items are accepted only once their subtree is clear.
    pub async fn dispatch_now(self: &Arc<Self>, id: i64) -> HarnessResult<DispatchAccepted> {
        let pool = &self.ctx.pool;
        let item = get_work_item(pool, id)
            .await?
            .ok_or_else(|| HarnessError::not_found(format!("work item {id} not found")))?;

        if item.claimed_at.is_some() {
            return Err(HarnessError::Conflict(format!(
                "work item {id} is already being dispatched"
            )));
        }
        match item.status {
            WorkItemStatus::Completed => {
                return Err(HarnessError::Conflict(format!(
                    "work item {id} is already completed"
                )));
            }
            WorkItemStatus::Executing | WorkItemStatus::Verifying => {
                return Err(HarnessError::Conflict(format!(
                    "work item {id} is already in flight"
                )));
            }
            WorkItemStatus::Blocked => {
                if has_open_blocking_findings(pool, id).await? {
                    return Err(HarnessError::Conflict(format!(
                        "work item {id} is blocked by open findings"
                    )));
                }
            }
            _ => {}
        }

        let permit = Arc::clone(&self.permits).try_acquire_owned().map_err(|_| {
            HarnessError::Conflict(format!(
                "parallelism cap of {} runs reached",
                self.max_parallel
            ))
        })?;

        if matches!(
            item.status,
            WorkItemStatus::Blocked | WorkItemStatus::NeedsInput | WorkItemStatus::Failed
        ) {
            let to = if has_passed_run(pool, id, Stage::Plan).await? {
                WorkItemStatus::Planned
            } else {
                WorkItemStatus::Triaged
            };
            WorkItemStateMachine::transition(pool, id, item.status, to, Some("force dispatch"))
                .await?;
        }

        let claimed = claim_work_item(pool, id).await?.ok_or_else(|| {
            HarnessError::Conflict(format!("work item {id} could not be claimed"))
        })?;
        let accepted = DispatchAccepted {
            work_item_id: id,
            previous_status: claimed.previous_status,
            stage: match claimed.previous_status {
                WorkItemStatus::Planned => Stage::Execute,
                _ => Stage::Plan,
            },
        };
        insert_event(
            pool,
            "dispatch_forced",
            "work_item",
            Some(id.to_string()),
            json!({ "previous_status": claimed.previous_status }),
        )
        .await?;
        self.spawn_worker(claimed, permit);
        Ok(accepted)
    }

    fn spawn_worker(&self, claimed: ClaimedWorkItem, permit: OwnedSemaphorePermit) {
        let ctx = Arc::clone(&self.ctx);
        let id = claimed.item.id;
        debug!(work_item_id = id, previous_status = %claimed.previous_status, "spawning worker");
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = worker::process_claimed(&ctx, &claimed).await {
                worker::handle_worker_error(&ctx, id, &e).await;
            }
        });
    }

    /// Wait until no worker holds a permit.
    pub async fn wait_idle(&self) {
        if let Ok(all) = self.permits.acquire_many(self.max_parallel as u32).await {
            drop(all);
        }
    }
}
