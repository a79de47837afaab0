//! Admission and execution of deploy runs.
//!
//! [`Deployer::try_start`] either takes the [`DeployLock`] and detaches a run
//! task, or reports that a run is already in flight. The run task enforces
//! the timeout, archives the [`DeployRun`] to the journal and only then drops
//! the guard, so journal order matches run order. A panicking action is
//! archived as crashed like any other outcome.

use crate::action::{DeployAction, OutputBuffer, RunContext};
use crate::journal::RunJournal;
use crate::lock::{DeployGuard, DeployLock};
use crate::types::{DeployRun, RunOutcome, Trigger};
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Returned when the lock is already held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deploy already in progress")]
pub struct Busy;

#[derive(Clone)]
pub struct Deployer {
    action: Arc<dyn DeployAction>,
    lock: Arc<DeployLock>,
    journal: Arc<RunJournal>,
    timeout: Duration,
    output_limit: usize,
}

impl Deployer {
    pub fn new(
        action: Arc<dyn DeployAction>,
        journal: Arc<RunJournal>,
        timeout: Duration,
        output_limit: usize,
    ) -> Self {
        Self {
            action,
            lock: DeployLock::new(),
            journal,
            timeout,
            output_limit,
        }
    }

    /// Admit a run if none is active. Returns immediately; the run continues
    /// on its own task.
    pub fn try_start(&self, trigger: Trigger) -> Result<Uuid, Busy> {
        let guard = self.lock.try_acquire().ok_or(Busy)?;
        let run_id = Uuid::new_v4();
        let this = self.clone();
        tokio::spawn(async move {
            this.execute(run_id, trigger, guard).await;
        });
        Ok(run_id)
    }

    pub fn is_running(&self) -> bool {
        self.lock.is_running()
    }

    pub async fn wait_idle(&self) {
        self.lock.wait_idle().await
    }

    pub fn journal(&self) -> &RunJournal {
        &self.journal
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn execute(self, run_id: Uuid, trigger: Trigger, guard: DeployGuard) {
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(%run_id, delivery = trigger.delivery.as_deref().unwrap_or("-"), "deploy started");

        let ctx = RunContext { run_id, trigger };
        let output = OutputBuffer::new(self.output_limit);
        let attempt = AssertUnwindSafe(self.action.run(&ctx, &output)).catch_unwind();
        let outcome = match tokio::time::timeout(self.timeout, attempt).await {
            Ok(Ok(Ok(Some(0)))) => RunOutcome::Success,
            Ok(Ok(Ok(code))) => RunOutcome::Failed { exit_code: code },
            Ok(Ok(Err(e))) => RunOutcome::SpawnFailed {
                reason: e.to_string(),
            },
            Ok(Err(payload)) => RunOutcome::Crashed {
                reason: panic_message(&*payload),
            },
            Err(_) => RunOutcome::TimedOut {
                after_ms: millis(self.timeout),
            },
        };

        let elapsed = clock.elapsed();
        let (text, dropped) = output.snapshot();
        let run = DeployRun {
            id: run_id,
            trigger: ctx.trigger,
            started_at,
            finished_at: Utc::now(),
            duration_ms: millis(elapsed),
            outcome,
            output: text,
            output_dropped_bytes: dropped,
        };

        match &run.outcome {
            RunOutcome::Success => info!(%run_id, duration_ms = run.duration_ms, "deploy succeeded"),
            RunOutcome::Failed { exit_code } => warn!(
                %run_id,
                exit_code = exit_code.map(i64::from).unwrap_or(-1),
                duration_ms = run.duration_ms,
                "deploy failed"
            ),
            RunOutcome::TimedOut { after_ms } => warn!(%run_id, after_ms, "deploy timed out and was killed"),
            RunOutcome::SpawnFailed { reason } => error!(%run_id, %reason, "deploy action could not be started"),
            RunOutcome::Crashed { reason } => error!(%run_id, %reason, "deploy action panicked"),
        }

        if let Err(e) = self.journal.record(&run).await {
            error!(%run_id, error = %e, "failed to archive deploy run");
        }
        drop(guard);
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
