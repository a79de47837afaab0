use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Key used to authenticate webhook deliveries.
///
/// Loaded once at startup and handed to the verifier. Neither `Debug` nor
/// `Display` reveal the value, and the type is deliberately not `Serialize`.
#[derive(Clone)]
pub struct SharedSecret(Vec<u8>);

impl SharedSecret {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

/// What we know about the delivery that caused a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub received_at: DateTime<Utc>,
    /// `X-GitHub-Delivery` (or compatible) header, if the sender set one.
    pub delivery: Option<String>,
    pub event: Option<String>,
    pub git_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    /// Exited nonzero. `exit_code` is `None` when the process died from a signal.
    Failed { exit_code: Option<i32> },
    TimedOut { after_ms: u64 },
    SpawnFailed { reason: String },
    /// The action panicked before reporting an exit status.
    Crashed { reason: String },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success)
    }

    /// Short label used in log fields and the health summary.
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Failed { .. } => "failed",
            RunOutcome::TimedOut { .. } => "timed_out",
            RunOutcome::SpawnFailed { .. } => "spawn_failed",
            RunOutcome::Crashed { .. } => "crashed",
        }
    }
}

/// One archived execution of the deploy action. Written to the journal as a
/// single JSON line once the run has finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployRun {
    pub id: Uuid,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: RunOutcome,
    pub output: String,
    /// Bytes discarded from the front of the output to respect the capture limit.
    #[serde(default)]
    pub output_dropped_bytes: u64,
}

/// Output-free view of a run, safe to expose on the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub outcome: RunOutcome,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl From<&DeployRun> for RunSummary {
    fn from(run: &DeployRun) -> Self {
        Self {
            id: run.id,
            outcome: run.outcome.clone(),
            finished_at: run.finished_at,
            duration_ms: run.duration_ms,
        }
    }
}
