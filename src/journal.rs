use crate::types::DeployRun;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;

const MAX_RECENT_RUNS: usize = 50;

/// Where archived runs are appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogDestination {
    Stdout,
    Stderr,
    File(PathBuf),
}

impl FromStr for LogDestination {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "" | "-" | "stdout" => LogDestination::Stdout,
            "stderr" => LogDestination::Stderr,
            path => LogDestination::File(PathBuf::from(path)),
        })
    }
}

/// Append-only record of finished deploy runs, one JSON object per line,
/// plus a bounded in-memory window of the newest runs.
#[derive(Debug)]
pub struct RunJournal {
    destination: LogDestination,
    recent: Mutex<VecDeque<DeployRun>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl RunJournal {
    /// Open the journal. For a file destination the newest existing records
    /// seed the recent window; unreadable lines are skipped.
    pub async fn open(destination: LogDestination) -> std::io::Result<Self> {
        let mut recent = VecDeque::new();
        if let LogDestination::File(path) = &destination {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            recent = load_tail(path).await?;
        }
        Ok(Self {
            destination,
            recent: Mutex::new(recent),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn destination(&self) -> &LogDestination {
        &self.destination
    }

    /// Archive a finished run. The in-memory window is updated even when the
    /// durable write fails so the health view stays accurate.
    pub async fn record(&self, run: &DeployRun) -> std::io::Result<()> {
        self.remember(run.clone());

        let mut line = serde_json::to_vec(run)?;
        line.push(b'\n');

        let _serialized = self.write_lock.lock().await;
        match &self.destination {
            LogDestination::Stdout => {
                let mut out = tokio::io::stdout();
                out.write_all(&line).await?;
                out.flush().await
            }
            LogDestination::Stderr => {
                let mut out = tokio::io::stderr();
                out.write_all(&line).await?;
                out.flush().await
            }
            LogDestination::File(path) => {
                // Reopened per record so external log rotation is picked up.
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?;
                file.write_all(&line).await?;
                file.sync_data().await
            }
        }
    }

    /// Newest first.
    pub fn recent(&self) -> Vec<DeployRun> {
        self.lock_recent().iter().rev().cloned().collect()
    }

    pub fn last(&self) -> Option<DeployRun> {
        self.lock_recent().back().cloned()
    }

    fn remember(&self, run: DeployRun) {
        let mut recent = self.lock_recent();
        if recent.len() >= MAX_RECENT_RUNS {
            recent.pop_front();
        }
        recent.push_back(run);
    }

    fn lock_recent(&self) -> std::sync::MutexGuard<'_, VecDeque<DeployRun>> {
        match self.recent.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

async fn load_tail(path: &Path) -> std::io::Result<VecDeque<DeployRun>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(VecDeque::new()),
        Err(e) => return Err(e),
    };
    let mut runs: VecDeque<DeployRun> = VecDeque::new();
    for line in content.lines() {
        if let Ok(run) = serde_json::from_str::<DeployRun>(line) {
            if runs.len() >= MAX_RECENT_RUNS {
                runs.pop_front();
            }
            runs.push_back(run);
        }
    }
    Ok(runs)
}
