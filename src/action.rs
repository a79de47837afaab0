use crate::error::ActionError;
use crate::types::Trigger;
use async_trait::async_trait;
#[cfg(unix)]
use nix::{
    errno::Errno,
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinSet;
use uuid::Uuid;

/// How long to keep draining pipes after the process exits. A backgrounded
/// grandchild can hold them open indefinitely.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Per-run information handed to the action.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub trigger: Trigger,
}

impl RunContext {
    /// Environment variables exported to a subprocess action.
    pub fn env(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![("DEPLOY_HOOK_RUN_ID", self.run_id.to_string())];
        if let Some(d) = &self.trigger.delivery {
            vars.push(("DEPLOY_HOOK_DELIVERY", d.clone()));
        }
        if let Some(e) = &self.trigger.event {
            vars.push(("DEPLOY_HOOK_EVENT", e.clone()));
        }
        if let Some(r) = &self.trigger.git_ref {
            vars.push(("DEPLOY_HOOK_REF", r.clone()));
        }
        vars
    }
}

/// The external deploy step.
///
/// `run` returns the exit code (`Some(0)` is success, `None` means killed by
/// a signal). Output goes to `output` as it is produced so that a caller that
/// abandons the future on timeout still sees what was printed.
#[async_trait]
pub trait DeployAction: Send + Sync {
    async fn run(&self, ctx: &RunContext, output: &OutputBuffer) -> Result<Option<i32>, ActionError>;
}

/// Combined stdout/stderr capture, keeping only the newest `limit` bytes.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Captured>>,
    limit: usize,
}

#[derive(Debug, Default)]
struct Captured {
    bytes: VecDeque<u8>,
    dropped: u64,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Captured::default())),
            limit,
        }
    }

    pub fn push(&self, chunk: &[u8]) {
        let mut cap = match self.inner.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        cap.bytes.extend(chunk);
        let excess = cap.bytes.len().saturating_sub(self.limit);
        if excess > 0 {
            cap.bytes.drain(..excess);
            cap.dropped += excess as u64;
        }
    }

    /// Captured text (lossy UTF-8) and the number of bytes dropped from the front.
    pub fn snapshot(&self) -> (String, u64) {
        let cap = match self.inner.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        let (a, b) = cap.bytes.as_slices();
        let mut raw = Vec::with_capacity(a.len() + b.len());
        raw.extend_from_slice(a);
        raw.extend_from_slice(b);
        (String::from_utf8_lossy(&raw).into_owned(), cap.dropped)
    }
}

/// Runs an executable as a child process.
#[derive(Debug, Clone)]
pub struct CommandAction {
    program: PathBuf,
    args: Vec<String>,
    workdir: PathBuf,
}

impl CommandAction {
    pub fn new(program: impl Into<PathBuf>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: workdir.into(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

#[async_trait]
impl DeployAction for CommandAction {
    async fn run(&self, ctx: &RunContext, output: &OutputBuffer) -> Result<Option<i32>, ActionError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.workdir)
            .envs(ctx.env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so cancellation reaches everything the script started.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| ActionError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;
        #[cfg(unix)]
        let mut group = ProcessGroup::led_by(child.id());

        // Readers live in a JoinSet so they are aborted if we are cancelled.
        let mut readers = JoinSet::new();
        if let Some(stdout) = child.stdout.take() {
            readers.spawn(drain(stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.spawn(drain(stderr, output.clone()));
        }

        let status = child.wait().await.map_err(ActionError::Wait)?;

        let drained = tokio::time::timeout(PIPE_DRAIN_GRACE, async {
            while readers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(run_id = %ctx.run_id, "output pipes still open after exit, abandoning capture");
        }

        #[cfg(unix)]
        group.release();
        Ok(status.code())
    }
}

/// SIGKILLs the action's process group when dropped, unless released after
/// a normal exit. Dropping happens when the run future is abandoned on
/// timeout.
#[cfg(unix)]
struct ProcessGroup {
    leader: Option<Pid>,
}

#[cfg(unix)]
impl ProcessGroup {
    fn led_by(pid: Option<u32>) -> Self {
        Self {
            leader: pid.and_then(|p| i32::try_from(p).ok()).map(Pid::from_raw),
        }
    }

    fn release(&mut self) {
        self.leader = None;
    }
}

#[cfg(unix)]
impl Drop for ProcessGroup {
    fn drop(&mut self) {
        let Some(leader) = self.leader.take() else {
            return;
        };
        match killpg(leader, Signal::SIGKILL) {
            Ok(()) => tracing::debug!(pgid = leader.as_raw(), "killed deploy process group"),
            // Group already gone.
            Err(Errno::ESRCH) => {}
            Err(e) => tracing::warn!(pgid = leader.as_raw(), error = %e, "failed to kill deploy process group"),
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(mut pipe: R, output: OutputBuffer) {
    let mut buf = [0u8; 4096];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => output.push(&buf[..n]),
        }
    }
}
