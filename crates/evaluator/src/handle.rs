use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sandbox::{ExecRequest, SandboxError, SandboxRuntime};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::types::{Outcome, StagedFile};

/// Pool-assigned key of a handle in the pool's arena.
pub type HandleId = u64;

/// Literal a script prints as its last line to accept an answer.
const ACCEPTED: &str = "True";

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Ready = 0,
    Occupied = 1,
    Removed = 2,
}

impl HandleState {
    fn from_u8(v: u8) -> Self {
        debug_assert!(v <= 2, "invalid HandleState: {v}");
        match v {
            0 => Self::Ready,
            1 => Self::Occupied,
            _ => Self::Removed,
        }
    }
}

impl std::fmt::Display for HandleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => f.write_str("ready"),
            Self::Occupied => f.write_str("occupied"),
            Self::Removed => f.write_str("removed"),
        }
    }
}

/// Receives the outcome of the one command a handle runs.
#[async_trait]
pub trait CompletionObserver: Send + Sync {
    async fn on_completion(&self, outcome: Outcome);
}

/// One single-use sandbox.
///
/// A handle runs at most one command in its lifetime. Observers registered
/// before that command are taken out of the handle when it finishes and
/// awaited one after another in registration order, so each fires at most
/// once.
pub struct SandboxHandle {
    id: HandleId,
    /// Runtime-assigned sandbox name.
    name: String,
    runtime: Arc<dyn SandboxRuntime>,
    upload_dir: String,
    exec_timeout: Duration,
    state: AtomicU8,
    started: AtomicBool,
    executed: AtomicBool,
    observers: Mutex<Vec<Arc<dyn CompletionObserver>>>,
}

impl SandboxHandle {
    pub(crate) fn new(
        id: HandleId,
        name: String,
        runtime: Arc<dyn SandboxRuntime>,
        upload_dir: String,
        exec_timeout: Duration,
    ) -> Self {
        Self {
            id,
            name,
            runtime,
            upload_dir,
            exec_timeout,
            state: AtomicU8::new(HandleState::Ready as u8),
            started: AtomicBool::new(false),
            executed: AtomicBool::new(false),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> HandleState {
        HandleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomically move between states. Returns `false` if the handle was not
    /// in `from`.
    pub(crate) fn transition(&self, from: HandleState, to: HandleState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub async fn add_completion_observer(&self, observer: Arc<dyn CompletionObserver>) {
        self.observers.lock().await.push(observer);
    }

    /// Pack `files` into a tar archive and extract it into the upload
    /// directory, starting the sandbox first if needed.
    pub async fn stage(&self, files: &[StagedFile]) -> sandbox::Result<()> {
        self.expect_state(HandleState::Occupied)?;
        debug!(sandbox = %self.name, count = files.len(), "creating archive");
        let archive = build_archive(files)?;
        self.ensure_started().await?;
        info!(sandbox = %self.name, dir = %self.upload_dir, "uploading staged files");
        self.runtime
            .push_archive(&self.name, &self.upload_dir, archive)
            .await
    }

    /// Run `command`, derive the outcome from its output and notify every
    /// observer before returning it.
    ///
    /// Fails without notifying anyone if the command cannot be run or does
    /// not finish within the execution timeout.
    pub async fn execute(&self, command: &str, request_id: i64) -> sandbox::Result<Outcome> {
        self.expect_state(HandleState::Occupied)?;
        if self.executed.swap(true, Ordering::AcqRel) {
            return Err(SandboxError::InvalidState(format!(
                "sandbox {} already ran a command",
                self.name
            )));
        }

        info!(sandbox = %self.name, request_id, command, "running command");
        self.ensure_started().await?;

        let request = ExecRequest {
            cmd: command,
            workdir: &self.upload_dir,
        };
        let output = tokio::time::timeout(self.exec_timeout, self.runtime.exec(&self.name, &request))
            .await
            .map_err(|_| SandboxError::Timeout(self.exec_timeout))??;

        let text = output.to_string_lossy();
        let is_correct = match last_line(&text) {
            Some(line) => line == ACCEPTED,
            None => {
                error!(sandbox = %self.name, request_id, "no output received from command");
                false
            }
        };

        let outcome = Outcome {
            request_id,
            is_correct,
        };
        self.notify(outcome).await;
        Ok(outcome)
    }

    /// Stop and delete the backing sandbox. Failures are logged, never
    /// returned.
    pub async fn remove(&self) {
        let previous = HandleState::from_u8(
            self.state
                .swap(HandleState::Removed as u8, Ordering::AcqRel),
        );
        if previous == HandleState::Removed {
            return;
        }

        info!(sandbox = %self.name, "removing sandbox");
        if let Err(e) = self.runtime.stop(&self.name).await {
            warn!(sandbox = %self.name, error = %e, "sandbox stop failed");
        }
        if let Err(e) = self.runtime.remove(&self.name).await {
            warn!(sandbox = %self.name, error = %e, "sandbox removal failed");
        }
    }

    fn expect_state(&self, expected: HandleState) -> sandbox::Result<()> {
        let current = self.state();
        if current == expected {
            Ok(())
        } else {
            Err(SandboxError::InvalidState(format!(
                "sandbox {} is {current}, expected {expected}",
                self.name
            )))
        }
    }

    async fn ensure_started(&self) -> sandbox::Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        self.runtime.start(&self.name).await?;
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    async fn notify(&self, outcome: Outcome) {
        let observers = std::mem::take(&mut *self.observers.lock().await);
        for observer in observers {
            observer.on_completion(outcome).await;
        }
    }
}

/// Last line of `output` that is not blank, without trailing whitespace.
fn last_line(output: &str) -> Option<&str> {
    output
        .lines()
        .rev()
        .map(str::trim_end)
        .find(|line| !line.is_empty())
}

fn build_archive(files: &[StagedFile]) -> sandbox::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for file in files {
        let data = file.content.as_bytes();
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, &file.path, data)
            .map_err(|e| SandboxError::StageFailed(format!("archive {}: {e}", file.path)))?;
    }
    builder
        .into_inner()
        .map_err(|e| SandboxError::StageFailed(format!("finish archive: {e}")))
}
