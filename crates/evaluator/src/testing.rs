//! Fakes shared by the unit tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sandbox::{ExecOutput, ExecRequest, SandboxError, SandboxRuntime, SandboxSpec};

use crate::handle::CompletionObserver;
use crate::types::Outcome;

#[derive(Default)]
struct FakeState {
    next: u64,
    live: HashSet<String>,
    started: HashSet<String>,
    created: usize,
    remove_attempts: usize,
    archives: Vec<(String, String, Vec<u8>)>,
    commands: Vec<(String, String)>,
    output: String,
    exec_delay: Option<Duration>,
    fail_create: bool,
    fail_push: bool,
    fail_exec: bool,
    fail_remove: bool,
}

/// In-memory [`SandboxRuntime`] that records every call.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn with_output(output: &str) -> Self {
        let runtime = Self::default();
        runtime.state.lock().unwrap().output = output.into();
        runtime
    }

    pub fn set_exec_delay(&self, delay: Duration) {
        self.state.lock().unwrap().exec_delay = Some(delay);
    }

    pub fn fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    pub fn fail_push(&self, fail: bool) {
        self.state.lock().unwrap().fail_push = fail;
    }

    pub fn fail_exec(&self, fail: bool) {
        self.state.lock().unwrap().fail_exec = fail;
    }

    pub fn fail_remove(&self, fail: bool) {
        self.state.lock().unwrap().fail_remove = fail;
    }

    /// Sandboxes created and not yet removed.
    pub fn live_count(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub fn created_count(&self) -> usize {
        self.state.lock().unwrap().created
    }

    pub fn remove_attempts(&self) -> usize {
        self.state.lock().unwrap().remove_attempts
    }

    pub fn is_started(&self, name: &str) -> bool {
        self.state.lock().unwrap().started.contains(name)
    }

    pub fn commands(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn archives(&self) -> Vec<(String, String, Vec<u8>)> {
        self.state.lock().unwrap().archives.clone()
    }
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn prepare(&self, _spec: &SandboxSpec) -> sandbox::Result<()> {
        Ok(())
    }

    async fn create(&self, _spec: &SandboxSpec) -> sandbox::Result<String> {
        let mut state = self.state.lock().unwrap();
        if state.fail_create {
            return Err(SandboxError::CreationFailed("intentional failure".into()));
        }
        state.next += 1;
        state.created += 1;
        let name = format!("fake-{}", state.next);
        state.live.insert(name.clone());
        Ok(name)
    }

    async fn start(&self, name: &str) -> sandbox::Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.live.contains(name) {
            return Err(SandboxError::StartFailed(format!("no such sandbox {name}")));
        }
        state.started.insert(name.into());
        Ok(())
    }

    async fn push_archive(&self, name: &str, path: &str, archive: Vec<u8>) -> sandbox::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_push {
            return Err(SandboxError::StageFailed("intentional failure".into()));
        }
        state.archives.push((name.into(), path.into(), archive));
        Ok(())
    }

    async fn exec(&self, name: &str, request: &ExecRequest<'_>) -> sandbox::Result<ExecOutput> {
        let (delay, output) = {
            let mut state = self.state.lock().unwrap();
            if state.fail_exec {
                return Err(SandboxError::ExecFailed("intentional failure".into()));
            }
            state.commands.push((name.into(), request.cmd.into()));
            (state.exec_delay, state.output.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(ExecOutput {
            output: output.into_bytes(),
        })
    }

    async fn stop(&self, _name: &str) -> sandbox::Result<()> {
        Ok(())
    }

    async fn remove(&self, name: &str) -> sandbox::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.remove_attempts += 1;
        if state.fail_remove {
            return Err(SandboxError::RemovalFailed("intentional failure".into()));
        }
        state.live.remove(name);
        state.started.remove(name);
        Ok(())
    }
}

pub type ObserverLog = Arc<Mutex<Vec<(&'static str, i64, bool)>>>;

/// Observer that appends `(tag, request_id, is_correct)` to a shared log.
pub struct RecordingObserver {
    tag: &'static str,
    log: ObserverLog,
}

impl RecordingObserver {
    pub fn new(tag: &'static str, log: &ObserverLog) -> Self {
        Self {
            tag,
            log: Arc::clone(log),
        }
    }
}

#[async_trait]
impl CompletionObserver for RecordingObserver {
    async fn on_completion(&self, outcome: Outcome) {
        self.log
            .lock()
            .unwrap()
            .push((self.tag, outcome.request_id, outcome.is_correct));
    }
}
