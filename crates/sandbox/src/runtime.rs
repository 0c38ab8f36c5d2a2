use async_trait::async_trait;

use crate::config::SandboxSpec;
use crate::error::Result;
use crate::types::{ExecOutput, ExecRequest};

/// A backend that can create, feed, run and tear down isolated sandboxes.
///
/// Sandboxes are addressed by the opaque name returned from [`create`].
/// Implementations must be safe to share across tasks; the caller
/// guarantees that at most one command runs per sandbox at a time.
///
/// [`create`]: SandboxRuntime::create
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Human-readable name for this runtime (e.g. "docker").
    fn name(&self) -> &str;
    /// Make the backend ready to create sandboxes from `spec`
    /// (image pulls, connectivity checks). Called once at startup.
    async fn prepare(&self, spec: &SandboxSpec) -> Result<()>;
    /// Create a new, not yet started sandbox and return its name.
    async fn create(&self, spec: &SandboxSpec) -> Result<String>;
    /// Start the sandbox. Starting a running sandbox is not an error.
    async fn start(&self, name: &str) -> Result<()>;
    /// Extract a tar archive into `path` inside the sandbox.
    async fn push_archive(&self, name: &str, path: &str, archive: Vec<u8>) -> Result<()>;
    /// Run a command to completion and capture its combined output.
    async fn exec(&self, name: &str, request: &ExecRequest<'_>) -> Result<ExecOutput>;
    async fn stop(&self, name: &str) -> Result<()>;
    /// Delete the sandbox and everything in it.
    async fn remove(&self, name: &str) -> Result<()>;
}
