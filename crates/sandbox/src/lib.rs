mod config;
mod error;
mod runtime;
mod types;

pub use config::SandboxSpec;
pub use error::{Result, SandboxError};
pub use runtime::SandboxRuntime;
pub use types::{ExecOutput, ExecRequest};
