#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("sandbox creation failed: {0}")]
    CreationFailed(String),

    #[error("sandbox start failed: {0}")]
    StartFailed(String),

    #[error("staging failed: {0}")]
    StageFailed(String),

    #[error("execution failed: {0}")]
    ExecFailed(String),

    #[error("execution timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("sandbox removal failed: {0}")]
    RemovalFailed(String),

    #[error("invalid sandbox state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
