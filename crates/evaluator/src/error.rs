use crate::broker::BrokerError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EvaluatorError {
    #[error("config error: {0}")]
    Config(String),

    #[error("startup failed: {0}")]
    Startup(String),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

pub type EvaluatorResult<T> = Result<T, EvaluatorError>;

/// Why a single evaluation request produced no outcome.
///
/// All variants are handled by logging; none of them stops the service.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no ready sandbox available")]
    AllocationExhausted,

    #[error("no task data for task {0}")]
    TaskDataNotFound(i64),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("encode payload: {0}")]
    Encode(String),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] sandbox::SandboxError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("sandbox {0} is not occupied")]
    InvalidState(crate::handle::HandleId),
}

pub type PoolResult<T> = Result<T, PoolError>;
