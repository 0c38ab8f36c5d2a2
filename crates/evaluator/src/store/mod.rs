use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::TaskData;

#[cfg(test)]
mod memory;
mod postgres;

#[cfg(test)]
pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt data: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable storage of task definitions and evaluation results.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Script and graph for a task, or `None` if any part is missing.
    async fn fetch_task(&self, task_id: i64) -> StoreResult<Option<TaskData>>;

    /// Record the verdict for a request. Writing the same request twice
    /// overwrites the earlier verdict.
    async fn record_outcome(
        &self,
        request_id: i64,
        is_correct: bool,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;
}
