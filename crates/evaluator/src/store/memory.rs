use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{StoreError, StoreResult, TaskStore};
use crate::types::TaskData;

/// In-memory [`TaskStore`] for tests.
#[derive(Default)]
pub struct MemoryStore {
    tasks: Mutex<HashMap<i64, TaskData>>,
    outcomes: Mutex<Vec<(i64, bool, DateTime<Utc>)>>,
    fail_reads: AtomicBool,
}

impl MemoryStore {
    pub fn with_task(self, task_id: i64, data: TaskData) -> Self {
        self.tasks.lock().unwrap().insert(task_id, data);
        self
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Release);
    }

    /// Recorded `(request_id, is_correct)` pairs in write order.
    pub fn outcomes(&self) -> Vec<(i64, bool)> {
        self.outcomes
            .lock()
            .unwrap()
            .iter()
            .map(|(id, correct, _)| (*id, *correct))
            .collect()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn fetch_task(&self, task_id: i64) -> StoreResult<Option<TaskData>> {
        if self.fail_reads.load(Ordering::Acquire) {
            return Err(StoreError::Database(sqlx::Error::PoolClosed));
        }
        Ok(self.tasks.lock().unwrap().get(&task_id).cloned())
    }

    async fn record_outcome(
        &self,
        request_id: i64,
        is_correct: bool,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.outcomes
            .lock()
            .unwrap()
            .push((request_id, is_correct, at));
        Ok(())
    }
}
