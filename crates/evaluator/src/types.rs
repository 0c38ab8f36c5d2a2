use serde::{Deserialize, Serialize};

use crate::graph::Graph;

/// Inbound evaluation request, as published on the request channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationRequest {
    pub request_id: i64,
    pub task_id: i64,
    pub input_answer: String,
}

/// The verdict for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub request_id: i64,
    pub is_correct: bool,
}

/// Result notification published to the optional result channel.
#[derive(Debug, Serialize)]
pub struct ResultMessage {
    pub request: i64,
    pub is_correct: bool,
}

impl From<Outcome> for ResultMessage {
    fn from(outcome: Outcome) -> Self {
        Self {
            request: outcome.request_id,
            is_correct: outcome.is_correct,
        }
    }
}

/// A file pushed into a sandbox before execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub path: String,
    pub content: String,
}

impl StagedFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Everything the store knows about a task that an evaluation needs.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskData {
    pub script: String,
    pub graph: Graph,
}
