use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::broker::{Broker, TASK_REQUEST};
use crate::codec::{EVAL_SCRIPT, build_command, encode_arg, encode_graph};
use crate::error::{DispatchError, DispatchResult};
use crate::handle::{CompletionObserver, SandboxHandle};
use crate::pool::SandboxPool;
use crate::store::TaskStore;
use crate::types::{EvaluationRequest, Outcome, ResultMessage, StagedFile};

/// Something that turns request bodies from one channel into outcomes.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Channel this evaluator receives requests on.
    fn channel(&self) -> &str;
    async fn on_request_received(&self, body: &[u8]) -> DispatchResult<Outcome>;
}

/// Publishes outcomes to a result channel.
pub struct ResultPublisher {
    broker: Arc<dyn Broker>,
    channel: String,
}

impl ResultPublisher {
    pub fn new(broker: Arc<dyn Broker>, channel: String) -> Self {
        Self { broker, channel }
    }

    async fn publish(&self, outcome: Outcome) {
        let payload = match serde_json::to_vec(&ResultMessage::from(outcome)) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to serialize result message");
                return;
            }
        };
        if let Err(e) = self.broker.publish(&self.channel, &payload).await {
            warn!(
                request_id = outcome.request_id,
                channel = %self.channel,
                error = %e,
                "failed to publish result"
            );
        }
    }
}

/// The dispatcher's completion path: persist, then optionally publish.
struct OutcomeRecorder {
    store: Arc<dyn TaskStore>,
    results: Option<ResultPublisher>,
}

#[async_trait]
impl CompletionObserver for OutcomeRecorder {
    async fn on_completion(&self, outcome: Outcome) {
        info!(
            request_id = outcome.request_id,
            is_correct = outcome.is_correct,
            "result received"
        );
        if let Err(e) = self
            .store
            .record_outcome(outcome.request_id, outcome.is_correct, Utc::now())
            .await
        {
            error!(request_id = outcome.request_id, error = %e, "failed to persist result");
        }
        if let Some(results) = &self.results {
            results.publish(outcome).await;
        }
    }
}

/// Standard evaluator: runs a task's script against a submitted answer in
/// a pooled sandbox and records the verdict.
pub struct Dispatcher {
    pool: SandboxPool,
    store: Arc<dyn TaskStore>,
    recorder: Arc<OutcomeRecorder>,
    interpreter: String,
}

impl Dispatcher {
    pub fn new(
        pool: SandboxPool,
        store: Arc<dyn TaskStore>,
        results: Option<ResultPublisher>,
        interpreter: String,
    ) -> Self {
        let recorder = Arc::new(OutcomeRecorder {
            store: Arc::clone(&store),
            results,
        });
        Self {
            pool,
            store,
            recorder,
            interpreter,
        }
    }

    /// Evaluate one request.
    ///
    /// If no sandbox is ready or the task is unknown the request is dropped:
    /// nothing is recorded and it is not retried. On any failure after
    /// allocation the sandbox is released so its slot is not lost.
    pub async fn run(&self, request: EvaluationRequest) -> DispatchResult<Outcome> {
        let Some(handle) = self.pool.allocate().await else {
            return Err(DispatchError::AllocationExhausted);
        };

        match self.run_in_sandbox(&handle, &request).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if let Err(release_err) = self.pool.release(handle.id()).await {
                    warn!(
                        request_id = request.request_id,
                        sandbox = %handle.name(),
                        error = %release_err,
                        "failed to release sandbox after error"
                    );
                }
                Err(e)
            }
        }
    }

    async fn run_in_sandbox(
        &self,
        handle: &SandboxHandle,
        request: &EvaluationRequest,
    ) -> DispatchResult<Outcome> {
        let task = self
            .store
            .fetch_task(request.task_id)
            .await?
            .ok_or(DispatchError::TaskDataNotFound(request.task_id))?;

        let graph = encode_graph(&task.graph)?;
        let answer = encode_arg(&request.input_answer);
        let command = build_command(&self.interpreter, &answer, &graph);

        handle
            .stage(&[StagedFile::new(EVAL_SCRIPT, task.script)])
            .await?;

        let recorder: Arc<dyn CompletionObserver> = self.recorder.clone();
        handle.add_completion_observer(recorder).await;
        Ok(handle.execute(&command, request.request_id).await?)
    }
}

#[async_trait]
impl Evaluator for Dispatcher {
    fn channel(&self) -> &str {
        TASK_REQUEST
    }

    async fn on_request_received(&self, body: &[u8]) -> DispatchResult<Outcome> {
        let request: EvaluationRequest = serde_json::from_slice(body)
            .map_err(|e| DispatchError::InvalidRequest(e.to_string()))?;
        info!(
            request_id = request.request_id,
            task_id = request.task_id,
            "request received"
        );
        self.run(request).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sandbox::{SandboxError, SandboxRuntime, SandboxSpec};
    use tracing_test::traced_test;

    use super::*;
    use crate::broker::MemoryBroker;
    use crate::graph::Graph;
    use crate::pool::{PoolOptions, PoolStats};
    use crate::store::MemoryStore;
    use crate::testing::FakeRuntime;
    use crate::types::TaskData;

    fn graph() -> Graph {
        Graph {
            id: 1,
            edges: vec![],
            vertices: vec![],
            label: "label".into(),
        }
    }

    fn request(request_id: i64, task_id: i64) -> EvaluationRequest {
        EvaluationRequest {
            request_id,
            task_id,
            input_answer: "x".into(),
        }
    }

    struct Fixture {
        runtime: Arc<FakeRuntime>,
        store: Arc<MemoryStore>,
        pool: SandboxPool,
        dispatcher: Dispatcher,
    }

    async fn fixture(output: &str, max_active: usize, ready_target: usize) -> Fixture {
        fixture_with(output, max_active, ready_target, None, Duration::from_secs(5)).await
    }

    async fn fixture_with(
        output: &str,
        max_active: usize,
        ready_target: usize,
        results: Option<ResultPublisher>,
        exec_timeout: Duration,
    ) -> Fixture {
        let runtime = Arc::new(FakeRuntime::with_output(output));
        let store = Arc::new(MemoryStore::default().with_task(
            1,
            TaskData {
                script: "print(True)".into(),
                graph: graph(),
            },
        ));
        let pool = SandboxPool::start(
            Arc::clone(&runtime) as Arc<dyn SandboxRuntime>,
            PoolOptions {
                max_active,
                ready_target,
                spec: SandboxSpec::new("sagemath/sagemath"),
                upload_dir: "/home/sage/sage".into(),
                exec_timeout,
            },
        )
        .await;
        let dispatcher = Dispatcher::new(
            pool.clone(),
            Arc::clone(&store) as Arc<dyn TaskStore>,
            results,
            "sage".into(),
        );
        Fixture {
            runtime,
            store,
            pool,
            dispatcher,
        }
    }

    #[tokio::test]
    async fn end_to_end_correct_answer() {
        let f = fixture("True", 4, 1).await;

        let outcome = f
            .dispatcher
            .on_request_received(br#"{"requestId": 1, "taskId": 1, "inputAnswer": "x"}"#)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            Outcome {
                request_id: 1,
                is_correct: true
            }
        );
        assert_eq!(f.store.outcomes(), vec![(1, true)]);
        assert_eq!(
            f.pool.stats().await,
            PoolStats {
                ready: 1,
                occupied: 0
            }
        );
        // The used sandbox is gone; only the backfilled one remains.
        assert_eq!(f.runtime.live_count(), 1);
    }

    #[tokio::test]
    async fn command_and_staged_script() {
        let f = fixture("True", 4, 1).await;
        f.dispatcher.run(request(1, 1)).await.unwrap();

        let commands = f.runtime.commands();
        assert_eq!(commands.len(), 1);
        let expected = build_command("sage", &encode_arg("x"), &encode_graph(&graph()).unwrap());
        assert_eq!(commands[0].1, expected);

        let archives = f.runtime.archives();
        assert_eq!(archives.len(), 1);
        assert_eq!(archives[0].0, commands[0].0);
        assert_eq!(archives[0].1, "/home/sage/sage");
    }

    #[tokio::test]
    async fn wrong_answer_is_recorded_false() {
        let f = fixture("checking\nFalse\n", 4, 1).await;
        let outcome = f.dispatcher.run(request(2, 1)).await.unwrap();
        assert!(!outcome.is_correct);
        assert_eq!(f.store.outcomes(), vec![(2, false)]);
    }

    #[tokio::test]
    async fn exhausted_pool_drops_request() {
        let f = fixture("True", 1, 1).await;
        let _held = f.pool.allocate().await.unwrap();

        let err = f.dispatcher.run(request(3, 1)).await.unwrap_err();
        assert!(matches!(err, DispatchError::AllocationExhausted), "{err}");
        assert!(f.store.outcomes().is_empty());
        assert_eq!(f.pool.stats().await.occupied, 1);
    }

    #[tokio::test]
    async fn unknown_task_drops_request_and_frees_sandbox() {
        let f = fixture("True", 2, 1).await;

        let err = f.dispatcher.run(request(4, 99)).await.unwrap_err();
        assert!(matches!(err, DispatchError::TaskDataNotFound(99)), "{err}");
        assert!(f.store.outcomes().is_empty());
        assert!(f.runtime.commands().is_empty());
        assert_eq!(
            f.pool.stats().await,
            PoolStats {
                ready: 1,
                occupied: 0
            }
        );
    }

    #[tokio::test]
    async fn store_read_failure_frees_sandbox() {
        let f = fixture("True", 2, 1).await;
        f.store.fail_reads(true);

        let err = f.dispatcher.run(request(5, 1)).await.unwrap_err();
        assert!(matches!(err, DispatchError::Store(_)), "{err}");
        assert_eq!(f.pool.stats().await.occupied, 0);
    }

    #[tokio::test]
    async fn stage_failure_frees_sandbox() {
        let f = fixture("True", 2, 1).await;
        f.runtime.fail_push(true);

        let err = f.dispatcher.run(request(6, 1)).await.unwrap_err();
        assert!(
            matches!(err, DispatchError::Sandbox(SandboxError::StageFailed(_))),
            "{err}"
        );
        assert!(f.store.outcomes().is_empty());
        assert_eq!(f.pool.stats().await.occupied, 0);
    }

    #[tokio::test]
    async fn exec_failure_frees_sandbox() {
        let f = fixture("True", 2, 1).await;
        f.runtime.fail_exec(true);

        let err = f.dispatcher.run(request(7, 1)).await.unwrap_err();
        assert!(
            matches!(err, DispatchError::Sandbox(SandboxError::ExecFailed(_))),
            "{err}"
        );
        assert!(f.store.outcomes().is_empty());
        assert_eq!(f.pool.stats().await.occupied, 0);
    }

    #[tokio::test]
    async fn timed_out_execution_frees_sandbox() {
        let f = fixture_with("True", 2, 1, None, Duration::from_millis(50)).await;
        f.runtime.set_exec_delay(Duration::from_secs(60));

        let err = f.dispatcher.run(request(9, 1)).await.unwrap_err();
        assert!(
            matches!(err, DispatchError::Sandbox(SandboxError::Timeout(_))),
            "{err}"
        );
        assert!(f.store.outcomes().is_empty());
        assert_eq!(
            f.pool.stats().await,
            PoolStats {
                ready: 1,
                occupied: 0
            }
        );
        // The timed out sandbox is gone; only its replacement is left.
        assert_eq!(f.runtime.live_count(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn empty_output_records_false_and_logs_error() {
        let f = fixture("", 2, 1).await;

        let outcome = f.dispatcher.run(request(10, 1)).await.unwrap();

        assert!(!outcome.is_correct);
        assert_eq!(f.store.outcomes(), vec![(10, false)]);
        assert_eq!(f.pool.stats().await.occupied, 0);
        assert!(logs_contain("no output received from command"));
    }

    #[tokio::test]
    async fn malformed_body_is_rejected() {
        let f = fixture("True", 2, 1).await;
        let err = f
            .dispatcher
            .on_request_received(b"{not json")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidRequest(_)), "{err}");
        assert_eq!(f.pool.stats().await.occupied, 0);
    }

    #[tokio::test]
    async fn publishes_result_when_configured() {
        let broker = Arc::new(MemoryBroker::default());
        let results = ResultPublisher::new(
            Arc::clone(&broker) as Arc<dyn Broker>,
            "TASK_RESULT".into(),
        );
        let f = fixture_with("True", 2, 1, Some(results), Duration::from_secs(5)).await;

        f.dispatcher.run(request(8, 1)).await.unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "TASK_RESULT");
        let body: serde_json::Value = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(body, serde_json::json!({"request": 8, "is_correct": true}));
    }

    #[tokio::test]
    async fn each_request_gets_a_fresh_sandbox() {
        let f = fixture("True", 3, 1).await;
        f.dispatcher.run(request(1, 1)).await.unwrap();
        f.dispatcher.run(request(2, 1)).await.unwrap();

        let commands = f.runtime.commands();
        assert_eq!(commands.len(), 2);
        assert_ne!(commands[0].0, commands[1].0);
        assert_eq!(f.store.outcomes(), vec![(1, true), (2, true)]);
    }
}
