use std::sync::Arc;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Subscription};
use crate::dispatcher::Evaluator;
use crate::error::{DispatchError, EvaluatorResult};

/// Receives request messages and hands each one to its evaluator.
///
/// Every registered evaluator gets its own consumer loop. A message is
/// evaluated on a worker task, never on the loop itself, and the number of
/// evaluations in flight across all channels is capped at `max_in_flight`.
pub struct Ingress {
    broker: Arc<dyn Broker>,
    evaluators: Vec<Arc<dyn Evaluator>>,
    max_in_flight: usize,
}

impl Ingress {
    pub fn new(broker: Arc<dyn Broker>, max_in_flight: usize) -> Self {
        Self {
            broker,
            evaluators: Vec::new(),
            max_in_flight,
        }
    }

    pub fn register(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluators.push(evaluator);
        self
    }

    /// Consume until every channel closes or `shutdown` turns true.
    ///
    /// Fails only if a channel cannot be subscribed at startup. On shutdown
    /// the evaluations still running are left to finish on their own.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> EvaluatorResult<()> {
        let mut subscriptions = Vec::with_capacity(self.evaluators.len());
        for evaluator in self.evaluators {
            let subscription = self.broker.consume(evaluator.channel()).await?;
            info!(channel = evaluator.channel(), "consuming requests");
            subscriptions.push((evaluator, subscription));
        }

        let semaphore = Arc::new(Semaphore::new(self.max_in_flight));
        let mut loops = JoinSet::new();
        for (evaluator, subscription) in subscriptions {
            loops.spawn(consume_channel(
                evaluator,
                subscription,
                Arc::clone(&semaphore),
                shutdown.clone(),
            ));
        }

        while let Some(result) = loops.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "consumer loop panicked");
            }
        }
        info!("ingress stopped");
        Ok(())
    }
}

async fn consume_channel(
    evaluator: Arc<dyn Evaluator>,
    mut subscription: Subscription,
    semaphore: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let channel = evaluator.channel().to_string();
    let mut workers = JoinSet::new();

    loop {
        let message = tokio::select! {
            () = wait_for_shutdown(&mut shutdown) => {
                info!(channel, in_flight = workers.len(), "shutdown requested, consumer stopping");
                workers.detach_all();
                return;
            }
            Some(result) = workers.join_next(), if !workers.is_empty() => {
                if let Err(e) = result {
                    error!(channel, error = %e, "evaluation task panicked");
                }
                continue;
            }
            message = subscription.next() => message,
        };

        let body = match message {
            Some(Ok(body)) => body,
            Some(Err(e)) => {
                error!(channel, error = %e, "failed to receive message");
                continue;
            }
            None => break,
        };

        let permit = tokio::select! {
            () = wait_for_shutdown(&mut shutdown) => {
                warn!(channel, "shutdown requested, dropping received message");
                workers.detach_all();
                return;
            }
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => {
                    error!(channel, "semaphore closed unexpectedly");
                    break;
                }
            },
        };

        let evaluator = Arc::clone(&evaluator);
        workers.spawn(async move {
            handle_message(evaluator.as_ref(), &body).await;
            drop(permit);
        });
    }

    if !workers.is_empty() {
        info!(channel, remaining = workers.len(), "channel closed, waiting for evaluations");
    }
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            error!(channel, error = %e, "evaluation task panicked");
        }
    }
    info!(channel, "channel closed");
}

async fn handle_message(evaluator: &dyn Evaluator, body: &[u8]) {
    let channel = evaluator.channel();
    match evaluator.on_request_received(body).await {
        Ok(outcome) => debug!(
            channel,
            request_id = outcome.request_id,
            is_correct = outcome.is_correct,
            "request evaluated"
        ),
        Err(DispatchError::AllocationExhausted) => {
            warn!(channel, "no sandbox ready, request dropped");
        }
        Err(e @ DispatchError::TaskDataNotFound(_)) => {
            info!(channel, error = %e, "request dropped");
        }
        Err(e) => error!(channel, error = %e, "evaluation failed"),
    }
}

/// Resolve once shutdown is requested; pend forever if the sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let sender_gone = shutdown.wait_for(|stop| *stop).await.is_err();
    if sender_gone {
        std::future::pending::<()>().await;
    }
}
