use async_trait::async_trait;
use tokio::sync::mpsc;

mod amqp;
#[cfg(test)]
mod memory;

pub use amqp::AmqpBroker;
#[cfg(test)]
pub use memory::MemoryBroker;

/// Channel the standard evaluator receives requests on.
pub const TASK_REQUEST: &str = "TASK_REQUEST";

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Message bus the service receives requests from and publishes results to.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Start receiving message bodies from `channel`. Messages count as
    /// delivered as soon as they are handed out.
    async fn consume(&self, channel: &str) -> BrokerResult<Subscription>;
    async fn publish(&self, channel: &str, payload: &[u8]) -> BrokerResult<()>;
}

/// Stream of message bodies from one channel.
pub struct Subscription {
    rx: mpsc::Receiver<BrokerResult<Vec<u8>>>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<BrokerResult<Vec<u8>>>) -> Self {
        Self { rx }
    }

    /// Next message body, or `None` once the channel is closed.
    pub async fn next(&mut self) -> Option<BrokerResult<Vec<u8>>> {
        self.rx.recv().await
    }
}
