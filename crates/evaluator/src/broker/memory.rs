use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Broker, BrokerResult, Subscription};

type Delivery = BrokerResult<Vec<u8>>;

/// In-process [`Broker`] for tests.
///
/// Tests push deliveries through the sender returned by [`open`]; dropping
/// every sender closes the channel. Consuming a channel that was never
/// opened yields an already closed subscription.
///
/// [`open`]: MemoryBroker::open
#[derive(Default)]
pub struct MemoryBroker {
    pending: Mutex<HashMap<String, mpsc::Receiver<Delivery>>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryBroker {
    pub fn open(&self, channel: &str) -> mpsc::Sender<Delivery> {
        let (tx, rx) = mpsc::channel(16);
        self.pending.lock().unwrap().insert(channel.into(), rx);
        tx
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn consume(&self, channel: &str) -> BrokerResult<Subscription> {
        let rx = self.pending.lock().unwrap().remove(channel);
        let rx = rx.unwrap_or_else(|| mpsc::channel(1).1);
        Ok(Subscription::new(rx))
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> BrokerResult<()> {
        self.published
            .lock()
            .unwrap()
            .push((channel.into(), payload.to_vec()));
        Ok(())
    }
}
