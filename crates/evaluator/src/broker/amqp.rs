use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{Broker, BrokerError, BrokerResult, Subscription};

const CONSUMER_TAG: &str = "evaluator";

/// Deliveries buffered between the AMQP consumer and the ingress loop.
const DELIVERY_BUFFER: usize = 64;

/// [`Broker`] over an AMQP 0.9.1 server (RabbitMQ).
///
/// Channels map to queues on the default exchange.
pub struct AmqpBroker {
    /// Kept so the connection lives as long as the broker.
    _connection: Connection,
    channel: Channel,
}

impl AmqpBroker {
    pub async fn connect(url: &str) -> BrokerResult<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        info!("connected to message broker");
        Ok(Self {
            _connection: connection,
            channel,
        })
    }

    async fn declare(&self, queue: &str) -> BrokerResult<()> {
        self.channel
            .queue_declare(queue, QueueDeclareOptions::default(), FieldTable::default())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn consume(&self, channel: &str) -> BrokerResult<Subscription> {
        self.declare(channel).await?;
        let mut consumer = self
            .channel
            .basic_consume(
                channel,
                CONSUMER_TAG,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let queue = channel.to_owned();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let body = delivery.map(|d| d.data).map_err(BrokerError::from);
                if tx.send(body).await.is_err() {
                    break;
                }
            }
            debug!(channel = %queue, "consumer stream ended");
        });

        info!(channel, "consuming started");
        Ok(Subscription::new(rx))
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> BrokerResult<()> {
        self.declare(channel).await?;
        self.channel
            .basic_publish(
                "",
                channel,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default(),
            )
            .await?
            .await?;
        debug!(channel, bytes = payload.len(), "published message");
        Ok(())
    }
}
