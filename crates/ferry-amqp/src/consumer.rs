//! AmqpConsumer - manual-ack delivery stream

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::acker::Acker;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use lapin::{Channel, Consumer};
use tracing::warn;

use ferry_core::domain::BrokerError;
use ferry_core::ports::{Delivery, DeliveryAcker, DeliveryStream};

/// Deliveries from one consumer channel.
///
/// Unsettled deliveries are requeued by the broker when the channel closes.
pub struct AmqpConsumer {
    channel: Channel,
    inner: Consumer,
}

impl AmqpConsumer {
    pub(crate) fn new(channel: Channel, inner: Consumer) -> Self {
        Self { channel, inner }
    }
}

#[async_trait]
impl DeliveryStream for AmqpConsumer {
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>> {
        match self.inner.next().await? {
            Ok(delivery) => Some(Ok(Delivery {
                tag: delivery.delivery_tag,
                payload: delivery.data,
                redelivered: delivery.redelivered,
                acker: Box::new(AmqpAcker {
                    inner: delivery.acker,
                }),
            })),
            Err(err) => {
                warn!(channel_id = self.channel.id(), error = %err, "consumer error");
                Some(Err(BrokerError::Consume(err.to_string())))
            }
        }
    }
}

struct AmqpAcker {
    inner: Acker,
}

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.inner
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|err| BrokerError::Ack(err.to_string()))
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        let options = BasicNackOptions {
            requeue,
            multiple: false,
        };
        self.inner
            .nack(options)
            .await
            .map(|_| ())
            .map_err(|err| BrokerError::Nack(err.to_string()))
    }
}
