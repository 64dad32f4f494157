//! AmqpPublisher - persistent publish with confirms

use async_trait::async_trait;
use lapin::options::BasicPublishOptions;
use lapin::{BasicProperties, Channel};
use tracing::debug;

use ferry_core::domain::{BrokerError, codec};
use ferry_core::ports::Publisher;

/// AMQP delivery mode 2: the broker writes the message to disk.
const PERSISTENT: u8 = 2;

/// Publishes onto the task queue through the default exchange.
#[derive(Clone)]
pub struct AmqpPublisher {
    channel: Channel,
    queue: String,
}

impl AmqpPublisher {
    pub(crate) fn new(channel: Channel, queue: String) -> Self {
        Self { channel, queue }
    }
}

pub(crate) fn task_properties() -> BasicProperties {
    BasicProperties::default()
        .with_delivery_mode(PERSISTENT)
        .with_content_type(codec::CONTENT_TYPE.into())
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn publish(&self, payload: &[u8]) -> Result<(), BrokerError> {
        let confirm = self
            .channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                payload,
                task_properties(),
            )
            .await
            .map_err(|err| BrokerError::Publish(err.to_string()))?;

        let confirmation = confirm
            .await
            .map_err(|err| BrokerError::Publish(err.to_string()))?;
        if confirmation.is_nack() {
            return Err(BrokerError::Publish(format!(
                "broker rejected publish to {}",
                self.queue
            )));
        }
        debug!(queue = %self.queue, bytes = payload.len(), "publish confirmed");
        Ok(())
    }
}
