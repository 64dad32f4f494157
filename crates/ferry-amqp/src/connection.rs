//! AmqpBroker - 接続と channel の管理

use lapin::options::{BasicConsumeOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use tracing::{debug, info};

use crate::config::AmqpConfig;
use crate::consumer::AmqpConsumer;
use crate::error::AmqpError;
use crate::publisher::AmqpPublisher;

/// One broker connection. Publishers and consumers each get their own channel.
///
/// # 使用例
/// ```ignore
/// let broker = AmqpBroker::connect(AmqpConfig::default()).await?;
/// let publisher = broker.publisher().await?;
/// let consumer = broker.consumer().await?;
/// // ...
/// broker.close().await?;
/// ```
pub struct AmqpBroker {
    connection: Connection,
    config: AmqpConfig,
}

impl AmqpBroker {
    pub async fn connect(config: AmqpConfig) -> Result<Self, AmqpError> {
        info!(url = %config.redacted_url(), queue = %config.queue, "connecting to broker");
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(AmqpError::Connect)?;
        Ok(Self { connection, config })
    }

    /// Open a confirm-mode channel for publishing onto the task queue.
    pub async fn publisher(&self) -> Result<AmqpPublisher, AmqpError> {
        let channel = self.open_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(AmqpError::Configure)?;
        debug!(channel_id = channel.id(), "publisher channel ready");
        Ok(AmqpPublisher::new(channel, self.config.queue.clone()))
    }

    /// Open a manual-ack consumer limited to `config.prefetch` unacked deliveries.
    pub async fn consumer(&self) -> Result<AmqpConsumer, AmqpError> {
        let channel = self.open_channel().await?;
        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await
            .map_err(AmqpError::Configure)?;

        let options = BasicConsumeOptions {
            no_ack: false,
            ..BasicConsumeOptions::default()
        };
        let consumer = channel
            .basic_consume(
                &self.config.queue,
                &self.config.consumer_tag,
                options,
                FieldTable::default(),
            )
            .await
            .map_err(|source| AmqpError::Consume {
                queue: self.config.queue.clone(),
                source,
            })?;
        info!(
            queue = %self.config.queue,
            prefetch = self.config.prefetch,
            consumer_tag = %self.config.consumer_tag,
            "consumer started"
        );
        Ok(AmqpConsumer::new(channel, consumer))
    }

    async fn open_channel(&self) -> Result<Channel, AmqpError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(AmqpError::Channel)?;
        declare_queue(&channel, &self.config.queue).await?;
        Ok(channel)
    }

    pub async fn close(self) -> Result<(), AmqpError> {
        self.connection
            .close(200, "shutdown")
            .await
            .map_err(AmqpError::Close)?;
        info!("broker connection closed");
        Ok(())
    }
}

/// Declare the durable task queue. Idempotent for identical arguments.
async fn declare_queue(channel: &Channel, queue: &str) -> Result<(), AmqpError> {
    channel
        .queue_declare(queue, queue_options(), FieldTable::default())
        .await
        .map_err(|source| AmqpError::Declare {
            queue: queue.to_string(),
            source,
        })?;
    Ok(())
}

fn queue_options() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_is_durable_and_shared() {
        let options = queue_options();
        assert!(options.durable);
        assert!(!options.exclusive);
        assert!(!options.auto_delete);
        assert!(!options.passive);
    }
}
