//! Broker ports - 配送キュー（RabbitMQ または InMemory）
//!
//! The broker link is split into three seams:
//! - [`DeliveryStream`]: pull the next delivery (the broker enforces prefetch)
//! - [`DeliveryAcker`]: settle one delivery, exactly once
//! - [`Publisher`]: put a payload on the queue
//!
//! 実装:
//! - `impls::InMemoryBroker`（開発・テスト用）
//! - `ferry-amqp`（本番用）

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::BrokerError;

/// Settles a single delivery.
///
/// Both methods consume the acker, so a delivery can be settled at most once.
#[async_trait]
pub trait DeliveryAcker: Send {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError>;
}

/// One message handed to a consumer.
pub struct Delivery {
    /// Broker-assigned tag, used for logging.
    pub tag: u64,
    pub payload: Vec<u8>,
    /// Set when the broker hands out a message a second time after a consumer
    /// went away without settling it.
    pub redelivered: bool,
    pub acker: Box<dyn DeliveryAcker>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries for one consumer.
///
/// `None` means the channel is gone and no more deliveries will arrive.
#[async_trait]
pub trait DeliveryStream: Send {
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>>;
}

/// Publishes persistent messages onto the task queue.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, payload: &[u8]) -> Result<(), BrokerError>;

    /// `publish` bounded by `timeout`. An elapsed timeout aborts the call and
    /// is reported as [`BrokerError::PublishTimeout`].
    async fn publish_within(&self, payload: &[u8], timeout: Duration) -> Result<(), BrokerError> {
        match tokio::time::timeout(timeout, self.publish(payload)).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::PublishTimeout(timeout)),
        }
    }
}
