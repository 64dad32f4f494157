//! InMemoryBroker - 開発用の配送キュー
//!
//! # 学習ポイント
//! - Mutex + Notify による async な blocking pop
//! - prefetch（未 ack メッセージ数の上限）の実装
//! - consumer 切断時の再配送（unacked → ready の先頭へ）
//!
//! Behaves like a single durable queue on a real broker with manual
//! acknowledgment: messages stay in `unacked` until settled, a consumer never
//! holds more than `prefetch` unsettled messages, and nack without requeue
//! moves the message to a dead-letter list.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::domain::BrokerError;
use crate::ports::{Delivery, DeliveryAcker, DeliveryStream, Publisher};

/// A settlement observed by the broker, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckEvent {
    Ack { tag: u64 },
    Nack { tag: u64, requeue: bool },
}

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    consumer: u64,
    message: Message,
}

#[derive(Default)]
struct BrokerState {
    ready: VecDeque<Message>,
    unacked: HashMap<u64, Unacked>,
    dead_letters: Vec<Vec<u8>>,
    published: Vec<Vec<u8>>,
    settlements: Vec<AckEvent>,
    /// Number of upcoming publishes that fail (fault injection).
    failing_publishes: usize,
    next_tag: u64,
    next_consumer: u64,
    closed: bool,
}

impl BrokerState {
    fn in_flight_for(&self, consumer: u64) -> usize {
        self.unacked
            .values()
            .filter(|u| u.consumer == consumer)
            .count()
    }

    /// Put every unsettled message of `consumer` (or of everyone) back at the
    /// front of the queue, flagged as redelivered.
    fn requeue_unacked(&mut self, consumer: Option<u64>) -> usize {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| consumer.is_none_or(|c| u.consumer == c))
            .map(|(tag, _)| *tag)
            .collect();
        // 古い tag ほど先頭に戻す
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in &tags {
            if let Some(entry) = self.unacked.remove(tag) {
                self.ready.push_front(Message {
                    body: entry.message.body,
                    redelivered: true,
                });
            }
        }
        tags.len()
    }
}

/// InMemoryBroker is a cloneable handle to one in-process queue.
///
/// # 使用例
/// ```ignore
/// let broker = InMemoryBroker::new();
/// broker.publish(b"{\"name\":\"alice\",\"quantity\":30}").await?;
/// let mut consumer = broker.consumer(1);
/// let delivery = consumer.next().await.unwrap()?;
/// delivery.acker.ack().await?;
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a consumer that holds at most `prefetch` unsettled messages.
    /// A prefetch of 0 is treated as 1.
    pub fn consumer(&self, prefetch: usize) -> InMemoryConsumer {
        let id = {
            let mut state = self.lock();
            state.next_consumer += 1;
            state.next_consumer
        };
        InMemoryConsumer {
            broker: self.clone(),
            id,
            prefetch: prefetch.max(1),
        }
    }

    /// Make the next `n` publishes fail with [`BrokerError::Publish`].
    pub fn fail_next_publishes(&self, n: usize) {
        self.lock().failing_publishes = n;
    }

    /// Simulate every consumer disconnecting: unsettled messages become ready
    /// again. Returns how many were requeued.
    pub fn recover(&self) -> usize {
        let requeued = self.lock().requeue_unacked(None);
        self.notify.notify_waiters();
        requeued
    }

    /// Close the queue: every stream ends and further publishes fail.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn ready_len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn unacked_len(&self) -> usize {
        self.lock().unacked.len()
    }

    /// Every payload ever accepted by `publish`, in order.
    pub fn published(&self) -> Vec<Vec<u8>> {
        self.lock().published.clone()
    }

    /// Payloads nacked without requeue, in order.
    pub fn dead_letters(&self) -> Vec<Vec<u8>> {
        self.lock().dead_letters.clone()
    }

    /// Every ack/nack the broker accepted, in order.
    pub fn settlements(&self) -> Vec<AckEvent> {
        self.lock().settlements.clone()
    }

    fn try_take(&self, consumer: u64, prefetch: usize) -> Option<Option<Delivery>> {
        let mut state = self.lock();
        if state.closed {
            return Some(None);
        }
        if state.in_flight_for(consumer) >= prefetch {
            return None;
        }
        let message = state.ready.pop_front()?;
        state.next_tag += 1;
        let tag = state.next_tag;
        let delivery = Delivery {
            tag,
            payload: message.body.clone(),
            redelivered: message.redelivered,
            acker: Box::new(InMemoryAcker {
                broker: self.clone(),
                tag,
            }),
        };
        state.unacked.insert(tag, Unacked { consumer, message });
        Some(Some(delivery))
    }

    fn settle(&self, event: AckEvent) -> Result<(), BrokerError> {
        {
            let mut state = self.lock();
            match event {
                AckEvent::Ack { tag } => {
                    if state.unacked.remove(&tag).is_none() {
                        return Err(BrokerError::Ack(format!("unknown delivery tag {tag}")));
                    }
                }
                AckEvent::Nack { tag, requeue } => {
                    let Some(entry) = state.unacked.remove(&tag) else {
                        return Err(BrokerError::Nack(format!("unknown delivery tag {tag}")));
                    };
                    if requeue {
                        state.ready.push_front(Message {
                            body: entry.message.body,
                            redelivered: true,
                        });
                    } else {
                        state.dead_letters.push(entry.message.body);
                    }
                }
            }
            state.settlements.push(event);
        }
        // credit が空いたので待機中の consumer を起こす
        self.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Publisher for InMemoryBroker {
    async fn publish(&self, payload: &[u8]) -> Result<(), BrokerError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(BrokerError::Closed);
            }
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(BrokerError::Publish("injected publish failure".to_string()));
            }
            state.published.push(payload.to_vec());
            state.ready.push_back(Message {
                body: payload.to_vec(),
                redelivered: false,
            });
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

/// One consumer's view of an [`InMemoryBroker`].
///
/// Dropping the consumer behaves like a disconnect: its unsettled messages
/// are handed out again.
pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    id: u64,
    prefetch: usize,
}

#[async_trait]
impl DeliveryStream for InMemoryConsumer {
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>> {
        loop {
            // 先に Notified を登録してから state を見る（通知の取りこぼし防止）
            let notified = self.broker.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(taken) = self.broker.try_take(self.id, self.prefetch) {
                return taken.map(Ok);
            }
            notified.await;
        }
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        let requeued = self.broker.lock().requeue_unacked(Some(self.id));
        if requeued > 0 {
            self.broker.notify.notify_waiters();
        }
    }
}

struct InMemoryAcker {
    broker: InMemoryBroker,
    tag: u64,
}

#[async_trait]
impl DeliveryAcker for InMemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.broker.settle(AckEvent::Ack { tag: self.tag })
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        self.broker.settle(AckEvent::Nack {
            tag: self.tag,
            requeue,
        })
    }
}
