//! Delivery pipeline scenarios against the in-memory broker and store.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use ferry_core::app::{DeliveryPipeline, PipelineConfig};
use ferry_core::domain::{
    BrokerError, Disposition, MalformedPolicy, PipelineError, StoreError, StoredTask, TaskId,
    TaskRecord, codec,
};
use ferry_core::impls::{AckEvent, InMemoryBroker, InMemoryTaskStore};
use ferry_core::ports::{Delivery, DeliveryAcker, DeliveryStream, Publisher, TaskStore};

fn pipeline(
    store: &Arc<InMemoryTaskStore>,
    broker: &InMemoryBroker,
    config: PipelineConfig,
) -> DeliveryPipeline {
    DeliveryPipeline::new(store.clone(), Arc::new(broker.clone()), config)
}

async fn publish(broker: &InMemoryBroker, record: &TaskRecord) {
    broker.publish(&codec::encode(record).unwrap()).await.unwrap();
}

async fn next_delivery(stream: &mut impl DeliveryStream) -> Delivery {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("delivery within 1s")
        .expect("stream open")
        .expect("delivery ok")
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn retry_counts(payloads: &[Vec<u8>]) -> Vec<u32> {
    payloads
        .iter()
        .map(|p| codec::decode(p).unwrap().retry_count)
        .collect()
}

fn unavailable() -> StoreError {
    StoreError::Unavailable("connection refused".to_string())
}

#[tokio::test]
async fn stored_task_is_acked_without_republish() {
    let store = Arc::new(InMemoryTaskStore::new());
    let broker = InMemoryBroker::new();
    let pipeline = pipeline(&store, &broker, PipelineConfig::default());
    publish(&broker, &TaskRecord::new("alice", 30)).await;

    let mut consumer = broker.consumer(1);
    let delivery = next_delivery(&mut consumer).await;
    let tag = delivery.tag;
    let disposition = pipeline.process(delivery).await.unwrap();

    assert_eq!(disposition, Disposition::Stored { id: TaskId::new(1) });
    assert_eq!(broker.settlements(), vec![AckEvent::Ack { tag }]);
    assert_eq!(broker.published().len(), 1);
    let rows: Vec<StoredTask> = store.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].name, "alice");
    assert_eq!(rows[0].quantity, 30);
    assert_eq!(rows[0].retry_count, 0);
}

#[tokio::test]
async fn failed_store_is_requeued_and_succeeds_on_redelivery() {
    let store = Arc::new(InMemoryTaskStore::new());
    let broker = InMemoryBroker::new();
    let pipeline = pipeline(&store, &broker, PipelineConfig::default());
    store.fail_next(unavailable());
    publish(&broker, &TaskRecord::new("bob", 40)).await;

    let mut consumer = broker.consumer(1);
    let first = next_delivery(&mut consumer).await;
    let first_tag = first.tag;
    assert_eq!(
        pipeline.process(first).await.unwrap(),
        Disposition::Requeued { retry_count: 1 }
    );

    let published = broker.published();
    assert_eq!(retry_counts(&published), vec![0, 1]);

    let second = next_delivery(&mut consumer).await;
    let second_tag = second.tag;
    assert!(!second.redelivered, "retry copy is a new message");
    assert!(matches!(
        pipeline.process(second).await.unwrap(),
        Disposition::Stored { .. }
    ));

    assert_eq!(
        broker.settlements(),
        vec![
            AckEvent::Ack { tag: first_tag },
            AckEvent::Ack { tag: second_tag }
        ]
    );
    let rows = store.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].name, "bob");
    assert_eq!(rows[0].retry_count, 1);
}

#[tokio::test]
async fn exhausted_task_is_dead_lettered() {
    let store = Arc::new(InMemoryTaskStore::new());
    let broker = InMemoryBroker::new();
    let pipeline = pipeline(&store, &broker, PipelineConfig::default());
    store.fail_always(StoreError::Rejected("constraint".to_string()));
    publish(&broker, &TaskRecord::new("carol", 50).with_retry_count(3)).await;

    let mut consumer = broker.consumer(1);
    let delivery = next_delivery(&mut consumer).await;
    let tag = delivery.tag;

    assert_eq!(
        pipeline.process(delivery).await.unwrap(),
        Disposition::DeadLettered { retry_count: 4 }
    );
    assert_eq!(
        broker.settlements(),
        vec![AckEvent::Nack {
            tag,
            requeue: false
        }]
    );
    assert_eq!(broker.published().len(), 1, "no republish");
    assert_eq!(broker.dead_letters().len(), 1);
    assert_eq!(broker.ready_len(), 0);
    assert!(store.rows().is_empty());
}

#[tokio::test]
async fn malformed_payload_is_acked_without_store() {
    let store = Arc::new(InMemoryTaskStore::new());
    let broker = InMemoryBroker::new();
    let pipeline = pipeline(&store, &broker, PipelineConfig::default());
    broker.publish(b"{ not a task").await.unwrap();

    let mut consumer = broker.consumer(1);
    let delivery = next_delivery(&mut consumer).await;
    let tag = delivery.tag;

    assert_eq!(
        pipeline.process(delivery).await.unwrap(),
        Disposition::Malformed {
            dead_lettered: false
        }
    );
    assert_eq!(broker.settlements(), vec![AckEvent::Ack { tag }]);
    assert!(store.attempts().is_empty());
    assert_eq!(broker.published().len(), 1);
    assert!(broker.dead_letters().is_empty());
}

#[tokio::test]
async fn malformed_payload_can_be_dead_lettered() {
    let store = Arc::new(InMemoryTaskStore::new());
    let broker = InMemoryBroker::new();
    let config = PipelineConfig::default().with_malformed(MalformedPolicy::DeadLetter);
    let pipeline = pipeline(&store, &broker, config);
    broker.publish(b"[1, 2, 3]").await.unwrap();

    let mut consumer = broker.consumer(1);
    let delivery = next_delivery(&mut consumer).await;

    assert_eq!(
        pipeline.process(delivery).await.unwrap(),
        Disposition::Malformed {
            dead_lettered: true
        }
    );
    assert_eq!(broker.dead_letters(), vec![b"[1, 2, 3]".to_vec()]);
    assert!(store.attempts().is_empty());
    assert_eq!(broker.published().len(), 1, "malformed payloads are never retried");
}

#[tokio::test]
async fn lineage_respects_retry_ceiling() {
    let store = Arc::new(InMemoryTaskStore::new());
    let broker = InMemoryBroker::new();
    store.fail_always(unavailable());
    let handle = pipeline(&store, &broker, PipelineConfig::default()).spawn(broker.consumer(1));

    publish(&broker, &TaskRecord::new("dave", 7)).await;
    wait_until("dead letter", || broker.dead_letters().len() == 1).await;

    // original + max_retries copies, each exactly one higher than the last
    assert_eq!(retry_counts(&broker.published()), vec![0, 1, 2, 3]);
    let attempted: Vec<u32> = store.attempts().iter().map(|r| r.retry_count).collect();
    assert_eq!(attempted, vec![0, 1, 2, 3]);

    let settlements = broker.settlements();
    assert_eq!(settlements.len(), 4);
    let tags: HashSet<u64> = settlements
        .iter()
        .map(|e| match e {
            AckEvent::Ack { tag } | AckEvent::Nack { tag, .. } => *tag,
        })
        .collect();
    assert_eq!(tags.len(), 4, "each delivery settled once");
    assert!(matches!(
        settlements[3],
        AckEvent::Nack { requeue: false, .. }
    ));
    assert_eq!(retry_counts(&broker.dead_letters()), vec![3]);

    let stats = handle.stats();
    assert_eq!(stats.received, 4);
    assert_eq!(stats.requeued, 3);
    assert_eq!(stats.dead_lettered, 1);
    handle.shutdown_and_join().await;
}

#[tokio::test]
async fn custom_retry_budget_is_honoured() {
    let store = Arc::new(InMemoryTaskStore::new());
    let broker = InMemoryBroker::new();
    store.fail_always(unavailable());
    let config = PipelineConfig::default().with_max_retries(1);
    let handle = pipeline(&store, &broker, config).spawn(broker.consumer(1));

    publish(&broker, &TaskRecord::new("erin", 1)).await;
    wait_until("dead letter", || broker.dead_letters().len() == 1).await;

    assert_eq!(retry_counts(&broker.published()), vec![0, 1]);
    handle.shutdown_and_join().await;
}

#[tokio::test(start_paused = true)]
async fn store_timeout_counts_as_failure() {
    let store = Arc::new(InMemoryTaskStore::new().with_latency(Duration::from_secs(60)));
    let broker = InMemoryBroker::new();
    let config = PipelineConfig::default().with_store_timeout(Some(Duration::from_secs(1)));
    let pipeline = pipeline(&store, &broker, config);
    publish(&broker, &TaskRecord::new("frank", 2)).await;

    let mut consumer = broker.consumer(1);
    let delivery = next_delivery(&mut consumer).await;

    assert_eq!(
        pipeline.process(delivery).await.unwrap(),
        Disposition::Requeued { retry_count: 1 }
    );
    assert_eq!(retry_counts(&broker.published()), vec![0, 1]);
}

#[tokio::test]
async fn failed_republish_nacks_the_original() {
    let store = Arc::new(InMemoryTaskStore::new());
    let broker = InMemoryBroker::new();
    let pipeline = pipeline(&store, &broker, PipelineConfig::default());
    store.fail_next(unavailable());
    publish(&broker, &TaskRecord::new("gina", 3)).await;
    broker.fail_next_publishes(1);

    let mut consumer = broker.consumer(1);
    let delivery = next_delivery(&mut consumer).await;
    let tag = delivery.tag;

    let err = pipeline.process(delivery).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Republish {
            retry_count: 1,
            source: BrokerError::Publish(_)
        }
    ));
    assert_eq!(
        broker.settlements(),
        vec![AckEvent::Nack {
            tag,
            requeue: false
        }]
    );
    assert_eq!(broker.published().len(), 1);
    assert_eq!(pipeline.stats().errors, 1);
}

struct HangingPublisher;

#[async_trait]
impl Publisher for HangingPublisher {
    async fn publish(&self, _payload: &[u8]) -> Result<(), BrokerError> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn republish_is_bounded_by_publish_timeout() {
    let store = Arc::new(InMemoryTaskStore::new());
    let broker = InMemoryBroker::new();
    let config = PipelineConfig::default().with_publish_timeout(Duration::from_secs(5));
    let pipeline = DeliveryPipeline::new(store.clone(), Arc::new(HangingPublisher), config);
    store.fail_next(unavailable());
    publish(&broker, &TaskRecord::new("hank", 4)).await;

    let mut consumer = broker.consumer(1);
    let delivery = next_delivery(&mut consumer).await;

    let err = pipeline.process(delivery).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Republish {
            source: BrokerError::PublishTimeout(_),
            ..
        }
    ));
    assert_eq!(broker.dead_letters().len(), 1);
}

/// Counts settlements instead of talking to a broker.
#[derive(Clone, Default)]
struct CountingAcker {
    acks: Arc<AtomicUsize>,
    nacks: Arc<AtomicUsize>,
    fail: bool,
}

#[async_trait]
impl DeliveryAcker for CountingAcker {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(BrokerError::Ack("channel closed".to_string()));
        }
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        assert!(!requeue, "pipeline never nacks with requeue");
        self.nacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn delivery_with(acker: &CountingAcker, payload: Vec<u8>) -> Delivery {
    Delivery {
        tag: 1,
        payload,
        redelivered: false,
        acker: Box::new(acker.clone()),
    }
}

#[tokio::test]
async fn every_path_settles_exactly_once() {
    let store = Arc::new(InMemoryTaskStore::new());
    let broker = InMemoryBroker::new();
    let pipeline = pipeline(&store, &broker, PipelineConfig::default());

    let valid = codec::encode(&TaskRecord::new("ivy", 5)).unwrap();
    let exhausted = codec::encode(&TaskRecord::new("ivy", 5).with_retry_count(3)).unwrap();
    let cases: Vec<(Vec<u8>, Option<StoreError>)> = vec![
        (valid.clone(), None),
        (valid.clone(), Some(unavailable())),
        (exhausted, Some(unavailable())),
        (b"garbage".to_vec(), None),
    ];

    for (payload, failure) in cases {
        if let Some(err) = failure {
            store.fail_next(err);
        }
        let acker = CountingAcker::default();
        pipeline.process(delivery_with(&acker, payload)).await.unwrap();
        let total = acker.acks.load(Ordering::SeqCst) + acker.nacks.load(Ordering::SeqCst);
        assert_eq!(total, 1);
    }
}

#[tokio::test]
async fn failed_ack_is_reported() {
    let store = Arc::new(InMemoryTaskStore::new());
    let broker = InMemoryBroker::new();
    let pipeline = pipeline(&store, &broker, PipelineConfig::default());
    let acker = CountingAcker {
        fail: true,
        ..CountingAcker::default()
    };
    let payload = codec::encode(&TaskRecord::new("jack", 6)).unwrap();

    let err = pipeline
        .process(delivery_with(&acker, payload))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Acknowledge(BrokerError::Ack(_))));
    assert_eq!(acker.acks.load(Ordering::SeqCst), 1, "no second attempt");
    assert_eq!(store.rows().len(), 1);
}

/// Blocks every `store` call until the test hands out a permit.
struct GatedStore {
    inner: InMemoryTaskStore,
    gate: Semaphore,
    calls: AtomicUsize,
}

#[async_trait]
impl TaskStore for GatedStore {
    async fn store(&self, record: &TaskRecord) -> Result<TaskId, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.gate
            .acquire()
            .await
            .expect("gate open")
            .forget();
        self.inner.store(record).await
    }

    async fn list(&self) -> Result<Vec<StoredTask>, StoreError> {
        self.inner.list().await
    }
}

#[tokio::test]
async fn prefetch_of_one_processes_strictly_in_order() {
    let store = Arc::new(GatedStore {
        inner: InMemoryTaskStore::new(),
        gate: Semaphore::new(0),
        calls: AtomicUsize::new(0),
    });
    let broker = InMemoryBroker::new();
    let handle = DeliveryPipeline::new(
        store.clone(),
        Arc::new(broker.clone()),
        PipelineConfig::default().with_prefetch(1),
    )
    .spawn(broker.consumer(1));

    publish(&broker, &TaskRecord::new("first", 1)).await;
    publish(&broker, &TaskRecord::new("second", 2)).await;

    wait_until("first store call", || store.calls.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.unacked_len(), 1);
    assert_eq!(broker.ready_len(), 1, "second message not yet delivered");

    store.gate.add_permits(1);
    wait_until("second store call", || store.calls.load(Ordering::SeqCst) == 2).await;
    assert_eq!(broker.settlements().len(), 1, "first acked before second starts");

    store.gate.add_permits(1);
    wait_until("second ack", || broker.settlements().len() == 2).await;

    let names: Vec<String> = store.inner.rows().into_iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["first", "second"]);
    handle.shutdown_and_join().await;
}

#[tokio::test]
async fn higher_prefetch_overlaps_up_to_the_limit() {
    let store = Arc::new(GatedStore {
        inner: InMemoryTaskStore::new(),
        gate: Semaphore::new(0),
        calls: AtomicUsize::new(0),
    });
    let broker = InMemoryBroker::new();
    let handle = DeliveryPipeline::new(
        store.clone(),
        Arc::new(broker.clone()),
        PipelineConfig::default().with_prefetch(2),
    )
    .spawn(broker.consumer(2));

    for i in 0..3 {
        publish(&broker, &TaskRecord::new(format!("t{i}"), i)).await;
    }

    wait_until("two store calls", || store.calls.load(Ordering::SeqCst) == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    assert_eq!(broker.ready_len(), 1);

    store.gate.add_permits(3);
    wait_until("all acked", || broker.settlements().len() == 3).await;
    assert_eq!(store.inner.rows().len(), 3);
    handle.shutdown_and_join().await;
}

#[tokio::test]
async fn unacked_delivery_is_redelivered_after_consumer_loss() {
    let store = Arc::new(InMemoryTaskStore::new());
    let broker = InMemoryBroker::new();
    publish(&broker, &TaskRecord::new("kate", 8)).await;

    {
        // consumer takes the message and goes away without settling it
        let mut crashed = broker.consumer(1);
        let _lost = next_delivery(&mut crashed).await;
    }

    let handle = pipeline(&store, &broker, PipelineConfig::default()).spawn(broker.consumer(1));
    wait_until("row stored", || store.rows().len() == 1).await;
    assert_eq!(store.rows()[0].retry_count, 0);
    handle.shutdown_and_join().await;
}

#[tokio::test]
async fn loop_ends_when_broker_closes() {
    let store = Arc::new(InMemoryTaskStore::new());
    let broker = InMemoryBroker::new();
    let handle = pipeline(&store, &broker, PipelineConfig::default()).spawn(broker.consumer(1));

    publish(&broker, &TaskRecord::new("liam", 9)).await;
    wait_until("row stored", || store.rows().len() == 1).await;

    broker.close();
    tokio::time::timeout(Duration::from_secs(1), handle.stopped())
        .await
        .expect("loop stops after close");
    assert_eq!(handle.stats().stored, 1);
    handle.join().await;
}

#[tokio::test]
async fn shutdown_stops_taking_deliveries() {
    let store = Arc::new(InMemoryTaskStore::new());
    let broker = InMemoryBroker::new();
    let handle = pipeline(&store, &broker, PipelineConfig::default()).spawn(broker.consumer(1));

    tokio::time::timeout(Duration::from_secs(1), handle.shutdown_and_join())
        .await
        .expect("idle loop stops promptly");

    publish(&broker, &TaskRecord::new("mia", 10)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.attempts().is_empty());
    assert_eq!(broker.ready_len(), 1);
}

#[tokio::test]
async fn oversized_prefetch_still_runs() {
    let store = Arc::new(InMemoryTaskStore::new());
    let broker = InMemoryBroker::new();
    let config = PipelineConfig::default().with_prefetch(usize::MAX);
    let handle = pipeline(&store, &broker, config).spawn(broker.consumer(1));

    publish(&broker, &TaskRecord::new("nora", 11)).await;
    wait_until("row stored", || store.rows().len() == 1).await;

    let stats = handle.shutdown_and_join().await;
    assert_eq!(stats.stored, 1);
}

#[tokio::test]
async fn final_stats_include_in_flight_passes() {
    let store = Arc::new(GatedStore {
        inner: InMemoryTaskStore::new(),
        gate: Semaphore::new(0),
        calls: AtomicUsize::new(0),
    });
    let broker = InMemoryBroker::new();
    let handle = DeliveryPipeline::new(
        store.clone(),
        Arc::new(broker.clone()),
        PipelineConfig::default(),
    )
    .spawn(broker.consumer(1));

    publish(&broker, &TaskRecord::new("oscar", 12)).await;
    wait_until("store call", || store.calls.load(Ordering::SeqCst) == 1).await;

    let stopping = tokio::spawn(handle.shutdown_and_join());
    tokio::time::sleep(Duration::from_millis(20)).await;
    store.gate.add_permits(1);

    let stats = stopping.await.unwrap();
    assert_eq!(stats.received, 1);
    assert_eq!(stats.stored, 1);
    assert_eq!(broker.settlements().len(), 1);
}

/// Panics on a task named "boom", stores everything else.
struct ExplodingStore {
    inner: InMemoryTaskStore,
}

#[async_trait]
impl TaskStore for ExplodingStore {
    async fn store(&self, record: &TaskRecord) -> Result<TaskId, StoreError> {
        if record.name == "boom" {
            panic!("store blew up");
        }
        self.inner.store(record).await
    }

    async fn list(&self) -> Result<Vec<StoredTask>, StoreError> {
        self.inner.list().await
    }
}

#[tokio::test]
async fn panicking_pass_does_not_stop_the_loop() {
    let store = Arc::new(ExplodingStore {
        inner: InMemoryTaskStore::new(),
    });
    let broker = InMemoryBroker::new();
    // the panicked delivery stays unacked, so the consumer needs spare credit
    let handle = DeliveryPipeline::new(
        store.clone(),
        Arc::new(broker.clone()),
        PipelineConfig::default(),
    )
    .spawn(broker.consumer(2));

    publish(&broker, &TaskRecord::new("boom", 1)).await;
    publish(&broker, &TaskRecord::new("paula", 2)).await;
    wait_until("second task stored", || store.inner.rows().len() == 1).await;

    assert_eq!(broker.unacked_len(), 1);
    let stats = handle.shutdown_and_join().await;
    assert_eq!(stats.received, 2);
    assert_eq!(stats.stored, 1);
    // the consumer went away, so the unsettled delivery is back on the queue
    assert_eq!(broker.ready_len(), 1);
}
