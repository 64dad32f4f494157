//! DeliveryPipeline - 配送・リトライ・ack ループ
//!
//! # フロー（1 delivery = 1 pass）
//! 1. DeliveryStream::next() で delivery を取得（prefetch で同時数を制限）
//! 2. codec::decode で TaskRecord に変換
//! 3. TaskStore::store() で永続化
//! 4. 失敗時: retry_count += 1 → Decider が Requeue / DeadLetter を決定
//! 5. Requeue なら新しいコピーを publish（timeout 付き）
//! 6. 元の delivery を ack / nack（必ず 1 回だけ）

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::status::{PipelineCounters, PipelineStats};
use crate::domain::{
    Acknowledgement, CodecError, DEFAULT_MAX_RETRIES, Decider, Decision, Disposition,
    MalformedPolicy, PipelineError, RetryDecider, StoreError, TaskId, TaskRecord, codec,
};
use crate::ports::{Delivery, DeliveryAcker, DeliveryStream, Publisher, TaskStore};

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Name for logging.
    pub name: String,
    /// Maximum republishes per task lineage.
    pub max_retries: u32,
    /// Maximum deliveries processed at once. Should match the broker prefetch.
    pub prefetch: usize,
    /// Upper bound on a retry publish.
    pub publish_timeout: Duration,
    /// Upper bound on a store call; `None` waits forever.
    pub store_timeout: Option<Duration>,
    pub malformed: MalformedPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "delivery-pipeline".to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            prefetch: 1,
            publish_timeout: Duration::from_secs(5),
            store_timeout: Some(Duration::from_secs(10)),
            malformed: MalformedPolicy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_malformed(mut self, policy: MalformedPolicy) -> Self {
        self.malformed = policy;
        self
    }
}

/// The consumer-side core: decode, store, retry or dead-letter, acknowledge.
///
/// Retry state lives in the message body, so the pipeline itself holds no
/// per-task state and several instances may consume the same queue.
pub struct DeliveryPipeline {
    store: Arc<dyn TaskStore>,
    publisher: Arc<dyn Publisher>,
    decider: Arc<dyn Decider>,
    config: PipelineConfig,
    counters: Arc<PipelineCounters>,
}

impl DeliveryPipeline {
    /// Create a pipeline that uses [`RetryDecider`] with `config.max_retries`.
    pub fn new(
        store: Arc<dyn TaskStore>,
        publisher: Arc<dyn Publisher>,
        config: PipelineConfig,
    ) -> Self {
        let decider = Arc::new(RetryDecider::with_max_retries(config.max_retries));
        Self {
            store,
            publisher,
            decider,
            config,
            counters: Arc::new(PipelineCounters::default()),
        }
    }

    pub fn with_decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = decider;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    /// Run one delivery pass.
    ///
    /// The original delivery is settled exactly once on every path, including
    /// the error paths. An `Err` means the pass could not finish cleanly
    /// (republish or acknowledgment failed); it has already been logged.
    pub async fn process(&self, delivery: Delivery) -> Result<Disposition, PipelineError> {
        let span = info_span!(
            "delivery",
            pipeline = %self.config.name,
            delivery_tag = delivery.tag,
            redelivered = delivery.redelivered,
        );
        self.counters.record_received();
        let result = self.dispatch(delivery).instrument(span).await;
        self.counters.record(&result);
        result
    }

    async fn dispatch(&self, delivery: Delivery) -> Result<Disposition, PipelineError> {
        let Delivery { payload, acker, .. } = delivery;

        let mut record = match codec::decode(&payload) {
            Ok(record) => record,
            Err(err) => return self.discard_malformed(acker, err).await,
        };
        debug!(name = %record.name, retry_count = record.retry_count, "received task");

        let failure = match self.try_store(&record).await {
            Ok(id) => {
                let disposition = Disposition::Stored { id };
                settle(acker, disposition.acknowledgement()).await?;
                info!(task_id = %id, name = %record.name, retry_count = record.retry_count, "task stored");
                return Ok(disposition);
            }
            Err(err) => err,
        };

        let retry_count = record.record_failure();
        warn!(
            name = %record.name,
            retry_count,
            max_retries = self.config.max_retries,
            error = %failure,
            "failed to store task"
        );

        match self.decider.decide(&record, &failure) {
            Decision::DeadLetter => {
                let disposition = Disposition::DeadLettered { retry_count };
                settle(acker, disposition.acknowledgement()).await?;
                warn!(name = %record.name, retry_count, "max retries reached, task dead-lettered");
                Ok(disposition)
            }
            Decision::Requeue => {
                if let Err(err) = self.republish(&record).await {
                    error!(name = %record.name, retry_count, error = %err, "task could not be requeued, dead-lettering original");
                    // 元の delivery は置き換えられていないので ack しない。
                    // nack の失敗は settle 内でログ済み、返すのは republish のエラー
                    let _ = settle(acker, Acknowledgement::Nack).await;
                    return Err(err);
                }
                let disposition = Disposition::Requeued { retry_count };
                settle(acker, disposition.acknowledgement()).await?;
                info!(name = %record.name, retry_count, "task requeued");
                Ok(disposition)
            }
        }
    }

    async fn discard_malformed(
        &self,
        acker: Box<dyn DeliveryAcker>,
        err: CodecError,
    ) -> Result<Disposition, PipelineError> {
        let dead_lettered = self.config.malformed == MalformedPolicy::DeadLetter;
        warn!(error = %err, dead_lettered, "discarding malformed task payload");
        let disposition = Disposition::Malformed { dead_lettered };
        settle(acker, disposition.acknowledgement()).await?;
        Ok(disposition)
    }

    async fn try_store(&self, record: &TaskRecord) -> Result<TaskId, StoreError> {
        match self.config.store_timeout {
            Some(limit) => tokio::time::timeout(limit, self.store.store(record))
                .await
                .unwrap_or(Err(StoreError::Timeout(limit))),
            None => self.store.store(record).await,
        }
    }

    async fn republish(&self, record: &TaskRecord) -> Result<(), PipelineError> {
        let retry_count = record.retry_count;
        let payload = codec::encode(record)
            .map_err(|source| PipelineError::EncodeRetry { retry_count, source })?;
        self.publisher
            .publish_within(&payload, self.config.publish_timeout)
            .await
            .map_err(|source| PipelineError::Republish { retry_count, source })
    }

    /// Spawn the run loop on the current tokio runtime.
    ///
    /// The loop drains `stream` until it ends or shutdown is requested, keeping
    /// at most `config.prefetch` passes in flight.
    pub fn spawn<S>(self, stream: S) -> PipelineHandle
    where
        S: DeliveryStream + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::clone(&self.counters);
        let join = tokio::spawn(run_loop(Arc::new(self), stream, shutdown_rx));
        PipelineHandle {
            shutdown_tx,
            join,
            counters,
        }
    }
}

async fn settle(acker: Box<dyn DeliveryAcker>, ack: Acknowledgement) -> Result<(), PipelineError> {
    let result = match ack {
        Acknowledgement::Ack => acker.ack().await,
        Acknowledgement::Nack => acker.nack(false).await,
    };
    result.map_err(|err| {
        error!(error = %err, ?ack, "failed to settle delivery");
        PipelineError::Acknowledge(err)
    })
}

async fn run_loop<S: DeliveryStream>(
    pipeline: Arc<DeliveryPipeline>,
    mut stream: S,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // DeliveryPipeline::new は builder の検証を通らないのでここでも範囲に収める
    let permits = Arc::new(Semaphore::new(
        pipeline.config.prefetch.clamp(1, Semaphore::MAX_PERMITS),
    ));
    let mut in_flight = JoinSet::new();
    info!(
        pipeline = %pipeline.config.name,
        prefetch = pipeline.config.prefetch,
        max_retries = pipeline.config.max_retries,
        "waiting for deliveries"
    );

    loop {
        // shutdown が来ていたら抜ける
        if *shutdown_rx.borrow() {
            break;
        }
        while let Some(joined) = in_flight.try_join_next() {
            log_join_error(&pipeline.config.name, joined);
        }

        // permit を先に取ることで同時処理数を prefetch 以下に保つ
        let permit = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let next = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            next = stream.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(err)) => {
                error!(pipeline = %pipeline.config.name, error = %err, "delivery stream failed");
                break;
            }
            None => {
                info!(pipeline = %pipeline.config.name, "delivery stream closed");
                break;
            }
        };

        let pipeline = Arc::clone(&pipeline);
        in_flight.spawn(async move {
            let _permit = permit;
            // エラーは process 内でログ済み、件数は counters に記録済み
            let _ = pipeline.process(delivery).await;
        });
    }

    while let Some(joined) = in_flight.join_next().await {
        log_join_error(&pipeline.config.name, joined);
    }
    info!(pipeline = %pipeline.config.name, stats = ?pipeline.stats(), "pipeline stopped");
}

/// A pass that panicked leaves its delivery unsettled; the broker redelivers
/// it once the consumer goes away.
fn log_join_error(pipeline: &str, joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        error!(pipeline, error = %err, "delivery pass panicked");
    }
}

/// Handle to a running pipeline.
/// - `shutdown_tx` を drop するとループが止まる
/// - `shutdown_and_join()` で in-flight の pass 完了まで待てる
pub struct PipelineHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    counters: Arc<PipelineCounters>,
}

impl PipelineHandle {
    /// Stop taking new deliveries. In-flight passes run to completion.
    pub fn request_shutdown(&self) {
        // receiver may already be gone if the stream ended
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop, wait for in-flight passes, and return the final stats.
    pub async fn shutdown_and_join(self) -> PipelineStats {
        self.request_shutdown();
        self.join_loop().await
    }

    /// Wait for the loop to end on its own (the stream closed).
    pub async fn join(self) -> PipelineStats {
        self.join_loop().await
    }

    async fn join_loop(self) -> PipelineStats {
        if let Err(err) = self.join.await {
            error!(error = %err, "pipeline task panicked");
        }
        self.counters.snapshot()
    }

    /// Resolves once the run loop has returned, for whatever reason.
    pub async fn stopped(&self) {
        // run_loop が shutdown_rx を drop した時点で closed になる
        self.shutdown_tx.closed().await;
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }
}
