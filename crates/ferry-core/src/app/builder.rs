//! PipelineBuilder - パイプラインの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 開発体験の改善（明確なエラーメッセージ）

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use super::pipeline::{DeliveryPipeline, PipelineConfig};
use crate::domain::Decider;
use crate::ports::{Publisher, TaskStore};

/// PipelineBuilder assembles a [`DeliveryPipeline`] from its ports.
///
/// # 使用例
/// ```ignore
/// let pipeline = PipelineBuilder::new()
///     .store(Arc::new(store))
///     .publisher(Arc::new(publisher))
///     .config(PipelineConfig::default().with_prefetch(1))
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - store / publisher が未設定なら BuildError
/// - prefetch = 0 や timeout = 0 のような設定は起動時に弾く
#[derive(Default)]
pub struct PipelineBuilder {
    store: Option<Arc<dyn TaskStore>>,
    publisher: Option<Arc<dyn Publisher>>,
    decider: Option<Arc<dyn Decider>>,
    config: PipelineConfig,
}

/// BuildError はパイプライン構築時のエラー
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("no task store configured")]
    MissingStore,

    #[error("no publisher configured")]
    MissingPublisher,

    #[error("invalid pipeline config: {0}")]
    InvalidConfig(String),
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Override the default [`crate::domain::RetryDecider`].
    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<DeliveryPipeline, BuildError> {
        let store = self.store.ok_or(BuildError::MissingStore)?;
        let publisher = self.publisher.ok_or(BuildError::MissingPublisher)?;
        validate(&self.config)?;

        let pipeline = DeliveryPipeline::new(store, publisher, self.config);
        Ok(match self.decider {
            Some(decider) => pipeline.with_decider(decider),
            None => pipeline,
        })
    }
}

fn validate(config: &PipelineConfig) -> Result<(), BuildError> {
    if config.prefetch == 0 {
        return Err(BuildError::InvalidConfig(
            "prefetch must be at least 1".to_string(),
        ));
    }
    if config.prefetch > Semaphore::MAX_PERMITS {
        return Err(BuildError::InvalidConfig(format!(
            "prefetch must be at most {}",
            Semaphore::MAX_PERMITS
        )));
    }
    if config.publish_timeout == Duration::ZERO {
        return Err(BuildError::InvalidConfig(
            "publish timeout must be positive".to_string(),
        ));
    }
    if config.store_timeout == Some(Duration::ZERO) {
        return Err(BuildError::InvalidConfig(
            "store timeout must be positive (use None to disable)".to_string(),
        ));
    }
    Ok(())
}
