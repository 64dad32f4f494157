//! App - アプリケーション層
//!
//! ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **PipelineBuilder**: パイプラインの構築と起動時検証
//! - **DeliveryPipeline**: consume → decode → store → retry/dead-letter → ack
//! - **Submitter**: 新規タスクの検証と publish
//! - **PipelineStats**: 処理件数のスナップショット

pub mod builder;
pub mod pipeline;
pub mod submission;
pub mod status;

pub use self::builder::{BuildError, PipelineBuilder};
pub use self::pipeline::{DeliveryPipeline, PipelineConfig, PipelineHandle};
pub use self::submission::Submitter;
pub use self::status::PipelineStats;
