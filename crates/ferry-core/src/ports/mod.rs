//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（RabbitMQ, PostgreSQL など）へのインターフェースで、
//! 実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - Broker は配送と ack のみを担当（retry 状態は message body に載る）
//! - TaskStore は永続化のみを担当（重複排除はしない）

pub mod task_store;
pub mod broker;

pub use self::task_store::TaskStore;
pub use self::broker::{Delivery, DeliveryAcker, DeliveryStream, Publisher};
