//! ferry-amqp - AMQP 0-9-1 (RabbitMQ) アダプタ
//!
//! ferry-core の ports を lapin で実装します。
//!
//! # 構成
//! - **AmqpBroker**: 接続を 1 本保持し、役割ごとに channel を切り出す
//! - **AmqpPublisher**: durable queue への persistent publish（publisher confirm 付き）
//! - **AmqpConsumer**: manual ack の consumer（basic.qos で prefetch を設定）
//!
//! # 設計原則
//! - 接続は呼び出し側が明示的に所有する（グローバル状態なし）
//! - publish 用と consume 用で channel を分ける

pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod publisher;

pub use config::AmqpConfig;
pub use connection::AmqpBroker;
pub use consumer::AmqpConsumer;
pub use error::AmqpError;
pub use publisher::AmqpPublisher;
