//! Impls - 実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryBroker**: 開発用の配送キュー（prefetch, manual ack, dead-letter）
//! - **InMemoryTaskStore**: テスト用の永続化先（fault injection 付き）
//!
//! # 本番用実装
//! 本番用の実装は別クレートに配置します：
//! - `ferry-amqp`: AmqpBroker (RabbitMQ)
//! - `ferry-pg`: PgTaskStore (PostgreSQL)

pub mod inmem_broker;
pub mod inmem_store;

pub use self::inmem_broker::{AckEvent, InMemoryBroker, InMemoryConsumer};
pub use self::inmem_store::InMemoryTaskStore;
