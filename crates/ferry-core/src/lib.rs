//! ferry-core
//!
//! Core building blocks for the Ferry task queue.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（task record, codec, decision, outcome, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, DeliveryStream, DeliveryAcker, Publisher）
//! - **app**: アプリケーションロジック（builder, pipeline, submission, status）
//! - **impls**: 実装（InMemoryBroker, InMemoryTaskStore など開発用）
//!
//! Production adapters live in their own crates:
//! - `ferry-amqp`: RabbitMQ broker channel
//! - `ferry-pg`: PostgreSQL task store

pub mod domain;
pub mod ports;
pub mod app;
pub mod impls;
