//! ferry-pg - PostgreSQL の TaskStore 実装
//!
//! # 学習ポイント
//! - sqlx の PgPool を ports::TaskStore の裏に隠す
//! - sqlx::Error をドメインの StoreError に分類する
//! - 起動時に冪等なスキーマ作成（migrate）

pub mod schema;
pub mod store;

pub use store::{PgTaskStore, classify};
