//! ferry - task queue producer API and consumer worker
//!
//! # サブコマンド
//! - `serve`: HTTP API（POST /task で publish、GET /tasks で一覧）
//! - `work`: delivery pipeline（consume → store → retry/dead-letter → ack）
//! - `all`: 両方を 1 プロセス・1 接続で動かす

mod config;
mod http;
mod logging;
mod run;

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use config::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.log_format);

    match run::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("ferry exited with error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
