//! Process wiring.
//!
//! # 設計原則
//! - AMQP 接続はこのモジュールが所有し、終了時に明示的に close する
//! - API の publish、pipeline の republish、consume はそれぞれ別 channel
//! - 起動時の失敗（接続・queue 宣言・migrate）は anyhow で main に返す

use std::future::IntoFuture;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};

use ferry_amqp::AmqpBroker;
use ferry_core::app::{PipelineBuilder, PipelineHandle, Submitter};
use ferry_core::ports::TaskStore;
use ferry_pg::PgTaskStore;

use crate::config::{AllArgs, Cli, Command, DatabaseArgs, ServeArgs, WorkArgs, WorkerArgs};
use crate::http::{self, ApiState};

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match &cli.command {
        Command::Serve(args) => serve(&cli, args).await,
        Command::Work(args) => work(&cli, args).await,
        Command::All(args) => all(&cli, args).await,
    }
}

async fn serve(cli: &Cli, args: &ServeArgs) -> anyhow::Result<()> {
    let store = open_store(&args.database).await?;
    let broker = AmqpBroker::connect(cli.amqp_config(None))
        .await
        .context("connecting to broker")?;

    let app = api(cli, &broker, store).await?;
    let listener = bind(args.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    broker.close().await.context("closing broker connection")?;
    Ok(())
}

async fn work(cli: &Cli, args: &WorkArgs) -> anyhow::Result<()> {
    let store = open_store(&args.database).await?;
    let broker = AmqpBroker::connect(cli.amqp_config(Some(&args.worker)))
        .await
        .context("connecting to broker")?;

    let handle = start_pipeline(cli, &args.worker, &broker, store).await?;
    tokio::select! {
        _ = shutdown_signal() => {}
        _ = handle.stopped() => warn!("delivery stream ended"),
    }
    stop_pipeline(handle).await;

    broker.close().await.context("closing broker connection")?;
    Ok(())
}

async fn all(cli: &Cli, args: &AllArgs) -> anyhow::Result<()> {
    let store = open_store(&args.database).await?;
    let broker = AmqpBroker::connect(cli.amqp_config(Some(&args.worker)))
        .await
        .context("connecting to broker")?;

    let handle = start_pipeline(cli, &args.worker, &broker, store.clone()).await?;
    let app = api(cli, &broker, store).await?;
    let listener = bind(args.listen).await?;
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .into_future();

    tokio::select! {
        result = server => result.context("http server failed")?,
        _ = handle.stopped() => warn!("delivery stream ended, stopping http server"),
    }
    stop_pipeline(handle).await;

    broker.close().await.context("closing broker connection")?;
    Ok(())
}

async fn open_store(args: &DatabaseArgs) -> anyhow::Result<Arc<dyn TaskStore>> {
    let store = PgTaskStore::connect(&args.database_url, args.db_max_connections)
        .await
        .context("connecting to postgres")?;
    store.migrate().await.context("creating tasks table")?;
    Ok(Arc::new(store))
}

async fn api(
    cli: &Cli,
    broker: &AmqpBroker,
    store: Arc<dyn TaskStore>,
) -> anyhow::Result<axum::Router> {
    let publisher = broker
        .publisher()
        .await
        .context("opening api publisher channel")?;
    let submitter = Submitter::new(Arc::new(publisher), cli.publish_timeout());
    Ok(http::router(ApiState::new(submitter, store)))
}

async fn start_pipeline(
    cli: &Cli,
    worker: &WorkerArgs,
    broker: &AmqpBroker,
    store: Arc<dyn TaskStore>,
) -> anyhow::Result<PipelineHandle> {
    let publisher = broker
        .publisher()
        .await
        .context("opening retry publisher channel")?;
    let consumer = broker.consumer().await.context("starting consumer")?;

    let pipeline = PipelineBuilder::new()
        .store(store)
        .publisher(Arc::new(publisher))
        .config(worker.pipeline_config(cli.publish_timeout()))
        .build()
        .context("invalid pipeline configuration")?;
    Ok(pipeline.spawn(consumer))
}

async fn stop_pipeline(handle: PipelineHandle) {
    info!("stopping pipeline, waiting for in-flight deliveries");
    let stats = handle.shutdown_and_join().await;
    info!(
        received = stats.received,
        stored = stats.stored,
        requeued = stats.requeued,
        dead_lettered = stats.dead_lettered,
        "pipeline stopped"
    );
}

async fn bind(addr: std::net::SocketAddr) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, "http api listening");
    Ok(listener)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
