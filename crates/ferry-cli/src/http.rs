//! HTTP API - タスク投入と一覧
//!
//! - `POST /task`: 検証して queue に publish（201 / 400 / 502 / 504）
//! - `GET /tasks`: 永続化済みタスクの一覧
//! - `GET /health`: liveness

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::{error, warn};

use ferry_core::app::Submitter;
use ferry_core::domain::{BrokerError, NewTask, SubmitError};
use ferry_core::ports::TaskStore;

#[derive(Clone)]
pub struct ApiState {
    submitter: Arc<Submitter>,
    store: Arc<dyn TaskStore>,
}

impl ApiState {
    pub fn new(submitter: Submitter, store: Arc<dyn TaskStore>) -> Self {
        Self {
            submitter: Arc::new(submitter),
            store,
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/task", post(submit_task))
        .route("/tasks", get(list_tasks))
        .route("/health", get(health))
        .with_state(state)
}

fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

async fn submit_task(
    State(state): State<ApiState>,
    body: Result<Json<NewTask>, JsonRejection>,
) -> Response {
    let Json(task) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return json_error(StatusCode::BAD_REQUEST, "invalid_json", rejection.body_text());
        }
    };

    match state.submitter.submit(task).await {
        Ok(_) => (StatusCode::CREATED, Json(json!({ "status": "queued" }))).into_response(),
        Err(SubmitError::BlankName) => {
            json_error(StatusCode::BAD_REQUEST, "invalid_task", "name must not be blank")
        }
        Err(SubmitError::Broker(err @ BrokerError::PublishTimeout(_))) => {
            warn!(error = %err, "task publish timed out");
            json_error(StatusCode::GATEWAY_TIMEOUT, "publish_timeout", err.to_string())
        }
        Err(SubmitError::Broker(err)) => {
            error!(error = %err, "task publish failed");
            json_error(StatusCode::BAD_GATEWAY, "publish_failed", err.to_string())
        }
        Err(SubmitError::Encode(err)) => {
            error!(error = %err, "task could not be encoded");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "encode_failed", err.to_string())
        }
    }
}

async fn list_tasks(State(state): State<ApiState>) -> Response {
    match state.store.list().await {
        Ok(tasks) => Json(tasks).into_response(),
        Err(err) => {
            error!(error = %err, "failed to list tasks");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_unavailable", err.to_string())
        }
    }
}

async fn health() -> &'static str {
    "ok"
}
