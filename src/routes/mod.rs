use std::convert::Infallible;
use std::sync::Arc;

use serde_json::json;
use thiserror::Error;
use tracing::error;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::error::ValidationError;
use crate::registry::TaskRegistry;
use crate::runner::{Collaborators, WorkflowSettings};

pub mod sse;
pub mod tasks;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppContext {
  pub registry: Arc<TaskRegistry>,
  pub collaborators: Collaborators,
  pub workflow: WorkflowSettings,
}

#[derive(Debug, Error)]
pub enum ApiError {
  #[error(transparent)]
  Validation(#[from] ValidationError),
  #[error("Task {0} not found")]
  NotFound(String),
  #[error("{0}")]
  Internal(String),
}

impl warp::reject::Reject for ApiError {}

fn with_context(ctx: AppContext) -> impl Filter<Extract = (AppContext,), Error = Infallible> + Clone {
  warp::any().map(move || ctx.clone())
}

pub fn routes(ctx: AppContext) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
  health_route(ctx.clone())
    .or(tasks::scrape_route(ctx.clone()))
    .or(tasks::status_route(ctx.clone()))
    .or(sse::logs_route(ctx))
    .recover(handle_rejection)
}

fn health_route(ctx: AppContext) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("health")
    .and(warp::get())
    .and(with_context(ctx))
    .and_then(|ctx: AppContext| async move {
      let tasks = ctx.registry.len().await;
      Ok::<_, Infallible>(warp::reply::json(&json!({ "status": "ok", "tasks": tasks })))
    })
}

fn error_reply(status: StatusCode, code: &str, message: impl Into<String>) -> warp::reply::WithStatus<warp::reply::Json> {
  let message = message.into();
  warp::reply::with_status(warp::reply::json(&json!({ "error": message, "code": code })), status)
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
  let reply = if let Some(api) = err.find::<ApiError>() {
    match api {
      ApiError::Validation(e) => error_reply(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string()),
      ApiError::NotFound(_) => error_reply(StatusCode::NOT_FOUND, "NOT_FOUND", api.to_string()),
      ApiError::Internal(message) => {
        error!(error = %message, "request failed");
        error_reply(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", "Internal server error")
      }
    }
  } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
    error_reply(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", format!("Invalid request body: {e}"))
  } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
    error_reply(StatusCode::PAYLOAD_TOO_LARGE, "VALIDATION_ERROR", "Request body too large")
  } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
    error_reply(StatusCode::UNSUPPORTED_MEDIA_TYPE, "VALIDATION_ERROR", "Expected a JSON body")
  } else if err.is_not_found() {
    error_reply(StatusCode::NOT_FOUND, "NOT_FOUND", "Route not found")
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    error_reply(StatusCode::METHOD_NOT_ALLOWED, "METHOD_NOT_ALLOWED", "Method not allowed")
  } else {
    error!(rejection = ?err, "unhandled rejection");
    error_reply(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", "Internal server error")
  };
  Ok(reply)
}
