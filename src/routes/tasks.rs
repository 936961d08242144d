use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;
use warp::{Filter, Rejection, Reply};

use super::{ApiError, AppContext, with_context};
use crate::error::{ErrorKind, ValidationError};
use crate::models::{LogEntry, Record, ScrapeRequest, TaskSnapshot, TaskStatus};
use crate::runner::ScrapeWorkflow;
use crate::task::Task;

const MAX_BODY_BYTES: u64 = 16 * 1024;

static WEBHOOK_URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^https?://\S+$").expect("webhook pattern is valid"));

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct NewScrape {
  pub username: String,
  pub password: String,
  pub captcha_api_key: String,
  pub discord_webhook: Option<String>,
}

impl NewScrape {
  pub fn validate(self) -> Result<ScrapeRequest, ValidationError> {
    for (field, value) in [
      ("username", &self.username),
      ("password", &self.password),
      ("captcha_api_key", &self.captcha_api_key),
    ] {
      if value.trim().is_empty() {
        return Err(ValidationError::new(field, format!("Missing required field '{field}'")));
      }
    }

    let discord_webhook = self
      .discord_webhook
      .map(|url| url.trim().to_string())
      .filter(|url| !url.is_empty());
    if let Some(url) = &discord_webhook {
      if !WEBHOOK_URL.is_match(url) {
        return Err(ValidationError::new("discord_webhook", "discord_webhook must be an http(s) URL"));
      }
    }

    Ok(ScrapeRequest {
      username: self.username.trim().to_string(),
      password: self.password,
      captcha_api_key: self.captcha_api_key.trim().to_string(),
      discord_webhook,
    })
  }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskResponse {
  pub task_id: Uuid,
  pub status: String,
  pub sse_url: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
  pub task_id: Uuid,
  pub status: TaskStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub assignments: Option<Vec<Record>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub quizzes: Option<Vec<Record>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error_kind: Option<ErrorKind>,
  pub log: Vec<LogEntry>,
}

impl From<TaskSnapshot> for StatusResponse {
  fn from(snapshot: TaskSnapshot) -> Self {
    let (message, assignments, quizzes) = match snapshot.result {
      Some(result) => (Some(result.message), Some(result.assignments), Some(result.quizzes)),
      None => (None, None, None),
    };
    let (error, error_kind) = match snapshot.error {
      Some(err) => (Some(err.message), Some(err.kind)),
      None => (None, None),
    };
    Self {
      task_id: snapshot.id,
      status: snapshot.status,
      message,
      assignments,
      quizzes,
      error,
      error_kind,
      log: snapshot.log,
    }
  }
}

pub fn scrape_route(ctx: AppContext) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("api" / "v1" / "scraper" / "scrape")
    .and(warp::post())
    .and(warp::body::content_length_limit(MAX_BODY_BYTES))
    .and(warp::body::json())
    .and(with_context(ctx))
    .and_then(handle_scrape)
}

pub fn status_route(ctx: AppContext) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("api" / "v1" / "scraper" / "status" / String)
    .and(warp::get())
    .and(with_context(ctx))
    .and_then(handle_status)
}

/// Malformed and unknown ids are indistinguishable to callers.
pub(super) async fn lookup(ctx: &AppContext, raw_id: &str) -> Result<Arc<Task>, Rejection> {
  let not_found = || warp::reject::custom(ApiError::NotFound(raw_id.to_string()));
  let id = Uuid::parse_str(raw_id).map_err(|_| not_found())?;
  ctx.registry.get(id).await.map_err(|_| not_found())
}

async fn handle_scrape(body: NewScrape, ctx: AppContext) -> Result<impl Reply, Rejection> {
  let request = body.validate().map_err(|e| {
    warn!(field = e.field, error = %e, "scrape request rejected");
    warp::reject::custom(ApiError::from(e))
  })?;

  let task = ctx.registry.create().await;
  let task_id = task.id();
  info!(%task_id, username = %request.username, notify = request.discord_webhook.is_some(), "scrape task submitted");

  let workflow = ScrapeWorkflow::new(request, ctx.collaborators.clone(), ctx.workflow);
  ctx.registry
    .start(task_id, workflow)
    .await
    .map_err(|e| warp::reject::custom(ApiError::Internal(e.to_string())))?;

  Ok(warp::reply::json(&TaskResponse {
    task_id,
    status: "started".into(),
    sse_url: format!("/api/v1/scraper/logs/{task_id}"),
  }))
}

async fn handle_status(raw_id: String, ctx: AppContext) -> Result<impl Reply, Rejection> {
  let task = lookup(&ctx, &raw_id).await?;
  let response = StatusResponse::from(task.snapshot().await);
  Ok(warp::reply::json(&response))
}
