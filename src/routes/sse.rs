use std::convert::Infallible;

use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};
use warp::sse::Event;
use warp::{Filter, Rejection, Reply};

use super::tasks::lookup;
use super::{AppContext, with_context};
use crate::events::{EventKind, TaskEvent};

pub fn logs_route(ctx: AppContext) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("api" / "v1" / "scraper" / "logs" / String)
    .and(warp::get())
    .and(with_context(ctx))
    .and_then(handle_logs)
}

fn with_json(event: Event, data: &impl Serialize) -> Event {
  match serde_json::to_string(data) {
    Ok(body) => event.data(body),
    Err(err) => {
      warn!(error = %err, "could not encode event payload");
      event.data("{}")
    }
  }
}

/// Wire form of one task event.
pub fn to_sse(event: &TaskEvent) -> Event {
  let base = Event::default().id(event.sequence.to_string());
  match &event.kind {
    EventKind::Log(entry) => with_json(base.event("log"), entry),
    EventKind::StatusChange(status) => with_json(base.event("status"), &json!({ "status": status })),
    EventKind::Result(result) => with_json(
      base.event("result"),
      &json!({ "assignments": result.assignments, "quizzes": result.quizzes }),
    ),
    EventKind::Error(err) => with_json(base.event("error"), &json!({ "message": err.message, "kind": err.kind })),
    EventKind::Closed => base.event("close").data(""),
  }
}

async fn handle_logs(raw_id: String, ctx: AppContext) -> Result<impl Reply, Rejection> {
  let task = lookup(&ctx, &raw_id).await?;
  let task_id = task.id();
  let subscription = task.subscribe().await;
  debug!(%task_id, "observer attached");

  let stream = subscription
    .into_stream()
    .map(|event| Ok::<_, Infallible>(to_sse(&event)));
  Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)))
}
