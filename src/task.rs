use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::events::{EventChannel, EventKind, Subscription};
use crate::models::{LogEntry, LogLevel, TaskError, TaskResult, TaskSnapshot, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid status transition from {from} to {to}")]
pub struct TransitionError {
  pub from: TaskStatus,
  pub to: TaskStatus,
}

struct TaskState {
  status: TaskStatus,
  log: Vec<LogEntry>,
  result: Option<Arc<TaskResult>>,
  error: Option<TaskError>,
  finished_at: Option<DateTime<Utc>>,
}

/// Mutable record of one run plus the channel its progress is published on.
///
/// Every mutation publishes its event while the state lock is held, so the
/// stored log and the event sequence always agree on order.
pub struct Task {
  id: Uuid,
  created_at: DateTime<Utc>,
  state: Mutex<TaskState>,
  events: EventChannel,
}

impl Task {
  pub fn new(event_capacity: usize) -> Self {
    Self {
      id: Uuid::new_v4(),
      created_at: Utc::now(),
      state: Mutex::new(TaskState {
        status: TaskStatus::Pending,
        log: Vec::new(),
        result: None,
        error: None,
        finished_at: None,
      }),
      events: EventChannel::new(event_capacity),
    }
  }

  pub fn id(&self) -> Uuid {
    self.id
  }

  pub fn created_at(&self) -> DateTime<Utc> {
    self.created_at
  }

  pub async fn status(&self) -> TaskStatus {
    self.state.lock().await.status
  }

  pub async fn finished_at(&self) -> Option<DateTime<Utc>> {
    self.state.lock().await.finished_at
  }

  pub async fn snapshot(&self) -> TaskSnapshot {
    let state = self.state.lock().await;
    TaskSnapshot {
      id: self.id,
      status: state.status,
      created_at: self.created_at,
      finished_at: state.finished_at,
      log: state.log.clone(),
      result: state.result.as_deref().cloned(),
      error: state.error.clone(),
    }
  }

  pub async fn subscribe(&self) -> Subscription {
    self.events.subscribe().await
  }

  /// Append a log line and publish it. Ignored once the task is terminal.
  pub async fn log(&self, level: LogLevel, message: impl Into<String>) -> bool {
    let message = message.into();
    let mut state = self.state.lock().await;
    if state.status.is_terminal() {
      warn!(task_id = %self.id, %message, "log entry after terminal status dropped");
      return false;
    }
    match level {
      LogLevel::Info | LogLevel::Success => info!(task_id = %self.id, "{message}"),
      LogLevel::Warning => warn!(task_id = %self.id, "{message}"),
      LogLevel::Error => error!(task_id = %self.id, "{message}"),
    }
    let entry = LogEntry::new(level, message);
    state.log.push(entry.clone());
    self.events.publish(EventKind::Log(entry)).await;
    true
  }

  /// Move to a non-terminal status (in practice `Running`).
  pub async fn transition(&self, next: TaskStatus) -> Result<(), TransitionError> {
    let mut state = self.state.lock().await;
    Self::check(&state, next)?;
    state.status = next;
    self.events.publish(EventKind::StatusChange(next)).await;
    if next.is_terminal() {
      state.finished_at = Some(Utc::now());
      self.events.close().await;
    }
    Ok(())
  }

  /// Record the result, then publish `StatusChange(Completed)`, `Result`, `Closed`.
  pub async fn complete(&self, result: TaskResult) -> Result<(), TransitionError> {
    let mut state = self.state.lock().await;
    Self::check(&state, TaskStatus::Completed)?;
    let result = Arc::new(result);
    state.result = Some(result.clone());
    state.status = TaskStatus::Completed;
    state.finished_at = Some(Utc::now());
    info!(
      task_id = %self.id,
      assignments = result.assignments.len(),
      quizzes = result.quizzes.len(),
      "task completed"
    );

    self.events.publish(EventKind::StatusChange(TaskStatus::Completed)).await;
    self.events.publish(EventKind::Result(result)).await;
    self.events.close().await;
    Ok(())
  }

  /// Record the error, then publish `Error`, `StatusChange(Failed)`, `Closed`.
  pub async fn fail(&self, err: &WorkflowError) -> Result<(), TransitionError> {
    let mut state = self.state.lock().await;
    Self::check(&state, TaskStatus::Failed)?;
    let task_error = TaskError {
      kind: err.kind(),
      message: err.to_string(),
    };
    error!(task_id = %self.id, kind = %task_error.kind, "task failed: {}", task_error.message);

    let entry = LogEntry::new(LogLevel::Error, format!("Scraping task failed: {}", task_error.message));
    state.log.push(entry.clone());
    self.events.publish(EventKind::Log(entry)).await;

    state.error = Some(task_error.clone());
    state.status = TaskStatus::Failed;
    state.finished_at = Some(Utc::now());
    self.events.publish(EventKind::Error(task_error)).await;
    self.events.publish(EventKind::StatusChange(TaskStatus::Failed)).await;
    self.events.close().await;
    Ok(())
  }

  fn check(state: &TaskState, next: TaskStatus) -> Result<(), TransitionError> {
    if state.status.can_transition_to(next) {
      Ok(())
    } else {
      Err(TransitionError { from: state.status, to: next })
    }
  }
}
