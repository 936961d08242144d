use serde::{Serialize, Deserialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
  Pending,
  Running,
  Completed,
  #[serde(rename = "error")]
  Failed,
}

impl TaskStatus {
  fn rank(self) -> u8 {
    match self {
      TaskStatus::Pending => 0,
      TaskStatus::Running => 1,
      TaskStatus::Completed | TaskStatus::Failed => 2,
    }
  }

  pub fn is_terminal(self) -> bool {
    matches!(self, TaskStatus::Completed | TaskStatus::Failed)
  }

  /// Forward-only: a status may only move to a strictly later stage.
  pub fn can_transition_to(self, next: TaskStatus) -> bool {
    next.rank() > self.rank()
  }

  pub fn as_str(self) -> &'static str {
    match self {
      TaskStatus::Pending => "pending",
      TaskStatus::Running => "running",
      TaskStatus::Completed => "completed",
      TaskStatus::Failed => "error",
    }
  }
}

impl std::fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
  Info,
  Warning,
  Error,
  Success,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
  pub timestamp: DateTime<Utc>,
  pub level: LogLevel,
  pub message: String,
}

impl LogEntry {
  pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
    Self {
      timestamp: Utc::now(),
      level,
      message: message.into(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
  Urgent,
  Warning,
  Normal,
}

/// A row as the portal reports it, before urgency is derived.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
  pub title: String,
  pub course: String,
  pub deadline: Option<DateTime<Utc>>,
  pub submission: String,
  pub url: Option<String>,
}

/// One assignment or quiz with its urgency snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  pub title: String,
  pub course: String,
  pub deadline: Option<DateTime<Utc>>,
  pub days_remaining: Option<i64>,
  #[serde(rename = "status")]
  pub urgency: Urgency,
  pub submission: String,
  pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
  pub assignments: Vec<Record>,
  pub quizzes: Vec<Record>,
  pub message: String,
  pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
  pub kind: ErrorKind,
  pub message: String,
}

/// Everything a caller needs to start a run. The password and the
/// solver key never show up in `Debug` output.
#[derive(Clone)]
pub struct ScrapeRequest {
  pub username: String,
  pub password: String,
  pub captcha_api_key: String,
  pub discord_webhook: Option<String>,
}

impl std::fmt::Debug for ScrapeRequest {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ScrapeRequest")
      .field("username", &self.username)
      .field("password", &"<redacted>")
      .field("captcha_api_key", &"<redacted>")
      .field("discord_webhook", &self.discord_webhook.as_ref().map(|_| "<set>"))
      .finish()
  }
}

/// Point-in-time copy of a task, safe to hand to readers.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
  pub id: Uuid,
  pub status: TaskStatus,
  pub created_at: DateTime<Utc>,
  pub finished_at: Option<DateTime<Utc>>,
  pub log: Vec<LogEntry>,
  pub result: Option<TaskResult>,
  pub error: Option<TaskError>,
}
