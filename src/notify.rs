use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::info;

use crate::models::{Record, Urgency};

const ALERT_CONTENT: &str = "\u{1F6A8} **DULMS Upcoming Deadlines Alert** \u{1F6A8}";

/// Discord rejects messages with more than ten embeds.
const MAX_EMBEDS_PER_MESSAGE: usize = 10;

const COLOR_URGENT: u32 = 0xFF0000;
const COLOR_WARNING: u32 = 0xFFFF00;
const COLOR_DONE: u32 = 0x00FF00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
  Sent { records: usize, messages: usize },
  /// Nothing was due within the threshold.
  Skipped,
}

#[derive(Debug, Error)]
pub enum NotifyError {
  #[error("HTTP request failed: {0}")]
  Request(#[from] reqwest::Error),
  #[error("Webhook returned HTTP {0}")]
  HttpStatus(u16),
}

#[async_trait]
pub trait Notifier: Send + Sync {
  async fn notify(&self, target: &str, assignments: &[Record], quizzes: &[Record]) -> Result<NotifyOutcome, NotifyError>;
}

fn is_done(record: &Record) -> bool {
  let submission = record.submission.to_lowercase();
  submission == "submitted" || submission == "completed"
}

/// Records due within `threshold_days` (overdue ones included).
pub fn upcoming(records: &[Record], threshold_days: i64) -> impl Iterator<Item = &Record> {
  records
    .iter()
    .filter(move |record| record.days_remaining.is_some_and(|days| days <= threshold_days))
}

pub fn embed(record: &Record) -> Value {
  let color = if is_done(record) {
    COLOR_DONE
  } else if record.urgency == Urgency::Urgent {
    COLOR_URGENT
  } else {
    COLOR_WARNING
  };
  let deadline = record
    .deadline
    .map(|d| d.format("%d/%m/%Y").to_string())
    .unwrap_or_else(|| "Not published".into());
  let days = record.days_remaining.map(|d| d.to_string()).unwrap_or_else(|| "-".into());

  let mut embed = json!({
    "title": record.title,
    "description": format!(
      "**Course:** {}\n**Deadline:** {}\n**Days Remaining:** {}\n**Status:** {}",
      record.course, deadline, days, record.submission
    ),
    "color": color,
  });
  if let Some(url) = &record.url {
    embed["url"] = json!(url);
  }
  embed
}

/// Posts deadline alerts to a Discord webhook URL.
pub struct DiscordNotifier {
  client: reqwest::Client,
  threshold_days: i64,
}

impl DiscordNotifier {
  pub fn new(threshold_days: i64, request_timeout: Duration) -> Result<Self, NotifyError> {
    let client = reqwest::Client::builder().timeout(request_timeout).build()?;
    Ok(Self { client, threshold_days })
  }

  async fn post(&self, target: &str, payload: &Value) -> Result<(), NotifyError> {
    let response = self.client.post(target).json(payload).send().await?;
    if !response.status().is_success() {
      return Err(NotifyError::HttpStatus(response.status().as_u16()));
    }
    Ok(())
  }
}

#[async_trait]
impl Notifier for DiscordNotifier {
  async fn notify(&self, target: &str, assignments: &[Record], quizzes: &[Record]) -> Result<NotifyOutcome, NotifyError> {
    let embeds: Vec<Value> = upcoming(assignments, self.threshold_days)
      .chain(upcoming(quizzes, self.threshold_days))
      .map(embed)
      .collect();
    if embeds.is_empty() {
      return Ok(NotifyOutcome::Skipped);
    }

    let mut messages = 0;
    for (index, batch) in embeds.chunks(MAX_EMBEDS_PER_MESSAGE).enumerate() {
      let content = if index == 0 { ALERT_CONTENT } else { "(continued)" };
      self.post(target, &json!({ "content": content, "embeds": batch })).await?;
      messages += 1;
    }
    info!(records = embeds.len(), messages, "Discord notification sent");
    Ok(NotifyOutcome::Sent { records: embeds.len(), messages })
  }
}
