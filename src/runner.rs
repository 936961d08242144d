use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::captcha::CaptchaSolver;
use crate::deadline;
use crate::error::WorkflowError;
use crate::models::{LogLevel, RawRecord, Record, ScrapeRequest, TaskResult};
use crate::notify::{Notifier, NotifyOutcome};
use crate::portal::{PortalConnector, PortalError, PortalSession};
use crate::registry::Workflow;
use crate::task::Task;

/// External services a run depends on.
#[derive(Clone)]
pub struct Collaborators {
  pub portal: Arc<dyn PortalConnector>,
  pub solver: Arc<dyn CaptchaSolver>,
  pub notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkflowSettings {
  /// Upper bound for each authenticate and extract call.
  pub step_timeout: Duration,
  pub notify_timeout: Duration,
  /// Login submissions allowed while the portal keeps refusing the CAPTCHA answer.
  pub captcha_attempts: usize,
}

impl Default for WorkflowSettings {
  fn default() -> Self {
    Self {
      step_timeout: Duration::from_secs(180),
      notify_timeout: Duration::from_secs(20),
      captcha_attempts: 3,
    }
  }
}

fn timed_out(step: &str, limit: Duration) -> WorkflowError {
  WorkflowError::Network(format!("{step} timed out after {}s", limit.as_secs_f32()))
}

async fn bounded<T, E, F>(step: &str, limit: Duration, fut: F) -> Result<T, WorkflowError>
where
  F: Future<Output = Result<T, E>>,
  WorkflowError: From<E>,
{
  match tokio::time::timeout(limit, fut).await {
    Ok(outcome) => outcome.map_err(WorkflowError::from),
    Err(_) => Err(timed_out(step, limit)),
  }
}

/// One scrape run: authenticate, extract assignments and quizzes, compute
/// urgency, notify.
///
/// A failed extraction step fails the whole run; records gathered by
/// earlier steps are discarded.
pub struct ScrapeWorkflow {
  request: ScrapeRequest,
  collaborators: Collaborators,
  settings: WorkflowSettings,
}

impl ScrapeWorkflow {
  pub fn new(request: ScrapeRequest, collaborators: Collaborators, settings: WorkflowSettings) -> Self {
    Self { request, collaborators, settings }
  }

  /// A refused CAPTCHA answer gets a fresh challenge, up to
  /// `captcha_attempts` submissions. Any other rejection ends the run.
  async fn authenticate(&self, task: &Task, session: &dyn PortalSession) -> Result<(), WorkflowError> {
    let limit = self.settings.step_timeout;
    let attempts = self.settings.captcha_attempts.max(1);
    task.log(LogLevel::Info, format!("Attempting to log in as {}...", self.request.username)).await;

    let mut attempt = 1;
    loop {
      let challenge = bounded("loading the login page", limit, session.captcha()).await?;
      task.log(LogLevel::Info, "Solving CAPTCHA...").await;
      let solution = bounded(
        "solving the CAPTCHA",
        limit,
        self.collaborators.solver.solve(&self.request.captcha_api_key, &challenge),
      )
      .await?;

      let submitted = tokio::time::timeout(
        limit,
        session.login(&self.request.username, &self.request.password, &solution),
      )
      .await
      .map_err(|_| timed_out("submitting credentials", limit))?;
      match submitted {
        Ok(()) => {
          task.log(LogLevel::Success, "Login successful!").await;
          return Ok(());
        }
        Err(PortalError::CaptchaRejected(message)) if attempt < attempts => {
          task.log(
            LogLevel::Warning,
            format!("CAPTCHA rejected ({message}), retrying (attempt {}/{attempts})", attempt + 1),
          )
          .await;
          attempt += 1;
        }
        Err(err) => return Err(err.into()),
      }
    }
  }

  async fn extract<F>(&self, task: &Task, label: &str, fetch: F) -> Result<Vec<RawRecord>, WorkflowError>
  where
    F: Future<Output = Result<Vec<RawRecord>, PortalError>>,
  {
    task.log(LogLevel::Info, format!("Navigating to {label} page...")).await;
    let records = bounded(&format!("extracting {label}"), self.settings.step_timeout, fetch).await?;
    task.log(LogLevel::Success, format!("Successfully scraped {} {label}", records.len())).await;
    Ok(records)
  }

  async fn notify(&self, task: &Task, target: &str, assignments: &[Record], quizzes: &[Record]) {
    task.log(LogLevel::Info, "Sending deadline notification...").await;
    let sent = tokio::time::timeout(
      self.settings.notify_timeout,
      self.collaborators.notifier.notify(target, assignments, quizzes),
    )
    .await;
    match sent {
      Ok(Ok(NotifyOutcome::Sent { records, .. })) => {
        task.log(LogLevel::Success, format!("Notification sent for {records} upcoming deadlines")).await;
      }
      Ok(Ok(NotifyOutcome::Skipped)) => {
        task.log(LogLevel::Info, "No upcoming deadlines; notification skipped").await;
      }
      Ok(Err(err)) => {
        task.log(LogLevel::Warning, format!("Failed to send notification: {err}")).await;
      }
      Err(_) => {
        task.log(
          LogLevel::Warning,
          format!("Failed to send notification: timed out after {}s", self.settings.notify_timeout.as_secs_f32()),
        )
        .await;
      }
    }
  }
}

#[async_trait]
impl Workflow for ScrapeWorkflow {
  async fn run(self, task: Arc<Task>) -> Result<TaskResult, WorkflowError> {
    task.log(LogLevel::Info, "Connecting to the portal...").await;
    let session = self.collaborators.portal.connect()?;

    self.authenticate(&task, session.as_ref()).await?;
    let raw_assignments = self.extract(&task, "assignments", session.assignments()).await?;
    let raw_quizzes = self.extract(&task, "quizzes", session.quizzes()).await?;

    let now = Utc::now();
    let assignments = deadline::assess_all(raw_assignments, now);
    let quizzes = deadline::assess_all(raw_quizzes, now);
    task.log(
      LogLevel::Info,
      format!("Computed deadlines for {} assignments and {} quizzes", assignments.len(), quizzes.len()),
    )
    .await;

    if let Some(target) = &self.request.discord_webhook {
      self.notify(&task, target, &assignments, &quizzes).await;
    }

    task.log(LogLevel::Success, "Scraping task completed successfully").await;
    Ok(TaskResult {
      assignments,
      quizzes,
      message: "Scraping completed successfully".into(),
      completed_at: Utc::now(),
    })
  }
}
