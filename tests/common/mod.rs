#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use tokio::sync::Notify;

use deadline_watch::captcha::{CaptchaChallenge, CaptchaError, CaptchaSolver};
use deadline_watch::events::{Subscription, TaskEvent};
use deadline_watch::models::{RawRecord, Record, ScrapeRequest};
use deadline_watch::notify::{Notifier, NotifyError, NotifyOutcome};
use deadline_watch::portal::{PortalConnector, PortalError, PortalSession};
use deadline_watch::registry::TaskRegistry;
use deadline_watch::routes::AppContext;
use deadline_watch::runner::{Collaborators, WorkflowSettings};
use deadline_watch::task::Task;

pub const WAIT: Duration = Duration::from_secs(5);

/// In-memory portal. Each `connect` hands out a copy of the configured session.
#[derive(Clone, Default)]
pub struct StubPortal {
  pub assignments: Vec<RawRecord>,
  pub quizzes: Vec<RawRecord>,
  pub reject_login: Option<String>,
  /// The first `captcha_rejections` logins fail with a wrong-CAPTCHA message.
  pub captcha_rejections: usize,
  pub logins: Arc<AtomicUsize>,
  pub missing_quiz_table: bool,
  pub extract_delay: Option<Duration>,
  /// When set, assignment extraction waits for a permit.
  pub gate: Option<Arc<Notify>>,
}

impl PortalConnector for StubPortal {
  fn connect(&self) -> Result<Box<dyn PortalSession>, PortalError> {
    Ok(Box::new(self.clone()))
  }
}

#[async_trait]
impl PortalSession for StubPortal {
  async fn captcha(&self) -> Result<CaptchaChallenge, PortalError> {
    Ok(CaptchaChallenge { image: vec![0x89, 0x50, 0x4e, 0x47] })
  }

  async fn login(&self, _username: &str, _password: &str, _captcha_solution: &str) -> Result<(), PortalError> {
    let attempt = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
    if attempt <= self.captcha_rejections {
      return Err(PortalError::CaptchaRejected("Invalid CAPTCHA code".into()));
    }
    match &self.reject_login {
      Some(message) => Err(PortalError::Rejected(message.clone())),
      None => Ok(()),
    }
  }

  async fn assignments(&self) -> Result<Vec<RawRecord>, PortalError> {
    if let Some(gate) = &self.gate {
      gate.notified().await;
    }
    if let Some(delay) = self.extract_delay {
      tokio::time::sleep(delay).await;
    }
    Ok(self.assignments.clone())
  }

  async fn quizzes(&self) -> Result<Vec<RawRecord>, PortalError> {
    if self.missing_quiz_table {
      return Err(PortalError::Layout("table #gvQuiz not found".into()));
    }
    Ok(self.quizzes.clone())
  }
}

pub struct StubSolver {
  pub fail: bool,
}

#[async_trait]
impl CaptchaSolver for StubSolver {
  async fn solve(&self, _api_key: &str, _challenge: &CaptchaChallenge) -> Result<String, CaptchaError> {
    if self.fail {
      Err(CaptchaError::Service {
        code: "ERROR_ZERO_BALANCE".into(),
        description: "Account has zero balance".into(),
      })
    } else {
      Ok("x7k2".into())
    }
  }
}

/// Records every call as `(target, assignments, quizzes)`.
#[derive(Default)]
pub struct StubNotifier {
  pub calls: Mutex<Vec<(String, usize, usize)>>,
  pub delay: Option<Duration>,
}

#[async_trait]
impl Notifier for StubNotifier {
  async fn notify(&self, target: &str, assignments: &[Record], quizzes: &[Record]) -> Result<NotifyOutcome, NotifyError> {
    self.calls.lock().unwrap().push((target.to_string(), assignments.len(), quizzes.len()));
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    Ok(NotifyOutcome::Sent { records: assignments.len() + quizzes.len(), messages: 1 })
  }
}

pub fn raw(title: &str, days_from_now: Option<i64>) -> RawRecord {
  RawRecord {
    title: title.into(),
    course: "CS201 Data Structures".into(),
    deadline: days_from_now.map(|days| Utc::now() + TimeDelta::days(days)),
    submission: "Not Submitted".into(),
    url: Some(format!("https://dulms.example/items/{title}")),
  }
}

/// Assignment due in one day, quiz due in ten.
pub fn scenario_portal() -> StubPortal {
  StubPortal {
    assignments: vec![raw("Linked lists lab", Some(1))],
    quizzes: vec![raw("Quiz 2", Some(10))],
    ..StubPortal::default()
  }
}

pub fn request(discord_webhook: Option<&str>) -> ScrapeRequest {
  ScrapeRequest {
    username: "student".into(),
    password: "hunter2".into(),
    captcha_api_key: "solver-key".into(),
    discord_webhook: discord_webhook.map(str::to_string),
  }
}

pub fn collaborators(portal: StubPortal, solver: StubSolver, notifier: Arc<dyn Notifier>) -> Collaborators {
  Collaborators {
    portal: Arc::new(portal),
    solver: Arc::new(solver),
    notifier,
  }
}

pub fn fast_settings() -> WorkflowSettings {
  WorkflowSettings {
    step_timeout: Duration::from_secs(2),
    notify_timeout: Duration::from_secs(2),
    captcha_attempts: 3,
  }
}

pub fn context(collaborators: Collaborators) -> AppContext {
  AppContext {
    registry: Arc::new(TaskRegistry::default()),
    collaborators,
    workflow: fast_settings(),
  }
}

/// Every event up to and including `Closed`.
pub async fn drain(mut subscription: Subscription) -> Vec<TaskEvent> {
  tokio::time::timeout(WAIT, async move {
    let mut events = Vec::new();
    while let Some(event) = subscription.recv().await {
      events.push(event);
    }
    events
  })
  .await
  .expect("subscription did not close in time")
}

pub async fn wait_until_finished(task: &Task) {
  tokio::time::timeout(WAIT, async {
    while !task.status().await.is_terminal() {
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  })
  .await
  .expect("task did not finish in time")
}
