use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio_retry::RetryIf;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, info, warn};

/// Errors the solving service reports for a single bad image or a busy
/// queue. Everything else (bad key, zero balance, ...) is permanent.
const TRANSIENT_SERVICE_CODES: [&str; 2] = ["ERROR_CAPTCHA_UNSOLVABLE", "ERROR_NO_SLOT_AVAILABLE"];

/// CAPTCHA image taken from the login page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaChallenge {
  pub image: Vec<u8>,
}

impl CaptchaChallenge {
  pub fn to_base64(&self) -> String {
    STANDARD.encode(&self.image)
  }
}

#[derive(Debug, Error)]
pub enum CaptchaError {
  #[error("solver request failed: {0}")]
  Request(#[from] reqwest::Error),
  #[error("solver rejected the task: {code} ({description})")]
  Service { code: String, description: String },
  #[error("no solution after {polls} polls")]
  Unsolved { polls: u32 },
  #[error("CAPTCHA image is empty")]
  EmptyChallenge,
}

impl CaptchaError {
  pub fn is_retryable(&self) -> bool {
    match self {
      CaptchaError::Request(e) => e.is_timeout() || e.is_connect() || e.status().is_some_and(|s| s.is_server_error()),
      CaptchaError::Service { code, .. } => TRANSIENT_SERVICE_CODES.contains(&code.as_str()),
      CaptchaError::Unsolved { .. } => true,
      CaptchaError::EmptyChallenge => false,
    }
  }
}

/// Turns a challenge into the text to type. Implementations own any retry
/// policy; callers treat one call as one outcome.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
  async fn solve(&self, api_key: &str, challenge: &CaptchaChallenge) -> Result<String, CaptchaError>;
}

#[derive(Debug, Clone)]
pub struct SolverSettings {
  pub attempts: usize,
  pub poll_interval: Duration,
  pub max_polls: u32,
  /// Multiplier for the exponential backoff between attempts.
  pub backoff_unit: Duration,
  pub request_timeout: Duration,
}

impl Default for SolverSettings {
  fn default() -> Self {
    Self {
      attempts: 3,
      poll_interval: Duration::from_secs(2),
      max_polls: 30,
      backoff_unit: Duration::from_millis(250),
      request_timeout: Duration::from_secs(20),
    }
  }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskResponse {
  error_id: i64,
  error_code: Option<String>,
  error_description: Option<String>,
  task_id: Option<i64>,
}

#[derive(Deserialize)]
struct Solution {
  text: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskResultResponse {
  error_id: i64,
  error_code: Option<String>,
  error_description: Option<String>,
  status: Option<String>,
  solution: Option<Solution>,
}

fn service_error(code: Option<String>, description: Option<String>) -> CaptchaError {
  CaptchaError::Service {
    code: code.unwrap_or_else(|| "UNKNOWN".into()),
    description: description.unwrap_or_default(),
  }
}

/// Client for Anti-Captcha style `createTask` / `getTaskResult` APIs.
pub struct AntiCaptchaSolver {
  client: reqwest::Client,
  base_url: String,
  settings: SolverSettings,
}

impl AntiCaptchaSolver {
  pub fn new(base_url: impl Into<String>, settings: SolverSettings) -> Result<Self, CaptchaError> {
    let client = reqwest::Client::builder()
      .timeout(settings.request_timeout)
      .build()?;
    Ok(Self {
      client,
      base_url: base_url.into().trim_end_matches('/').to_string(),
      settings,
    })
  }

  async fn solve_once(&self, api_key: &str, challenge: &CaptchaChallenge) -> Result<String, CaptchaError> {
    info!("Submitting CAPTCHA to solving service...");
    let created: CreateTaskResponse = self.client
      .post(format!("{}/createTask", self.base_url))
      .json(&json!({
        "clientKey": api_key,
        "task": { "type": "ImageToTextTask", "body": challenge.to_base64() },
      }))
      .send()
      .await?
      .error_for_status()?
      .json()
      .await?;
    if created.error_id != 0 {
      return Err(service_error(created.error_code, created.error_description));
    }
    let Some(task_id) = created.task_id else {
      return Err(service_error(Some("MISSING_TASK_ID".into()), None));
    };

    for poll in 1..=self.settings.max_polls {
      tokio::time::sleep(self.settings.poll_interval).await;
      let result: TaskResultResponse = self.client
        .post(format!("{}/getTaskResult", self.base_url))
        .json(&json!({ "clientKey": api_key, "taskId": task_id }))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
      if result.error_id != 0 {
        return Err(service_error(result.error_code, result.error_description));
      }
      match (result.status.as_deref(), result.solution) {
        (Some("ready"), Some(solution)) => {
          info!(task_id, poll, "CAPTCHA solution received");
          return Ok(solution.text);
        }
        _ => debug!(task_id, poll, "CAPTCHA still processing"),
      }
    }
    Err(CaptchaError::Unsolved { polls: self.settings.max_polls })
  }
}

#[async_trait]
impl CaptchaSolver for AntiCaptchaSolver {
  async fn solve(&self, api_key: &str, challenge: &CaptchaChallenge) -> Result<String, CaptchaError> {
    if challenge.image.is_empty() {
      return Err(CaptchaError::EmptyChallenge);
    }
    let unit = self.settings.backoff_unit.as_millis().max(1) as u64;
    let strategy = ExponentialBackoff::from_millis(2)
      .factor(unit)
      .max_delay(Duration::from_secs(10))
      .take(self.settings.attempts.saturating_sub(1));

    RetryIf::start(
      strategy,
      || self.solve_once(api_key, challenge),
      |err: &CaptchaError| {
        let retry = err.is_retryable();
        if retry {
          warn!(error = %err, "CAPTCHA attempt failed, retrying");
        }
        retry
      },
    )
    .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use wiremock::matchers::{body_partial_json, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn fast_settings() -> SolverSettings {
    SolverSettings {
      attempts: 3,
      poll_interval: Duration::from_millis(1),
      max_polls: 3,
      backoff_unit: Duration::from_millis(1),
      request_timeout: Duration::from_secs(5),
    }
  }

  fn challenge() -> CaptchaChallenge {
    CaptchaChallenge { image: vec![0x89, 0x50, 0x4e, 0x47] }
  }

  #[test]
  fn challenge_encodes_as_base64() {
    assert_eq!(challenge().to_base64(), "iVBORw==");
  }

  #[tokio::test]
  async fn solves_after_polling() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/createTask"))
      .and(body_partial_json(json!({ "clientKey": "key-1", "task": { "type": "ImageToTextTask", "body": "iVBORw==" } })))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "errorId": 0, "taskId": 7 })))
      .expect(1)
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(path("/getTaskResult"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "errorId": 0, "status": "processing" })))
      .up_to_n_times(1)
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(path("/getTaskResult"))
      .and(body_partial_json(json!({ "taskId": 7 })))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "errorId": 0, "status": "ready", "solution": { "text": "x7k2" }
      })))
      .mount(&server)
      .await;

    let solver = AntiCaptchaSolver::new(server.uri(), fast_settings()).unwrap();
    assert_eq!(solver.solve("key-1", &challenge()).await.unwrap(), "x7k2");
  }

  #[tokio::test]
  async fn permanent_service_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/createTask"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "errorId": 1,
        "errorCode": "ERROR_KEY_DOES_NOT_EXIST",
        "errorDescription": "Account authorization key not found in the system",
      })))
      .expect(1)
      .mount(&server)
      .await;

    let solver = AntiCaptchaSolver::new(server.uri(), fast_settings()).unwrap();
    let err = solver.solve("bad", &challenge()).await.unwrap_err();
    assert!(matches!(err, CaptchaError::Service { ref code, .. } if code == "ERROR_KEY_DOES_NOT_EXIST"));
    assert!(!err.is_retryable());
  }

  #[tokio::test]
  async fn transient_failures_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/createTask"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "errorId": 12, "errorCode": "ERROR_CAPTCHA_UNSOLVABLE", "errorDescription": "Workers could not solve the Captcha"
      })))
      .up_to_n_times(1)
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(path("/createTask"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "errorId": 0, "taskId": 9 })))
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(path("/getTaskResult"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "errorId": 0, "status": "ready", "solution": { "text": "abcd" }
      })))
      .mount(&server)
      .await;

    let solver = AntiCaptchaSolver::new(server.uri(), fast_settings()).unwrap();
    assert_eq!(solver.solve("key", &challenge()).await.unwrap(), "abcd");
  }

  #[tokio::test]
  async fn gives_up_after_all_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/createTask"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "errorId": 0, "taskId": 1 })))
      .expect(3)
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(path("/getTaskResult"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "errorId": 0, "status": "processing" })))
      .mount(&server)
      .await;

    let solver = AntiCaptchaSolver::new(server.uri(), fast_settings()).unwrap();
    let err = solver.solve("key", &challenge()).await.unwrap_err();
    assert!(matches!(err, CaptchaError::Unsolved { polls: 3 }));
  }

  #[tokio::test]
  async fn empty_images_are_rejected_without_a_request() {
    let solver = AntiCaptchaSolver::new("http://127.0.0.1:9", fast_settings()).unwrap();
    let err = solver.solve("key", &CaptchaChallenge { image: vec![] }).await.unwrap_err();
    assert!(matches!(err, CaptchaError::EmptyChallenge));
  }
}
