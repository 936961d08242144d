use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::captcha::CaptchaError;
use crate::portal::PortalError;

/// Stable classification of every failure the service can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
  ValidationError,
  AuthError,
  NetworkError,
  ScrapeError,
  NotificationError,
  InternalError,
}

impl std::fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      ErrorKind::ValidationError => "ValidationError",
      ErrorKind::AuthError => "AuthError",
      ErrorKind::NetworkError => "NetworkError",
      ErrorKind::ScrapeError => "ScrapeError",
      ErrorKind::NotificationError => "NotificationError",
      ErrorKind::InternalError => "InternalError",
    };
    f.write_str(name)
  }
}

/// Rejected input. Raised before a task exists and never stored on one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
  pub field: &'static str,
  pub message: String,
}

impl ValidationError {
  pub fn new(field: &'static str, message: impl Into<String>) -> Self {
    Self { field, message: message.into() }
  }
}

/// A fault that ends a run. Captured by the registry and recorded on the task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
  #[error("Authentication failed: {0}")]
  Auth(String),
  #[error("Network failure: {0}")]
  Network(String),
  #[error("Unexpected portal content: {0}")]
  Scrape(String),
  #[error("Internal error: {0}")]
  Internal(String),
}

impl WorkflowError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      WorkflowError::Auth(_) => ErrorKind::AuthError,
      WorkflowError::Network(_) => ErrorKind::NetworkError,
      WorkflowError::Scrape(_) => ErrorKind::ScrapeError,
      WorkflowError::Internal(_) => ErrorKind::InternalError,
    }
  }
}

impl From<PortalError> for WorkflowError {
  fn from(err: PortalError) -> Self {
    match err {
      PortalError::Rejected(message) | PortalError::CaptchaRejected(message) => WorkflowError::Auth(message),
      PortalError::Network(e) => WorkflowError::Network(e.to_string()),
      PortalError::Layout(message) => WorkflowError::Scrape(message),
    }
  }
}

impl From<CaptchaError> for WorkflowError {
  // Any solver failure means we could not get past the login form.
  fn from(err: CaptchaError) -> Self {
    WorkflowError::Auth(format!("CAPTCHA could not be solved: {err}"))
  }
}
