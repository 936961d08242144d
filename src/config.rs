use std::env;
use std::fmt::Display;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::captcha::SolverSettings;
use crate::runner::WorkflowSettings;

#[derive(Debug, Clone)]
pub struct Config {
  pub server_host: IpAddr,
  pub server_port: u16,
  pub portal_base_url: String,
  pub captcha_api_url: String,
  pub captcha_solve_retries: usize,
  pub captcha_poll_interval: Duration,
  pub captcha_max_polls: u32,
  pub request_timeout: Duration,
  pub step_timeout: Duration,
  pub notify_timeout: Duration,
  pub deadline_threshold_days: i64,
  pub event_buffer: usize,
  pub task_retention: Duration,
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
  T: FromStr,
  T::Err: Display,
{
  match lookup(name) {
    Some(raw) => raw
      .trim()
      .parse()
      .map_err(|e| anyhow::anyhow!("{e}"))
      .with_context(|| format!("{name} has an invalid value {raw:?}")),
    None => Ok(default),
  }
}

impl Config {
  /// Reads the process environment (after loading `.env` if present).
  pub fn from_env() -> Result<Self> {
    let _ = dotenvy::dotenv();
    Self::from_lookup(|name| env::var(name).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let config = Self {
      server_host: parse_or(&lookup, "SERVER_HOST", IpAddr::from([0, 0, 0, 0]))?,
      server_port: parse_or(&lookup, "SERVER_PORT", 8080)?,
      portal_base_url: lookup("DULMS_BASE_URL").unwrap_or_else(|| "https://dulms.deltauniv.edu.eg".into()),
      captcha_api_url: lookup("CAPTCHA_API_URL").unwrap_or_else(|| "https://api.anti-captcha.com".into()),
      captcha_solve_retries: parse_or(&lookup, "CAPTCHA_SOLVE_RETRIES", 3)?,
      captcha_poll_interval: Duration::from_millis(parse_or(&lookup, "CAPTCHA_POLL_INTERVAL_MS", 2000)?),
      captcha_max_polls: parse_or(&lookup, "CAPTCHA_MAX_POLLS", 30)?,
      request_timeout: Duration::from_secs(parse_or(&lookup, "REQUEST_TIMEOUT_SECS", 20)?),
      step_timeout: Duration::from_secs(parse_or(&lookup, "STEP_TIMEOUT_SECS", 180)?),
      notify_timeout: Duration::from_secs(parse_or(&lookup, "NOTIFY_TIMEOUT_SECS", 20)?),
      deadline_threshold_days: parse_or(&lookup, "DEADLINE_THRESHOLD_DAYS", 3)?,
      event_buffer: parse_or(&lookup, "EVENT_BUFFER", 256)?,
      task_retention: Duration::from_secs(parse_or(&lookup, "TASK_RETENTION_SECS", 3600)?),
    };
    if config.captcha_solve_retries == 0 {
      anyhow::bail!("CAPTCHA_SOLVE_RETRIES must be at least 1");
    }
    Ok(config)
  }

  pub fn solver_settings(&self) -> SolverSettings {
    SolverSettings {
      attempts: self.captcha_solve_retries,
      poll_interval: self.captcha_poll_interval,
      max_polls: self.captcha_max_polls,
      request_timeout: self.request_timeout,
      ..SolverSettings::default()
    }
  }

  pub fn workflow_settings(&self) -> WorkflowSettings {
    WorkflowSettings {
      step_timeout: self.step_timeout,
      notify_timeout: self.notify_timeout,
      captcha_attempts: self.captcha_solve_retries,
    }
  }
}
