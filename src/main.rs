use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use deadline_watch::captcha::AntiCaptchaSolver;
use deadline_watch::config::Config;
use deadline_watch::notify::DiscordNotifier;
use deadline_watch::portal::DulmsPortal;
use deadline_watch::registry::{TaskRegistry, spawn_retention_sweeper};
use deadline_watch::routes::{AppContext, routes};
use deadline_watch::runner::Collaborators;

fn init_tracing() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));
  let builder = tracing_subscriber::fmt().with_env_filter(filter);
  if json {
    builder.json().init();
  } else {
    builder.init();
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let config = Config::from_env()?;
  init_tracing();

  let collaborators = Collaborators {
    portal: Arc::new(DulmsPortal::new(&config.portal_base_url, config.request_timeout)?),
    solver: Arc::new(AntiCaptchaSolver::new(config.captcha_api_url.clone(), config.solver_settings())?),
    notifier: Arc::new(DiscordNotifier::new(config.deadline_threshold_days, config.notify_timeout)?),
  };

  let registry = Arc::new(TaskRegistry::new(config.event_buffer));
  let retention = chrono::Duration::from_std(config.task_retention).context("TASK_RETENTION_SECS is out of range")?;
  let sweep_every = (config.task_retention / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
  spawn_retention_sweeper(registry.clone(), retention, sweep_every);

  let ctx = AppContext {
    registry,
    collaborators,
    workflow: config.workflow_settings(),
  };

  let addr = SocketAddr::new(config.server_host, config.server_port);
  let (addr, server) = warp::serve(routes(ctx))
    .try_bind_with_graceful_shutdown(addr, async {
      match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => {
          error!(error = %err, "could not listen for ctrl-c; running until killed");
          std::future::pending::<()>().await;
        }
      }
    })
    .with_context(|| format!("could not bind {addr}"))?;
  info!(%addr, portal = %config.portal_base_url, "deadline watch API listening");
  server.await;
  Ok(())
}
