use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::IntervalStream;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::events::DEFAULT_CAPACITY;
use crate::models::{TaskResult, TaskStatus};
use crate::task::Task;

/// A unit of work the registry can run on behalf of a task.
///
/// The workflow only logs progress on the task; recording the outcome is
/// the registry's job.
#[async_trait]
pub trait Workflow: Send + 'static {
  async fn run(self, task: Arc<Task>) -> Result<TaskResult, WorkflowError>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
  #[error("task {0} not found")]
  NotFound(Uuid),
  #[error("task {id} already started (status {status})")]
  AlreadyStarted { id: Uuid, status: TaskStatus },
}

pub struct TaskRegistry {
  tasks: RwLock<HashMap<Uuid, Arc<Task>>>,
  event_capacity: usize,
}

impl TaskRegistry {
  pub fn new(event_capacity: usize) -> Self {
    Self {
      tasks: RwLock::new(HashMap::new()),
      event_capacity,
    }
  }

  pub async fn create(&self) -> Arc<Task> {
    let task = Arc::new(Task::new(self.event_capacity));
    self.tasks.write().await.insert(task.id(), task.clone());
    info!(task_id = %task.id(), "created scraper task");
    task
  }

  pub async fn get(&self, id: Uuid) -> Result<Arc<Task>, RegistryError> {
    self.tasks.read().await.get(&id).cloned().ok_or(RegistryError::NotFound(id))
  }

  pub async fn len(&self) -> usize {
    self.tasks.read().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.tasks.read().await.is_empty()
  }

  /// Mark the task running and spawn `workflow` for it. Returns as soon as
  /// the run is spawned; dropping the handle detaches it.
  pub async fn start<W: Workflow>(&self, id: Uuid, workflow: W) -> Result<JoinHandle<()>, RegistryError> {
    let task = self.get(id).await?;
    if let Err(err) = task.transition(TaskStatus::Running).await {
      return Err(RegistryError::AlreadyStarted { id, status: err.from });
    }
    info!(task_id = %id, "starting background task");

    Ok(tokio::spawn(async move {
      let outcome = AssertUnwindSafe(workflow.run(task.clone()))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(WorkflowError::Internal(panic_message(panic.as_ref()))));

      let recorded = match outcome {
        Ok(result) => task.complete(result).await,
        Err(err) => task.fail(&err).await,
      };
      if let Err(err) = recorded {
        error!(task_id = %task.id(), error = %err, "could not record workflow outcome");
      }
    }))
  }

  /// Drop finished tasks whose `finished_at` is older than `retention`.
  /// Pending and running tasks are always kept.
  pub async fn prune_finished(&self, retention: Duration) -> usize {
    let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
      return 0;
    };
    let mut expired = Vec::new();
    for (id, task) in self.tasks.read().await.iter() {
      if task.finished_at().await.is_some_and(|finished| finished <= cutoff) {
        expired.push(*id);
      }
    }
    if expired.is_empty() {
      return 0;
    }

    let mut tasks = self.tasks.write().await;
    for id in &expired {
      tasks.remove(id);
    }
    warn!(count = expired.len(), "pruned finished tasks past retention");
    expired.len()
  }
}

/// Periodically prune finished tasks older than `retention`.
pub fn spawn_retention_sweeper(
  registry: Arc<TaskRegistry>,
  retention: Duration,
  period: std::time::Duration,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut ticks = IntervalStream::new(ticker);
    while ticks.next().await.is_some() {
      let pruned = registry.prune_finished(retention).await;
      if pruned > 0 {
        let remaining = registry.len().await;
        info!(pruned, remaining, "retention sweep finished");
      }
    }
  })
}

impl Default for TaskRegistry {
  fn default() -> Self {
    Self::new(DEFAULT_CAPACITY)
  }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
  let detail = panic
    .downcast_ref::<&str>()
    .map(|s| s.to_string())
    .or_else(|| panic.downcast_ref::<String>().cloned())
    .unwrap_or_else(|| "unknown panic".into());
  format!("workflow panicked: {detail}")
}
