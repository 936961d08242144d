//! Per-task ordered broadcast of progress events.
//!
//! [`EventChannel`] fans a task's events out to any number of
//! [`Subscription`]s over a `tokio::sync::broadcast` channel. Publishing and
//! subscribing take the same lock, so a subscriber sees exactly the events
//! published after it subscribed, in publish order.
//!
//! Once closed the channel drops its sender and keeps only the terminal
//! events (final status, result or error, and `Closed`), which it replays to
//! anyone who subscribes later.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, broadcast};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::models::{LogEntry, TaskError, TaskResult, TaskStatus};

/// Default buffer capacity for a task's broadcast channel.
pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum EventKind {
  Log(LogEntry),
  StatusChange(TaskStatus),
  Result(Arc<TaskResult>),
  Error(TaskError),
  Closed,
}

impl EventKind {
  fn is_retained(&self) -> bool {
    matches!(self, EventKind::StatusChange(_) | EventKind::Result(_) | EventKind::Error(_))
  }
}

/// One immutable, timestamped notification about a task.
#[derive(Debug, Clone)]
pub struct TaskEvent {
  /// Position in the task's sequence, starting at 0.
  pub sequence: u64,
  pub timestamp: DateTime<Utc>,
  pub kind: EventKind,
}

impl TaskEvent {
  pub fn is_closed(&self) -> bool {
    matches!(self.kind, EventKind::Closed)
  }
}

struct ChannelState {
  sender: Option<broadcast::Sender<TaskEvent>>,
  next_sequence: u64,
  retained: Vec<TaskEvent>,
}

pub struct EventChannel {
  state: Mutex<ChannelState>,
}

impl EventChannel {
  pub fn new(capacity: usize) -> Self {
    let (sender, _) = broadcast::channel(capacity.max(1));
    Self {
      state: Mutex::new(ChannelState {
        sender: Some(sender),
        next_sequence: 0,
        retained: Vec::new(),
      }),
    }
  }

  /// Publish to all current subscribers. Returns the event's sequence number,
  /// or `None` when the channel is already closed.
  ///
  /// `Closed` cannot be published directly; use [`EventChannel::close`].
  pub async fn publish(&self, kind: EventKind) -> Option<u64> {
    if matches!(kind, EventKind::Closed) {
      return self.close().await;
    }
    let mut state = self.state.lock().await;
    Self::emit(&mut state, kind)
  }

  /// Emit `Closed` and release the sender. Only the first call has effect.
  pub async fn close(&self) -> Option<u64> {
    let mut state = self.state.lock().await;
    let sequence = Self::emit(&mut state, EventKind::Closed)?;
    state.sender = None;
    Some(sequence)
  }

  pub async fn is_closed(&self) -> bool {
    self.state.lock().await.sender.is_none()
  }

  pub async fn subscribe(&self) -> Subscription {
    let state = self.state.lock().await;
    match &state.sender {
      Some(sender) => Subscription::live(sender.subscribe()),
      None => Subscription::replay(state.retained.iter().cloned().collect()),
    }
  }

  pub async fn subscriber_count(&self) -> usize {
    let state = self.state.lock().await;
    state.sender.as_ref().map_or(0, |sender| sender.receiver_count())
  }

  fn emit(state: &mut ChannelState, kind: EventKind) -> Option<u64> {
    if state.sender.is_none() {
      warn!(event = ?kind, "publish on a closed event channel ignored");
      return None;
    }
    let sequence = state.next_sequence;
    let event = TaskEvent {
      sequence,
      timestamp: Utc::now(),
      kind,
    };
    state.next_sequence += 1;

    if let EventKind::StatusChange(_) = event.kind {
      state.retained.retain(|e| !matches!(e.kind, EventKind::StatusChange(_)));
    }
    if event.kind.is_retained() || event.is_closed() {
      state.retained.push(event.clone());
    }

    if let Some(sender) = &state.sender {
      // A send error only means nobody is listening right now.
      let _ = sender.send(event);
    }
    Some(sequence)
  }
}

impl Default for EventChannel {
  fn default() -> Self {
    Self::new(DEFAULT_CAPACITY)
  }
}

/// One observer's view of a task's events.
pub struct Subscription {
  backlog: VecDeque<TaskEvent>,
  live: Option<broadcast::Receiver<TaskEvent>>,
  missed: u64,
  finished: bool,
}

impl Subscription {
  fn live(receiver: broadcast::Receiver<TaskEvent>) -> Self {
    Self {
      backlog: VecDeque::new(),
      live: Some(receiver),
      missed: 0,
      finished: false,
    }
  }

  fn replay(events: VecDeque<TaskEvent>) -> Self {
    Self {
      backlog: events,
      live: None,
      missed: 0,
      finished: false,
    }
  }

  /// Next event, or `None` once `Closed` has been delivered.
  pub async fn recv(&mut self) -> Option<TaskEvent> {
    if self.finished {
      return None;
    }
    let next = match self.backlog.pop_front() {
      Some(event) => Some(event),
      None => self.recv_live().await,
    };
    match &next {
      Some(event) if event.is_closed() => self.finish(),
      None => self.finish(),
      _ => {}
    }
    next
  }

  async fn recv_live(&mut self) -> Option<TaskEvent> {
    let receiver = self.live.as_mut()?;
    loop {
      match receiver.recv().await {
        Ok(event) => return Some(event),
        Err(RecvError::Lagged(skipped)) => {
          warn!(skipped, "event subscriber fell behind; live events dropped");
          self.missed += skipped;
        }
        Err(RecvError::Closed) => return None,
      }
    }
  }

  fn finish(&mut self) {
    self.finished = true;
    self.live = None;
  }

  /// Number of live events this subscriber lost by lagging behind.
  pub fn missed(&self) -> u64 {
    self.missed
  }

  pub fn into_stream(self) -> impl futures::Stream<Item = TaskEvent> + Send + 'static {
    futures::stream::unfold(self, |mut subscription| async move {
      subscription.recv().await.map(|event| (event, subscription))
    })
  }
}
