use std::any::Any;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// The outcome a [`Task`](crate::Task) resolves to.
pub type TaskResult<T> = Result<T, TaskError>;

/// Failures a `Task` can resolve with.
///
/// Errors are propagated as data: a failing or panicking transform never takes
/// down the executor thread it runs on, it becomes the failure of the task it
/// was producing. `TaskError` is `Clone` because a task's result is handed to
/// every continuation registered on it.
#[derive(Error, Debug, Clone)]
pub enum TaskError {
  #[error("Task was cancelled")]
  Cancelled,

  #[error("Task work panicked: {0}")]
  Panicked(String),

  #[error(transparent)]
  Failed(Arc<dyn std::error::Error + Send + Sync + 'static>),
}

impl TaskError {
  /// Wraps an arbitrary error as a task failure.
  pub fn failed<E>(error: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    TaskError::Failed(Arc::new(error))
  }

  /// Builds a task failure from a plain message.
  pub fn msg(message: impl Into<String>) -> Self {
    TaskError::Failed(Arc::new(MessageError(message.into())))
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, TaskError::Cancelled)
  }

  pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
    TaskError::Panicked(panic_message(payload.as_ref()))
  }
}

// Failures are compared by what they say; the wrapped error types are opaque.
impl PartialEq for TaskError {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (TaskError::Cancelled, TaskError::Cancelled) => true,
      (TaskError::Panicked(a), TaskError::Panicked(b)) => a == b,
      (TaskError::Failed(a), TaskError::Failed(b)) => Arc::ptr_eq(a, b) || a.to_string() == b.to_string(),
      _ => false,
    }
  }
}

impl From<String> for TaskError {
  fn from(message: String) -> Self {
    TaskError::msg(message)
  }
}

impl From<&str> for TaskError {
  fn from(message: &str) -> Self {
    TaskError::msg(message)
  }
}

impl From<std::io::Error> for TaskError {
  fn from(error: std::io::Error) -> Self {
    TaskError::failed(error)
  }
}

/// Errors from reading a [`Deferred`](crate::Deferred) asynchronously.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeferredError {
  #[error("Wake-up continuation was dropped before the value arrived (executor shut down)")]
  ContinuationDropped,
}

impl From<DeferredError> for TaskError {
  fn from(error: DeferredError) -> Self {
    TaskError::failed(error)
  }
}

#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl std::error::Error for MessageError {}

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&'static str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
