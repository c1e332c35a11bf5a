use crate::error::panic_message;

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, Handle as TokioHandle, Runtime};
use tracing::{error, trace};

/// A unit of work handed to an [`Executor`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The form executors are passed around in.
pub type SharedExecutor = Arc<dyn Executor>;

const GENERIC_EXECUTOR_NAME: &str = "generic";

lazy_static::lazy_static! {
  // Only built when `generic()` is called outside of any Tokio runtime. Lives for the process.
  static ref FALLBACK_RUNTIME: Runtime = Builder::new_multi_thread()
    .thread_name("deferred-generic")
    .enable_all()
    .build()
    .expect("failed to build the fallback runtime for the generic executor");
}

/// Runs callbacks, possibly on another thread, possibly later.
///
/// Continuations registered on a [`Deferred`](crate::Deferred) are always
/// submitted to an executor, never run on the thread that fills the value.
pub trait Executor: Send + Sync + fmt::Debug {
  fn submit(&self, job: Job);

  /// Submits `job` once `delay` has elapsed.
  fn submit_after(&self, delay: Duration, job: Job);
}

/// The class of threads an executor runs its jobs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
  /// Runs jobs directly on the runtime's async worker threads. Jobs must be
  /// short and must not block.
  Interactive,
  /// Runs jobs on the runtime's blocking pool. Jobs may block, including on
  /// [`Deferred::wait`](crate::Deferred::wait).
  #[default]
  Utility,
}

/// An [`Executor`] backed by a Tokio runtime.
///
/// Every job runs inside `catch_unwind`: a panicking continuation is logged and
/// dropped, the worker thread survives.
#[derive(Clone)]
pub struct TokioExecutor {
  handle: TokioHandle,
  name: Arc<String>,
  priority: Priority,
}

impl TokioExecutor {
  pub fn new(handle: TokioHandle, name: &str) -> Self {
    Self {
      handle,
      name: Arc::new(name.to_string()),
      priority: Priority::default(),
    }
  }

  pub fn with_priority(mut self, priority: Priority) -> Self {
    self.priority = priority;
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn priority(&self) -> Priority {
    self.priority
  }

  pub fn shared(self) -> SharedExecutor {
    Arc::new(self)
  }
}

fn run_guarded(executor_name: &str, job: Job) {
  if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
    error!(
      executor = %executor_name,
      "A job panicked during execution: {}",
      panic_message(payload.as_ref())
    );
  }
}

impl Executor for TokioExecutor {
  fn submit(&self, job: Job) {
    let name = self.name.clone();
    trace!(executor = %*name, priority = ?self.priority, "Submitting job.");
    match self.priority {
      Priority::Utility => {
        self.handle.spawn_blocking(move || run_guarded(&name, job));
      }
      Priority::Interactive => {
        self.handle.spawn(async move { run_guarded(&name, job) });
      }
    }
  }

  fn submit_after(&self, delay: Duration, job: Job) {
    let this = self.clone();
    self.handle.spawn(async move {
      tokio::time::sleep(delay).await;
      this.submit(job);
    });
  }
}

impl fmt::Debug for TokioExecutor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TokioExecutor")
      .field("name", &*self.name)
      .field("priority", &self.priority)
      .finish_non_exhaustive()
  }
}

/// Returns the default executor used by every operation called without one.
///
/// Inside a Tokio runtime this is that runtime (blocking pool, so
/// continuations may block). Outside of any runtime it is a process-wide
/// multi-thread runtime built on first use. The result is resolved when
/// called and then passed along explicitly, so a continuation always runs on
/// the executor that was current when it was registered.
pub fn generic() -> SharedExecutor {
  let handle = TokioHandle::try_current().unwrap_or_else(|_| FALLBACK_RUNTIME.handle().clone());
  TokioExecutor::new(handle, GENERIC_EXECUTOR_NAME).shared()
}
