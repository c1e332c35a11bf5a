use crate::cancel::{CancelChain, CancelHandle, Cancellable, NoCancellation};
use crate::deferred::Deferred;
use crate::error::{TaskError, TaskResult};
use crate::executor::{self, SharedExecutor};
use crate::progress::Progress;

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::runtime::Handle as TokioHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, trace, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

fn next_task_id() -> u64 {
  NEXT_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed)
}

/// A deferred success-or-failure result that can be cancelled and reports progress.
///
/// Mapping a task appends a unit of progress to the root task, the earliest
/// task in a chain of transforms, and the derived task is cancelled through
/// the task it was derived from.
pub struct Task<T> {
  id: u64,
  deferred: Deferred<TaskResult<T>>,
  progress: Progress,
  cancellation: CancelHandle,
}

impl<T> Clone for Task<T> {
  fn clone(&self) -> Self {
    Self {
      id: self.id,
      deferred: self.deferred.clone(),
      progress: self.progress.clone(),
      cancellation: self.cancellation.clone(),
    }
  }
}

/// What spawned work gets to observe while it runs.
#[derive(Debug, Clone)]
pub struct TaskContext {
  task_id: u64,
  token: CancellationToken,
  progress: Progress,
}

impl TaskContext {
  pub fn task_id(&self) -> u64 {
    self.task_id
  }

  /// Checks if cancellation has been requested for the task.
  /// Work is expected to check this and stop on its own.
  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  pub fn cancellation_token(&self) -> &CancellationToken {
    &self.token
  }

  /// Progress of the work itself: one unit, completed when the work returns.
  pub fn progress(&self) -> &Progress {
    &self.progress
  }
}

impl<T: Clone + Send + Sync + 'static> Task<T> {
  /// Wraps `deferred` with an explicit progress and cancellation handle.
  ///
  /// The caller is responsible for completing `progress` no later than it
  /// fills `deferred`.
  pub fn new(deferred: Deferred<TaskResult<T>>, progress: Progress, cancellation: CancelHandle) -> Self {
    Self {
      id: next_task_id(),
      deferred,
      progress,
      cancellation,
    }
  }

  /// Wraps a plain deferred result. Its progress completes when it is filled;
  /// cancelling it does nothing.
  pub fn from_deferred(deferred: Deferred<TaskResult<T>>) -> Self {
    let progress = Progress::new(1);
    let tracked = deferred.clone();
    progress.adopt_child(&Progress::tracking(move || tracked.is_filled()), 1);
    Self::new(deferred, progress, Arc::new(NoCancellation))
  }

  pub fn succeeded(value: T) -> Self {
    Self::new(Deferred::filled(Ok(value)), Progress::completed(), Arc::new(NoCancellation))
  }

  pub fn failed(error: impl Into<TaskError>) -> Self {
    Self::new(Deferred::filled(Err(error.into())), Progress::completed(), Arc::new(NoCancellation))
  }

  /// Runs `work` on `executor` and returns the task tracking it.
  ///
  /// If the task is cancelled before `work` starts it fails with
  /// `TaskError::Cancelled` without running. A panic in `work` fails the task
  /// with `TaskError::Panicked`.
  pub fn spawn_on<F>(executor: &SharedExecutor, work: F) -> Self
  where
    F: FnOnce(&TaskContext) -> TaskResult<T> + Send + 'static,
  {
    let (task, context) = Self::spawned_parts();
    let deferred = task.deferred.clone();
    debug!(task_id = %context.task_id, "Spawning task on executor.");

    executor.submit(Box::new(move || {
      let _span = info_span!("task", task_id = %context.task_id).entered();
      let outcome = if context.is_cancelled() {
        debug!("Task cancelled before it started.");
        Err(TaskError::Cancelled)
      } else {
        catch_unwind(AssertUnwindSafe(|| work(&context))).unwrap_or_else(|payload| {
          error!("Task work panicked.");
          Err(TaskError::from_panic(payload))
        })
      };
      context.progress.complete_all();
      trace!(success = outcome.is_ok(), "Task work finished.");
      deferred.fill(outcome);
    }));
    task
  }

  pub fn spawn<F>(work: F) -> Self
  where
    F: FnOnce(&TaskContext) -> TaskResult<T> + Send + 'static,
  {
    Self::spawn_on(&executor::generic(), work)
  }

  /// Runs the future built by `work` on a Tokio runtime.
  pub fn spawn_future<F, Fut>(handle: &TokioHandle, work: F) -> Self
  where
    F: FnOnce(TaskContext) -> Fut + Send + 'static,
    Fut: Future<Output = TaskResult<T>> + Send + 'static,
  {
    let (task, context) = Self::spawned_parts();
    let deferred = task.deferred.clone();
    let task_id = context.task_id;
    debug!(%task_id, "Spawning task future on runtime.");

    handle.spawn(
      async move {
        let work_progress = context.progress.clone();
        let outcome = if context.is_cancelled() {
          debug!("Task cancelled before it started.");
          Err(TaskError::Cancelled)
        } else {
          match AssertUnwindSafe(async move { work(context).await }).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
              error!("Task future panicked.");
              Err(TaskError::from_panic(payload))
            }
          }
        };
        work_progress.complete_all();
        deferred.fill(outcome);
      }
      .instrument(info_span!("task", %task_id)),
    );
    task
  }

  // The task's progress has the work's own progress as a child, so extending
  // it for transforms never gets mixed up with completing the work.
  fn spawned_parts() -> (Self, TaskContext) {
    let token = CancellationToken::new();
    let progress = Progress::discrete(1);
    let work_progress = Progress::new(1);
    progress.adopt_child(&work_progress, 1);
    let task = Self::new(Deferred::new(), progress, Arc::new(token.clone()));
    let context = TaskContext {
      task_id: task.id,
      token,
      progress: work_progress,
    };
    (task, context)
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn progress(&self) -> &Progress {
    &self.progress
  }

  pub fn deferred(&self) -> &Deferred<TaskResult<T>> {
    &self.deferred
  }

  pub fn into_deferred(self) -> Deferred<TaskResult<T>> {
    self.deferred
  }

  pub fn is_filled(&self) -> bool {
    self.deferred.is_filled()
  }

  pub fn peek(&self) -> Option<TaskResult<T>> {
    self.deferred.peek()
  }

  /// Blocks until the task resolves. See [`Deferred::wait`].
  pub fn wait(&self) -> TaskResult<T> {
    self.deferred.wait()
  }

  pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskResult<T>> {
    self.deferred.wait_timeout(timeout)
  }

  /// Awaits the task's result without blocking the thread.
  pub async fn result(&self) -> TaskResult<T> {
    self.deferred.value().await?
  }

  pub fn upon_on<F>(&self, executor: &SharedExecutor, block: F)
  where
    F: FnOnce(TaskResult<T>) + Send + 'static,
  {
    self.deferred.upon_on(executor, block);
  }

  pub fn upon<F>(&self, block: F)
  where
    F: FnOnce(TaskResult<T>) + Send + 'static,
  {
    self.deferred.upon(block);
  }

  /// Requests cancellation of the work behind this task.
  ///
  /// Ignored once the task has resolved. Derived tasks forward this to the
  /// task they were derived from, which applies the same rule, so a finished
  /// root task is never marked cancelled. A `flat_map` task also forwards it
  /// to the task its step started.
  pub fn cancel(&self) {
    if self.is_filled() {
      trace!(task_id = %self.id, "Task: Cancellation ignored, task already resolved.");
      return;
    }
    debug!(task_id = %self.id, "Task: Cancellation requested.");
    self.cancellation.cancel();
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancellation.is_cancelled()
  }

  fn extended_progress(&self) -> Progress {
    self.progress.extend(1)
  }

  fn derive<U, F>(&self, executor: &SharedExecutor, body: F) -> Task<U>
  where
    U: Clone + Send + Sync + 'static,
    F: FnOnce(T) -> TaskResult<U> + Send + 'static,
  {
    let progress = self.extended_progress();
    let body_progress = progress.clone();
    let future = self.deferred.map_on(executor, move |result: TaskResult<T>| {
      let _current = body_progress.become_current(1);
      result.and_then(|value| run_transform(move || body(value)))
    });
    let derived = Task::new(future, progress, Arc::new(self.clone()));
    trace!(task_id = %self.id, derived_task_id = %derived.id, "Task: Derived new task.");
    derived
  }

  /// Returns a task holding `transform` applied to the success value.
  ///
  /// A failure skips `transform` and is passed through. Either way one unit of
  /// progress is added to the root task and completed once the step has run.
  pub fn map_on<U, F>(&self, executor: &SharedExecutor, transform: F) -> Task<U>
  where
    U: Clone + Send + Sync + 'static,
    F: FnOnce(T) -> U + Send + 'static,
  {
    self.derive(executor, move |value| Ok(transform(value)))
  }

  pub fn map<U, F>(&self, transform: F) -> Task<U>
  where
    U: Clone + Send + Sync + 'static,
    F: FnOnce(T) -> U + Send + 'static,
  {
    self.map_on(&executor::generic(), transform)
  }

  /// Like [`map_on`](Task::map_on) for a transform that can fail.
  pub fn try_map_on<U, E, F>(&self, executor: &SharedExecutor, transform: F) -> Task<U>
  where
    U: Clone + Send + Sync + 'static,
    E: Into<TaskError>,
    F: FnOnce(T) -> Result<U, E> + Send + 'static,
  {
    self.derive(executor, move |value| transform(value).map_err(Into::into))
  }

  pub fn try_map<U, E, F>(&self, transform: F) -> Task<U>
  where
    U: Clone + Send + Sync + 'static,
    E: Into<TaskError>,
    F: FnOnce(T) -> Result<U, E> + Send + 'static,
  {
    self.try_map_on(&executor::generic(), transform)
  }

  /// Starts the next task with the success value once this one succeeds.
  ///
  /// The next task's progress is adopted for the unit this step adds to the
  /// root task, unless it was already attached while the step ran.
  pub fn flat_map_on<U, F>(&self, executor: &SharedExecutor, start_next: F) -> Task<U>
  where
    U: Clone + Send + Sync + 'static,
    F: FnOnce(T) -> Task<U> + Send + 'static,
  {
    let progress = self.extended_progress();
    let body_progress = progress.clone();
    let cancellation = Arc::new(CancelChain::new(Arc::new(self.clone())));
    let chain = cancellation.clone();
    let future = self.deferred.bind_on(executor, move |result: TaskResult<T>| {
      let current = body_progress.become_current(1);
      match result.and_then(|value| run_transform(move || Ok(start_next(value)))) {
        Ok(next) => {
          current.adopt(next.progress());
          chain.attach(Arc::new(next.clone()));
          next.deferred
        }
        Err(error) => Deferred::filled(Err(error)),
      }
    });
    Task::new(future, progress, cancellation)
  }

  pub fn flat_map<U, F>(&self, start_next: F) -> Task<U>
  where
    U: Clone + Send + Sync + 'static,
    F: FnOnce(T) -> Task<U> + Send + 'static,
  {
    self.flat_map_on(&executor::generic(), start_next)
  }
}

// Cancelling through a task keeps its "ignored once resolved" behaviour.
impl<T: Clone + Send + Sync + 'static> Cancellable for Task<T> {
  fn cancel(&self) {
    Task::cancel(self);
  }

  fn is_cancelled(&self) -> bool {
    Task::is_cancelled(self)
  }
}

fn run_transform<U>(transform: impl FnOnce() -> TaskResult<U>) -> TaskResult<U> {
  catch_unwind(AssertUnwindSafe(transform)).unwrap_or_else(|payload| {
    error!("Task transform panicked.");
    Err(TaskError::from_panic(payload))
  })
}

impl<T> fmt::Debug for Task<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Task")
      .field("id", &self.id)
      .field("deferred", &self.deferred)
      .field("progress", &self.progress)
      .field("is_cancelled", &self.cancellation.is_cancelled())
      .finish()
  }
}
