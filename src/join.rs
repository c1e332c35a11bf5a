use crate::cancel::{CancelAll, CancelHandle, NoCancellation};
use crate::deferred::Deferred;
use crate::error::{TaskError, TaskResult};
use crate::executor::{self, SharedExecutor};
use crate::group::Group;
use crate::progress::Progress;
use crate::task::Task;

use std::sync::Arc;

use tracing::{debug, trace};

/// Anything that resolves to a [`TaskResult`] and can take part in a join.
///
/// The progress and cancellation capabilities have defaults for values that
/// only know when they are done: a progress unit that completes when the
/// result is known, and a handle that ignores cancellation.
pub trait TaskLike: Clone + Send + Sync + 'static {
  type Success: Clone + Send + Sync + 'static;

  fn upon_result<F>(&self, executor: &SharedExecutor, block: F)
  where
    F: FnOnce(TaskResult<Self::Success>) + Send + 'static;

  fn is_determined(&self) -> bool;

  fn progress_node(&self) -> Progress {
    let tracked = self.clone();
    Progress::tracking(move || tracked.is_determined())
  }

  fn cancellation_handle(&self) -> CancelHandle {
    Arc::new(NoCancellation)
  }
}

impl<T: Clone + Send + Sync + 'static> TaskLike for Task<T> {
  type Success = T;

  fn upon_result<F>(&self, executor: &SharedExecutor, block: F)
  where
    F: FnOnce(TaskResult<T>) + Send + 'static,
  {
    self.upon_on(executor, block);
  }

  fn is_determined(&self) -> bool {
    self.is_filled()
  }

  fn progress_node(&self) -> Progress {
    self.progress().clone()
  }

  fn cancellation_handle(&self) -> CancelHandle {
    Arc::new(self.clone())
  }
}

impl<T: Clone + Send + Sync + 'static> TaskLike for Deferred<TaskResult<T>> {
  type Success = T;

  fn upon_result<F>(&self, executor: &SharedExecutor, block: F)
  where
    F: FnOnce(TaskResult<T>) + Send + 'static,
  {
    self.upon_on(executor, block);
  }

  fn is_determined(&self) -> bool {
    self.is_filled()
  }
}

/// Composes `tasks` into a single task that resolves once all of them have.
///
/// The joined task succeeds if every input succeeded. Otherwise it fails with
/// the first failure observed; later failures are dropped. It always waits
/// for every input to resolve first. Its progress has one unit per input,
/// and cancelling it cancels every input. An empty input succeeds at once.
pub fn joined_tasks_on<I>(executor: &SharedExecutor, tasks: I) -> Task<()>
where
  I: IntoIterator,
  I::Item: TaskLike,
{
  let tasks: Vec<I::Item> = tasks.into_iter().collect();
  if tasks.is_empty() {
    return Task::succeeded(());
  }

  let progress = Progress::new(tasks.len() as u64);
  let first_failure: Deferred<TaskError> = Deferred::new();
  let coalescing: Deferred<TaskResult<()>> = Deferred::new();
  let group = Group::new(tasks.len());
  let mut cancellations = Vec::with_capacity(tasks.len());

  for (index, task) in tasks.iter().enumerate() {
    if !progress.adopt_child(&task.progress_node(), 1) {
      // already part of another tree; count it by its completion instead
      let tracked = task.clone();
      progress.adopt_child(&Progress::tracking(move || tracked.is_determined()), 1);
    }
    cancellations.push(task.cancellation_handle());

    let first_failure = first_failure.clone();
    let group = group.clone();
    task.upon_result(executor, move |result| {
      if let Err(error) = result {
        if first_failure.fill_if_unfilled(error) {
          debug!(index, "joined_tasks: Recorded first failure.");
        } else {
          trace!(index, "joined_tasks: Dropping later failure.");
        }
      }
      group.leave();
    });
  }

  let filler = coalescing.clone();
  group.notify(executor, move || {
    let outcome = match first_failure.peek() {
      Some(error) => Err(error),
      None => Ok(()),
    };
    trace!(success = outcome.is_ok(), "joined_tasks: All inputs resolved.");
    filler.fill(outcome);
  });

  Task::new(coalescing, progress, Arc::new(CancelAll::new(cancellations)))
}

pub fn joined_tasks<I>(tasks: I) -> Task<()>
where
  I: IntoIterator,
  I::Item: TaskLike,
{
  joined_tasks_on(&executor::generic(), tasks)
}

/// Method form of [`joined_tasks`] for collections of tasks.
pub trait JoinedTasks {
  fn joined_tasks(self) -> Task<()>;
}

impl<I> JoinedTasks for I
where
  I: IntoIterator,
  I::Item: TaskLike,
{
  fn joined_tasks(self) -> Task<()> {
    joined_tasks(self)
  }
}
