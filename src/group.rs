use crate::deferred::Deferred;
use crate::executor::SharedExecutor;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts outstanding pieces of work and notifies once all of them have left.
///
/// A group created with `Group::new(n)` expects `n` calls to
/// [`leave`](Group::leave); [`enter`](Group::enter) adds one more. When the
/// count reaches zero the group is done, and stays done.
#[derive(Clone)]
pub struct Group {
  pending: Arc<AtomicUsize>,
  done: Deferred<()>,
}

impl Group {
  pub fn new(count: usize) -> Self {
    let done = if count == 0 { Deferred::filled(()) } else { Deferred::new() };
    Self {
      pending: Arc::new(AtomicUsize::new(count)),
      done,
    }
  }

  pub fn enter(&self) {
    self.pending.fetch_add(1, Ordering::AcqRel);
  }

  /// Marks one piece of work as finished.
  ///
  /// # Panics
  /// Panics if called more often than the group was entered.
  pub fn leave(&self) {
    let previous = self
      .pending
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
      .unwrap_or_else(|_| panic!("Group::leave called more times than the group was entered"));
    if previous == 1 {
      self.done.fill_if_unfilled(());
    }
  }

  pub fn pending(&self) -> usize {
    self.pending.load(Ordering::Acquire)
  }

  pub fn is_done(&self) -> bool {
    self.done.is_filled()
  }

  /// Submits `block` to `executor` once every piece of work has left.
  pub fn notify<F>(&self, executor: &SharedExecutor, block: F)
  where
    F: FnOnce() + Send + 'static,
  {
    self.done.upon_on(executor, move |()| block());
  }

  /// Blocks until every piece of work has left.
  pub fn wait(&self) {
    self.done.wait();
  }
}

impl fmt::Debug for Group {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Group")
      .field("pending", &self.pending())
      .field("is_done", &self.is_done())
      .finish()
  }
}
