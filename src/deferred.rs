use crate::error::DeferredError;
use crate::executor::{self, SharedExecutor};
use crate::protected::ProtectedState;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

type UponBlock<T> = Box<dyn FnOnce(T) + Send + 'static>;

struct Cell<T> {
  value: Option<Arc<T>>,
  upon_blocks: Vec<(SharedExecutor, UponBlock<T>)>,
}

/// A value that is filled exactly once and observed by any number of waiters.
///
/// `Deferred` is a shared handle: clones refer to the same cell, so the
/// producer keeps one clone to fill and consumers keep others to observe.
/// Continuations registered with [`upon_on`](Deferred::upon_on) are always
/// submitted to their executor, never run on the filling thread.
///
/// The cell keeps the value behind an `Arc`; the lock only ever covers a
/// reference count bump, and each waiter clones `T` outside of it.
pub struct Deferred<T> {
  protected: Arc<ProtectedState<Cell<T>>>,
}

impl<T> Clone for Deferred<T> {
  fn clone(&self) -> Self {
    Self {
      protected: self.protected.clone(),
    }
  }
}

impl<T: Clone + Send + Sync + 'static> Default for Deferred<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: Clone + Send + Sync + 'static> Deferred<T> {
  /// Creates an unfilled `Deferred`.
  pub fn new() -> Self {
    Self::with_value(None)
  }

  /// Creates a `Deferred` that is already filled with `value`.
  pub fn filled(value: T) -> Self {
    Self::with_value(Some(value))
  }

  fn with_value(value: Option<T>) -> Self {
    Self {
      protected: Arc::new(ProtectedState::new(Cell {
        value: value.map(Arc::new),
        upon_blocks: Vec::new(),
      })),
    }
  }

  pub fn is_filled(&self) -> bool {
    self.protected.with_read_lock(|cell| cell.value.is_some())
  }

  /// Returns the value if filled, without blocking.
  pub fn peek(&self) -> Option<T> {
    let value = self.protected.with_read_lock(|cell| cell.value.clone());
    value.map(|value| T::clone(&value))
  }

  /// Fills the `Deferred`.
  ///
  /// # Panics
  /// Panics if the `Deferred` is already filled. Use
  /// [`fill_if_unfilled`](Deferred::fill_if_unfilled) when several producers race.
  pub fn fill(&self, value: T) {
    if !self.fill_internal(value) {
      panic!("Cannot fill an already-filled Deferred");
    }
  }

  /// Fills the `Deferred` unless it already holds a value.
  ///
  /// Returns `true` if this call stored the value; a losing call is a no-op.
  pub fn fill_if_unfilled(&self, value: T) -> bool {
    self.fill_internal(value)
  }

  fn fill_internal(&self, value: T) -> bool {
    let outcome = self.protected.with_write_lock(|cell| {
      if cell.value.is_some() {
        return Err(value);
      }
      let value = Arc::new(value);
      cell.value = Some(value.clone());
      let blocks = std::mem::take(&mut cell.upon_blocks);
      if blocks.is_empty() {
        Ok(None)
      } else {
        Ok(Some((value, blocks)))
      }
    });

    match outcome {
      Err(_rejected) => false,
      Ok(None) => {
        trace!("Deferred filled with no waiters.");
        true
      }
      Ok(Some((value, blocks))) => {
        trace!("Deferred filled. Dispatching {} waiters.", blocks.len());
        dispatch(value, blocks);
        true
      }
    }
  }

  /// Registers `block` to run on `executor` with the value once it is filled.
  ///
  /// If the value is already known the block is submitted right away.
  pub fn upon_on<F>(&self, executor: &SharedExecutor, block: F)
  where
    F: FnOnce(T) + Send + 'static,
  {
    let block: UponBlock<T> = Box::new(block);
    let ready = self.protected.with_write_lock(|cell| match &cell.value {
      Some(value) => Some((value.clone(), block)),
      None => {
        cell.upon_blocks.push((executor.clone(), block));
        None
      }
    });
    if let Some((value, block)) = ready {
      executor.submit(Box::new(move || block(T::clone(&value))));
    }
  }

  /// [`upon_on`](Deferred::upon_on) with the [`generic`](executor::generic) executor.
  pub fn upon<F>(&self, block: F)
  where
    F: FnOnce(T) + Send + 'static,
  {
    self.upon_on(&executor::generic(), block);
  }

  /// Blocks the calling thread until the value is filled.
  ///
  /// Returns immediately if already filled. The thread is parked on a one-shot
  /// signal raised by a continuation on the generic executor, so this must not
  /// be called from a thread that executor needs to make progress.
  pub fn wait(&self) -> T {
    if let Some(value) = self.peek() {
      return value;
    }
    self.arm_signal().wait()
  }

  /// Like [`wait`](Deferred::wait) but gives up after `timeout`.
  pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
    if let Some(value) = self.peek() {
      return Some(value);
    }
    self.arm_signal().wait_for(timeout)
  }

  fn arm_signal(&self) -> Arc<Signal<T>> {
    let signal = Arc::new(Signal::new());
    let notifier = signal.clone();
    self.upon(move |value| notifier.notify(value));
    signal
  }

  /// Waits for the value without blocking the calling thread.
  ///
  /// # Errors
  /// Returns `DeferredError::ContinuationDropped` if the executor discarded the
  /// wake-up continuation without running it, which happens when its runtime
  /// shuts down first.
  pub async fn value(&self) -> Result<T, DeferredError> {
    if let Some(value) = self.peek() {
      return Ok(value);
    }
    let (tx, rx) = tokio::sync::oneshot::channel();
    self.upon(move |value| {
      let _ = tx.send(value);
    });
    rx.await.map_err(|_| DeferredError::ContinuationDropped)
  }

  /// Returns a `Deferred` filled with `transform(value)`, run on `executor`.
  pub fn map_on<U, F>(&self, executor: &SharedExecutor, transform: F) -> Deferred<U>
  where
    U: Clone + Send + Sync + 'static,
    F: FnOnce(T) -> U + Send + 'static,
  {
    let d = Deferred::new();
    let filler = d.clone();
    self.upon_on(executor, move |value| filler.fill(transform(value)));
    d
  }

  pub fn map<U, F>(&self, transform: F) -> Deferred<U>
  where
    U: Clone + Send + Sync + 'static,
    F: FnOnce(T) -> U + Send + 'static,
  {
    self.map_on(&executor::generic(), transform)
  }

  /// Starts another asynchronous step with the value once it is filled.
  ///
  /// The returned `Deferred` is filled with the value of the `Deferred` that
  /// `transform` returns. Both the transform and the hand-off run on `executor`.
  pub fn bind_on<U, F>(&self, executor: &SharedExecutor, transform: F) -> Deferred<U>
  where
    U: Clone + Send + Sync + 'static,
    F: FnOnce(T) -> Deferred<U> + Send + 'static,
  {
    let d = Deferred::new();
    let filler = d.clone();
    let inner_executor = executor.clone();
    self.upon_on(executor, move |value| {
      transform(value).upon_on(&inner_executor, move |inner| filler.fill(inner));
    });
    d
  }

  pub fn bind<U, F>(&self, transform: F) -> Deferred<U>
  where
    U: Clone + Send + Sync + 'static,
    F: FnOnce(T) -> Deferred<U> + Send + 'static,
  {
    self.bind_on(&executor::generic(), transform)
  }

  /// Alias of [`bind_on`](Deferred::bind_on).
  pub fn flat_map_on<U, F>(&self, executor: &SharedExecutor, transform: F) -> Deferred<U>
  where
    U: Clone + Send + Sync + 'static,
    F: FnOnce(T) -> Deferred<U> + Send + 'static,
  {
    self.bind_on(executor, transform)
  }

  /// Alias of [`bind`](Deferred::bind).
  pub fn flat_map<U, F>(&self, transform: F) -> Deferred<U>
  where
    U: Clone + Send + Sync + 'static,
    F: FnOnce(T) -> Deferred<U> + Send + 'static,
  {
    self.bind(transform)
  }

  /// Returns a `Deferred` of both values, filled once both are filled.
  pub fn both_on<U>(&self, executor: &SharedExecutor, other: &Deferred<U>) -> Deferred<(T, U)>
  where
    U: Clone + Send + Sync + 'static,
  {
    let other = other.clone();
    let inner_executor = executor.clone();
    self.bind_on(executor, move |t| other.map_on(&inner_executor, move |u| (t, u)))
  }

  pub fn both<U>(&self, other: &Deferred<U>) -> Deferred<(T, U)>
  where
    U: Clone + Send + Sync + 'static,
  {
    self.both_on(&executor::generic(), other)
  }
}

// Each block clones the value on its own executor.
fn dispatch<T: Clone + Send + Sync + 'static>(value: Arc<T>, blocks: Vec<(SharedExecutor, UponBlock<T>)>) {
  for (executor, block) in blocks {
    let value = value.clone();
    executor.submit(Box::new(move || block(T::clone(&value))));
  }
}

impl<T> fmt::Debug for Deferred<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let (is_filled, waiters) = self
      .protected
      .with_read_lock(|cell| (cell.value.is_some(), cell.upon_blocks.len()));
    f.debug_struct("Deferred")
      .field("is_filled", &is_filled)
      .field("waiters", &waiters)
      .finish()
  }
}

/// One-shot cross-thread signal used by the blocking accessors.
struct Signal<T> {
  slot: Mutex<Option<T>>,
  condvar: Condvar,
}

impl<T> Signal<T> {
  fn new() -> Self {
    Self {
      slot: Mutex::new(None),
      condvar: Condvar::new(),
    }
  }

  fn notify(&self, value: T) {
    *self.slot.lock() = Some(value);
    self.condvar.notify_all();
  }

  fn wait(&self) -> T {
    let mut slot = self.slot.lock();
    loop {
      if let Some(value) = slot.take() {
        return value;
      }
      self.condvar.wait(&mut slot);
    }
  }

  fn wait_for(&self, timeout: Duration) -> Option<T> {
    let mut slot = self.slot.lock();
    if slot.is_none() {
      self.condvar.wait_while_for(&mut slot, |slot| slot.is_none(), timeout);
    }
    slot.take()
  }
}
