use parking_lot::Mutex;
use std::fmt;

/// A value that can only be touched while holding its lock.
///
/// The lock itself is never handed out. Callers get two access patterns: read
/// something out, or mutate and return whatever needs acting on once the lock
/// is released. The lock is released on every exit path, including unwinding.
///
/// Acquisition is not re-entrant: calling back into the same `ProtectedState`
/// from inside `f` deadlocks. Never invoke user callbacks while locked.
pub struct ProtectedState<V> {
  item: Mutex<V>,
}

impl<V> ProtectedState<V> {
  pub fn new(item: V) -> Self {
    Self { item: Mutex::new(item) }
  }

  /// Runs `f` with shared access to the protected value.
  pub fn with_read_lock<R>(&self, f: impl FnOnce(&V) -> R) -> R {
    let guard = self.item.lock();
    f(&guard)
  }

  /// Runs `f` with exclusive access to the protected value.
  pub fn with_write_lock<R>(&self, f: impl FnOnce(&mut V) -> R) -> R {
    let mut guard = self.item.lock();
    f(&mut guard)
  }

  pub fn into_inner(self) -> V {
    self.item.into_inner()
  }
}

impl<V: Default> Default for ProtectedState<V> {
  fn default() -> Self {
    Self::new(V::default())
  }
}

impl<V: fmt::Debug> fmt::Debug for ProtectedState<V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    // try_lock so Debug never blocks behind a writer
    match self.item.try_lock() {
      Some(guard) => f.debug_struct("ProtectedState").field("item", &*guard).finish(),
      None => f.debug_struct("ProtectedState").field("item", &"<locked>").finish(),
    }
  }
}
