use crate::protected::ProtectedState;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Something that can be asked to stop.
///
/// Cancellation is cooperative: `cancel` only raises a signal, the work behind
/// the handle has to observe it and stop on its own.
pub trait Cancellable: Send + Sync {
  fn cancel(&self);

  fn is_cancelled(&self) -> bool;
}

/// The shared form a task keeps its cancellation handle in.
pub type CancelHandle = Arc<dyn Cancellable>;

impl Cancellable for CancellationToken {
  fn cancel(&self) {
    CancellationToken::cancel(self);
  }

  fn is_cancelled(&self) -> bool {
    CancellationToken::is_cancelled(self)
  }
}

/// Handle for work that has no way of being cancelled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCancellation;

impl Cancellable for NoCancellation {
  fn cancel(&self) {}

  fn is_cancelled(&self) -> bool {
    false
  }
}

/// Forwards cancellation to every handle it holds.
pub struct CancelAll {
  handles: Vec<CancelHandle>,
  requested: AtomicBool,
}

impl CancelAll {
  pub fn new(handles: Vec<CancelHandle>) -> Self {
    Self {
      handles,
      requested: AtomicBool::new(false),
    }
  }
}

impl Cancellable for CancelAll {
  fn cancel(&self) {
    self.requested.store(true, Ordering::SeqCst);
    for handle in &self.handles {
      handle.cancel();
    }
  }

  /// True once every handle reports cancelled, or once `cancel` was called
  /// and reached at least one of them. Handles that ignored the request,
  /// such as tasks that had already resolved, do not hold this back.
  fn is_cancelled(&self) -> bool {
    let mut states = self.handles.iter().map(|h| h.is_cancelled());
    if self.requested.load(Ordering::SeqCst) {
      states.any(|cancelled| cancelled)
    } else {
      !self.handles.is_empty() && states.all(|cancelled| cancelled)
    }
  }
}

impl fmt::Debug for CancelAll {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CancelAll").field("handles", &self.handles.len()).finish()
  }
}

/// Cancels an upstream handle and, once attached, the handle of the step
/// that follows it.
///
/// A request made before the follow-up handle is attached is replayed on it
/// when it arrives.
pub(crate) struct CancelChain {
  upstream: CancelHandle,
  next: ProtectedState<ChainNext>,
}

#[derive(Default)]
struct ChainNext {
  requested: bool,
  handle: Option<CancelHandle>,
}

impl CancelChain {
  pub(crate) fn new(upstream: CancelHandle) -> Self {
    Self {
      upstream,
      next: ProtectedState::new(ChainNext::default()),
    }
  }

  pub(crate) fn attach(&self, handle: CancelHandle) {
    let requested = self.next.with_write_lock(|next| {
      next.handle = Some(handle.clone());
      next.requested
    });
    if requested {
      handle.cancel();
    }
  }
}

impl Cancellable for CancelChain {
  fn cancel(&self) {
    self.upstream.cancel();
    let attached = self.next.with_write_lock(|next| {
      next.requested = true;
      next.handle.clone()
    });
    if let Some(handle) = attached {
      handle.cancel();
    }
  }

  fn is_cancelled(&self) -> bool {
    if self.upstream.is_cancelled() {
      return true;
    }
    let attached = self.next.with_read_lock(|next| next.handle.clone());
    attached.is_some_and(|handle| handle.is_cancelled())
  }
}
