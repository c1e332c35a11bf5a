//! Hierarchical progress reporting.
//!
//! A [`Progress`] is a node in a tree of weighted units of work. A parent owns
//! its children; each child stands for a number of the parent's pending units
//! and contributes its own completed fraction of them. Children only keep a
//! weak back-reference to their parent.
//!
//! A progress can be made *current* on a thread for the duration of a unit of
//! work. Progress created with [`Progress::discrete`] while another one is
//! current is adopted as its child; if nothing is adopted during the bracket,
//! the pending units are counted as completed when it resigns.

use crate::protected::ProtectedState;

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

// Held across the cycle check and the parent claim of an adoption, so two
// adoptions cannot each pass the check and link into a cycle.
static ADOPTION: Mutex<()> = parking_lot::const_mutex(());

type DonePredicate = Box<dyn Fn() -> bool + Send + Sync + 'static>;

/// Shared handle to one node of a progress tree.
#[derive(Clone)]
pub struct Progress {
  node: Arc<Node>,
}

struct Node {
  source: Source,
  parent: ProtectedState<Option<Weak<Node>>>,
}

enum Source {
  Units(ProtectedState<Units>),
  Tracking(DonePredicate),
}

struct Units {
  total: u64,
  completed: u64,
  children: Vec<Child>,
}

struct Child {
  progress: Progress,
  pending: u64,
}

struct CurrentEntry {
  progress: Progress,
  pending: u64,
  adopted: bool,
}

thread_local! {
  static CURRENT: RefCell<Vec<CurrentEntry>> = const { RefCell::new(Vec::new()) };
}

impl Progress {
  /// Creates a root progress with `total` units, none completed.
  pub fn new(total: u64) -> Self {
    Self::from_source(Source::Units(ProtectedState::new(Units {
      total,
      completed: 0,
      children: Vec::new(),
    })))
  }

  /// Creates a progress with `total` units and attaches it to the thread's
  /// current progress, if there is one that has not adopted a child yet.
  pub fn discrete(total: u64) -> Self {
    let progress = Self::new(total);
    let adopter = CURRENT.with(|current| {
      let mut stack = current.borrow_mut();
      match stack.last_mut() {
        Some(top) if !top.adopted => {
          top.adopted = true;
          Some((top.progress.clone(), top.pending))
        }
        _ => None,
      }
    });
    if let Some((parent, pending)) = adopter {
      parent.adopt_child(&progress, pending);
    }
    progress
  }

  /// A single unit that is already complete.
  pub fn completed() -> Self {
    let progress = Self::new(1);
    progress.complete_all();
    progress
  }

  /// A single unit that is complete exactly when `is_done` returns true.
  ///
  /// Used to represent work that reports nothing but its own completion, such
  /// as a plain [`Deferred`](crate::Deferred).
  pub fn tracking<F>(is_done: F) -> Self
  where
    F: Fn() -> bool + Send + Sync + 'static,
  {
    Self::from_source(Source::Tracking(Box::new(is_done)))
  }

  fn from_source(source: Source) -> Self {
    Self {
      node: Arc::new(Node {
        source,
        parent: ProtectedState::new(None),
      }),
    }
  }

  /// Returns the innermost progress made current on this thread.
  pub fn current() -> Option<Progress> {
    CURRENT.with(|current| current.borrow().last().map(|entry| entry.progress.clone()))
  }

  pub fn ptr_eq(&self, other: &Progress) -> bool {
    Arc::ptr_eq(&self.node, &other.node)
  }

  pub fn total_unit_count(&self) -> u64 {
    match &self.node.source {
      Source::Units(units) => units.with_read_lock(|u| u.total),
      Source::Tracking(_) => 1,
    }
  }

  /// Units completed directly on this node, not counting children.
  pub fn completed_unit_count(&self) -> u64 {
    match &self.node.source {
      Source::Units(units) => units.with_read_lock(|u| u.completed),
      Source::Tracking(is_done) => u64::from(is_done()),
    }
  }

  /// Fraction of the whole subtree that is complete, between 0 and 1.
  ///
  /// A node without any units reports 0.
  pub fn fraction_completed(&self) -> f64 {
    match &self.node.source {
      Source::Tracking(is_done) => {
        if is_done() {
          1.0
        } else {
          0.0
        }
      }
      Source::Units(units) => {
        let (total, completed, children) = units.with_read_lock(|u| {
          let children: Vec<(Progress, u64)> =
            u.children.iter().map(|c| (c.progress.clone(), c.pending)).collect();
          (u.total, u.completed, children)
        });
        if total == 0 {
          return 0.0;
        }
        let from_children: f64 = children
          .iter()
          .map(|(child, pending)| child.fraction_completed() * *pending as f64)
          .sum();
        ((completed as f64 + from_children) / total as f64).min(1.0)
      }
    }
  }

  pub fn is_finished(&self) -> bool {
    self.fraction_completed() >= 1.0
  }

  /// Marks `count` more units of this node as complete.
  pub fn complete_units(&self, count: u64) {
    if let Source::Units(units) = &self.node.source {
      units.with_write_lock(|u| u.completed = u.total.min(u.completed.saturating_add(count)));
    }
  }

  /// Marks every unit of this node as complete.
  pub fn complete_all(&self) {
    if let Source::Units(units) = &self.node.source {
      units.with_write_lock(|u| u.completed = u.total);
    }
  }

  /// Adds `count` units of pending work to this node and returns it.
  pub fn extend(&self, count: u64) -> Progress {
    match &self.node.source {
      Source::Units(units) => units.with_write_lock(|u| u.total = u.total.saturating_add(count)),
      Source::Tracking(_) => warn!("Cannot extend a tracking progress; extension ignored."),
    }
    self.clone()
  }

  /// Makes `child` account for `pending` of this node's units.
  ///
  /// Returns `false`, leaving both untouched, if `child` already has a parent,
  /// is this node or one of its ancestors, or this node is a tracking node.
  pub fn adopt_child(&self, child: &Progress, pending: u64) -> bool {
    let units = match &self.node.source {
      Source::Units(units) => units,
      Source::Tracking(_) => {
        warn!("A tracking progress cannot adopt children.");
        return false;
      }
    };
    let claimed = {
      let _adoption = ADOPTION.lock();
      if self.has_ancestor_or_self(child) {
        warn!("Refusing to adopt a progress into its own subtree.");
        return false;
      }
      child.node.parent.with_write_lock(|parent| {
        if parent.as_ref().and_then(Weak::upgrade).is_some() {
          return false;
        }
        *parent = Some(Arc::downgrade(&self.node));
        true
      })
    };
    if !claimed {
      return false;
    }
    let child = child.clone();
    units.with_write_lock(|u| u.children.push(Child { progress: child, pending }));
    true
  }

  pub fn has_parent(&self) -> bool {
    self.parent().is_some()
  }

  pub fn parent(&self) -> Option<Progress> {
    self
      .node
      .parent
      .with_read_lock(|parent| parent.as_ref().and_then(Weak::upgrade))
      .map(|node| Progress { node })
  }

  fn has_ancestor_or_self(&self, candidate: &Progress) -> bool {
    let mut cursor = Some(self.clone());
    while let Some(progress) = cursor {
      if progress.ptr_eq(candidate) {
        return true;
      }
      cursor = progress.parent();
    }
    false
  }

  /// Makes this progress current on the calling thread for `pending` units.
  ///
  /// The returned guard resigns when dropped. If no child was adopted while
  /// current, the pending units are completed on resign.
  pub fn become_current(&self, pending: u64) -> CurrentProgress {
    CURRENT.with(|current| {
      current.borrow_mut().push(CurrentEntry {
        progress: self.clone(),
        pending,
        adopted: false,
      })
    });
    CurrentProgress {
      progress: self.clone(),
      _not_send: PhantomData,
    }
  }
}

/// Bracket during which a [`Progress`] is current on this thread.
///
/// Dropping the guard resigns. The guard cannot leave the thread it was
/// created on.
#[must_use = "the progress resigns as soon as the guard is dropped"]
pub struct CurrentProgress {
  progress: Progress,
  _not_send: PhantomData<*const ()>,
}

impl CurrentProgress {
  pub fn progress(&self) -> &Progress {
    &self.progress
  }

  /// Adopts `child` for this bracket's pending units.
  ///
  /// Does nothing if a child was already adopted during the bracket. If
  /// `child` cannot be adopted, the units still complete on resign.
  pub fn adopt(&self, child: &Progress) -> bool {
    let pending = CURRENT.with(|current| match current.borrow().last() {
      Some(top) if top.progress.ptr_eq(&self.progress) && !top.adopted => Some(top.pending),
      _ => None,
    });
    let Some(pending) = pending else {
      return false;
    };
    if !self.progress.adopt_child(child, pending) {
      return false;
    }
    CURRENT.with(|current| {
      if let Some(top) = current.borrow_mut().last_mut() {
        top.adopted = true;
      }
    });
    true
  }

  pub fn resign(self) {}
}

impl Drop for CurrentProgress {
  fn drop(&mut self) {
    let entry = CURRENT.with(|current| current.borrow_mut().pop());
    match entry {
      Some(entry) => {
        if !entry.progress.ptr_eq(&self.progress) {
          warn!("Progress resigned out of order.");
        }
        if !entry.adopted {
          entry.progress.complete_units(entry.pending);
        }
      }
      None => warn!("Progress resigned without being current."),
    }
  }
}

impl fmt::Debug for Progress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let kind = match &self.node.source {
      Source::Units(_) => "units",
      Source::Tracking(_) => "tracking",
    };
    f.debug_struct("Progress")
      .field("kind", &kind)
      .field("total", &self.total_unit_count())
      .field("completed", &self.completed_unit_count())
      .field("fraction", &self.fraction_completed())
      .finish()
  }
}
