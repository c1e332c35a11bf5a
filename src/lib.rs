//! Single-assignment deferred values, combinators over them, and cancellable,
//! progress-tracked tasks, all running their continuations on a pluggable
//! executor.

mod cancel;
mod combinators;
mod deferred;
mod error;
mod executor;
mod group;
mod join;
mod progress;
mod protected;
mod task;

pub use cancel::{CancelAll, CancelHandle, Cancellable, NoCancellation};
pub use combinators::{all, all_on, any, any_on};
pub use deferred::Deferred;
pub use error::{DeferredError, TaskError, TaskResult};
pub use executor::{generic, Executor, Job, Priority, SharedExecutor, TokioExecutor};
pub use group::Group;
pub use join::{joined_tasks, joined_tasks_on, JoinedTasks, TaskLike};
pub use progress::{CurrentProgress, Progress};
pub use protected::ProtectedState;
pub use task::{Task, TaskContext};
