use deferred_tasks::{joined_tasks, Deferred, JoinedTasks, Task, TaskError, TaskResult};
use std::thread;
use std::time::{Duration, Instant};

fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,deferred_tasks=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

// Helper to create a task that resolves after `delay_ms`.
fn delayed_task(delay_ms: u64, outcome: TaskResult<u32>) -> Task<u32> {
  Task::spawn(move |_| {
    thread::sleep(Duration::from_millis(delay_ms));
    outcome
  })
}

fn cancellable_task() -> Task<()> {
  Task::spawn(|ctx| {
    for _ in 0..2_000 {
      if ctx.is_cancelled() {
        return Err(TaskError::Cancelled);
      }
      thread::sleep(Duration::from_millis(5));
    }
    Ok(())
  })
}

#[test]
fn test_join_of_nothing_succeeds_immediately() {
  setup_tracing_for_test();
  let joined = joined_tasks(Vec::<Task<u8>>::new());
  assert_eq!(joined.peek(), Some(Ok(())));
  assert!(joined.progress().is_finished());
}

#[test]
fn test_join_succeeds_when_all_succeed() {
  setup_tracing_for_test();
  let tasks: Vec<Task<u32>> = (0..5).map(|i| delayed_task(5 * i, Ok(i as u32))).collect();
  let joined = joined_tasks(tasks.clone());
  assert_eq!(joined.wait(), Ok(()));
  assert!(tasks.iter().all(|t| t.is_filled()));
  assert!(joined.progress().is_finished());
}

#[test]
fn test_join_reports_first_failure_after_everything_settled() {
  setup_tracing_for_test();
  let start = Instant::now();
  let t1 = delayed_task(20, Err(TaskError::msg("E1")));
  let t2 = delayed_task(80, Ok(2));
  let t3 = delayed_task(160, Err(TaskError::msg("E3")));
  let joined = joined_tasks(vec![t1.clone(), t2.clone(), t3.clone()]);

  // E1 is known long before the join may resolve
  assert_eq!(t1.wait(), Err(TaskError::msg("E1")));
  assert_eq!(joined.wait_timeout(Duration::from_millis(40)), None);

  assert_eq!(joined.wait(), Err(TaskError::msg("E1")));
  assert!(start.elapsed() >= Duration::from_millis(160));
  assert!(t2.is_filled());
  assert_eq!(t3.peek(), Some(Err(TaskError::msg("E3"))));
  assert!(joined.progress().is_finished());
}

#[test]
fn test_join_tracks_progress_per_task() {
  setup_tracing_for_test();
  let fast = delayed_task(0, Ok(1));
  let slow = delayed_task(200, Ok(2));
  let joined = joined_tasks(vec![fast.clone(), slow.clone()]);

  fast.wait().unwrap();
  assert!(joined.progress().fraction_completed() >= 0.5);
  assert!(!joined.progress().is_finished());

  joined.wait().unwrap();
  assert!(joined.progress().is_finished());
}

#[test]
fn test_join_accepts_plain_deferred_results() {
  setup_tracing_for_test();
  let inputs: Vec<Deferred<TaskResult<&str>>> = (0..3).map(|_| Deferred::new()).collect();
  let joined = inputs.clone().joined_tasks();
  assert_eq!(joined.progress().total_unit_count(), 3);

  inputs[1].fill(Err(TaskError::msg("second")));
  inputs[0].fill(Ok("first"));
  assert!(joined.wait_timeout(Duration::from_millis(40)).is_none());
  assert!((joined.progress().fraction_completed() - 2.0 / 3.0).abs() < 1e-9);

  // plain results cannot be cancelled
  joined.cancel();
  assert!(!joined.is_cancelled());

  inputs[2].fill(Err(TaskError::msg("third")));
  assert_eq!(joined.wait(), Err(TaskError::msg("second")));
  assert!(joined.progress().is_finished());
}

#[test]
fn test_cancelling_the_join_cancels_every_task() {
  setup_tracing_for_test();
  let tasks: Vec<Task<()>> = (0..3).map(|_| cancellable_task()).collect();
  let joined = tasks.clone().joined_tasks();
  thread::sleep(Duration::from_millis(20));

  joined.cancel();
  assert!(joined.is_cancelled());
  assert_eq!(joined.wait(), Err(TaskError::Cancelled));
  for task in &tasks {
    assert!(task.is_cancelled());
    assert_eq!(task.peek(), Some(Err(TaskError::Cancelled)));
  }
}

#[test]
fn test_cancelled_join_reports_cancelled_when_an_input_already_finished() {
  setup_tracing_for_test();
  let finished = delayed_task(0, Ok(1));
  finished.wait().unwrap();
  let running = cancellable_task();
  let joined = joined_tasks(vec![finished.clone(), running.map(|()| 0)]);

  joined.cancel();
  assert!(joined.is_cancelled());
  assert!(!finished.is_cancelled());
  assert!(running.is_cancelled());
  assert_eq!(joined.wait(), Err(TaskError::Cancelled));
}

#[test]
fn test_join_of_tasks_sharing_a_progress_tree() {
  setup_tracing_for_test();
  let root = delayed_task(10, Ok(4));
  let derived = root.map(|x| x * 2);
  let joined = joined_tasks(vec![root.clone(), derived.clone()]);

  assert_eq!(joined.wait(), Ok(()));
  assert_eq!(derived.peek(), Some(Ok(8)));
  assert!(joined.progress().is_finished());
}

#[test]
fn test_joined_task_can_be_mapped() {
  setup_tracing_for_test();
  let joined = vec![delayed_task(5, Ok(1)), delayed_task(10, Ok(2))].joined_tasks();
  let after = joined.map(|()| "all done");
  assert_eq!(after.wait(), Ok("all done"));
  assert!(joined.progress().is_finished());
}
