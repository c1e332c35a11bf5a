use deferred_tasks::{JoinedTasks, Task, TaskError};
use std::thread;
use std::time::Duration;
use tracing::info;

fn download(name: &'static str, delay_ms: u64, fail: bool) -> Task<usize> {
  Task::spawn(move |ctx| {
    let steps = delay_ms / 10;
    ctx.progress().extend(steps.saturating_sub(1));
    for _ in 0..steps {
      if ctx.is_cancelled() {
        info!("{} noticed cancellation", name);
        return Err(TaskError::Cancelled);
      }
      thread::sleep(Duration::from_millis(10));
      ctx.progress().complete_units(1);
    }
    if fail {
      return Err(TaskError::msg(format!("{} failed", name)));
    }
    info!("{} done", name);
    Ok(name.len())
  })
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Joined Tasks Example ---");

  let joined = vec![
    download("alpha", 100, true),
    download("beta", 300, false),
    download("gamma", 500, true),
  ]
  .joined_tasks();

  while !joined.is_filled() {
    info!("Overall progress: {:.0}%", joined.progress().fraction_completed() * 100.0);
    tokio::time::sleep(Duration::from_millis(100)).await;
  }

  // Every download has finished by now; only the earliest failure is reported.
  match joined.result().await {
    Ok(()) => info!("All downloads succeeded"),
    Err(e) => info!("Join failed with: {}", e),
  }

  let cancelled = vec![download("delta", 5_000, false), download("epsilon", 5_000, false)].joined_tasks();
  tokio::time::sleep(Duration::from_millis(50)).await;
  cancelled.cancel();
  info!("Cancelled join resolved with: {:?}", cancelled.result().await);

  info!("--- Joined Tasks Example End ---");
}
