use deferred_tasks::{all, any, Deferred, Task, TokioExecutor};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Basic Usage Example ---");

  let executor = TokioExecutor::new(Handle::current(), "basic_executor").shared();

  // A producer fills a Deferred later; consumers chain on it right away.
  let greeting = Deferred::<String>::new();
  let shouted = greeting.map_on(&executor, |s| s.to_uppercase());
  let length = shouted.map_on(&executor, |s| s.len());

  let producer = greeting.clone();
  executor.submit_after(
    Duration::from_millis(200),
    Box::new(move || producer.fill("hello, deferred".to_string())),
  );

  let (text, len) = shouted.both(&length).value().await.expect("executor shut down");
  info!("Shouted text: {} ({} bytes)", text, len);

  // `all` keeps input order, `any` takes whichever is first.
  let parts: Vec<Deferred<u64>> = (0..4).map(|_| Deferred::new()).collect();
  for (i, part) in parts.iter().enumerate() {
    let part = part.clone();
    let delay = Duration::from_millis(100 * (4 - i as u64));
    executor.submit_after(delay, Box::new(move || part.fill(i as u64 * i as u64)));
  }
  let first = any(parts.clone()).value().await.expect("executor shut down");
  info!("First part to arrive: index {} value {}", first.0, first.1);
  let squares = all(parts).value().await.expect("executor shut down");
  info!("All parts in order: {:?}", squares);

  // Tasks add failure, cancellation and progress on top.
  let task = Task::spawn_on(&executor, |ctx| {
    for step in 0..5 {
      if ctx.is_cancelled() {
        return Err(deferred_tasks::TaskError::Cancelled);
      }
      std::thread::sleep(Duration::from_millis(50));
      info!("Task {} finished step {}", ctx.task_id(), step);
    }
    Ok(21u32)
  })
  .map(|x| x * 2);

  match task.result().await {
    Ok(answer) => info!("Task answered {} (progress {:.0}%)", answer, task.progress().fraction_completed() * 100.0),
    Err(e) => info!("Task failed: {}", e),
  }

  info!("--- Basic Usage Example End ---");
}
