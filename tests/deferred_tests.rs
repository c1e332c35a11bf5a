use deferred_tasks::{all, any, generic, Deferred, Executor, Job, SharedExecutor, TokioExecutor};
use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

// Executor that only runs jobs when told to, on the calling thread.
#[derive(Default)]
struct ManualExecutor {
  jobs: Mutex<Vec<Job>>,
}

impl fmt::Debug for ManualExecutor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ManualExecutor")
      .field("queued", &self.jobs.lock().unwrap().len())
      .finish()
  }
}

impl Executor for ManualExecutor {
  fn submit(&self, job: Job) {
    self.jobs.lock().unwrap().push(job);
  }

  fn submit_after(&self, _delay: Duration, job: Job) {
    self.submit(job);
  }
}

impl ManualExecutor {
  fn queued(&self) -> usize {
    self.jobs.lock().unwrap().len()
  }

  fn run_all(&self) -> usize {
    let mut ran = 0;
    loop {
      let jobs = std::mem::take(&mut *self.jobs.lock().unwrap());
      if jobs.is_empty() {
        return ran;
      }
      for job in jobs {
        job();
        ran += 1;
      }
    }
  }
}

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

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn test_fill_and_peek() {
  setup_tracing_for_test();
  let d = Deferred::<i32>::new();
  assert!(!d.is_filled());
  assert_eq!(d.peek(), None);

  d.fill(42);
  assert!(d.is_filled());
  assert_eq!(d.peek(), Some(42));
  assert_eq!(Deferred::filled("ready").peek(), Some("ready"));
}

#[test]
#[should_panic(expected = "Cannot fill an already-filled Deferred")]
fn test_second_strict_fill_is_a_fault() {
  let d = Deferred::new();
  d.fill(1);
  d.fill(2);
}

#[test]
#[should_panic(expected = "Cannot fill an already-filled Deferred")]
fn test_strict_fill_of_prefilled_is_a_fault() {
  Deferred::filled(1).fill(2);
}

#[test]
fn test_fill_if_unfilled_keeps_first_value() {
  setup_tracing_for_test();
  let d = Deferred::new();
  assert!(d.fill_if_unfilled("first"));
  assert!(!d.fill_if_unfilled("second"));
  assert_eq!(d.peek(), Some("first"));
  assert_eq!(d.wait(), "first");
}

// A value whose clone looks back at the deferred that holds it.
#[derive(Debug)]
struct SelfObserving {
  home: Arc<OnceLock<Deferred<SelfObserving>>>,
  saw_filled: bool,
}

impl Clone for SelfObserving {
  fn clone(&self) -> Self {
    let saw_filled = self.home.get().is_some_and(|d| d.is_filled());
    Self {
      home: self.home.clone(),
      saw_filled,
    }
  }
}

#[test]
fn test_value_clone_may_read_its_own_deferred() {
  setup_tracing_for_test();
  let executor = Arc::new(ManualExecutor::default());
  let shared: SharedExecutor = executor.clone();
  let home = Arc::new(OnceLock::new());
  let d = Deferred::new();
  assert!(home.set(d.clone()).is_ok());

  let (tx, rx) = mpsc::channel();
  d.upon_on(&shared, move |v: SelfObserving| tx.send(v.saw_filled).unwrap());
  d.fill(SelfObserving {
    home: home.clone(),
    saw_filled: false,
  });

  assert!(d.peek().is_some_and(|v| v.saw_filled));
  executor.run_all();
  assert!(rx.recv_timeout(WAIT).unwrap());
}

#[test]
fn test_continuations_run_exactly_once_before_and_after_fill() {
  setup_tracing_for_test();
  let executor = Arc::new(ManualExecutor::default());
  let shared: SharedExecutor = executor.clone();
  let d = Deferred::new();
  let seen = Arc::new(Mutex::new(Vec::new()));

  for i in 0..5 {
    let seen = seen.clone();
    d.upon_on(&shared, move |v: u32| seen.lock().unwrap().push((i, v)));
  }
  // nothing is queued, let alone run, before the fill
  assert_eq!(executor.queued(), 0);

  d.fill(7);
  // the filling call only hands the waiters to the executor
  assert!(seen.lock().unwrap().is_empty());
  assert_eq!(executor.queued(), 5);

  for i in 5..8 {
    let seen = seen.clone();
    d.upon_on(&shared, move |v: u32| seen.lock().unwrap().push((i, v)));
  }
  assert_eq!(executor.run_all(), 8);
  assert_eq!(executor.run_all(), 0);

  let seen = seen.lock().unwrap().clone();
  assert_eq!(seen, (0..8).map(|i| (i, 7)).collect::<Vec<_>>());
}

#[test]
fn test_upon_never_runs_on_the_filling_thread() {
  setup_tracing_for_test();
  let d = Deferred::new();
  let (tx, rx) = mpsc::channel();
  for _ in 0..4 {
    let tx = tx.clone();
    d.upon(move |_: ()| {
      let _ = tx.send(thread::current().id());
    });
  }
  let filler = thread::spawn(move || {
    d.fill(());
    thread::current().id()
  })
  .join()
  .unwrap();

  for _ in 0..4 {
    assert_ne!(rx.recv_timeout(WAIT).unwrap(), filler);
  }
}

#[test]
fn test_upon_is_not_called_before_fill() {
  setup_tracing_for_test();
  let d = Deferred::<u8>::new();
  let calls = Arc::new(AtomicUsize::new(0));
  let counter = calls.clone();
  d.upon(move |_| {
    counter.fetch_add(1, Ordering::SeqCst);
  });
  thread::sleep(Duration::from_millis(50));
  assert_eq!(calls.load(Ordering::SeqCst), 0);

  d.fill(1);
  let deadline = Instant::now() + WAIT;
  while calls.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
    thread::sleep(Duration::from_millis(5));
  }
  thread::sleep(Duration::from_millis(50));
  assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_map_and_bind_laws() {
  setup_tracing_for_test();
  let g = |x: i32| x * 3;
  let h = |x: i32| x - 4;

  let source = Deferred::new();
  let identity = source.map(|x| x);
  let chained = source.map(g).map(h);
  let composed = source.map(move |x| h(g(x)));
  let bound = source.bind(move |x| Deferred::filled(g(x)));
  let mapped = source.map(g);
  source.fill(5);

  assert_eq!(identity.wait(), 5);
  assert_eq!(chained.wait(), composed.wait());
  assert_eq!(bound.wait(), mapped.wait());
}

#[test]
fn test_bind_waits_for_inner_deferred() {
  setup_tracing_for_test();
  let inner = Deferred::<String>::new();
  let inner_for_bind = inner.clone();
  let outer = Deferred::filled(2).flat_map(move |n: usize| inner_for_bind.map(move |s| s.repeat(n)));

  assert_eq!(outer.wait_timeout(Duration::from_millis(50)), None);
  inner.fill("ab".to_string());
  assert_eq!(outer.wait(), "abab");
}

#[test]
fn test_both_in_either_fill_order() {
  setup_tracing_for_test();
  let a = Deferred::new();
  let b = Deferred::new();
  let pair = a.both(&b);
  b.fill("right");
  assert!(pair.wait_timeout(Duration::from_millis(30)).is_none());
  a.fill(1);
  assert_eq!(pair.wait(), (1, "right"));
}

#[test]
fn test_long_map_chains_complete() {
  setup_tracing_for_test();
  let root = Deferred::new();
  let mut tail = root.clone();
  for _ in 0..2_000 {
    tail = tail.map(|x: u64| x + 1);
  }
  root.fill(0);
  assert_eq!(tail.wait(), 2_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_all_preserves_input_order() {
  setup_tracing_for_test();
  let executor = TokioExecutor::new(tokio::runtime::Handle::current(), "all_order").shared();
  let inputs: Vec<Deferred<usize>> = (0..20).map(|_| Deferred::new()).collect();
  let combined = all(inputs.clone());

  let mut rng = rand::rng();
  for (i, d) in inputs.iter().enumerate() {
    let d = d.clone();
    let delay = Duration::from_millis(rng.random_range(0..60));
    executor.submit_after(delay, Box::new(move || d.fill(i * 10)));
  }

  let values = combined.value().await.unwrap();
  assert_eq!(values, (0..20).map(|i| i * 10).collect::<Vec<_>>());
}

#[test]
fn test_all_of_nothing_is_already_filled() {
  let combined = all(Vec::<Deferred<u8>>::new());
  assert_eq!(combined.peek(), Some(Vec::new()));
}

#[test]
fn test_all_waits_for_every_input() {
  setup_tracing_for_test();
  let inputs: Vec<Deferred<u8>> = (0..3).map(|_| Deferred::new()).collect();
  let combined = all(inputs.clone());
  inputs[2].fill(2);
  inputs[0].fill(0);
  assert!(combined.wait_timeout(Duration::from_millis(50)).is_none());
  inputs[1].fill(1);
  assert_eq!(combined.wait(), vec![0, 1, 2]);
}

#[test]
fn test_any_resolves_to_the_only_filled_input() {
  setup_tracing_for_test();
  let inputs: Vec<Deferred<&str>> = (0..5).map(|_| Deferred::new()).collect();
  let winner = any(inputs.clone());
  assert!(winner.wait_timeout(Duration::from_millis(30)).is_none());

  let third = inputs[3].clone();
  thread::spawn(move || third.fill("three"));
  assert_eq!(winner.wait(), (3, "three"));

  inputs[0].fill("zero");
  thread::sleep(Duration::from_millis(30));
  assert_eq!(winner.peek(), Some((3, "three")));
}

#[test]
fn test_any_prefers_first_prefilled_in_iteration_order() {
  setup_tracing_for_test();
  let inputs = vec![Deferred::new(), Deferred::filled(1), Deferred::filled(2)];
  let winner = any(inputs.clone());
  assert_eq!(winner.peek(), Some((1, 1)));

  inputs[0].fill(0);
  thread::sleep(Duration::from_millis(30));
  assert_eq!(winner.wait(), (1, 1));
}

#[test]
fn test_any_picks_one_winner_under_racing_fills() {
  setup_tracing_for_test();
  let inputs: Vec<Deferred<usize>> = (0..8).map(|_| Deferred::new()).collect();
  let winner = any(inputs.clone());
  let handles: Vec<_> = inputs
    .iter()
    .cloned()
    .enumerate()
    .map(|(i, d)| thread::spawn(move || d.fill(i)))
    .collect();
  for h in handles {
    h.join().unwrap();
  }
  let (index, value) = winner.wait();
  assert_eq!(index, value);
  thread::sleep(Duration::from_millis(30));
  assert_eq!(winner.peek(), Some((index, value)));
}

#[test]
fn test_blocking_wait_returns_after_fill_from_another_thread() {
  setup_tracing_for_test();
  let d = Deferred::new();
  let filler = d.clone();
  let start = Instant::now();
  thread::spawn(move || {
    thread::sleep(Duration::from_millis(40));
    filler.fill("late");
  });
  assert_eq!(d.wait(), "late");
  assert!(start.elapsed() >= Duration::from_millis(40));
  assert!(start.elapsed() < WAIT);
}

#[test]
fn test_blocking_wait_on_filled_returns_immediately() {
  let d = Deferred::filled(3);
  assert_eq!(d.wait(), 3);
  assert_eq!(d.wait_timeout(Duration::ZERO), Some(3));
}

#[test]
fn test_wait_timeout_gives_up() {
  setup_tracing_for_test();
  let d = Deferred::<u8>::new();
  let start = Instant::now();
  assert_eq!(d.wait_timeout(Duration::from_millis(30)), None);
  assert!(start.elapsed() >= Duration::from_millis(30));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_value_awaits_without_blocking() {
  setup_tracing_for_test();
  let d = Deferred::new();
  let filler = d.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(20)).await;
    filler.fill(99u64);
  });
  assert_eq!(d.value().await, Ok(99));
  assert_eq!(d.value().await, Ok(99));
}

#[test]
fn test_generic_executor_is_usable_explicitly() {
  setup_tracing_for_test();
  let executor = generic();
  let d = Deferred::new();
  let doubled = d.map_on(&executor, |x: i64| x * 2);
  let paired = doubled.both_on(&executor, &Deferred::filled('z'));
  d.fill(21);
  assert_eq!(paired.wait(), (42, 'z'));
}
