use crate::deferred::Deferred;
use crate::executor::{self, SharedExecutor};

use std::sync::Arc;

use tracing::trace;

/// Combines `deferreds` into one `Deferred` of all their values, in input order.
///
/// Values are collected one after another: once the value at position `i` is
/// known, interest is registered on position `i + 1`. An empty input gives an
/// already-filled empty vector.
pub fn all_on<T, I>(executor: &SharedExecutor, deferreds: I) -> Deferred<Vec<T>>
where
  T: Clone + Send + Sync + 'static,
  I: IntoIterator<Item = Deferred<T>>,
{
  let deferreds: Arc<Vec<Deferred<T>>> = Arc::new(deferreds.into_iter().collect());
  if deferreds.is_empty() {
    return Deferred::filled(Vec::new());
  }

  let combined = Deferred::new();
  let results = Vec::with_capacity(deferreds.len());
  collect_next(executor.clone(), deferreds, results, combined.clone());
  combined
}

pub fn all<T, I>(deferreds: I) -> Deferred<Vec<T>>
where
  T: Clone + Send + Sync + 'static,
  I: IntoIterator<Item = Deferred<T>>,
{
  all_on(&executor::generic(), deferreds)
}

fn collect_next<T>(
  executor: SharedExecutor,
  deferreds: Arc<Vec<Deferred<T>>>,
  results: Vec<T>,
  combined: Deferred<Vec<T>>,
) where
  T: Clone + Send + Sync + 'static,
{
  let next = deferreds[results.len()].clone();
  let next_executor = executor.clone();
  next.upon_on(&executor, move |value| {
    let mut results = results;
    results.push(value);
    if results.len() == deferreds.len() {
      combined.fill(results);
    } else {
      collect_next(next_executor, deferreds, results, combined);
    }
  });
}

/// Resolves to the index and value of the first of `deferreds` to be filled.
///
/// Inputs that are already filled when `any_on` is called win in iteration
/// order, without going through the executor. Otherwise every input races to
/// fill the result and the first continuation to run wins; the rest are
/// dropped. An empty input is never filled.
pub fn any_on<T, I>(executor: &SharedExecutor, deferreds: I) -> Deferred<(usize, T)>
where
  T: Clone + Send + Sync + 'static,
  I: IntoIterator<Item = Deferred<T>>,
{
  let deferreds: Vec<Deferred<T>> = deferreds.into_iter().collect();
  let combined = Deferred::new();

  let already_filled = deferreds
    .iter()
    .enumerate()
    .find_map(|(index, d)| d.peek().map(|value| (index, value)));
  if let Some(winner) = already_filled {
    combined.fill(winner);
    return combined;
  }

  for (index, d) in deferreds.iter().enumerate() {
    let combined = combined.clone();
    d.upon_on(executor, move |value| {
      if combined.fill_if_unfilled((index, value)) {
        trace!(index, "any: input won the race.");
      }
    });
  }
  combined
}

pub fn any<T, I>(deferreds: I) -> Deferred<(usize, T)>
where
  T: Clone + Send + Sync + 'static,
  I: IntoIterator<Item = Deferred<T>>,
{
  any_on(&executor::generic(), deferreds)
}
