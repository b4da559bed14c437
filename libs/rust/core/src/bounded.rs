//! Bounded parallel map over a dedicated thread pool.

use rayon::prelude::*;
use std::panic::{catch_unwind, AssertUnwindSafe};
use thiserror::Error;

/// A task that panicked; the rest of the batch still ran.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("task {index} panicked: {message}")]
pub struct TaskPanic { pub index: usize, pub message: String }

#[derive(Debug, Error)]
#[error("worker pool: {0}")]
pub struct PoolError(#[from] rayon::ThreadPoolBuildError);

/// Run `f` over `items` with at most `concurrency` (min 1) tasks at once.
/// Results come back in input order.
pub fn bounded_parallel_map<T, R, F>(items: Vec<T>, concurrency: usize, f: F) -> Result<Vec<Result<R, TaskPanic>>, PoolError>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Send + Sync,
{
    if items.is_empty() { return Ok(Vec::new()); }
    let threads = concurrency.max(1).min(items.len());
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("bounded-map-{i}"))
        .build()?;
    Ok(pool.install(|| {
        items.into_par_iter().enumerate().map(|(index, item)| {
            catch_unwind(AssertUnwindSafe(|| f(item))).map_err(|payload| TaskPanic { index, message: panic_message(payload.as_ref()) })
        }).collect()
    }))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload.downcast_ref::<&str>().map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".into())
}
