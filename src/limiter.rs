#![forbid(unsafe_code)]

//! Bounded-parallelism scheduler used for metadata fan-out.
//!
//! Batch downloads are deliberately sequential (see `download`), but per-track
//! metadata lookups are independent network round trips, so they run in
//! parallel up to a fixed ceiling. Waiting tasks start in arrival order.

use std::sync::Arc;
use tokio::sync::Semaphore;

/// Admits at most `limit` tasks at a time. Cloning shares the same ceiling.
#[derive(Clone)]
pub struct Limiter {
    permits: Arc<Semaphore>,
}

impl Limiter {
    /// Panics if `limit` is zero; a zero-width limiter would deadlock every
    /// caller.
    pub fn new(limit: usize) -> Self {
        assert!(limit >= 1, "limiter requires a positive limit");
        Self {
            permits: Arc::new(Semaphore::new(limit)),
        }
    }

    /// Runs `task` once a slot is free. Tasks complete independently; a
    /// failing task only releases its slot, it never cancels the others.
    pub async fn run<F>(&self, task: F) -> F::Output
    where
        F: Future,
    {
        // The semaphore is never closed, so acquisition only fails if the
        // limiter itself is dropped mid-acquire, which cannot happen while
        // `self` is borrowed here.
        let _permit = self
            .permits
            .acquire()
            .await
            .expect("limiter semaphore closed");
        task.await
    }
}
