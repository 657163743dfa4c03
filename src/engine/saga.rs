//! Compensating-transaction helper for dual writes.
//!
//! A dual write first commits a local step (e.g. the ownership row) and then
//! performs remote steps that may fail or time out. Each committed local step
//! registers a compensation; the first failing step runs every registered
//! compensation in reverse order. `commit()` discards them once all steps
//! succeed. A saga dropped without `commit()` (the caller's future was
//! cancelled mid-flight) also compensates, so no row outlives an unverified
//! remote state.

use std::future::Future;

use crate::error::AppError;

type Compensation = Box<dyn FnOnce() -> Result<(), AppError> + Send>;

pub struct Saga {
    name: &'static str,
    compensations: Vec<(&'static str, Compensation)>,
}

impl Saga {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            compensations: Vec::new(),
        }
    }

    /// Register how to undo a step that has already been applied.
    pub fn on_rollback<F>(&mut self, step: &'static str, undo: F)
    where
        F: FnOnce() -> Result<(), AppError> + Send + 'static,
    {
        self.compensations.push((step, Box::new(undo)));
    }

    /// Await a forward step. On failure, compensate everything registered so far
    /// and hand the original error back.
    pub async fn step<T, Fut>(&mut self, step: &'static str, fut: Fut) -> Result<T, AppError>
    where
        Fut: Future<Output = Result<T, AppError>>,
    {
        match fut.await {
            Ok(value) => Ok(value),
            Err(err) => {
                tracing::warn!(
                    saga = self.name,
                    step,
                    kind = err.kind(),
                    error = %err,
                    "Saga step failed, compensating"
                );
                self.compensate();
                Err(err)
            }
        }
    }

    /// All steps succeeded; forget the compensations.
    pub fn commit(mut self) {
        self.compensations.clear();
    }

    /// Number of compensations that would run on failure.
    pub fn pending(&self) -> usize {
        self.compensations.len()
    }

    fn compensate(&mut self) {
        while let Some((step, undo)) = self.compensations.pop() {
            match undo() {
                Ok(()) => tracing::debug!(saga = self.name, step, "Compensated"),
                // The original failure is what the caller sees.
                Err(e) => tracing::error!(saga = self.name, step, error = %e, "Compensation failed"),
            }
        }
    }
}

impl Drop for Saga {
    fn drop(&mut self) {
        if self.pending() > 0 {
            tracing::warn!(
                saga = self.name,
                pending = self.pending(),
                "Saga dropped before commit, compensating"
            );
            self.compensate();
        }
    }
}
