//! Executor-agnostic dispatch for reactions and chain deliveries.
//!
//! The promise itself never owns a thread pool. Whoever embeds it decides
//! where reactions run: inline on the resolving thread, or handed to an
//! [`Executor`] implementation wrapping whatever pool the application uses.

use std::sync::Arc;
use std::thread;

/// Opaque "run this job somewhere" capability.
pub trait Executor: Send + Sync {
    /// Submit a job. The job must eventually run; ordering between jobs is
    /// whatever the underlying executor provides.
    fn execute(&self, job: Box<dyn FnOnce() + Send>);
}

/// Where a promise runs its chain deliveries once it settles.
///
/// Children created by `then`/`catch`/`fin` inherit the parent's policy at
/// chaining time.
#[derive(Clone, Default)]
pub enum ExecutionPolicy {
    /// Run on whichever thread called `resolve`/`error`.
    #[default]
    Inline,
    /// Hand the whole delivery batch to the executor before returning.
    Dispatch(Arc<dyn Executor>),
}

/// Thread-per-job [`Executor`] for tests and embedders without a pool.
pub struct ThreadExecutor;

impl Executor for ThreadExecutor {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        thread::spawn(job);
    }
}
