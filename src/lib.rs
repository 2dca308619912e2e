//! Single-assignment promise with blocking wait and chained reactions.
//!
//! A [`Promise<T>`] is resolved exactly once, from any thread, with either a
//! value or a [`PromiseError`]. Consumers can block on [`Promise::wait`],
//! `.await` the handle from async code, or chain dependent work with
//! [`Promise::then`], [`Promise::catch`] and [`Promise::fin`]. Asynchronous
//! producers plug in through a perform action that receives a [`Resolver`].
//!
//! # Examples
//!
//! ```
//! use promise_link::{Promise, Step};
//!
//! let promise: Promise<i32> = Promise::new();
//! let doubled = promise.then(|v| Step::Value(v * 2));
//! promise.resolve(21).unwrap();
//! assert_eq!(doubled.wait().value(), Some(&42));
//! ```

pub mod error;
pub mod executor;
pub mod promise;

pub use error::{AlreadyResolved, PromiseError};
pub use executor::{ExecutionPolicy, Executor, ThreadExecutor};
pub use promise::{Outcome, Promise, Resolver, State, Step, SuccessFn};
