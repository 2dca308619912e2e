//! The resolution state machine and the chaining protocol on top of it.
//!
//! A [`Promise`] is a shared handle (`Arc` over a mutex-guarded cell, with a
//! condvar gate for blocking waiters) to a single-assignment outcome. It is
//! resolved exactly once, from any thread, and delivers that outcome to
//! blocking waiters, async wakers, and every chained child in registration
//! order.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Poll, Waker};

use log::{debug, trace, warn};

use crate::error::{AlreadyResolved, PromiseError};
use crate::executor::ExecutionPolicy;

/// Lifecycle of a promise. Moves forward only:
/// `Pending < Running < {Succeeded | Failed} < Resolved`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Created, not yet activated or delivered.
    Pending,
    /// Activated (its perform action has been invoked, or a delivery has
    /// claimed the outcome slot and is computing the terminal outcome).
    Running,
    /// Terminal with a value.
    Succeeded,
    /// Terminal with an error.
    Failed,
    /// Terminal, and every reaction and chained delivery has been run or
    /// handed to the executor.
    Resolved,
}

impl State {
    /// True once the outcome is decided (`Succeeded`, `Failed` or `Resolved`).
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Succeeded | State::Failed | State::Resolved)
    }
}

/// Terminal outcome of a promise.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Success(T),
    Failure(PromiseError),
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Success(value) => Some(value),
            Outcome::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&PromiseError> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failure(err) => Some(err),
        }
    }
}

/// Result of a success reaction.
pub enum Step<T> {
    /// The link settles with this value.
    Value(T),
    /// The link settles only once this promise settles, with its outcome.
    /// This is how a reaction chains further asynchronous work.
    Defer(Promise<T>),
    /// The link fails with this error.
    Fail(PromiseError),
}

/// Success reaction: receives the delivered value, produces the link's
/// outcome. Runs at most once, on the delivering thread.
pub type SuccessFn<T> = Box<dyn FnOnce(T) -> Step<T> + Send>;

/// Failure reaction: observes the error, optionally producing a replacement
/// value. `Some(v)` recovers the chain with `v`; `None` recovers with
/// `T::default()` unless the promise forwards errors unchanged.
type FailureFn<T> = Box<dyn FnOnce(&PromiseError) -> Option<T> + Send>;

/// Finalizer reaction: observes the outcome, never alters it.
type FinalFn<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;

/// Asynchronous producer hook: invoked once at activation with the resolver
/// it must eventually call, synchronously or from any other thread.
type PerformFn<T> = Box<dyn FnOnce(Resolver<T>) + Send>;

/// An owned chain link. `raw` links splice a deferred promise's outcome
/// straight into the target without running the target's reactions again.
struct Link<T> {
    target: Promise<T>,
    raw: bool,
}

struct Inner<T> {
    state: State,
    outcome: Option<Arc<Outcome<T>>>,
    on_success: Option<SuccessFn<T>>,
    on_failure: Option<FailureFn<T>>,
    forward_error: bool,
    finalizer: Option<FinalFn<T>>,
    perform: Option<PerformFn<T>>,
    links: Vec<Link<T>>,
    wakers: Vec<Waker>, // Keep every waker, not just the last one. A single
                        // slot loses wakeups when two consumers poll the
                        // same promise.
    settling: bool,
    policy: ExecutionPolicy,
}

impl<T> Inner<T> {
    fn fresh(policy: ExecutionPolicy) -> Self {
        Inner {
            state: State::Pending,
            outcome: None,
            on_success: None,
            on_failure: None,
            forward_error: false,
            finalizer: None,
            perform: None,
            links: Vec::new(),
            wakers: Vec::new(),
            settling: false,
            policy,
        }
    }
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    gate: Condvar,
}

/// Single-assignment promise.
///
/// Cloning yields another handle to the same underlying cell; any handle may
/// resolve it (the first delivery wins, later ones get [`AlreadyResolved`])
/// and any number of handles may wait on it concurrently.
///
/// # Examples
///
/// ```
/// use promise_link::{Promise, Step};
/// use std::thread;
///
/// let promise: Promise<String> = Promise::new();
/// let producer = promise.clone();
/// let worker = thread::spawn(move || {
///     producer.resolve("🍓".into()).unwrap();
/// });
/// assert_eq!(promise.wait().value(), Some(&"🍓".to_string()));
/// worker.join().expect("The worker thread has panicked");
/// ```
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shared.inner.try_lock() {
            Ok(inner) => write!(f, "Promise({:?})", inner.state),
            Err(_) => write!(f, "Promise(<busy>)"),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolution handle given to a perform action. Consuming it enforces the
/// single resolution attempt the action is entitled to.
pub struct Resolver<T> {
    promise: Promise<T>,
}

impl<T> Promise<T> {
    fn from_inner(inner: Inner<T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                gate: Condvar::new(),
            }),
        }
    }

    /// Unresolved promise with no reactions.
    pub fn new() -> Self {
        Self::from_inner(Inner::fresh(ExecutionPolicy::default()))
    }

    /// Promise with a success reaction only.
    pub fn with_success(reaction: impl FnOnce(T) -> Step<T> + Send + 'static) -> Self {
        let mut inner = Inner::fresh(ExecutionPolicy::default());
        inner.on_success = Some(Box::new(reaction));
        Self::from_inner(inner)
    }

    /// Promise with a failure reaction only. A failure delivered to it is
    /// treated as recovered unless built with
    /// [`with_failure_forwarding`](Self::with_failure_forwarding).
    pub fn with_failure(
        handler: impl FnOnce(&PromiseError) -> Option<T> + Send + 'static,
    ) -> Self {
        let mut inner = Inner::fresh(ExecutionPolicy::default());
        inner.on_failure = Some(Box::new(handler));
        Self::from_inner(inner)
    }

    /// Failure observer: after the handler runs (and does not produce a
    /// replacement value), the original error still continues to this
    /// promise's own links instead of being treated as handled.
    pub fn with_failure_forwarding(
        handler: impl FnOnce(&PromiseError) -> Option<T> + Send + 'static,
    ) -> Self {
        let mut inner = Inner::fresh(ExecutionPolicy::default());
        inner.on_failure = Some(Box::new(handler));
        inner.forward_error = true;
        Self::from_inner(inner)
    }

    /// Promise with both reactions.
    pub fn with_reactions(
        success: impl FnOnce(T) -> Step<T> + Send + 'static,
        failure: impl FnOnce(&PromiseError) -> Option<T> + Send + 'static,
    ) -> Self {
        let mut inner = Inner::fresh(ExecutionPolicy::default());
        inner.on_success = Some(Box::new(success));
        inner.on_failure = Some(Box::new(failure));
        Self::from_inner(inner)
    }

    /// Promise driven by an asynchronous producer, activated immediately:
    /// `action` runs on the calling thread before this returns, and may hand
    /// its [`Resolver`] to any other thread.
    pub fn with_perform(action: impl FnOnce(Resolver<T>) + Send + 'static) -> Self {
        let promise = Self::with_perform_deferred(action);
        promise.activate();
        promise
    }

    /// Like [`with_perform`](Self::with_perform) but lazy: the action runs on
    /// the first `wait`, chain registration, or poll.
    pub fn with_perform_deferred(action: impl FnOnce(Resolver<T>) + Send + 'static) -> Self {
        let mut inner = Inner::fresh(ExecutionPolicy::default());
        inner.perform = Some(Box::new(action));
        Self::from_inner(inner)
    }

    /// Perform-driven promise with a failure reaction attached.
    pub fn with_perform_and_failure(
        action: impl FnOnce(Resolver<T>) + Send + 'static,
        failure: impl FnOnce(&PromiseError) -> Option<T> + Send + 'static,
    ) -> Self {
        let mut inner = Inner::fresh(ExecutionPolicy::default());
        inner.perform = Some(Box::new(action));
        inner.on_failure = Some(Box::new(failure));
        let promise = Self::from_inner(inner);
        promise.activate();
        promise
    }

    /// Sets where this promise runs its chain deliveries once settled.
    /// Install before sharing the handle; children inherit it.
    pub fn with_policy(self, policy: ExecutionPolicy) -> Self {
        self.shared.inner.lock().unwrap().policy = policy;
        self
    }

    /// Runs the perform action if one is pending. Idempotent.
    fn activate(&self) {
        let perform = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.state == State::Pending && inner.perform.is_some() {
                inner.state = State::Running;
                inner.perform.take()
            } else {
                None
            }
        };
        if let Some(action) = perform {
            trace!("running perform action");
            action(Resolver {
                promise: self.clone(),
            });
        }
    }

    /// Blocks the calling thread until the outcome is set, then returns it.
    ///
    /// Safe to call from any number of threads, before or after resolution:
    /// all waiters are released by the one resolution event and a late
    /// caller returns immediately with the stored outcome. A promise that is
    /// never resolved blocks its waiters indefinitely.
    pub fn wait(&self) -> Arc<Outcome<T>> {
        self.activate();
        let inner = self.shared.inner.lock().unwrap();
        let inner = self
            .shared
            .gate
            .wait_while(inner, |inner| inner.outcome.is_none())
            .unwrap();
        inner.outcome.clone().unwrap()
    }

    /// True once the outcome is decided. Implies the reactions have been run
    /// or handed to the executor.
    pub fn is_resolved(&self) -> bool {
        self.shared.inner.lock().unwrap().state.is_terminal()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.shared.inner.lock().unwrap().state
    }

    /// The stored outcome, if the promise has settled.
    pub fn outcome(&self) -> Option<Arc<Outcome<T>>> {
        self.shared.inner.lock().unwrap().outcome.clone()
    }

    fn policy(&self) -> ExecutionPolicy {
        self.shared.inner.lock().unwrap().policy.clone()
    }
}

impl<T> Promise<T>
where
    T: Clone + Default + Send + Sync + 'static,
{
    /// Transitions to `Succeeded` with `value`, releasing every waiter and
    /// delivering to every chained link before returning (or handing the
    /// deliveries to the configured executor).
    ///
    /// Fails with [`AlreadyResolved`] if the outcome slot was already
    /// claimed; the stored outcome is never altered.
    pub fn resolve(&self, value: T) -> Result<(), AlreadyResolved> {
        self.deliver(Outcome::Success(value))
    }

    /// Value-less `resolve` convenience: delivers `T::default()`.
    pub fn resolve_empty(&self) -> Result<(), AlreadyResolved> {
        self.deliver(Outcome::Success(T::default()))
    }

    /// Transitions to `Failed` with `err`. If this promise carries a failure
    /// reaction it runs here (recovery or forward, see [`catch`](Self::catch));
    /// otherwise the error continues unchanged to every chained link, and if
    /// there are none it stays queryable via [`wait`](Self::wait) /
    /// [`outcome`](Self::outcome).
    pub fn error(&self, err: PromiseError) -> Result<(), AlreadyResolved> {
        self.deliver(Outcome::Failure(err))
    }

    /// Argument-less `error` convenience: fails with
    /// [`PromiseError::Unspecified`].
    pub fn error_unspecified(&self) -> Result<(), AlreadyResolved> {
        self.deliver(Outcome::Failure(PromiseError::Unspecified))
    }

    /// Chains a success reaction, returning the link promise.
    ///
    /// On parent success the reaction receives the value and its [`Step`]
    /// becomes the link's outcome (a `Defer` settles the link with the
    /// deferred promise's eventual outcome, never with the promise itself).
    /// On parent failure the reaction is skipped and the link fails with the
    /// same error. Chaining after the parent has settled, even fully
    /// `Resolved`, replays the stored outcome synchronously. Multiple links
    /// on one parent fire in registration order.
    pub fn then(&self, reaction: impl FnOnce(T) -> Step<T> + Send + 'static) -> Promise<T> {
        self.then_boxed(Box::new(reaction))
    }

    /// [`then`](Self::then) taking an already-boxed reaction.
    pub fn then_boxed(&self, reaction: SuccessFn<T>) -> Promise<T> {
        self.activate();
        let mut inner = Inner::fresh(self.policy());
        inner.on_success = Some(reaction);
        let child = Promise::from_inner(inner);
        self.attach(Link {
            target: child.clone(),
            raw: false,
        });
        child
    }

    /// Chains an ordered sequence of success reactions, equivalent to
    /// `then(r1).then(r2)...`: left to right, and once any link fails the
    /// remaining reactions are skipped while the error flows to the end.
    pub fn then_each(&self, reactions: impl IntoIterator<Item = SuccessFn<T>>) -> Promise<T> {
        reactions
            .into_iter()
            .fold(self.clone(), |link, reaction| link.then_boxed(reaction))
    }

    /// Two-argument chain: the link transforms a success with `success` and
    /// handles a failure with `failure` (tried before generic propagation).
    pub fn then_or(
        &self,
        success: impl FnOnce(T) -> Step<T> + Send + 'static,
        failure: impl FnOnce(&PromiseError) -> Option<T> + Send + 'static,
    ) -> Promise<T> {
        self.activate();
        let mut inner = Inner::fresh(self.policy());
        inner.on_success = Some(Box::new(success));
        inner.on_failure = Some(Box::new(failure));
        let child = Promise::from_inner(inner);
        self.attach(Link {
            target: child.clone(),
            raw: false,
        });
        child
    }

    /// Chains a failure handler. A parent failure runs the handler; unless
    /// it produces a replacement value the link recovers with
    /// `T::default()`. A parent success passes through untouched.
    pub fn catch(
        &self,
        handler: impl FnOnce(&PromiseError) -> Option<T> + Send + 'static,
    ) -> Promise<T> {
        self.catch_link(Box::new(handler), false)
    }

    /// Chains a failure observer that forwards the original error unchanged
    /// to its own links after the handler runs, unless the handler itself
    /// produced a replacement value.
    pub fn catch_forwarding(
        &self,
        handler: impl FnOnce(&PromiseError) -> Option<T> + Send + 'static,
    ) -> Promise<T> {
        self.catch_link(Box::new(handler), true)
    }

    fn catch_link(&self, handler: FailureFn<T>, forward: bool) -> Promise<T> {
        self.activate();
        let mut inner = Inner::fresh(self.policy());
        inner.on_failure = Some(handler);
        inner.forward_error = forward;
        let child = Promise::from_inner(inner);
        self.attach(Link {
            target: child.clone(),
            raw: false,
        });
        child
    }

    /// Chains a finalizer: runs on either outcome, and the original outcome
    /// continues past the link unchanged (a failed parent stays failed).
    pub fn fin(&self, finalizer: impl FnOnce(&Outcome<T>) + Send + 'static) -> Promise<T> {
        self.activate();
        let mut inner = Inner::fresh(self.policy());
        inner.finalizer = Some(Box::new(finalizer));
        let child = Promise::from_inner(inner);
        self.attach(Link {
            target: child.clone(),
            raw: false,
        });
        child
    }

    /// Registers a link, replaying the stored outcome immediately if this
    /// promise has already settled.
    fn attach(&self, link: Link<T>) {
        let mut inner = self.shared.inner.lock().unwrap();
        match inner.outcome.clone() {
            Some(outcome) => {
                drop(inner);
                Self::deliver_link(link, &outcome);
            }
            None => inner.links.push(link),
        }
    }

    /// Delivers an incoming outcome: claims the write-once slot, runs this
    /// promise's own reactions on the calling thread, and settles with the
    /// result.
    fn deliver(&self, incoming: Outcome<T>) -> Result<(), AlreadyResolved> {
        let (on_success, on_failure, finalizer, forward) = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.settling || inner.state.is_terminal() {
                return Err(AlreadyResolved);
            }
            inner.settling = true;
            if inner.state == State::Pending {
                inner.state = State::Running;
            }
            (
                inner.on_success.take(),
                inner.on_failure.take(),
                inner.finalizer.take(),
                inner.forward_error,
            )
        };

        if let Some(finalize) = finalizer {
            finalize(&incoming);
            self.settle(incoming);
            return Ok(());
        }

        let terminal = match incoming {
            Outcome::Success(value) => match on_success {
                Some(react) => match react(value) {
                    Step::Value(value) => Outcome::Success(value),
                    Step::Fail(err) => Outcome::Failure(err),
                    Step::Defer(chained) => {
                        // Flatten: this promise settles with the chained
                        // promise's eventual outcome. The slot stays claimed
                        // in the meantime.
                        chained.attach(Link {
                            target: self.clone(),
                            raw: true,
                        });
                        return Ok(());
                    }
                },
                None => Outcome::Success(value),
            },
            Outcome::Failure(err) => match on_failure {
                Some(handle) => match handle(&err) {
                    Some(replacement) => Outcome::Success(replacement),
                    None if forward => Outcome::Failure(err),
                    None => Outcome::Success(T::default()),
                },
                None => Outcome::Failure(err),
            },
        };
        self.settle(terminal);
        Ok(())
    }

    /// Stores the terminal outcome, wakes every waiter, dispatches the links
    /// per policy, then marks the promise `Resolved`.
    fn settle(&self, outcome: Outcome<T>) {
        let state = if outcome.is_success() {
            State::Succeeded
        } else {
            State::Failed
        };
        let (links, wakers, policy, outcome) = {
            let mut inner = self.shared.inner.lock().unwrap();
            let outcome = Arc::new(outcome);
            inner.outcome = Some(outcome.clone());
            inner.state = state;
            inner.settling = true;
            (
                std::mem::take(&mut inner.links),
                std::mem::take(&mut inner.wakers),
                inner.policy.clone(),
                outcome,
            )
        };
        trace!("promise settled as {:?}", state);
        self.shared.gate.notify_all();
        for waker in wakers {
            waker.wake();
        }

        if links.is_empty() {
            if let Outcome::Failure(err) = &*outcome {
                debug!("failure held at chain tail: {err}");
            }
            self.mark_resolved();
            return;
        }
        match policy {
            ExecutionPolicy::Inline => {
                for link in links {
                    Self::deliver_link(link, &outcome);
                }
                self.mark_resolved();
            }
            ExecutionPolicy::Dispatch(executor) => {
                let promise = self.clone();
                executor.execute(Box::new(move || {
                    for link in links {
                        Self::deliver_link(link, &outcome);
                    }
                    promise.mark_resolved();
                }));
            }
        }
    }

    fn deliver_link(link: Link<T>, outcome: &Arc<Outcome<T>>) {
        if link.raw {
            // Splice target: its slot was claimed when the reaction deferred,
            // so it settles directly with this outcome.
            link.target.settle((**outcome).clone());
        } else if let Err(err) = link.target.deliver((**outcome).clone()) {
            warn!("chain delivery refused: {err}");
        }
    }

    fn mark_resolved(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.state = State::Resolved;
    }
}

impl<T> Resolver<T>
where
    T: Clone + Default + Send + Sync + 'static,
{
    /// Resolves the owning promise with `value`.
    pub fn resolve(self, value: T) -> Result<(), AlreadyResolved> {
        self.promise.resolve(value)
    }

    /// Fails the owning promise with `err`.
    pub fn error(self, err: PromiseError) -> Result<(), AlreadyResolved> {
        self.promise.error(err)
    }
}

impl<T> std::future::Future for Promise<T> {
    type Output = Arc<Outcome<T>>;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Self::Output> {
        self.activate();
        let mut inner = self.shared.inner.lock().unwrap();
        match inner.outcome {
            Some(ref outcome) => Poll::Ready(outcome.clone()),
            None => {
                inner.wakers.push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn resolve_then_wait() {
        let promise: Promise<i32> = Promise::new();
        promise.resolve(7).unwrap();
        assert_eq!(promise.wait().value(), Some(&7));
        assert_eq!(promise.state(), State::Resolved);
    }

    #[test]
    fn second_resolution_is_rejected() {
        let promise: Promise<i32> = Promise::new();
        promise.resolve(1).unwrap();
        assert_eq!(promise.resolve(2), Err(AlreadyResolved));
        assert_eq!(
            promise.error(PromiseError::Unspecified),
            Err(AlreadyResolved)
        );
        assert_eq!(promise.wait().value(), Some(&1));
    }

    #[test]
    fn late_join_wait_returns_immediately() {
        let promise: Promise<String> = Promise::new();
        promise.resolve("done".into()).unwrap();
        assert!(promise.is_resolved());
        assert_eq!(promise.wait().value(), Some(&"done".to_string()));
        assert_eq!(promise.wait().value(), Some(&"done".to_string()));
    }

    #[test]
    fn then_transforms_and_replays_after_resolved() {
        let promise: Promise<i32> = Promise::new();
        promise.resolve(5).unwrap();
        assert_eq!(promise.state(), State::Resolved);
        let link = promise.then(|v| Step::Value(v + 1));
        assert!(link.is_resolved());
        assert_eq!(link.wait().value(), Some(&6));
    }

    #[test]
    fn failure_skips_success_links() {
        let ran = Arc::new(AtomicBool::new(false));
        let (r1, r2) = (ran.clone(), ran.clone());
        let promise: Promise<i32> = Promise::new();
        let tail = promise
            .then(move |v| {
                r1.store(true, Ordering::SeqCst);
                Step::Value(v)
            })
            .then(move |v| {
                r2.store(true, Ordering::SeqCst);
                Step::Value(v)
            });
        promise.error(PromiseError::failure("io", "reset")).unwrap();
        assert_eq!(
            tail.wait().error(),
            Some(&PromiseError::failure("io", "reset"))
        );
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn reaction_error_short_circuits_chain() {
        let last_ran = Arc::new(AtomicBool::new(false));
        let probe = last_ran.clone();
        let promise: Promise<i32> = Promise::new();
        let tail = promise
            .then(|v| Step::Value(v + 1))
            .then(|_| Step::Fail(PromiseError::failure("test", "boom")))
            .then(move |v| {
                probe.store(true, Ordering::SeqCst);
                Step::Value(v * 2)
            });
        promise.resolve(10).unwrap();
        assert_eq!(
            tail.wait().error(),
            Some(&PromiseError::failure("test", "boom"))
        );
        assert!(!last_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn catch_recovers_with_default() {
        let promise: Promise<i32> = Promise::new();
        let recovered = promise.catch(|_| None);
        let tail = recovered.then(|v| Step::Value(v + 1));
        promise.error(PromiseError::failure("net", "down")).unwrap();
        assert!(recovered.wait().is_success());
        assert_eq!(tail.wait().value(), Some(&1));
    }

    #[test]
    fn catch_recovers_with_replacement() {
        let promise: Promise<i32> = Promise::new();
        let tail = promise.catch(|_| Some(9)).then(|v| Step::Value(v * 2));
        promise.error(PromiseError::Unspecified).unwrap();
        assert_eq!(tail.wait().value(), Some(&18));
    }

    #[test]
    fn forwarding_observer_keeps_error() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let promise: Promise<i32> = Promise::new();
        let observer = promise.catch_forwarding(move |err| {
            *sink.lock().unwrap() = Some(err.clone());
            None
        });
        let tail = observer.then(|v| Step::Value(v));
        promise.error(PromiseError::failure("db", "gone")).unwrap();
        assert_eq!(
            tail.wait().error(),
            Some(&PromiseError::failure("db", "gone"))
        );
        assert_eq!(
            *seen.lock().unwrap(),
            Some(PromiseError::failure("db", "gone"))
        );
    }

    #[test]
    fn forwarding_observer_replacement_still_recovers() {
        // Stricter forward-after-error reading: a handler that produces a
        // replacement value changes the terminal state, so nothing is
        // forwarded.
        let promise: Promise<i32> = Promise::new();
        let tail = promise.catch_forwarding(|_| Some(3)).then(|v| Step::Value(v + 1));
        promise.error(PromiseError::Unspecified).unwrap();
        assert_eq!(tail.wait().value(), Some(&4));
    }

    #[test]
    fn then_or_handles_failure_first() {
        let promise: Promise<i32> = Promise::new();
        let link = promise.then_or(|v| Step::Value(v + 1), |_| Some(100));
        promise.error(PromiseError::Unspecified).unwrap();
        assert_eq!(link.wait().value(), Some(&100));
    }

    #[test]
    fn fin_passes_failure_through() {
        let ran = Arc::new(AtomicBool::new(false));
        let probe = ran.clone();
        let promise: Promise<i32> = Promise::new();
        let tail = promise.fin(move |outcome| {
            assert!(outcome.is_failure());
            probe.store(true, Ordering::SeqCst);
        });
        promise.error(PromiseError::failure("io", "late")).unwrap();
        assert_eq!(
            tail.wait().error(),
            Some(&PromiseError::failure("io", "late"))
        );
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn fin_passes_value_through() {
        let promise: Promise<i32> = Promise::new();
        let tail = promise.fin(|_| {}).then(|v| Step::Value(v + 1));
        promise.resolve(41).unwrap();
        assert_eq!(tail.wait().value(), Some(&42));
    }

    #[test]
    fn then_each_runs_in_order_and_short_circuits() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (o1, o2, o3) = (order.clone(), order.clone(), order.clone());
        let promise: Promise<i32> = Promise::new();
        let tail = promise.then_each(vec![
            Box::new(move |v| {
                o1.lock().unwrap().push(1);
                Step::Value(v + 1)
            }) as SuccessFn<i32>,
            Box::new(move |_| {
                o2.lock().unwrap().push(2);
                Step::Fail(PromiseError::failure("seq", "stop"))
            }),
            Box::new(move |v| {
                o3.lock().unwrap().push(3);
                Step::Value(v)
            }),
        ]);
        promise.resolve(0).unwrap();
        assert_eq!(
            tail.wait().error(),
            Some(&PromiseError::failure("seq", "stop"))
        );
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn sibling_links_fire_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (o1, o2) = (order.clone(), order.clone());
        let promise: Promise<i32> = Promise::new();
        promise.then(move |v| {
            o1.lock().unwrap().push("first");
            Step::Value(v)
        });
        promise.then(move |v| {
            o2.lock().unwrap().push("second");
            Step::Value(v)
        });
        promise.resolve(0).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn empty_conveniences() {
        let promise: Promise<i32> = Promise::new();
        promise.resolve_empty().unwrap();
        assert_eq!(promise.wait().value(), Some(&0));

        let failed: Promise<i32> = Promise::new();
        failed.error_unspecified().unwrap();
        assert_eq!(failed.wait().error(), Some(&PromiseError::Unspecified));
    }

    #[test]
    fn deferred_perform_runs_on_first_wait() {
        let promise: Promise<i32> = Promise::with_perform_deferred(|resolver| {
            resolver.resolve(12).unwrap();
        });
        assert_eq!(promise.state(), State::Pending);
        assert_eq!(promise.wait().value(), Some(&12));
    }
}
