// Write-once promise with synchronous handler chaining.
//
// All state lives behind `Rc<RefCell<..>>`: a promise belongs to exactly one
// cooperative domain and is never touched from another thread. Handlers run
// inline on the thread that settles the promise, in registration order, and
// the borrow is always released before any user code is entered so handlers
// may freely chain onto or settle other promises (including this one).

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::error::StrandError;

pub type Outcome<T> = Result<T, StrandError>;

type Handler<T> = Box<dyn FnOnce(Outcome<T>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

struct Shared<T> {
    outcome: Option<Outcome<T>>,
    handlers: Vec<Handler<T>>,
    // Tasks suspended on this promise through `Future::poll`.
    wakers: Vec<Waker>,
}

/// Eventual result of an operation that succeeds or fails exactly once.
///
/// Cloning a `Promise` yields another handle onto the same settlement.
pub struct Promise<T> {
    shared: Rc<RefCell<Shared<T>>>,
}

/// The settling side of a [`Promise`].
///
/// Only the first `resolve`/`reject`/`settle` on any clone of a resolver has an
/// effect; later calls are ignored.
pub struct Resolver<T> {
    shared: Rc<RefCell<Shared<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

/// Runs `f`, turning a panic into a rejection reason.
pub(crate) fn trap<R>(f: impl FnOnce() -> Result<R, StrandError>) -> Result<R, StrandError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(StrandError::from_panic(payload)),
    }
}

fn state_of<T>(outcome: &Option<Outcome<T>>) -> PromiseState {
    match outcome {
        None => PromiseState::Pending,
        Some(Ok(_)) => PromiseState::Fulfilled,
        Some(Err(_)) => PromiseState::Rejected,
    }
}

impl<T: Clone + 'static> Resolver<T> {
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    pub fn reject(&self, reason: impl Into<StrandError>) -> bool {
        self.settle(Err(reason.into()))
    }

    /// Settles the promise; returns `false` if it was already settled.
    pub fn settle(&self, outcome: Outcome<T>) -> bool {
        let (handlers, wakers) = {
            let mut shared = self.shared.borrow_mut();
            if shared.outcome.is_some() {
                return false;
            }
            shared.outcome = Some(outcome.clone());
            (mem::take(&mut shared.handlers), mem::take(&mut shared.wakers))
        };

        log::trace!(
            "promise settled {:?}, dispatching {} handler(s)",
            if outcome.is_ok() { PromiseState::Fulfilled } else { PromiseState::Rejected },
            handlers.len()
        );

        for handler in handlers {
            handler(outcome.clone());
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }

    pub fn is_settled(&self) -> bool {
        self.shared.borrow().outcome.is_some()
    }
}

impl<T: Clone + 'static> Promise<T> {
    /// Creates a promise and runs `executor` immediately with its resolver.
    ///
    /// An `Err` returned from the executor, or a panic inside it, rejects the
    /// promise unless the executor already settled it.
    pub fn new<F>(executor: F) -> Self
    where
        F: FnOnce(Resolver<T>) -> Result<(), StrandError>,
    {
        let (promise, resolver) = Self::pending();
        let handle = resolver.clone();
        if let Err(reason) = trap(move || executor(handle)) {
            resolver.reject(reason);
        }
        promise
    }

    /// A pending promise together with the resolver that settles it.
    pub fn pending() -> (Self, Resolver<T>) {
        let shared = Rc::new(RefCell::new(Shared {
            outcome: None,
            handlers: Vec::new(),
            wakers: Vec::new(),
        }));
        (Promise { shared: shared.clone() }, Resolver { shared })
    }

    pub fn resolve(value: T) -> Self {
        Self::settled(Ok(value))
    }

    pub fn reject(reason: impl Into<StrandError>) -> Self {
        Self::settled(Err(reason.into()))
    }

    pub fn settled(outcome: Outcome<T>) -> Self {
        Promise {
            shared: Rc::new(RefCell::new(Shared {
                outcome: Some(outcome),
                handlers: Vec::new(),
                wakers: Vec::new(),
            })),
        }
    }

    pub fn state(&self) -> PromiseState {
        state_of(&self.shared.borrow().outcome)
    }

    pub fn is_settled(&self) -> bool {
        self.shared.borrow().outcome.is_some()
    }

    /// The outcome, if the promise has settled.
    pub fn peek(&self) -> Option<Outcome<T>> {
        self.shared.borrow().outcome.clone()
    }

    /// Calls `handler` with the outcome: right now if already settled,
    /// otherwise when the promise settles.
    pub(crate) fn subscribe(&self, handler: impl FnOnce(Outcome<T>) + 'static) {
        let settled = self.shared.borrow().outcome.clone();
        match settled {
            Some(outcome) => handler(outcome),
            None => self.shared.borrow_mut().handlers.push(Box::new(handler)),
        }
    }

    /// Chains both handlers; whichever runs settles the returned promise with
    /// its result. A handler that errors or panics rejects the returned promise.
    pub fn then<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<U, StrandError> + 'static,
        R: FnOnce(StrandError) -> Result<U, StrandError> + 'static,
    {
        let (downstream, resolver) = Promise::pending();
        self.subscribe(move |outcome| {
            let next = match outcome {
                Ok(value) => trap(move || on_fulfilled(value)),
                Err(reason) => trap(move || on_rejected(reason)),
            };
            resolver.settle(next);
        });
        downstream
    }

    /// Chains a fulfillment handler; a rejection passes through unchanged.
    pub fn and_then<U, F>(&self, on_fulfilled: F) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<U, StrandError> + 'static,
    {
        self.then(on_fulfilled, Err)
    }

    /// Chains a rejection handler; a fulfillment passes through unchanged.
    pub fn on_error<R>(&self, on_rejected: R) -> Promise<T>
    where
        R: FnOnce(StrandError) -> Result<T, StrandError> + 'static,
    {
        self.then(Ok, on_rejected)
    }

    /// Runs `f` whatever the outcome, then settles the returned promise with the
    /// original outcome, or with `f`'s error if it fails.
    pub fn on_finally<F>(&self, f: F) -> Promise<T>
    where
        F: FnOnce() -> Result<(), StrandError> + 'static,
    {
        let (downstream, resolver) = Promise::pending();
        self.subscribe(move |outcome| {
            let next = match trap(f) {
                Ok(()) => outcome,
                Err(reason) => Err(reason),
            };
            resolver.settle(next);
        });
        downstream
    }
}

impl<T: Clone + 'static> Future for Promise<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut shared = self.shared.borrow_mut();
        if let Some(outcome) = &shared.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !shared.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            shared.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T> Promise<T> {
    /// Drops a waker left by `poll` once its task stops waiting here.
    pub(crate) fn forget_waker(&self, waker: &Waker) {
        self.shared.borrow_mut().wakers.retain(|w| !w.will_wake(waker));
    }

    #[cfg(test)]
    pub(crate) fn waker_count(&self) -> usize {
        self.shared.borrow().wakers.len()
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.borrow();
        f.debug_struct("Promise")
            .field("state", &state_of(&shared.outcome))
            .field("handlers", &shared.handlers.len())
            .finish()
    }
}

impl<T> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("state", &state_of(&self.shared.borrow().outcome))
            .finish()
    }
}

/// Anything that can be waited on: a promise, or a thunk producing one.
pub trait IntoPromise<T> {
    fn into_promise(self) -> Promise<T>;
}

impl<T> IntoPromise<T> for Promise<T> {
    fn into_promise(self) -> Promise<T> {
        self
    }
}

impl<T, F> IntoPromise<T> for F
where
    F: FnOnce() -> Promise<T>,
{
    fn into_promise(self) -> Promise<T> {
        self()
    }
}

/// Element of an `all`/`race` input: a promise or a plain value that counts as
/// already fulfilled.
#[derive(Debug, Clone)]
pub enum Awaitable<T> {
    Promise(Promise<T>),
    Value(T),
}

impl<T> From<Promise<T>> for Awaitable<T> {
    fn from(promise: Promise<T>) -> Self {
        Awaitable::Promise(promise)
    }
}

impl<T: Clone + 'static> IntoPromise<T> for Awaitable<T> {
    fn into_promise(self) -> Promise<T> {
        match self {
            Awaitable::Promise(promise) => promise,
            Awaitable::Value(value) => Promise::resolve(value),
        }
    }
}
