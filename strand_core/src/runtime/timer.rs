use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::error::StrandError;
use crate::future::{Outcome, Promise};

/// Identifies one armed timer. The sequence number keeps equal deadlines apart.
pub(crate) type TimerKey = (Instant, u64);

/// Deadlines waiting to wake a task, earliest first.
#[derive(Default)]
pub(crate) struct Timers {
    entries: BTreeMap<TimerKey, Waker>,
    next_seq: u64,
}

impl Timers {
    pub fn register(&mut self, deadline: Instant, waker: Waker) -> TimerKey {
        let key = (deadline, self.next_seq);
        self.next_seq += 1;
        self.entries.insert(key, waker);
        key
    }

    /// Forgets a timer that has not fired. Returns false if it already fired.
    pub fn cancel(&mut self, key: TimerKey) -> bool {
        self.entries.remove(&key).is_some()
    }

    /// Removes every timer due at `now` and returns their wakers.
    pub fn take_expired(&mut self, now: Instant) -> Vec<Waker> {
        let later = self.entries.split_off(&(now, u64::MAX));
        mem::replace(&mut self.entries, later).into_values().collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

fn disarm(timers: &RefCell<Timers>, timer: &mut Option<TimerKey>) {
    if let Some(key) = timer.take() {
        timers.borrow_mut().cancel(key);
    }
}

/// Completes once its deadline has passed.
pub struct Sleep {
    deadline: Instant,
    timers: Rc<RefCell<Timers>>,
    timer: Option<TimerKey>,
}

impl Sleep {
    pub(crate) fn new(duration: Duration, timers: Rc<RefCell<Timers>>) -> Self {
        Self {
            deadline: Instant::now() + duration,
            timers,
            timer: None,
        }
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if Instant::now() >= this.deadline {
            disarm(&this.timers, &mut this.timer);
            return Poll::Ready(());
        }
        if this.timer.is_none() {
            this.timer = Some(this.timers.borrow_mut().register(this.deadline, cx.waker().clone()));
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        disarm(&self.timers, &mut self.timer);
    }
}

/// Suspends the calling task until a promise settles or a deadline passes.
///
/// Created by [`Executor::await_promise`](crate::Executor::await_promise).
/// Completion is checked before the deadline on every resumption, so a promise
/// that settled in time always wins over the timeout. Finishing or dropping
/// the await cancels its timer.
pub struct AwaitPromise<T> {
    promise: Promise<T>,
    started: Instant,
    deadline: Option<Instant>,
    timers: Rc<RefCell<Timers>>,
    timer: Option<TimerKey>,
    // Waker left on the promise by the last pending poll.
    waiting: Option<Waker>,
}

impl<T> AwaitPromise<T> {
    pub(crate) fn new(
        promise: Promise<T>,
        timeout: Option<Duration>,
        timers: Rc<RefCell<Timers>>,
    ) -> Self {
        let started = Instant::now();
        Self {
            promise,
            started,
            deadline: timeout.map(|timeout| started + timeout),
            timers,
            timer: None,
            waiting: None,
        }
    }

    fn release(&mut self) {
        disarm(&self.timers, &mut self.timer);
        if let Some(waker) = self.waiting.take() {
            self.promise.forget_waker(&waker);
        }
    }
}

impl<T: Clone + 'static> Future for AwaitPromise<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Poll::Ready(outcome) = Pin::new(&mut this.promise).poll(cx) {
            this.waiting = None;
            this.release();
            return Poll::Ready(outcome);
        }
        this.waiting = Some(cx.waker().clone());

        if let Some(deadline) = this.deadline {
            let now = Instant::now();
            if now >= deadline {
                let elapsed = now - this.started;
                log::debug!("await timed out after {:?}", elapsed);
                this.release();
                return Poll::Ready(Err(StrandError::timeout(elapsed)));
            }
            if this.timer.is_none() {
                this.timer = Some(this.timers.borrow_mut().register(deadline, cx.waker().clone()));
            }
        }
        Poll::Pending
    }
}

impl<T> Drop for AwaitPromise<T> {
    fn drop(&mut self) {
        self.release();
    }
}
