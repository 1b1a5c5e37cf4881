// Single-threaded cooperative executor.
//
// Tasks only suspend at `.await` points; there is no parallelism anywhere.
// The arena and timers sit behind `RefCell`s that are never borrowed while
// user code (a task poll, a promise handler) is running, so tasks may spawn
// tasks and handlers may settle promises that wake other tasks.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use generational_arena::Arena;
use parking_lot::Mutex;

use super::task::{ReadyQueue, Task, TaskId};
use super::timer::{AwaitPromise, Sleep, Timers};
use crate::channel::Registry;
use crate::config::StrandConfig;
use crate::error::StrandError;
use crate::future::{IntoPromise, Outcome, Promise};

struct Shared {
    config: StrandConfig,
    tasks: RefCell<Arena<Task>>,
    ready: ReadyQueue,
    timers: Rc<RefCell<Timers>>,
    next_seq: Cell<u64>,
}

/// Handle to a cooperative executor; clones drive the same set of tasks.
#[derive(Clone)]
pub struct Executor {
    shared: Rc<Shared>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self::with_config(StrandConfig::default())
    }

    pub fn with_config(config: StrandConfig) -> Self {
        Self {
            shared: Rc::new(Shared {
                config,
                tasks: RefCell::new(Arena::new()),
                ready: Arc::new(Mutex::new(VecDeque::new())),
                timers: Rc::new(RefCell::new(Timers::default())),
                next_seq: Cell::new(1),
            }),
        }
    }

    pub fn config(&self) -> &StrandConfig {
        &self.shared.config
    }

    /// A channel registry for this executor's domain, sized from its config.
    pub fn registry<V: Clone + 'static>(&self) -> Registry<V> {
        Registry::from_config(&self.shared.config)
    }

    /// Spawns a task running `future` and returns a promise bound to its
    /// outcome. The task is polled once before `spawn` returns.
    ///
    /// A panic inside the task rejects the promise.
    pub fn spawn<T, F>(&self, future: F) -> Promise<T>
    where
        T: Clone + 'static,
        F: Future<Output = Result<T, StrandError>> + 'static,
    {
        let (promise, resolver) = Promise::pending();
        let on_panic = resolver.clone();
        let seq = self.shared.next_seq.get();
        self.shared.next_seq.set(seq + 1);

        let body = async move {
            let outcome = future.await;
            resolver.settle(outcome);
        };

        let ready = self.shared.ready.clone();
        let id = self.shared.tasks.borrow_mut().insert_with(|id| {
            Task::new(
                id,
                seq,
                Box::pin(body),
                Box::new(move |reason: StrandError| {
                    on_panic.reject(reason);
                }),
                ready,
            )
        });
        log::debug!("task {} spawned", seq);

        self.poll_task(id);
        promise
    }

    /// Spawns a task that calls `f(args)` and awaits the future it returns.
    pub fn spawn_with<A, T, F, Fut>(&self, f: F, args: A) -> Promise<T>
    where
        A: 'static,
        T: Clone + 'static,
        F: FnOnce(A) -> Fut + 'static,
        Fut: Future<Output = Result<T, StrandError>> + 'static,
    {
        self.spawn(async move { f(args).await })
    }

    /// Waits for `target` to settle, failing with a timeout error once
    /// `timeout` (or the configured default) has elapsed since this call.
    ///
    /// Must be awaited from inside a task of this executor.
    pub fn await_promise<T, P>(&self, target: P, timeout: Option<Duration>) -> AwaitPromise<T>
    where
        T: Clone + 'static,
        P: IntoPromise<T>,
    {
        let timeout = timeout.or_else(|| self.shared.config.default_await_timeout());
        AwaitPromise::new(target.into_promise(), timeout, self.shared.timers.clone())
    }

    pub fn sleep(&self, duration: Duration) -> Sleep {
        Sleep::new(duration, self.shared.timers.clone())
    }

    /// Number of tasks that have not finished yet.
    pub fn task_count(&self) -> usize {
        self.shared.tasks.borrow().len()
    }

    /// Poll ready tasks until none is left ready, without sleeping.
    /// Returns the number of polls performed.
    pub fn run_until_stalled(&self) -> usize {
        let mut polls = 0;
        while self.turn() {
            polls += 1;
        }
        polls
    }

    /// Run until every task has finished. Returns 0 on completion, or the
    /// number of tasks left blocked if nothing can make progress any more.
    pub fn run(&self) -> usize {
        loop {
            self.run_until_stalled();
            let pending = self.task_count();
            if pending == 0 {
                return 0;
            }
            if !self.park(None) {
                log::warn!("executor stalled with {} blocked task(s)", pending);
                return pending;
            }
        }
    }

    /// Drive the executor until `target` settles and return its outcome.
    pub fn block_on<T, P>(&self, target: P) -> Outcome<T>
    where
        T: Clone + 'static,
        P: IntoPromise<T>,
    {
        let promise = target.into_promise();
        loop {
            if let Some(outcome) = promise.peek() {
                return outcome;
            }
            if !self.turn() && !self.park(None) {
                let pending = self.task_count();
                log::warn!("block_on stalled with {} blocked task(s)", pending);
                return Err(StrandError::stalled(pending));
            }
        }
    }

    /// Drive the executor until every promise settled or `timeout` elapsed.
    /// Yields each fulfilled value in input order; rejected or still pending
    /// inputs yield `None`. A zero timeout only inspects the current states.
    pub fn await_all<T: Clone + 'static>(
        &self,
        promises: &[Promise<T>],
        timeout: Duration,
    ) -> Vec<Option<T>> {
        let deadline = Instant::now() + timeout;
        while !timeout.is_zero() && Instant::now() < deadline {
            if promises.iter().all(Promise::is_settled) {
                break;
            }
            if !self.turn() && !self.park(Some(deadline)) {
                break;
            }
        }

        promises
            .iter()
            .map(|promise| promise.peek().and_then(Result::ok))
            .collect()
    }

    /// Fire expired timers, then poll at most one ready task.
    /// Returns false if no task was ready.
    fn turn(&self) -> bool {
        self.fire_timers();
        loop {
            let next = self.shared.ready.lock().pop_front();
            match next {
                Some(id) => {
                    if self.poll_task(id) {
                        return true;
                    }
                    // Stale or duplicate wake; try the next one.
                }
                None => return false,
            }
        }
    }

    fn fire_timers(&self) {
        let expired = self.shared.timers.borrow_mut().take_expired(Instant::now());
        for waker in expired {
            waker.wake();
        }
    }

    /// Sleep until the next timer (or `limit`, whichever is earlier).
    /// Returns false when no timer is armed, i.e. nothing can wake a task.
    fn park(&self, limit: Option<Instant>) -> bool {
        let next = self.shared.timers.borrow().next_deadline();
        let Some(mut deadline) = next else {
            return false;
        };
        if let Some(limit) = limit {
            deadline = deadline.min(limit);
        }
        let now = Instant::now();
        if deadline > now {
            thread::sleep((deadline - now).min(self.shared.config.max_idle_park()));
        }
        true
    }

    /// Poll one task. Returns false if the id is stale or the task is
    /// already being polled further up the stack.
    fn poll_task(&self, id: TaskId) -> bool {
        let (mut future, waker, seq) = {
            let mut tasks = self.shared.tasks.borrow_mut();
            let Some(task) = tasks.get_mut(id) else {
                return false;
            };
            let Some(future) = task.future.take() else {
                return false;
            };
            (future, task.waker.clone(), task.seq)
        };

        let mut cx = Context::from_waker(&waker);
        let polled = panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));

        match polled {
            Ok(Poll::Pending) => {
                if let Some(task) = self.shared.tasks.borrow_mut().get_mut(id) {
                    task.future = Some(future);
                }
            }
            Ok(Poll::Ready(())) => {
                self.shared.tasks.borrow_mut().remove(id);
                drop(future);
                log::debug!("task {} finished", seq);
            }
            Err(payload) => {
                let fail = self
                    .shared
                    .tasks
                    .borrow_mut()
                    .remove(id)
                    .and_then(|mut task| task.fail.take());
                drop(future);
                log::debug!("task {} panicked", seq);
                if let Some(fail) = fail {
                    fail(StrandError::from_panic(payload));
                }
            }
        }
        true
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("tasks", &self.shared.tasks.borrow().len())
            .field("ready", &self.shared.ready.lock().len())
            .field("timers", &self.shared.timers.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SelectCase;
    use crate::error::StrandErrorType;
    use crate::future::PromiseState;
    use crate::runtime::yield_now;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_spawn_doubles() {
        init_logger();
        let executor = Executor::new();
        let doubled = executor.spawn_with(|x: i32| async move { Ok(x * 2) }, 21);
        assert_eq!(executor.block_on(doubled), Ok(42));
        assert_eq!(executor.task_count(), 0);
    }

    #[test]
    fn test_spawn_starts_eagerly() {
        let executor = Executor::new();
        let started = Rc::new(Cell::new(false));
        let flag = started.clone();
        let (gate, open) = Promise::<()>::pending();

        let task = executor.spawn(async move {
            flag.set(true);
            gate.await?;
            Ok("through the gate")
        });

        assert!(started.get());
        assert_eq!(task.state(), PromiseState::Pending);
        open.resolve(());
        assert_eq!(executor.block_on(task), Ok("through the gate"));
    }

    #[test]
    fn test_task_error_rejects() {
        let executor = Executor::new();
        let failed: Promise<u8> = executor.spawn(async { Err("task failed".into()) });
        assert_eq!(failed.peek(), Some(Err(StrandError::rejected("task failed"))));
    }

    #[test]
    fn test_task_panic_rejects() {
        let executor = Executor::new();
        let exec = executor.clone();
        let panicked: Promise<u8> = executor.spawn(async move {
            yield_now().await;
            exec.sleep(Duration::ZERO).await;
            panic!("task blew up")
        });
        let err = executor.block_on(panicked).unwrap_err();
        assert_eq!(err.error_type, StrandErrorType::Panic);
        assert_eq!(err.message, "task blew up");
        assert_eq!(executor.task_count(), 0);
    }

    #[test]
    fn test_await_across_tasks() {
        init_logger();
        let executor = Executor::new();
        let (signal, resolver) = Promise::<String>::pending();

        let exec = executor.clone();
        let waiter = executor.spawn(async move {
            let greeting = exec.await_promise(signal, None).await?;
            Ok(greeting.len())
        });

        let exec = executor.clone();
        executor.spawn(async move {
            exec.sleep(Duration::from_millis(2)).await;
            resolver.resolve("hello".to_string());
            Ok(())
        });

        assert_eq!(executor.run(), 0);
        assert_eq!(waiter.peek(), Some(Ok(5)));
    }

    #[test]
    fn test_await_rejection_raises() {
        let executor = Executor::new();
        let exec = executor.clone();
        let task: Promise<i32> = executor.spawn(async move {
            let value = exec.await_promise(Promise::<i32>::reject("upstream"), None).await?;
            Ok(value + 1)
        });
        assert_eq!(task.peek(), Some(Err(StrandError::rejected("upstream"))));
    }

    #[test]
    fn test_await_thunk() {
        let executor = Executor::new();
        let exec = executor.clone();
        let task = executor.spawn(async move {
            exec.await_promise(|| Promise::resolve(3), None).await
        });
        assert_eq!(executor.block_on(task), Ok(3));
    }

    #[test]
    fn test_await_times_out() {
        init_logger();
        let executor = Executor::new();
        let (never, _keep) = Promise::<i32>::pending();
        let exec = executor.clone();

        let started = Instant::now();
        let task = executor.spawn(async move {
            exec.await_promise(never, Some(Duration::from_millis(10))).await
        });
        let err = executor.block_on(task).unwrap_err();
        let waited = started.elapsed();

        assert!(err.is_timeout());
        assert!(err.elapsed().unwrap() >= Duration::from_millis(10));
        assert!(waited >= Duration::from_millis(10));
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn test_await_settles_before_timeout() {
        let executor = Executor::new();
        let (later, resolver) = Promise::<&str>::pending();

        let exec = executor.clone();
        let task = executor.spawn(async move {
            exec.await_promise(later, Some(Duration::from_secs(5))).await
        });
        let exec = executor.clone();
        executor.spawn(async move {
            exec.sleep(Duration::from_millis(1)).await;
            resolver.resolve("in time");
            Ok(())
        });

        assert_eq!(executor.block_on(task), Ok("in time"));
    }

    #[test]
    fn test_settled_awaits_leave_no_timers() {
        let executor = Executor::new();
        let exec = executor.clone();
        let task = executor.spawn(async move {
            let mut total = 0;
            for i in 0..1000 {
                let (value, resolver) = Promise::pending();
                exec.spawn(async move {
                    yield_now().await;
                    resolver.resolve(i);
                    Ok(())
                });
                total += exec.await_promise(value, Some(Duration::from_secs(3600))).await?;
            }
            Ok(total)
        });

        assert_eq!(executor.block_on(task), Ok(499_500));
        assert_eq!(executor.shared.timers.borrow().len(), 0);
    }

    #[test]
    fn test_stall_detected_despite_finished_timeout() {
        let executor = Executor::new();
        let (quick, resolver) = Promise::<u8>::pending();
        let (never, _keep) = Promise::<u8>::pending();

        let exec = executor.clone();
        executor.spawn(async move { exec.await_promise(quick, Some(Duration::from_secs(2))).await });
        let exec = executor.clone();
        executor.spawn(async move { exec.await_promise(never, None).await });
        executor.spawn(async move {
            yield_now().await;
            resolver.resolve(1);
            Ok(())
        });

        let started = Instant::now();
        assert_eq!(executor.run(), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_configured_default_timeout() {
        let config = StrandConfig { default_await_timeout_ms: Some(5), ..Default::default() };
        let executor = Executor::with_config(config);
        let (never, _keep) = Promise::<()>::pending();
        let exec = executor.clone();
        let task = executor.spawn(async move { exec.await_promise(never, None).await });
        assert!(executor.block_on(task).unwrap_err().is_timeout());
    }

    #[test]
    fn test_stalled_block_on() {
        let executor = Executor::new();
        let (never, _keep) = Promise::<i32>::pending();
        let exec = executor.clone();
        let stuck = executor.spawn(async move { exec.await_promise(never, None).await });

        let err = executor.block_on(stuck.clone()).unwrap_err();
        assert_eq!(err.error_type, StrandErrorType::Stalled { pending: 1 });
        assert_eq!(executor.run(), 1);
        assert_eq!(stuck.state(), PromiseState::Pending);
    }

    #[test]
    fn test_nested_spawn() {
        let executor = Executor::new();
        let exec = executor.clone();
        let outer = executor.spawn(async move {
            let inner = exec.spawn(async { Ok(20) });
            let value = inner.await?;
            Ok(value + 1)
        });
        assert_eq!(executor.block_on(outer), Ok(21));
    }

    #[test]
    fn test_yield_interleaves_tasks() {
        let executor = Executor::new();
        let trace = Rc::new(RefCell::new(Vec::new()));
        for name in ["a", "b"] {
            let trace = trace.clone();
            executor.spawn(async move {
                for step in 0..3 {
                    trace.borrow_mut().push(format!("{}{}", name, step));
                    yield_now().await;
                }
                Ok(())
            });
        }
        assert_eq!(executor.run(), 0);
        assert_eq!(*trace.borrow(), vec!["a0", "b0", "a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn test_channel_between_tasks() {
        init_logger();
        let executor = Executor::new();
        let channels = executor.registry::<u32>();
        channels.create_channel("numbers", Some(1)).unwrap();

        let (exec, tx) = (executor.clone(), channels.clone());
        let producer = executor.spawn(async move {
            for n in 1..=5 {
                exec.await_promise(tx.send("numbers", n)?, None).await?;
            }
            Ok(())
        });

        let (exec, rx) = (executor.clone(), channels.clone());
        let consumer = executor.spawn(async move {
            let mut sum = 0;
            for _ in 0..5 {
                sum += exec.await_promise(rx.receive("numbers")?, None).await?;
            }
            Ok(sum)
        });

        assert_eq!(executor.run(), 0);
        assert_eq!(producer.peek(), Some(Ok(())));
        assert_eq!(consumer.peek(), Some(Ok(15)));
        channels.close_channel("numbers").unwrap();
    }

    #[test]
    fn test_select_between_tasks() {
        let executor = Executor::new();
        let channels = executor.registry::<String>();
        channels.create_channel("left", None).unwrap();
        channels.create_channel("right", None).unwrap();

        let (exec, rx) = (executor.clone(), channels.clone());
        let picker = executor.spawn(async move {
            let cases = vec![SelectCase::receive("left"), SelectCase::receive("right")];
            exec.await_promise(rx.select(cases)?, None).await
        });

        let (exec, tx) = (executor.clone(), channels.clone());
        executor.spawn(async move {
            exec.sleep(Duration::from_millis(1)).await;
            tx.send("right", "late".to_string())?;
            Ok(())
        });

        assert_eq!(executor.run(), 0);
        assert_eq!(picker.peek(), Some(Ok((1, Some("late".to_string())))));
        assert_eq!(channels.info("left").unwrap().waiting_receivers, 0);
    }

    #[test]
    fn test_unknown_channel_inside_task() {
        let executor = Executor::new();
        let channels = executor.registry::<i32>();
        let task: Promise<i32> = executor.spawn(async move {
            let value = channels.receive("nowhere")?.await?;
            Ok(value)
        });
        let err = task.peek().unwrap().unwrap_err();
        assert_eq!(err.error_type, StrandErrorType::UnknownChannel { name: "nowhere".into() });
    }

    #[test]
    fn test_await_all_collects_outcomes() {
        let executor = Executor::new();
        let exec = executor.clone();
        let slow = executor.spawn(async move {
            exec.sleep(Duration::from_millis(2)).await;
            Ok(2)
        });
        let failed: Promise<i32> = Promise::reject("nope");
        let ready = Promise::resolve(1);

        let results = executor.await_all(&[ready, slow, failed], Duration::from_secs(5));
        assert_eq!(results, vec![Some(1), Some(2), None]);
    }

    #[test]
    fn test_await_all_zero_timeout_does_not_drive() {
        let executor = Executor::new();
        let exec = executor.clone();
        let slow = executor.spawn(async move {
            exec.sleep(Duration::from_millis(1)).await;
            Ok(7)
        });
        assert_eq!(executor.await_all(&[slow.clone()], Duration::ZERO), vec![None]);
        assert_eq!(executor.block_on(slow), Ok(7));
    }

    #[test]
    fn test_sleep_waits() {
        let executor = Executor::new();
        let exec = executor.clone();
        let started = Instant::now();
        let task = executor.spawn(async move {
            exec.sleep(Duration::from_millis(5)).await;
            Ok(())
        });
        assert_eq!(executor.block_on(task), Ok(()));
        assert!(started.elapsed() >= Duration::from_millis(5));
    }
}
