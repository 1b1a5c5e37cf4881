use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::task::Waker;

use futures::future::LocalBoxFuture;
use futures::task::ArcWake;
use generational_arena::Index;
use parking_lot::Mutex;

use crate::error::StrandError;

/// Slot of a task in the executor's arena. The generation part makes a wake
/// for a finished task harmless even after its slot has been reused.
pub type TaskId = Index;

// Wakers must be `Send + Sync`, so the one structure they touch is locked.
pub(crate) type ReadyQueue = Arc<Mutex<VecDeque<TaskId>>>;

pub(crate) struct Task {
    pub seq: u64,
    // Taken out while the task is being polled.
    pub future: Option<LocalBoxFuture<'static, ()>>,
    // Rejects the task's promise if polling panics.
    pub fail: Option<Box<dyn FnOnce(StrandError)>>,
    pub waker: Waker,
}

impl Task {
    pub fn new(
        id: TaskId,
        seq: u64,
        future: LocalBoxFuture<'static, ()>,
        fail: Box<dyn FnOnce(StrandError)>,
        ready: ReadyQueue,
    ) -> Self {
        Self {
            seq,
            future: Some(future),
            fail: Some(fail),
            waker: futures::task::waker(Arc::new(TaskWaker { id, ready })),
        }
    }

    pub fn is_running(&self) -> bool {
        self.future.is_none()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("seq", &self.seq)
            .field("running", &self.is_running())
            .finish()
    }
}

struct TaskWaker {
    id: TaskId,
    ready: ReadyQueue,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.ready.lock().push_back(arc_self.id);
    }
}
