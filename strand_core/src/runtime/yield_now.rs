use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Lets every other ready task run once before the caller continues.
pub fn yield_now() -> YieldNow {
    YieldNow { requeued: false }
}

/// Future returned by [`yield_now`].
#[must_use = "futures do nothing unless awaited"]
#[derive(Debug)]
pub struct YieldNow {
    requeued: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if mem::replace(&mut self.requeued, true) {
            return Poll::Ready(());
        }
        // Puts the task at the back of the ready queue.
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
