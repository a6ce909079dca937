use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::Error;

use super::TaskHandle;

/// Future returned by [`any()`].
pub struct Any<T> {
    handles: Vec<TaskHandle<T>>,
}

impl<T> Unpin for Any<T> {}

impl<T> Future for Any<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T, Error>> {
        let this = self.get_mut();
        if let Some(i) = this.handles.iter().position(|h| h.done()) {
            let winner = this.handles.remove(i);
            let out = winner
                .try_take()
                .expect("winning task reported done without a result");
            // Losers are dropped here, which cancels them.
            this.handles.clear();
            return Poll::Ready(out);
        }
        for handle in &this.handles {
            handle.register_awaiter(cx.waker());
        }
        Poll::Pending
    }
}

/// Resolve with the first task to finish; cancel the rest.
///
/// When several tasks finish on the same loop step the lowest input index
/// wins, so the outcome is deterministic. The winner's value (or its
/// cancellation error) is returned; every other handle is dropped, which
/// cancels the task behind it.
///
/// # Panics
///
/// Panics if `handles` is empty — the future could never resolve.
pub fn any<T>(handles: Vec<TaskHandle<T>>) -> Any<T> {
    assert!(!handles.is_empty(), "any() requires at least one task");
    Any { handles }
}
