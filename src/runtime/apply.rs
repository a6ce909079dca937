use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::timer::{Sleep, sleep, sleep_until};

use super::TaskHandle;

/// Future returned by [`TaskHandle::apply`].
pub struct Apply<T, U, F> {
    handle: TaskHandle<T>,
    f: Option<F>,
    _out: std::marker::PhantomData<U>,
}

impl<T, U, F> Unpin for Apply<T, U, F> {}

impl<T, U, F> Future for Apply<T, U, F>
where
    F: FnOnce(T) -> U,
{
    type Output = Result<U, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<U, Error>> {
        let this = self.get_mut();
        match Pin::new(&mut this.handle).poll(cx) {
            Poll::Ready(Ok(value)) => {
                let f = this.f.take().expect("apply polled after completion");
                Poll::Ready(Ok(f(value)))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> TaskHandle<T> {
    /// Chain a transformation onto this task's result.
    ///
    /// The returned future resolves to `f(value)` once the task finishes;
    /// a cancellation surfaces unchanged instead.
    pub fn apply<U, F>(self, f: F) -> Apply<T, U, F>
    where
        F: FnOnce(T) -> U,
    {
        Apply {
            handle: self,
            f: Some(f),
            _out: std::marker::PhantomData,
        }
    }
}

pin_project_lite::pin_project! {
    /// Future returned by [`timeout()`] and [`timeout_at()`].
    pub struct Timeout<F> {
        #[pin]
        future: F,
        #[pin]
        sleep: Sleep,
    }
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        // The wrapped operation is given priority: if both it and the
        // deadline are ready on the same step, the operation wins.
        if let Poll::Ready(v) = this.future.poll(cx) {
            return Poll::Ready(Ok(v));
        }
        match this.sleep.poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(Error::TimedOut)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Bound `future` by a relative deadline; the loser is dropped.
pub fn timeout<F: Future>(duration: Duration, future: F) -> Timeout<F> {
    Timeout {
        future,
        sleep: sleep(duration),
    }
}

/// Bound `future` by an absolute deadline; the loser is dropped.
pub fn timeout_at<F: Future>(deadline: Instant, future: F) -> Timeout<F> {
    Timeout {
        future,
        sleep: sleep_until(deadline),
    }
}
