use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::Error;

use super::TaskHandle;

enum Slot<T> {
    Running(TaskHandle<T>),
    Done(T),
}

/// Future returned by [`all()`].
pub struct All<T> {
    slots: Vec<Slot<T>>,
}

impl<T> Unpin for All<T> {}

impl<T> Future for All<T> {
    type Output = Result<Vec<T>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<Vec<T>, Error>> {
        let this = self.get_mut();
        let mut pending = false;
        for slot in this.slots.iter_mut() {
            let Slot::Running(handle) = slot else {
                continue;
            };
            if !handle.done() {
                handle.register_awaiter(cx.waker());
                pending = true;
                continue;
            }
            match handle
                .try_take()
                .expect("finished task reported done without a result")
            {
                Ok(v) => *slot = Slot::Done(v),
                Err(e) => {
                    // One failure fails the whole; the rest are cancelled.
                    this.slots.clear();
                    return Poll::Ready(Err(e));
                }
            }
        }
        if pending {
            return Poll::Pending;
        }
        let outputs = std::mem::take(&mut this.slots)
            .into_iter()
            .map(|slot| match slot {
                Slot::Done(v) => v,
                Slot::Running(_) => unreachable!("pending slot after completion scan"),
            })
            .collect();
        Poll::Ready(Ok(outputs))
    }
}

/// Resolve once every task has finished, yielding the values in input
/// order. The first cancelled input fails the whole set and drops (and so
/// cancels) the remaining tasks.
pub fn all<T>(handles: Vec<TaskHandle<T>>) -> All<T> {
    All {
        slots: handles.into_iter().map(Slot::Running).collect(),
    }
}
