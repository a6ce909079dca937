//! Task runtime: the executor, task handles, and combinators.
//!
//! Tasks are plain `Future<Output = T> + 'static` values boxed into a slab.
//! Spawning returns a [`TaskHandle<T>`] that is both externally pollable
//! (`done()` / `try_take()`) and awaitable from another task. Dropping an
//! unfinished handle cancels its task: the future is destroyed, which in
//! turn withdraws any timers and I/O interests it registered.
//!
//! Everything here is single-threaded. Wakers never cross threads; they
//! push task keys onto a thread-local queue drained by the event loop.

pub(crate) mod all;
pub(crate) mod any;
pub(crate) mod apply;
pub(crate) mod task;
pub(crate) mod waker;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::error::Error;
use crate::metrics;

use self::task::TaskSlab;
use self::waker::{TaskKey, drain_ready_queue};

thread_local! {
    /// Key of the task currently being polled, or `u64::MAX` outside a poll.
    static CURRENT_TASK: Cell<u64> = const { Cell::new(u64::MAX) };

    /// Tasks whose handles were dropped and that await destruction.
    /// Cancellation is deferred to the event loop so a handle can be
    /// dropped from inside another task's poll without re-entering the
    /// executor.
    static CANCEL_QUEUE: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Opaque identity of a spawned task.
///
/// Inside a task, [`current_task()`] returns the same identity as the
/// [`TaskHandle::id()`] the spawner holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(pub(crate) u64);

/// The identity of the task this call executes in.
///
/// # Panics
///
/// Panics when called outside a task poll (there is no current task).
pub fn current_task() -> TaskId {
    let raw = CURRENT_TASK.with(|c| c.get());
    assert!(raw != u64::MAX, "current_task() called outside a task");
    TaskId(raw)
}

pub(crate) fn set_current_task(key: Option<TaskKey>) {
    CURRENT_TASK.with(|c| c.set(key.map_or(u64::MAX, TaskKey::encode)));
}

pub(crate) fn push_cancel(key: TaskKey) {
    CANCEL_QUEUE.with(|q| q.borrow_mut().push(key.encode()));
}

pub(crate) fn take_cancelled() -> Vec<u64> {
    CANCEL_QUEUE.with(|q| std::mem::take(&mut *q.borrow_mut()))
}

pub(crate) fn clear_cancel_queue() {
    CANCEL_QUEUE.with(|q| q.borrow_mut().clear());
}

/// Result cell shared between a running task and its handle.
enum HandleState<T> {
    Pending { awaiter: Option<Waker> },
    Done(Result<T, Error>),
    Taken,
}

type Shared<T> = Rc<RefCell<HandleState<T>>>;

/// Marks the task as cancelled if its future is destroyed before
/// completing, and wakes the awaiter either way.
struct CompletionGuard<T> {
    shared: Shared<T>,
}

impl<T> CompletionGuard<T> {
    fn finish(self, value: T) {
        settle(&self.shared, Ok(value));
        // Drop runs next and sees the terminal state: no-op.
    }
}

impl<T> Drop for CompletionGuard<T> {
    fn drop(&mut self) {
        let pending = matches!(*self.shared.borrow(), HandleState::Pending { .. });
        if pending {
            settle(&self.shared, Err(Error::Cancelled));
        }
    }
}

fn settle<T>(shared: &Shared<T>, value: Result<T, Error>) {
    let awaiter = {
        let mut state = shared.borrow_mut();
        let awaiter = match &mut *state {
            HandleState::Pending { awaiter } => awaiter.take(),
            _ => None,
        };
        *state = HandleState::Done(value);
        awaiter
    };
    if let Some(w) = awaiter {
        w.wake();
    }
}

/// Handle to a spawned task.
///
/// The handle is the task's owner: dropping it before completion cancels
/// the task. It can be observed from outside the loop (`done()`,
/// `try_take()`) or awaited from another task, in which case it resolves
/// to the task's value or [`Error::Cancelled`]. At most one task may await
/// a handle at a time.
pub struct TaskHandle<T> {
    key: TaskKey,
    shared: Shared<T>,
    detached: bool,
}

impl<T> TaskHandle<T> {
    /// Let the task run to completion without an owner. The result is
    /// discarded; used for fire-and-forget work like per-connection
    /// server tasks.
    pub fn detach(mut self) {
        self.detached = true;
    }
    /// This task's identity; equal to [`current_task()`] observed inside it.
    pub fn id(&self) -> TaskId {
        TaskId(self.key.encode())
    }

    /// Whether the task reached a terminal state (completed or cancelled).
    pub fn done(&self) -> bool {
        !matches!(*self.shared.borrow(), HandleState::Pending { .. })
    }

    /// Take the result if the task is done. Returns `None` while it is
    /// still running; at most one caller ever receives the value.
    pub fn try_take(&self) -> Option<Result<T, Error>> {
        let mut state = self.shared.borrow_mut();
        match &*state {
            HandleState::Done(_) => match std::mem::replace(&mut *state, HandleState::Taken) {
                HandleState::Done(v) => Some(v),
                _ => unreachable!(),
            },
            _ => None,
        }
    }

    /// Record `waker` as the single awaiter to resume on completion.
    pub(crate) fn register_awaiter(&self, waker: &Waker) {
        if let HandleState::Pending { awaiter } = &mut *self.shared.borrow_mut() {
            *awaiter = Some(waker.clone());
        }
    }

    pub(crate) fn key(&self) -> TaskKey {
        self.key
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T, Error>> {
        match self.try_take() {
            Some(v) => Poll::Ready(v),
            None => {
                let taken = matches!(*self.shared.borrow(), HandleState::Taken);
                assert!(!taken, "task handle polled after its result was taken");
                self.register_awaiter(cx.waker());
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        if !self.detached && !self.done() {
            push_cancel(self.key);
        }
    }
}

/// Per-loop executor: the task slab plus the batch queue of runnable keys.
pub(crate) struct Executor {
    pub(crate) slab: TaskSlab,
    pub(crate) ready: VecDeque<u64>,
    /// Set by `stop()`/`shutdown()`; read by `EventLoop::run`.
    pub(crate) stop_requested: bool,
}

impl Executor {
    pub(crate) fn new() -> Self {
        Executor {
            slab: TaskSlab::new(),
            ready: VecDeque::new(),
            stop_requested: false,
        }
    }

    /// Wrap a user future so completion lands in the shared result cell,
    /// insert it, and queue its first poll.
    pub(crate) fn make_task<T, F>(&mut self, future: F) -> TaskHandle<T>
    where
        T: 'static,
        F: Future<Output = T> + 'static,
    {
        let shared: Shared<T> = Rc::new(RefCell::new(HandleState::Pending { awaiter: None }));
        let guard = CompletionGuard {
            shared: shared.clone(),
        };
        let wrapper = async move {
            let out = future.await;
            guard.finish(out);
        };
        let key = self.slab.insert(Box::pin(wrapper));
        self.ready.push_back(key.encode());
        metrics::TASKS_SPAWNED.increment();
        TaskHandle {
            key,
            shared,
            detached: false,
        }
    }

    /// Pull wakeups queued by wakers into the batch queue and mark their
    /// tasks Ready. Stale keys are dropped here.
    pub(crate) fn collect_wakeups(&mut self) {
        let mut incoming = VecDeque::new();
        drain_ready_queue(&mut incoming);
        for raw in incoming {
            let key = TaskKey::decode(raw);
            if self.slab.wake(key) {
                self.ready.push_back(raw);
            }
        }
    }
}

/// Spawn a task onto the running event loop.
///
/// The free-function form is usable from inside any task; the new task is
/// queued and gets its first poll later in the same loop step. To spawn
/// before the loop runs, use [`EventLoop::spawn`](crate::EventLoop::spawn),
/// which also gives the task its first poll immediately.
///
/// # Panics
///
/// Panics if called outside a running event loop.
pub fn spawn<T, F>(future: F) -> TaskHandle<T>
where
    T: 'static,
    F: Future<Output = T> + 'static,
{
    crate::reactor::with_loop(|_, executor| executor.make_task(future))
}

pub use self::all::{All, all};
pub use self::any::{Any, any};
pub use self::apply::{Apply, Timeout, timeout, timeout_at};
