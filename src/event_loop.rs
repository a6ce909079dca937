//! The event loop: one `step()` = wait, fire timers, deliver wakeups,
//! poll runnable tasks.

use std::future::Future;
use std::task::Context;
use std::time::{Duration, Instant};

use crate::backend::{BackendKind, Wakeup};
use crate::error::Error;
use crate::metrics;
use crate::reactor::{LoopState, Reactor, set_loop_state};
use crate::runtime::waker::{self, TaskKey, task_waker};
use crate::runtime::{self, Executor, TaskHandle, set_current_task};
use crate::timer::wait_duration;

/// Ceiling on how long one wait may block, even with no timers armed.
const MAX_WAIT: Duration = Duration::from_secs(10);

/// A single-threaded event loop: backend, timer queue, and task executor.
///
/// Tasks belong to the loop they were spawned on; everything — timers,
/// socket wakeups, continuations — runs on the caller's thread inside
/// [`step()`](EventLoop::step).
///
/// ```no_run
/// use netloop::EventLoop;
/// use std::time::Duration;
///
/// let mut el = EventLoop::new()?;
/// let woke = el.block_on(async {
///     netloop::sleep(Duration::from_millis(10)).await;
///     42
/// })?;
/// assert_eq!(woke, 42);
/// # Ok::<(), netloop::Error>(())
/// ```
pub struct EventLoop {
    reactor: Reactor,
    executor: Executor,
    scratch: Vec<Wakeup>,
}

impl EventLoop {
    /// Create a loop on the host's preferred backend.
    pub fn new() -> Result<EventLoop, Error> {
        Self::with_backend(BackendKind::default_for_host())
    }

    /// Create a loop on a specific backend.
    pub fn with_backend(kind: BackendKind) -> Result<EventLoop, Error> {
        let reactor = Reactor::new(kind)?;
        // A previous loop on this thread may have left wakeups behind.
        waker::clear_ready_queue();
        runtime::clear_cancel_queue();
        tracing::debug!(backend = %kind, "event loop created");
        Ok(EventLoop {
            reactor,
            executor: Executor::new(),
            scratch: Vec::new(),
        })
    }

    /// The backend this loop runs on.
    pub fn backend_kind(&self) -> BackendKind {
        self.reactor.kind()
    }

    /// Number of live timers. After a combinator cancels its losers this
    /// drops back to whatever remains armed.
    pub fn timers_len(&self) -> usize {
        self.reactor.timers.len()
    }

    /// Spawn a task and give it its first poll immediately.
    ///
    /// The eager poll means a task that never suspends (or a chain over
    /// already-finished tasks) completes before `spawn` returns, without
    /// the loop ever stepping.
    pub fn spawn<T, F>(&mut self, future: F) -> TaskHandle<T>
    where
        T: 'static,
        F: Future<Output = T> + 'static,
    {
        let handle = self.executor.make_task(future);
        let key = handle.key();
        self.scoped(|el| {
            el.poll_task(key);
            el.drain_cancelled();
        });
        handle
    }

    /// One loop iteration: wait for the next deadline or wakeup, fire
    /// expired timers (always before fd wakeups), then poll every
    /// runnable task until the batch queue drains.
    pub fn step(&mut self) -> Result<(), Error> {
        metrics::LOOP_STEPS.increment();
        self.scoped(|el| el.drain_cancelled());

        let now = Instant::now();
        let mut timeout = match self.reactor.timers.next_deadline() {
            Some(deadline) => wait_duration(now, deadline, MAX_WAIT),
            None => MAX_WAIT,
        };
        if !self.executor.ready.is_empty() || !waker::ready_queue_is_empty() {
            timeout = Duration::ZERO;
        }

        let mut wakeups = std::mem::take(&mut self.scratch);
        wakeups.clear();
        let waited = self.reactor.wait(timeout, &mut wakeups);

        self.reactor.timers.fire_expired(Instant::now());
        self.reactor.route(&wakeups);
        wakeups.clear();
        self.scratch = wakeups;
        waited?;

        self.scoped(|el| {
            loop {
                el.executor.collect_wakeups();
                let Some(raw) = el.executor.ready.pop_front() else {
                    break;
                };
                el.poll_task(TaskKey::decode(raw));
                el.drain_cancelled();
            }
        });
        Ok(())
    }

    /// Step until `handle` reaches a terminal state.
    pub fn run_until<T>(&mut self, handle: &TaskHandle<T>) -> Result<(), Error> {
        while !handle.done() {
            self.step()?;
        }
        Ok(())
    }

    /// Spawn `future` and drive the loop until it finishes, returning its
    /// output.
    pub fn block_on<T, F>(&mut self, future: F) -> Result<T, Error>
    where
        T: 'static,
        F: Future<Output = T> + 'static,
    {
        let handle = self.spawn(future);
        self.run_until(&handle)?;
        handle
            .try_take()
            .expect("task not settled after run_until returned")
    }

    /// Step until [`stop()`](EventLoop::stop) or
    /// [`shutdown()`](crate::shutdown) is called.
    pub fn run(&mut self) -> Result<(), Error> {
        self.executor.stop_requested = false;
        while !self.executor.stop_requested {
            self.step()?;
        }
        Ok(())
    }

    /// Make [`run()`](EventLoop::run) return after the current step.
    pub fn stop(&mut self) {
        self.executor.stop_requested = true;
    }

    /// Publish this loop's state in the thread-local slot for the
    /// duration of `f`, so futures polled inside can reach the runtime.
    fn scoped<R>(&mut self, f: impl FnOnce(&mut EventLoop) -> R) -> R {
        struct Restore(*mut LoopState);
        impl Drop for Restore {
            fn drop(&mut self) {
                set_loop_state(self.0);
            }
        }

        let mut state = LoopState {
            reactor: &mut self.reactor,
            executor: &mut self.executor,
        };
        let _restore = Restore(set_loop_state(&mut state));
        f(self)
    }

    /// Poll one task. The future is moved out of the slab first so its
    /// own poll (and anything it drops) can re-enter the runtime freely.
    fn poll_task(&mut self, key: TaskKey) {
        let Some(mut fut) = self.executor.slab.take_ready(key) else {
            // Stale queue entry: the task completed, was cancelled, or
            // was already polled this batch.
            return;
        };
        set_current_task(Some(key));
        let waker = task_waker(key);
        let mut cx = Context::from_waker(&waker);
        let poll = fut.as_mut().poll(&mut cx);
        set_current_task(None);
        match poll {
            std::task::Poll::Ready(()) => {
                drop(fut);
                self.executor.slab.complete(key);
                // Hand control to whatever this task woke (its awaiter)
                // ahead of the rest of the batch. A combinator resumed
                // this way can cancel its losers before their queued
                // wakeups are reached; those entries then miss the slab
                // and are skipped.
                let mut woken = std::collections::VecDeque::new();
                waker::drain_ready_queue(&mut woken);
                while let Some(raw) = woken.pop_back() {
                    if self.executor.slab.wake(TaskKey::decode(raw)) {
                        self.executor.ready.push_front(raw);
                    }
                }
            }
            std::task::Poll::Pending => self.executor.slab.park(key, fut),
        }
    }

    /// Destroy tasks whose handles were dropped. Futures are moved out of
    /// the slab before being dropped; their destructors withdraw timers
    /// and interests through the published loop state.
    fn drain_cancelled(&mut self) {
        loop {
            let keys = runtime::take_cancelled();
            if keys.is_empty() {
                break;
            }
            for raw in keys {
                let key = TaskKey::decode(raw);
                if let Some(fut) = self.executor.slab.remove(key) {
                    drop(fut);
                }
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.scoped(|el| {
            el.drain_cancelled();
            let tasks = el.executor.slab.drain_all();
            for fut in tasks {
                drop(fut);
            }
            el.drain_cancelled();
        });
        waker::clear_ready_queue();
        runtime::clear_cancel_queue();
    }
}

/// Request the running loop to stop; the free-function twin of
/// [`EventLoop::stop`] for use inside tasks.
///
/// # Panics
///
/// Panics if called outside a running event loop.
pub fn shutdown() {
    crate::reactor::with_loop(|_, executor| {
        executor.stop_requested = true;
    });
}
