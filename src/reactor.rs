//! Reactor: interest registry, timers, and in-flight completion tracking.
//!
//! The reactor sits between futures and the backend. Futures register
//! wakers per `(fd, direction)` or per submitted operation; the event loop
//! feeds backend wakeups back through [`Reactor::route`], which consumes
//! the fired slots and re-arms whatever interest remains. At most one
//! waker per direction exists for an fd at any time — a new registration
//! replaces the old one.
//!
//! Every fd entry carries an epoch drawn from a loop-wide counter. Events
//! tagged with an older epoch (a closed socket whose fd number was reused)
//! are dropped here instead of waking an unrelated task.

use std::cell::Cell;
use std::collections::HashMap;
use std::io;
use std::ptr;
use std::task::Waker;
use std::time::Duration;

use crate::backend::{
    self, Backend, BackendKind, Family, Interest, OpDesc, OpId, SubmitError, Wakeup,
};
use crate::error::Error;
use crate::metrics;
use crate::runtime::Executor;
use crate::sys::Fd;
use crate::timer::TimerQueue;

/// One direction of interest on an fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Filter {
    Read,
    Write,
    Hup,
}

#[derive(Default)]
struct FdEntry {
    epoch: u32,
    read: Option<Waker>,
    write: Option<Waker>,
    hup: Option<Waker>,
}

impl FdEntry {
    fn mask(&self) -> Interest {
        Interest {
            read: self.read.is_some(),
            write: self.write.is_some(),
            hup: self.hup.is_some(),
        }
    }

    fn slot(&mut self, filter: Filter) -> &mut Option<Waker> {
        match filter {
            Filter::Read => &mut self.read,
            Filter::Write => &mut self.write,
            Filter::Hup => &mut self.hup,
        }
    }
}

pub(crate) struct Reactor {
    backend: Box<dyn Backend>,
    registry: HashMap<Fd, FdEntry>,
    pub(crate) timers: TimerQueue,
    op_waiters: HashMap<OpId, Waker>,
    /// Wakers whose submissions hit a full queue; all are retried after
    /// the next wait drains the queue.
    submit_backlog: Vec<Waker>,
    next_epoch: u32,
}

impl Reactor {
    pub(crate) fn new(kind: BackendKind) -> Result<Self, Error> {
        Ok(Reactor {
            backend: backend::create(kind)?,
            registry: HashMap::new(),
            timers: TimerQueue::new(),
            op_waiters: HashMap::new(),
            submit_backlog: Vec::new(),
            next_epoch: 0,
        })
    }

    pub(crate) fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub(crate) fn family(&self) -> Family {
        self.backend.family()
    }

    /// Register `waker` for one direction of `fd`, replacing any previous
    /// registration for that direction.
    pub(crate) fn register(&mut self, fd: Fd, filter: Filter, waker: Waker) -> Result<(), Error> {
        let epoch = {
            let next = &mut self.next_epoch;
            let entry = self.registry.entry(fd).or_insert_with(|| {
                *next = next.wrapping_add(1);
                FdEntry {
                    epoch: *next,
                    ..FdEntry::default()
                }
            });
            *entry.slot(filter) = Some(waker);
            entry.epoch
        };
        let mask = self.registry[&fd].mask();
        self.backend.arm(fd, mask, epoch).map_err(Error::Backend)
    }

    /// Withdraw one direction of interest. The backend is re-armed with
    /// whatever remains.
    pub(crate) fn deregister(&mut self, fd: Fd, filter: Filter) {
        let Some(entry) = self.registry.get_mut(&fd) else {
            return;
        };
        *entry.slot(filter) = None;
        let mask = entry.mask();
        let epoch = entry.epoch;
        if mask.is_empty() {
            self.registry.remove(&fd);
            let _ = self.backend.disarm(fd);
        } else {
            let _ = self.backend.arm(fd, mask, epoch);
        }
    }

    /// Drop every interest for `fd` (socket closed).
    pub(crate) fn remove_fd(&mut self, fd: Fd) {
        if self.registry.remove(&fd).is_some() {
            let _ = self.backend.disarm(fd);
        }
    }

    pub(crate) fn wait(&mut self, timeout: Duration, wakeups: &mut Vec<Wakeup>) -> io::Result<()> {
        self.backend.wait(timeout, wakeups)
    }

    /// Hand a batch of backend wakeups to their waiters, in batch order.
    /// Readiness wakeups with a stale epoch are dropped; fired directions
    /// are consumed and the fd re-armed with the remaining mask.
    pub(crate) fn route(&mut self, wakeups: &[Wakeup]) {
        metrics::WAKEUPS_DELIVERED.add(wakeups.len() as u64);
        for wakeup in wakeups {
            match *wakeup {
                Wakeup::Ready {
                    fd,
                    epoch,
                    readable,
                    writable,
                    hup,
                    err,
                } => {
                    let Some(entry) = self.registry.get_mut(&fd) else {
                        continue;
                    };
                    if entry.epoch != epoch {
                        tracing::trace!(fd, epoch, "dropping stale readiness wakeup");
                        continue;
                    }
                    // An error or hangup unblocks every direction; the
                    // waiters re-try their syscall and observe it there.
                    let burst = hup || err;
                    if (readable || burst)
                        && let Some(w) = entry.read.take()
                    {
                        w.wake();
                    }
                    if (writable || burst)
                        && let Some(w) = entry.write.take()
                    {
                        w.wake();
                    }
                    if (readable || burst)
                        && let Some(w) = entry.hup.take()
                    {
                        w.wake();
                    }
                    let mask = entry.mask();
                    let entry_epoch = entry.epoch;
                    if mask.is_empty() {
                        self.registry.remove(&fd);
                        let _ = self.backend.disarm(fd);
                    } else {
                        let _ = self.backend.arm(fd, mask, entry_epoch);
                    }
                }
                Wakeup::Complete { op, .. } => {
                    if let Some(w) = self.op_waiters.remove(&op) {
                        w.wake();
                    }
                }
            }
        }
        if !self.submit_backlog.is_empty() {
            for w in self.submit_backlog.drain(..) {
                w.wake();
            }
        }
    }

    // ── Completion-family plumbing ───────────────────────────────────

    /// Submit an operation. `Ok(None)` means the submission queue was
    /// full; the waker is parked and re-woken after the next wait so the
    /// caller can retry.
    pub(crate) fn submit(
        &mut self,
        desc: OpDesc<'_>,
        waker: &Waker,
    ) -> Result<Option<OpId>, Error> {
        match self.backend.submit(desc) {
            Ok(op) => {
                self.op_waiters.insert(op, waker.clone());
                Ok(Some(op))
            }
            Err(SubmitError::QueueFull) => {
                self.submit_backlog.push(waker.clone());
                Ok(None)
            }
            Err(SubmitError::Unsupported) => Err(Error::Backend(io::Error::new(
                io::ErrorKind::Unsupported,
                "completion operations unsupported by this backend",
            ))),
            Err(SubmitError::Os(e)) => Err(Error::from_io(e)),
        }
    }

    /// Refresh the waker that a pending operation will wake.
    pub(crate) fn update_op_waker(&mut self, op: OpId, waker: &Waker) {
        self.op_waiters.insert(op, waker.clone());
    }

    pub(crate) fn op_result(&mut self, op: OpId) -> Option<i32> {
        self.backend.op_result(op)
    }

    pub(crate) fn complete_read(&mut self, op: OpId, buf: &mut [u8]) -> usize {
        self.op_waiters.remove(&op);
        self.backend.complete_read(op, buf)
    }

    pub(crate) fn take_accept(&mut self, op: OpId) -> Option<(Fd, std::net::SocketAddr)> {
        self.op_waiters.remove(&op);
        self.backend.take_accept(op)
    }

    pub(crate) fn release_op(&mut self, op: OpId) {
        self.op_waiters.remove(&op);
        self.backend.release(op);
    }

    pub(crate) fn cancel_op(&mut self, op: OpId) {
        self.op_waiters.remove(&op);
        self.backend.cancel(op);
    }
}

// ── Loop-state access for futures ───────────────────────────────────

/// Raw pointers to the loop's reactor and executor, published in a
/// thread-local while the loop is stepping so futures can reach their
/// runtime without carrying references.
///
/// # Safety
///
/// Single-threaded by construction: the pointers are set by the loop on
/// its own thread, cleared when it leaves, and only dereferenced for the
/// duration of one short call. Nothing holds a borrow across a nested
/// access — task futures are always moved out of the slab before being
/// polled or dropped.
pub(crate) struct LoopState {
    pub(crate) reactor: *mut Reactor,
    pub(crate) executor: *mut Executor,
}

thread_local! {
    static CURRENT_LOOP: Cell<*mut LoopState> = const { Cell::new(ptr::null_mut()) };
}

/// Install `state` as the current loop, returning the previous value for
/// restoration.
pub(crate) fn set_loop_state(state: *mut LoopState) -> *mut LoopState {
    CURRENT_LOOP.with(|c| c.replace(state))
}

/// Run `f` with the current loop's reactor and executor.
///
/// # Panics
///
/// Panics when no event loop is running on this thread.
pub(crate) fn with_loop<R>(f: impl FnOnce(&mut Reactor, &mut Executor) -> R) -> R {
    try_with_loop(f).expect("netloop operation used outside a running event loop")
}

/// Like [`with_loop`], but returns `None` outside a loop. Used by `Drop`
/// impls, which must tolerate running after the loop is gone.
pub(crate) fn try_with_loop<R>(f: impl FnOnce(&mut Reactor, &mut Executor) -> R) -> Option<R> {
    let ptr = CURRENT_LOOP.with(|c| c.get());
    if ptr.is_null() {
        return None;
    }
    let state = unsafe { &mut *ptr };
    let reactor = unsafe { &mut *state.reactor };
    let executor = unsafe { &mut *state.executor };
    Some(f(reactor, executor))
}
