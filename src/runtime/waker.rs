use std::collections::VecDeque;
use std::task::{RawWaker, RawWakerVTable, Waker};

/// Identity of a task slot: index plus the generation it was created in.
///
/// The generation is bumped whenever a slot is vacated, so a waker minted
/// for a dead task can never resume whatever reuses its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TaskKey {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

impl TaskKey {
    #[inline]
    pub(crate) fn encode(self) -> u64 {
        ((self.generation as u64) << 32) | self.slot as u64
    }

    #[inline]
    pub(crate) fn decode(raw: u64) -> Self {
        TaskKey {
            slot: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

thread_local! {
    /// Thread-local queue of task keys whose tasks are ready to poll.
    /// Wakers push here; the event loop drains it between polls.
    static READY_QUEUE: std::cell::RefCell<VecDeque<u64>> =
        const { std::cell::RefCell::new(VecDeque::new()) };
}

/// Create a [`Waker`] for the given task key.
///
/// When woken, the waker pushes the encoded key onto the thread-local
/// ready queue. Zero allocation — the key is the raw data word.
///
/// Only meaningful on the thread that runs the event loop; netloop is
/// strictly single-threaded.
pub(crate) fn task_waker(key: TaskKey) -> Waker {
    let data = key.encode() as usize as *const ();
    // SAFETY: the vtable functions below follow the RawWaker contract. The
    // data word is a plain integer — no heap allocation, no lifetimes.
    unsafe { Waker::from_raw(RawWaker::new(data, &VTABLE)) }
}

const VTABLE: RawWakerVTable = RawWakerVTable::new(clone_fn, wake_fn, wake_by_ref_fn, drop_fn);

unsafe fn clone_fn(data: *const ()) -> RawWaker {
    RawWaker::new(data, &VTABLE)
}

unsafe fn wake_fn(data: *const ()) {
    // SAFETY: wake_by_ref_fn accepts any data word from our vtable.
    unsafe { wake_by_ref_fn(data) };
}

unsafe fn wake_by_ref_fn(data: *const ()) {
    let raw = data as usize as u64;
    READY_QUEUE.with(|q| {
        q.borrow_mut().push_back(raw);
    });
}

unsafe fn drop_fn(_data: *const ()) {
    // Nothing to free.
}

/// Drain the thread-local ready queue into the provided buffer.
pub(crate) fn drain_ready_queue(buf: &mut VecDeque<u64>) {
    READY_QUEUE.with(|q| {
        buf.append(&mut q.borrow_mut());
    });
}

/// Whether any wakeups are queued but not yet collected.
pub(crate) fn ready_queue_is_empty() -> bool {
    READY_QUEUE.with(|q| q.borrow().is_empty())
}

/// Discard queued wakeups. Called when an event loop is created or torn
/// down so keys from a previous loop on this thread cannot leak into the
/// next one.
pub(crate) fn clear_ready_queue() {
    READY_QUEUE.with(|q| q.borrow_mut().clear());
}
