use std::future::Future;
use std::pin::Pin;

use super::waker::TaskKey;

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// State of a single task slot.
enum TaskSlot {
    /// Slot is empty (no task).
    Empty,
    /// Task is parked (waiting for a wakeup).
    Parked(BoxFuture),
    /// Task is ready to be polled.
    Ready(BoxFuture),
}

/// Growable slab of task futures with a free list and per-slot generations.
///
/// A slot's generation increments whenever the slot is vacated, so keys
/// held by wakers or handles of a dead task stop matching and their
/// wakeups are silently dropped.
pub(crate) struct TaskSlab {
    tasks: Vec<(u32, TaskSlot)>,
    free_list: Vec<u32>,
}

impl TaskSlab {
    pub(crate) fn new() -> Self {
        TaskSlab {
            tasks: Vec::new(),
            free_list: Vec::new(),
        }
    }

    /// Insert a task. The slot starts in the Ready state so the task gets
    /// its first poll on the next drain.
    pub(crate) fn insert(&mut self, future: BoxFuture) -> TaskKey {
        match self.free_list.pop() {
            Some(slot) => {
                let entry = &mut self.tasks[slot as usize];
                debug_assert!(matches!(entry.1, TaskSlot::Empty));
                entry.1 = TaskSlot::Ready(future);
                TaskKey {
                    slot,
                    generation: entry.0,
                }
            }
            None => {
                let slot = self.tasks.len() as u32;
                self.tasks.push((0, TaskSlot::Ready(future)));
                TaskKey {
                    slot,
                    generation: 0,
                }
            }
        }
    }

    /// Take a Ready task out for polling. Returns None if the key is stale
    /// or the slot is not Ready.
    pub(crate) fn take_ready(&mut self, key: TaskKey) -> Option<BoxFuture> {
        let entry = self.tasks.get_mut(key.slot as usize)?;
        if entry.0 != key.generation {
            return None;
        }
        match std::mem::replace(&mut entry.1, TaskSlot::Empty) {
            TaskSlot::Ready(fut) => Some(fut),
            other => {
                entry.1 = other;
                None
            }
        }
    }

    /// Park a task back after it returned Poll::Pending.
    pub(crate) fn park(&mut self, key: TaskKey, future: BoxFuture) {
        let entry = &mut self.tasks[key.slot as usize];
        debug_assert_eq!(entry.0, key.generation);
        entry.1 = TaskSlot::Parked(future);
    }

    /// Mark a Parked task as Ready. Returns true if the task was parked and
    /// should be queued for polling.
    pub(crate) fn wake(&mut self, key: TaskKey) -> bool {
        let Some(entry) = self.tasks.get_mut(key.slot as usize) else {
            return false;
        };
        if entry.0 != key.generation {
            return false;
        }
        match std::mem::replace(&mut entry.1, TaskSlot::Empty) {
            TaskSlot::Parked(fut) => {
                entry.1 = TaskSlot::Ready(fut);
                true
            }
            other => {
                // Already ready, already queued — or mid-poll (Empty).
                entry.1 = other;
                false
            }
        }
    }

    /// Vacate a slot, returning the future so the caller can drop it with
    /// no slab borrow outstanding (future destructors may re-enter the
    /// runtime to deregister timers and interests).
    pub(crate) fn remove(&mut self, key: TaskKey) -> Option<BoxFuture> {
        let entry = self.tasks.get_mut(key.slot as usize)?;
        if entry.0 != key.generation {
            return None;
        }
        let fut = match std::mem::replace(&mut entry.1, TaskSlot::Empty) {
            TaskSlot::Parked(fut) | TaskSlot::Ready(fut) => Some(fut),
            TaskSlot::Empty => None,
        };
        entry.0 = entry.0.wrapping_add(1);
        self.free_list.push(key.slot);
        fut
    }

    /// Mark the slot of a task that just ran to completion as vacant.
    /// The future itself was consumed by the caller's poll.
    pub(crate) fn complete(&mut self, key: TaskKey) {
        if let Some(entry) = self.tasks.get_mut(key.slot as usize)
            && entry.0 == key.generation
        {
            debug_assert!(matches!(entry.1, TaskSlot::Empty));
            entry.0 = entry.0.wrapping_add(1);
            self.free_list.push(key.slot);
        }
    }

    /// Drain every live task out of the slab (loop teardown).
    pub(crate) fn drain_all(&mut self) -> Vec<BoxFuture> {
        let mut out = Vec::new();
        for (slot, entry) in self.tasks.iter_mut().enumerate() {
            match std::mem::replace(&mut entry.1, TaskSlot::Empty) {
                TaskSlot::Parked(fut) | TaskSlot::Ready(fut) => {
                    entry.0 = entry.0.wrapping_add(1);
                    self.free_list.push(slot as u32);
                    out.push(fut);
                }
                TaskSlot::Empty => {}
            }
        }
        out
    }

    #[cfg(test)]
    pub(crate) fn has_task(&self, key: TaskKey) -> bool {
        self.tasks
            .get(key.slot as usize)
            .is_some_and(|e| e.0 == key.generation && !matches!(e.1, TaskSlot::Empty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::{Context, Poll};

    /// A future that resolves after being polled N times.
    struct CountdownFuture(u32);

    impl Future for CountdownFuture {
        type Output = ();
        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.0 == 0 {
                Poll::Ready(())
            } else {
                self.0 -= 1;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    #[test]
    fn insert_and_take_ready() {
        let mut slab = TaskSlab::new();
        let key = slab.insert(Box::pin(CountdownFuture(2)));
        assert!(slab.has_task(key));

        let fut = slab.take_ready(key);
        assert!(fut.is_some());
        assert!(!slab.has_task(key));
    }

    #[test]
    fn park_and_wake() {
        let mut slab = TaskSlab::new();
        let key = slab.insert(Box::pin(CountdownFuture(1)));
        let fut = slab.take_ready(key).unwrap();

        slab.park(key, fut);
        assert!(slab.take_ready(key).is_none());

        assert!(slab.wake(key));
        assert!(slab.take_ready(key).is_some());
    }

    #[test]
    fn wake_already_ready_is_false() {
        let mut slab = TaskSlab::new();
        let key = slab.insert(Box::pin(CountdownFuture(0)));
        assert!(!slab.wake(key));
    }

    #[test]
    fn remove_bumps_generation() {
        let mut slab = TaskSlab::new();
        let key = slab.insert(Box::pin(CountdownFuture(0)));
        assert!(slab.remove(key).is_some());

        // The slot is reused with a new generation; the old key is stale.
        let key2 = slab.insert(Box::pin(CountdownFuture(0)));
        assert_eq!(key2.slot, key.slot);
        assert_ne!(key2.generation, key.generation);
        assert!(!slab.wake(key));
        assert!(slab.take_ready(key).is_none());
        assert!(slab.take_ready(key2).is_some());
    }

    #[test]
    fn drain_all_empties_slab() {
        let mut slab = TaskSlab::new();
        let a = slab.insert(Box::pin(CountdownFuture(0)));
        let b = slab.insert(Box::pin(CountdownFuture(3)));
        let fut = slab.take_ready(b).unwrap();
        slab.park(b, fut);

        let drained = slab.drain_all();
        assert_eq!(drained.len(), 2);
        assert!(!slab.has_task(a));
        assert!(!slab.has_task(b));
    }
}
