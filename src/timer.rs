//! Timer queue and the `sleep` / `yield_now` futures.
//!
//! Timers are an ordered map keyed by `(deadline, sequence)`. The sequence
//! number makes entries with equal deadlines totally ordered and lets a
//! specific timer be cancelled without disturbing its neighbours.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::metrics;
use crate::reactor::{try_with_loop, with_loop};

/// Handle naming one registered timer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerId {
    deadline: Instant,
    seq: u64,
}

/// Ordered set of `(deadline, waker)` entries.
///
/// `BTreeMap` gives O(log n) insert/remove and an O(1) view of the minimum,
/// and iterating in key order yields exactly the non-decreasing
/// `(deadline, seq)` firing order required of `fire_expired`.
pub(crate) struct TimerQueue {
    entries: BTreeMap<(Instant, u64), Waker>,
    next_seq: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        TimerQueue {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Register a timer. The waker fires once `deadline` has passed.
    pub(crate) fn add(&mut self, deadline: Instant, waker: Waker) -> TimerId {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((deadline, seq), waker);
        TimerId { deadline, seq }
    }

    /// Cancel a timer. No-op if it already fired or was never registered.
    pub(crate) fn cancel(&mut self, id: TimerId) {
        self.entries.remove(&(id.deadline, id.seq));
    }

    /// Earliest deadline across all live timers.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.first_key_value().map(|(&(d, _), _)| d)
    }

    /// Wake (and remove) every entry with `deadline <= now`, in
    /// non-decreasing `(deadline, seq)` order. Returns the fire count.
    pub(crate) fn fire_expired(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some((&(deadline, _), _)) = self.entries.first_key_value() {
            if deadline > now {
                break;
            }
            if let Some((_, waker)) = self.entries.pop_first() {
                waker.wake();
                fired += 1;
            }
        }
        if fired > 0 {
            metrics::TIMERS_FIRED.add(fired as u64);
        }
        fired
    }

    /// Number of live timers. Exposed so callers can observe that cancelled
    /// sleeps were actually withdrawn.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// How long a blocking wait may last before the next timer is due:
/// `min(deadline - now, cap)`, clamped to zero, fractional part preserved.
pub(crate) fn wait_duration(now: Instant, deadline: Instant, cap: Duration) -> Duration {
    deadline.saturating_duration_since(now).min(cap)
}

/// Future returned by [`sleep()`] and [`sleep_until()`].
///
/// The timer entry is registered on first poll and withdrawn on drop, so a
/// `Sleep` abandoned by a combinator leaves nothing behind in the queue.
pub struct Sleep {
    deadline: Instant,
    timer: Option<TimerId>,
}

impl Sleep {
    /// Deadline this sleep resolves at.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if Instant::now() >= self.deadline {
            if let Some(id) = self.timer.take() {
                with_loop(|reactor, _| reactor.timers.cancel(id));
            }
            return Poll::Ready(());
        }
        if self.timer.is_none() {
            let deadline = self.deadline;
            let waker = cx.waker().clone();
            self.timer = Some(with_loop(|reactor, _| reactor.timers.add(deadline, waker)));
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(id) = self.timer.take() {
            try_with_loop(|reactor, _| reactor.timers.cancel(id));
        }
    }
}

/// Complete after `duration` has elapsed.
///
/// Resolution is bounded by the event loop: the task resumes on the first
/// `step()` whose clock reading is at or past the deadline, never before it.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        deadline: Instant::now() + duration,
        timer: None,
    }
}

/// Complete at the absolute instant `deadline`.
pub fn sleep_until(deadline: Instant) -> Sleep {
    Sleep {
        deadline,
        timer: None,
    }
}

/// Future returned by [`yield_now()`].
pub struct YieldNow {
    timer: Option<TimerId>,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match self.timer {
            Some(_) => {
                self.timer = None;
                Poll::Ready(())
            }
            None => {
                // An already-expired timer: fires on the next step, which is
                // exactly one full trip through the loop for every other
                // runnable task.
                let waker = cx.waker().clone();
                self.timer =
                    Some(with_loop(|reactor, _| reactor.timers.add(Instant::now(), waker)));
                Poll::Pending
            }
        }
    }
}

impl Drop for YieldNow {
    fn drop(&mut self) {
        if let Some(id) = self.timer.take() {
            try_with_loop(|reactor, _| reactor.timers.cancel(id));
        }
    }
}

/// Suspend the current task until the next loop step.
///
/// Lets sibling tasks sharing a resource (for example two tasks reading and
/// writing one socket) make progress before this task issues its syscall.
pub fn yield_now() -> YieldNow {
    YieldNow { timer: None }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_waker() -> Waker {
        Waker::noop().clone()
    }

    #[test]
    fn wait_duration_basic() {
        let base = Instant::now();
        let cap = Duration::from_secs(10);

        let d = wait_duration(base + Duration::from_secs(4), base + Duration::from_secs(10), cap);
        assert_eq!(d, Duration::from_secs(6));

        let d = wait_duration(
            base + Duration::from_secs(4),
            base + Duration::from_millis(10_001),
            cap,
        );
        assert_eq!(d, Duration::new(6, 1_000_000));

        let d = wait_duration(
            base + Duration::from_secs(4),
            base + Duration::from_secs(10_000 * 60),
            cap,
        );
        assert_eq!(d, cap);
    }

    #[test]
    fn wait_duration_never_negative() {
        let base = Instant::now();
        let cap = Duration::from_secs(10);
        let d = wait_duration(base + Duration::from_secs(5), base, cap);
        assert_eq!(d, Duration::ZERO);
    }

    #[test]
    fn fire_order_is_deadline_then_seq() {
        let mut q = TimerQueue::new();
        let base = Instant::now();
        q.add(base + Duration::from_millis(5), noop_waker());
        q.add(base + Duration::from_millis(1), noop_waker());
        q.add(base + Duration::from_millis(1), noop_waker());
        assert_eq!(q.next_deadline(), Some(base + Duration::from_millis(1)));

        assert_eq!(q.fire_expired(base + Duration::from_millis(1)), 2);
        assert_eq!(q.len(), 1);
        assert_eq!(q.fire_expired(base + Duration::from_millis(5)), 1);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn cancel_is_exact() {
        let mut q = TimerQueue::new();
        let base = Instant::now();
        let deadline = base + Duration::from_millis(3);
        let a = q.add(deadline, noop_waker());
        let b = q.add(deadline, noop_waker());
        q.cancel(a);
        assert_eq!(q.len(), 1);
        // Cancelling again, or cancelling a fired timer, is a no-op.
        q.cancel(a);
        assert_eq!(q.fire_expired(deadline), 1);
        q.cancel(b);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn expired_entries_all_fire() {
        let mut q = TimerQueue::new();
        let base = Instant::now();
        for i in 0..16 {
            q.add(base + Duration::from_millis(i % 4), noop_waker());
        }
        assert_eq!(q.fire_expired(base + Duration::from_millis(10)), 16);
        assert_eq!(q.next_deadline(), None);
    }
}
