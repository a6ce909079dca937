//! Timer ordering, combinators, and task identity, run per backend.

mod common;

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use common::{for_each_backend, run_all};
use netloop::{Error, EventLoop, all, any, sleep, sleep_until};

#[test]
fn sleep_resumes_at_or_after_deadline() {
    for_each_backend(|kind| {
        let mut el = EventLoop::with_backend(kind).unwrap();
        let start = Instant::now();
        let timeout = Duration::from_millis(100);
        let woke = el
            .block_on(async move {
                sleep(timeout).await;
                Instant::now()
            })
            .unwrap();
        assert!(woke >= start + timeout);
    });
}

#[test]
fn concurrent_sleeps_complete_in_deadline_order() {
    for_each_backend(|kind| {
        let mut el = EventLoop::with_backend(kind).unwrap();
        let counter = Rc::new(Cell::new(0));

        let c1 = counter.clone();
        let h1 = el.spawn(async move {
            sleep(Duration::from_millis(100)).await;
            c1.set(c1.get() + 1);
            c1.get()
        });
        let c2 = counter.clone();
        let h2 = el.spawn(async move {
            sleep(Duration::from_millis(200)).await;
            c2.set(c2.get() + 1);
            c2.get()
        });

        while !(h1.done() && h2.done()) {
            el.step().unwrap();
        }
        assert_eq!(h1.try_take().unwrap().unwrap(), 1);
        assert_eq!(h2.try_take().unwrap().unwrap(), 2);
        assert_eq!(counter.get(), 2);
    });
}

#[test]
fn any_resolves_with_first_sleep_and_drains_losers() {
    for_each_backend(|kind| {
        let mut el = EventLoop::with_backend(kind).unwrap();

        let sleeps: Vec<_> = [100u64, 200, 201, 202]
            .into_iter()
            .map(|ms| {
                el.spawn(async move {
                    sleep(Duration::from_millis(ms)).await;
                })
            })
            .collect();
        let start = Instant::now();
        let h = el.spawn(async move {
            any(sleeps).await.unwrap();
        });

        el.run_until(&h).unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(200));

        // The losers were cancelled; nothing outlives the winner.
        while el.timers_len() > 0 {
            el.step().unwrap();
        }
    });
}

#[test]
fn any_returns_the_winning_value() {
    for_each_backend(|kind| {
        let mut el = EventLoop::with_backend(kind).unwrap();

        let tasks: Vec<_> = [(204u64, 1u32), (100, 2), (201, 3), (202, 4)]
            .into_iter()
            .map(|(ms, value)| {
                el.spawn(async move {
                    sleep(Duration::from_millis(ms)).await;
                    value
                })
            })
            .collect();
        let h = el.spawn(async move { any(tasks).await.unwrap() });

        el.run_until(&h).unwrap();
        assert_eq!(h.try_take().unwrap().unwrap(), 2);

        while el.timers_len() > 0 {
            el.step().unwrap();
        }
    });
}

#[test]
fn any_with_identical_deadlines_runs_one_winner() {
    for_each_backend(|kind| {
        let mut el = EventLoop::with_backend(kind).unwrap();
        let counter = Rc::new(Cell::new(0));
        let until = Instant::now() + Duration::from_millis(100);

        let sleepers: Vec<_> = (0..4)
            .map(|_| {
                let c = counter.clone();
                el.spawn(async move {
                    sleep_until(until).await;
                    c.set(c.get() + 1);
                })
            })
            .collect();
        let c = counter.clone();
        let h = el.spawn(async move {
            any(sleepers).await.unwrap();
            c.set(c.get() + 1);
        });

        el.run_until(&h).unwrap();
        while el.timers_len() > 0 {
            el.step().unwrap();
        }
        // Exactly one sleeper ran before the combinator cancelled the
        // rest, plus the outer increment.
        assert_eq!(counter.get(), 2);
    });
}

#[test]
fn all_preserves_input_order_without_stepping() {
    let mut el = EventLoop::new().unwrap();

    let tasks: Vec<_> = (1..=4).map(|i| el.spawn(async move { i })).collect();
    let h = el.spawn(async move { all(tasks).await.unwrap() });
    // Every input finished at spawn, so the aggregate resolved eagerly.
    assert!(h.done());
    assert_eq!(h.try_take().unwrap().unwrap(), vec![1, 2, 3, 4]);

    let units: Vec<_> = (0..4).map(|_| el.spawn(async {})).collect();
    let h = el.spawn(async move {
        all(units).await.unwrap();
        1
    });
    assert!(h.done());
    assert_eq!(h.try_take().unwrap().unwrap(), 1);
}

#[test]
fn all_bounded_by_timeout_cancels_its_inputs() {
    let mut el = EventLoop::new().unwrap();

    let finished = el.spawn(async { 1u32 });
    let stuck = el.spawn(async { std::future::pending::<u32>().await });
    let h = el.spawn(async move {
        let waiting = all(vec![finished, stuck]);
        netloop::timeout(Duration::from_millis(50), waiting).await
    });
    el.run_until(&h).unwrap();
    assert!(matches!(h.try_take().unwrap().unwrap(), Err(Error::TimedOut)));
}

#[test]
fn loop_teardown_cancels_tasks() {
    let mut el = EventLoop::new().unwrap();
    let h = el.spawn(async { std::future::pending::<u32>().await });
    assert!(!h.done());
    drop(el);
    assert!(h.done());
    assert!(matches!(h.try_take(), Some(Err(Error::Cancelled))));
}

#[test]
fn apply_chains_a_transformation() {
    let mut el = EventLoop::new().unwrap();

    let int_task = el.spawn(async { 1i32 });
    let chained = int_task.apply(|v| v as f64 * 1.5);
    let h = el.spawn(async move { chained.await.unwrap() });

    assert!(h.done());
    let value = h.try_take().unwrap().unwrap();
    assert!((value - 1.5).abs() < 1e-13);
}

#[test]
fn apply_abandoned_by_timeout_cancels_the_task() {
    let mut el = EventLoop::new().unwrap();

    let stuck = el.spawn(async { std::future::pending::<u32>().await });
    let chained = stuck.apply(|v| v + 1);
    let h = el.spawn(async move { netloop::timeout(Duration::from_millis(20), chained).await });
    el.run_until(&h).unwrap();
    assert!(matches!(h.try_take().unwrap().unwrap(), Err(Error::TimedOut)));
}

#[test]
fn current_task_matches_the_handle() {
    let mut el = EventLoop::new().unwrap();
    let observed = Rc::new(Cell::new(None));

    let cell = observed.clone();
    let h = el.spawn(async move {
        cell.set(Some(netloop::current_task()));
    });

    assert!(h.done());
    assert_eq!(observed.get(), Some(h.id()));
}

#[test]
fn dropping_a_handle_cancels_its_task() {
    for_each_backend(|kind| {
        let mut el = EventLoop::with_backend(kind).unwrap();
        let h = el.spawn(async {
            sleep(Duration::from_secs(30)).await;
        });
        let tick = el.spawn(async {
            sleep(Duration::from_millis(1)).await;
        });
        assert!(!h.done());
        drop(h);
        // The cancellation is processed at the next step; the 30 s timer
        // must be withdrawn rather than parking the loop on it.
        el.run_until(&tick).unwrap();
        assert_eq!(el.timers_len(), 0);
    });
}

#[test]
fn run_all_helper_drives_mixed_durations() {
    for_each_backend(|kind| {
        let mut el = EventLoop::with_backend(kind).unwrap();
        let fast = el.spawn(async {
            sleep(Duration::from_millis(5)).await;
            1
        });
        let slow = el.spawn(async {
            sleep(Duration::from_millis(25)).await;
            2
        });
        run_all(&mut el, &[&fast, &slow]);
        assert_eq!(fast.try_take().unwrap().unwrap(), 1);
        assert_eq!(slow.try_take().unwrap().unwrap(), 2);
    });
}
