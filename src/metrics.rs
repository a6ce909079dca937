//! Runtime counters.
//!
//! Static metriken counters incremented on the loop's hot paths. Cheap
//! enough to leave on unconditionally; an embedding application exposes
//! them through whatever metriken exporter it already runs.

use metriken::{Counter, metric};

// ── Loop ─────────────────────────────────────────────────────────

#[metric(name = "netloop/loop/steps", description = "Event loop iterations")]
pub static LOOP_STEPS: Counter = Counter::new();

#[metric(name = "netloop/timers/fired", description = "Timer entries fired")]
pub static TIMERS_FIRED: Counter = Counter::new();

#[metric(
    name = "netloop/wakeups/delivered",
    description = "Backend wakeups routed to waiters"
)]
pub static WAKEUPS_DELIVERED: Counter = Counter::new();

#[metric(name = "netloop/tasks/spawned", description = "Tasks spawned")]
pub static TASKS_SPAWNED: Counter = Counter::new();

// ── Sockets ──────────────────────────────────────────────────────

#[metric(
    name = "netloop/connections/accepted",
    description = "Connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "netloop/connections/opened",
    description = "Outbound connections initiated"
)]
pub static CONNECTIONS_OPENED: Counter = Counter::new();

#[metric(name = "netloop/connections/closed", description = "Streams closed")]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(name = "netloop/bytes/read", description = "Bytes read from streams")]
pub static BYTES_READ: Counter = Counter::new();

#[metric(name = "netloop/bytes/written", description = "Bytes written to streams")]
pub static BYTES_WRITTEN: Counter = Counter::new();

// ── Backend ──────────────────────────────────────────────────────

#[metric(
    name = "netloop/backend/submit_retries",
    description = "Submission queue full events"
)]
pub static SUBMIT_RETRIES: Counter = Counter::new();

// ── Resolver ─────────────────────────────────────────────────────

#[metric(name = "netloop/resolver/queries", description = "DNS lookups started")]
pub static RESOLVER_QUERIES: Counter = Counter::new();
