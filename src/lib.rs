//! netloop — single-threaded async networking runtime with pluggable
//! readiness and completion backends.
//!
//! One [`EventLoop`] per thread drives timers, sockets, and tasks over a
//! chosen [`BackendKind`]: `select`/`poll` everywhere on Unix, `epoll`
//! and `io_uring` on Linux, `kqueue` on macOS and the BSDs, and I/O
//! completion ports on Windows — all behind one interface, so the same
//! program runs on any of them.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use netloop::{ByteReader, ByteWriter, EventLoop, TcpListener, TcpStream};
//!
//! fn main() -> Result<(), netloop::Error> {
//!     let _net = netloop::NetInit::new()?;
//!     let mut el = EventLoop::new()?;
//!
//!     let listener = TcpListener::bind("127.0.0.1:8888".parse().unwrap())?;
//!     listener.listen(128)?;
//!
//!     el.block_on(async move {
//!         let conn = listener.accept().await?;
//!         let mut reader = ByteReader::new(&conn);
//!         let line = reader.read_until(b"\n").await?;
//!         ByteWriter::new(&conn).write_all(&line).await
//!     })?
//! }
//! ```
//!
//! # Model
//!
//! Everything is cooperative and single-threaded: tasks only suspend at
//! `.await`, continuations run on the loop's thread, and blocking
//! syscalls are never issued — an operation that cannot progress parks on
//! a backend wakeup instead. Within one [`EventLoop::step`], expired
//! timers always fire before socket wakeups.

pub(crate) mod addr;
pub(crate) mod backend;
pub(crate) mod error;
pub(crate) mod event_loop;
pub(crate) mod framing;
pub(crate) mod init;
pub(crate) mod metrics;
pub(crate) mod net;
pub(crate) mod reactor;
pub(crate) mod resolver;
pub(crate) mod runtime;
pub(crate) mod sys;
pub(crate) mod timer;

// ── Re-exports: loop and backends ───────────────────────────────────

/// The backend implementations selectable at loop creation.
pub use backend::BackendKind;
/// Readiness vs. completion notification model.
pub use backend::Family;
/// Crate-wide error taxonomy.
pub use error::Error;
/// The event loop.
pub use event_loop::EventLoop;
/// Request the running loop to stop from inside a task.
pub use event_loop::shutdown;
/// Scoped process-wide socket library startup (Winsock).
pub use init::NetInit;

// ── Re-exports: tasks and combinators ───────────────────────────────

/// Future returned by [`all()`].
pub use runtime::All;
/// Future returned by [`any()`].
pub use runtime::Any;
/// Future returned by [`TaskHandle::apply`].
pub use runtime::Apply;
/// Handle to a spawned task: externally pollable, awaitable, cancel on drop.
pub use runtime::TaskHandle;
/// Identity of a spawned task.
pub use runtime::TaskId;
/// Future returned by [`timeout()`] and [`timeout_at()`].
pub use runtime::Timeout;
/// Wait for every task, preserving input order.
pub use runtime::all;
/// Wait for the first task, cancelling the rest.
pub use runtime::any;
/// The identity of the task this call runs in.
pub use runtime::current_task;
/// Spawn a task from inside another task.
pub use runtime::spawn;
/// Bound a future by a relative deadline.
pub use runtime::timeout;
/// Bound a future by an absolute deadline.
pub use runtime::timeout_at;

// ── Re-exports: timers ──────────────────────────────────────────────

/// Future returned by [`sleep()`] and [`sleep_until()`].
pub use timer::Sleep;
/// Future returned by [`yield_now()`].
pub use timer::YieldNow;
/// Complete after a duration.
pub use timer::sleep;
/// Complete at an absolute instant.
pub use timer::sleep_until;
/// Suspend until the next loop step.
pub use timer::yield_now;

// ── Re-exports: sockets ─────────────────────────────────────────────

/// Parse an IP literal and port into a socket address.
pub use addr::parse_addr;
/// Listening TCP socket.
pub use net::TcpListener;
/// Connected TCP stream.
pub use net::TcpStream;
/// UDP socket.
pub use net::UdpSocket;

// ── Re-exports: framing ─────────────────────────────────────────────

/// Buffered reader: exact reads, `read_until`, struct reads.
pub use framing::ByteReader;
/// Write-all wrapper over `write_some`.
pub use framing::ByteWriter;
/// A complete line as two contiguous spans.
pub use framing::Line;
/// Line reader over a zero-copy splitter.
pub use framing::LineReader;
/// Copying ring-buffer line splitter.
pub use framing::LineSplitter;
/// Marker for raw-bytes-readable types.
pub use framing::Plain;
/// Non-relocating ring-buffer line splitter.
pub use framing::ZeroCopyLineSplitter;

// ── Re-exports: resolver ────────────────────────────────────────────

/// Default DNS port.
pub use resolver::DNS_PORT;
/// DNS record types (A, AAAA).
pub use resolver::RecordType;
/// Parsed `resolv.conf` nameserver list.
pub use resolver::ResolvConf;
/// DNS stub resolver.
pub use resolver::Resolver;
