//! Readiness and completion backends behind one interface.
//!
//! Two families share the [`Backend`] trait:
//!
//! - **Readiness** (`select`, `poll`, `epoll`, `kqueue`): the backend
//!   reports which descriptors can make progress and the engine performs
//!   the syscall itself, re-arming on `EAGAIN`.
//! - **Completion** (`io_uring`, IOCP): whole operations are submitted
//!   with backend-owned buffers and the backend later delivers the result
//!   (bytes transferred or a negative errno).
//!
//! The reactor owns all waker bookkeeping; a backend tracks only
//! `(fd, interest mask, epoch)` and hands back [`Wakeup`] values. The
//! epoch travels with every readiness event so a wakeup armed for an fd's
//! previous life is discarded instead of resuming an unrelated task.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::Error;
use crate::sys::Fd;

#[cfg(unix)]
mod poll;
#[cfg(unix)]
mod select;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
mod uring;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;

#[cfg(windows)]
mod iocp;

/// Which notification model a backend implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// "fd is ready" — the engine performs the syscall.
    Readiness,
    /// "operation finished" — the backend performed the I/O.
    Completion,
}

/// The available backend implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// `select(2)`. Portable, O(highest fd), fd limit applies.
    Select,
    /// `poll(2)`. Portable, array rebuilt per wait.
    Poll,
    /// `epoll(7)`, Linux. Level-triggered.
    Epoll,
    /// `kqueue(2)`, macOS/BSD.
    Kqueue,
    /// `io_uring`, Linux. Completion family.
    Uring,
    /// I/O completion ports, Windows. Completion family.
    Iocp,
}

impl BackendKind {
    /// The preferred backend for the host OS.
    pub fn default_for_host() -> BackendKind {
        #[cfg(target_os = "linux")]
        {
            BackendKind::Epoll
        }
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        ))]
        {
            BackendKind::Kqueue
        }
        #[cfg(windows)]
        {
            BackendKind::Iocp
        }
        #[cfg(not(any(
            target_os = "linux",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly",
            windows
        )))]
        {
            BackendKind::Poll
        }
    }

    /// Backends usable in this process, probed at runtime.
    ///
    /// io_uring is compiled in on Linux but may still be unavailable
    /// (seccomp, old kernels); it is listed only when a ring can actually
    /// be created.
    pub fn available() -> Vec<BackendKind> {
        let mut kinds = Vec::new();
        #[cfg(unix)]
        {
            kinds.push(BackendKind::Select);
            kinds.push(BackendKind::Poll);
        }
        #[cfg(target_os = "linux")]
        {
            kinds.push(BackendKind::Epoll);
            if uring::UringBackend::probe() {
                kinds.push(BackendKind::Uring);
            }
        }
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        ))]
        {
            kinds.push(BackendKind::Kqueue);
        }
        #[cfg(windows)]
        {
            kinds.push(BackendKind::Iocp);
        }
        kinds
    }
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "select" => Ok(BackendKind::Select),
            "poll" => Ok(BackendKind::Poll),
            "epoll" => Ok(BackendKind::Epoll),
            "kqueue" => Ok(BackendKind::Kqueue),
            "uring" => Ok(BackendKind::Uring),
            "iocp" => Ok(BackendKind::Iocp),
            other => Err(Error::Backend(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown backend {other:?}"),
            ))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackendKind::Select => "select",
            BackendKind::Poll => "poll",
            BackendKind::Epoll => "epoll",
            BackendKind::Kqueue => "kqueue",
            BackendKind::Uring => "uring",
            BackendKind::Iocp => "iocp",
        };
        f.write_str(name)
    }
}

/// Which directions an fd is armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Interest {
    pub(crate) read: bool,
    pub(crate) write: bool,
    pub(crate) hup: bool,
}

impl Interest {
    pub(crate) fn is_empty(self) -> bool {
        !(self.read || self.write || self.hup)
    }
}

/// Handle to one in-flight completion operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct OpId {
    pub(crate) slot: u32,
    pub(crate) generation: u16,
}

/// An operation submitted to a completion-family backend.
pub(crate) enum OpDesc<'a> {
    /// Receive up to `len` bytes into a backend-owned buffer.
    Recv { fd: Fd, len: usize },
    /// Send `data` (copied into a backend-owned buffer at submission).
    Send { fd: Fd, data: &'a [u8] },
    /// Connect `fd` to `addr`.
    Connect { fd: Fd, addr: SocketAddr },
    /// Accept one connection on listener `fd`.
    Accept { fd: Fd },
}

/// Why a submission was not accepted.
#[derive(Debug)]
pub(crate) enum SubmitError {
    /// The submission queue is full; retry after the next wait.
    QueueFull,
    /// This backend does not implement completion operations.
    Unsupported,
    /// The OS rejected the submission outright.
    Os(io::Error),
}

/// One unit of "something happened", delivered by [`Backend::wait`].
#[derive(Debug, Clone, Copy)]
pub(crate) enum Wakeup {
    /// Readiness family: `fd` can make progress in the flagged directions.
    Ready {
        fd: Fd,
        epoch: u32,
        readable: bool,
        writable: bool,
        hup: bool,
        err: bool,
    },
    /// Completion family: the operation finished.
    /// `result` is bytes transferred (or a new fd) on success, a negative
    /// errno on failure.
    Complete { op: OpId, result: i32 },
}

/// The common backend contract; see the module docs for the two families.
pub(crate) trait Backend {
    fn kind(&self) -> BackendKind;

    fn family(&self) -> Family {
        Family::Readiness
    }

    /// Register interest in `fd`, replacing any previous mask. An empty
    /// mask is equivalent to [`disarm`](Backend::disarm).
    fn arm(&mut self, fd: Fd, interest: Interest, epoch: u32) -> io::Result<()>;

    /// Cancel all interests for `fd`.
    fn disarm(&mut self, fd: Fd) -> io::Result<()>;

    /// Block until something happens or `timeout` elapses, appending
    /// wakeups in the order the OS reported them.
    fn wait(&mut self, timeout: Duration, wakeups: &mut Vec<Wakeup>) -> io::Result<()>;

    /// Submit an operation (completion family only).
    fn submit(&mut self, desc: OpDesc<'_>) -> Result<OpId, SubmitError> {
        let _ = desc;
        Err(SubmitError::Unsupported)
    }

    /// Request cancellation of an in-flight operation. The backend keeps
    /// the operation's buffers alive until the OS confirms.
    fn cancel(&mut self, op: OpId) {
        let _ = op;
    }

    /// The stored result of a finished operation, if any.
    fn op_result(&mut self, op: OpId) -> Option<i32> {
        let _ = op;
        None
    }

    /// Copy a finished read's bytes out and release the operation.
    /// Returns the number of bytes copied.
    fn complete_read(&mut self, op: OpId, buf: &mut [u8]) -> usize {
        let _ = (op, buf);
        0
    }

    /// Take the accepted fd and peer address of a finished accept,
    /// releasing the operation.
    fn take_accept(&mut self, op: OpId) -> Option<(Fd, SocketAddr)> {
        let _ = op;
        None
    }

    /// Release a finished operation whose result has been consumed.
    fn release(&mut self, op: OpId) {
        let _ = op;
    }
}

/// Instantiate the requested backend.
pub(crate) fn create(kind: BackendKind) -> Result<Box<dyn Backend>, Error> {
    match kind {
        #[cfg(unix)]
        BackendKind::Select => Ok(Box::new(select::SelectBackend::new())),
        #[cfg(unix)]
        BackendKind::Poll => Ok(Box::new(poll::PollBackend::new())),
        #[cfg(target_os = "linux")]
        BackendKind::Epoll => Ok(Box::new(epoll::EpollBackend::new()?)),
        #[cfg(target_os = "linux")]
        BackendKind::Uring => Ok(Box::new(uring::UringBackend::new(uring::DEFAULT_ENTRIES)?)),
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        ))]
        BackendKind::Kqueue => Ok(Box::new(kqueue::KqueueBackend::new()?)),
        #[cfg(windows)]
        BackendKind::Iocp => Ok(Box::new(iocp::IocpBackend::new()?)),
        #[allow(unreachable_patterns)]
        other => Err(Error::Backend(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("backend {other} is not available on this platform"),
        ))),
    }
}
