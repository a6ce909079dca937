//! Non-blocking sockets driven by the event loop.
//!
//! The data path depends on the backend family. On readiness backends an
//! operation tries its syscall first and, on `EAGAIN`, parks on an
//! [`IoReady`] future that registers the matching interest; wakeups are
//! advisory, so a woken operation simply retries the syscall. On
//! completion backends the operation is submitted whole and its future
//! waits for the stored result.
//!
//! UDP and peer-close monitoring always use the readiness path; the
//! io_uring backend serves them through one-shot poll submissions.

mod tcp;
mod udp;

pub use tcp::{TcpListener, TcpStream};
pub use udp::UdpSocket;

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::backend::{Family, OpDesc, OpId};
use crate::error::Error;
use crate::reactor::{Filter, try_with_loop, with_loop};
use crate::sys::Fd;

/// The family of the running loop's backend.
pub(crate) fn loop_family() -> Family {
    with_loop(|reactor, _| reactor.family())
}

/// Resolve once `fd` looks ready for `filter`.
///
/// Wakeups may be spurious (another direction fired on the same event, or
/// a combinator polled early); callers always re-try their syscall and
/// re-await on `EAGAIN`. Dropping the future mid-wait withdraws the
/// interest, so an abandoned wait leaves nothing armed.
pub(crate) struct IoReady {
    fd: Fd,
    filter: Filter,
    registered: bool,
}

impl IoReady {
    pub(crate) fn new(fd: Fd, filter: Filter) -> Self {
        IoReady {
            fd,
            filter,
            registered: false,
        }
    }
}

impl Future for IoReady {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        if self.registered {
            self.registered = false;
            return Poll::Ready(Ok(()));
        }
        let (fd, filter) = (self.fd, self.filter);
        let waker = cx.waker().clone();
        match with_loop(|reactor, _| reactor.register(fd, filter, waker)) {
            Ok(()) => {
                self.registered = true;
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl Drop for IoReady {
    fn drop(&mut self) {
        if self.registered {
            let (fd, filter) = (self.fd, self.filter);
            try_with_loop(|reactor, _| reactor.deregister(fd, filter));
        }
    }
}

fn errno_error(res: i32) -> Error {
    Error::from_io(io::Error::from_raw_os_error(-res))
}

/// Completion-family read: submit, wait, copy out.
pub(crate) struct CompletionRead<'a> {
    fd: Fd,
    buf: &'a mut [u8],
    op: Option<OpId>,
}

impl<'a> CompletionRead<'a> {
    pub(crate) fn new(fd: Fd, buf: &'a mut [u8]) -> Self {
        CompletionRead { fd, buf, op: None }
    }
}

impl Future for CompletionRead<'_> {
    type Output = Result<usize, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<usize, Error>> {
        let this = self.get_mut();
        with_loop(|reactor, _| match this.op {
            Some(op) => match reactor.op_result(op) {
                Some(res) => {
                    this.op = None;
                    if res < 0 {
                        reactor.release_op(op);
                        Poll::Ready(Err(errno_error(res)))
                    } else {
                        let n = reactor.complete_read(op, this.buf);
                        Poll::Ready(Ok(n))
                    }
                }
                None => {
                    reactor.update_op_waker(op, cx.waker());
                    Poll::Pending
                }
            },
            None => {
                let desc = OpDesc::Recv {
                    fd: this.fd,
                    len: this.buf.len(),
                };
                match reactor.submit(desc, cx.waker()) {
                    Ok(Some(op)) => {
                        this.op = Some(op);
                        Poll::Pending
                    }
                    // Queue full: parked for retry after the next wait.
                    Ok(None) => Poll::Pending,
                    Err(e) => Poll::Ready(Err(e)),
                }
            }
        })
    }
}

impl Drop for CompletionRead<'_> {
    fn drop(&mut self) {
        if let Some(op) = self.op.take() {
            try_with_loop(|reactor, _| reactor.cancel_op(op));
        }
    }
}

/// Completion-family write: the bytes are copied into the backend's slot
/// at submission, so the caller's buffer is free as soon as `submit`
/// accepts it.
pub(crate) struct CompletionWrite<'a> {
    fd: Fd,
    data: &'a [u8],
    op: Option<OpId>,
}

impl<'a> CompletionWrite<'a> {
    pub(crate) fn new(fd: Fd, data: &'a [u8]) -> Self {
        CompletionWrite { fd, data, op: None }
    }
}

impl Future for CompletionWrite<'_> {
    type Output = Result<usize, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<usize, Error>> {
        let this = self.get_mut();
        with_loop(|reactor, _| match this.op {
            Some(op) => match reactor.op_result(op) {
                Some(res) => {
                    this.op = None;
                    reactor.release_op(op);
                    if res < 0 {
                        Poll::Ready(Err(errno_error(res)))
                    } else {
                        Poll::Ready(Ok(res as usize))
                    }
                }
                None => {
                    reactor.update_op_waker(op, cx.waker());
                    Poll::Pending
                }
            },
            None => {
                let desc = OpDesc::Send {
                    fd: this.fd,
                    data: this.data,
                };
                match reactor.submit(desc, cx.waker()) {
                    Ok(Some(op)) => {
                        this.op = Some(op);
                        Poll::Pending
                    }
                    Ok(None) => Poll::Pending,
                    Err(e) => Poll::Ready(Err(e)),
                }
            }
        })
    }
}

impl Drop for CompletionWrite<'_> {
    fn drop(&mut self) {
        if let Some(op) = self.op.take() {
            try_with_loop(|reactor, _| reactor.cancel_op(op));
        }
    }
}

/// Completion-family connect.
pub(crate) struct CompletionConnect {
    fd: Fd,
    addr: std::net::SocketAddr,
    op: Option<OpId>,
}

impl CompletionConnect {
    pub(crate) fn new(fd: Fd, addr: std::net::SocketAddr) -> Self {
        CompletionConnect { fd, addr, op: None }
    }
}

impl Future for CompletionConnect {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        let this = self.get_mut();
        with_loop(|reactor, _| match this.op {
            Some(op) => match reactor.op_result(op) {
                Some(res) => {
                    this.op = None;
                    reactor.release_op(op);
                    if res < 0 {
                        Poll::Ready(Err(errno_error(res)))
                    } else {
                        Poll::Ready(Ok(()))
                    }
                }
                None => {
                    reactor.update_op_waker(op, cx.waker());
                    Poll::Pending
                }
            },
            None => {
                let desc = OpDesc::Connect {
                    fd: this.fd,
                    addr: this.addr,
                };
                match reactor.submit(desc, cx.waker()) {
                    Ok(Some(op)) => {
                        this.op = Some(op);
                        Poll::Pending
                    }
                    Ok(None) => Poll::Pending,
                    Err(e) => Poll::Ready(Err(e)),
                }
            }
        })
    }
}

impl Drop for CompletionConnect {
    fn drop(&mut self) {
        if let Some(op) = self.op.take() {
            try_with_loop(|reactor, _| reactor.cancel_op(op));
        }
    }
}

/// Completion-family accept.
pub(crate) struct CompletionAccept {
    fd: Fd,
    op: Option<OpId>,
}

impl CompletionAccept {
    pub(crate) fn new(fd: Fd) -> Self {
        CompletionAccept { fd, op: None }
    }
}

impl Future for CompletionAccept {
    type Output = Result<(Fd, std::net::SocketAddr), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        with_loop(|reactor, _| match this.op {
            Some(op) => match reactor.op_result(op) {
                Some(res) => {
                    this.op = None;
                    if res < 0 {
                        reactor.release_op(op);
                        Poll::Ready(Err(errno_error(res)))
                    } else {
                        match reactor.take_accept(op) {
                            Some((fd, peer)) => Poll::Ready(Ok((fd, peer))),
                            None => Poll::Ready(Err(Error::Backend(io::Error::new(
                                io::ErrorKind::Other,
                                "accept completed without a socket",
                            )))),
                        }
                    }
                }
                None => {
                    reactor.update_op_waker(op, cx.waker());
                    Poll::Pending
                }
            },
            None => match reactor.submit(OpDesc::Accept { fd: this.fd }, cx.waker()) {
                Ok(Some(op)) => {
                    this.op = Some(op);
                    Poll::Pending
                }
                Ok(None) => Poll::Pending,
                Err(e) => Poll::Ready(Err(e)),
            },
        })
    }
}

impl Drop for CompletionAccept {
    fn drop(&mut self) {
        if let Some(op) = self.op.take() {
            try_with_loop(|reactor, _| reactor.cancel_op(op));
        }
    }
}
