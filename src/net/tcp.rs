use std::net::SocketAddr;
use std::time::Instant;

use crate::backend::Family;
use crate::error::Error;
use crate::metrics;
use crate::reactor::{Filter, try_with_loop, with_loop};
use crate::runtime::timeout_at;
use crate::sys::{self, Fd};
use crate::timer::yield_now;

use super::{
    CompletionAccept, CompletionConnect, CompletionRead, CompletionWrite, IoReady, loop_family,
};

/// A listening TCP socket bound to the loop's backend.
pub struct TcpListener {
    fd: Fd,
}

impl TcpListener {
    /// Create and bind a listening socket. Synchronous; OS failures
    /// surface directly.
    pub fn bind(addr: SocketAddr) -> Result<TcpListener, Error> {
        let fd = sys::tcp_socket(&addr).map_err(Error::from_io)?;
        let listener = TcpListener { fd };
        sys::bind(fd, &addr).map_err(Error::from_io)?;
        Ok(listener)
    }

    /// Start accepting with the given backlog.
    pub fn listen(&self, backlog: i32) -> Result<(), Error> {
        sys::listen(self.fd, backlog).map_err(Error::from_io)
    }

    /// Accept one connection. The new stream is non-blocking and served
    /// by the same loop.
    pub async fn accept(&self) -> Result<TcpStream, Error> {
        if loop_family() == Family::Completion {
            let (fd, peer) = CompletionAccept::new(self.fd).await?;
            metrics::CONNECTIONS_ACCEPTED.increment();
            tracing::debug!(%peer, "accepted connection");
            return Ok(TcpStream { fd });
        }
        loop {
            match sys::accept(self.fd) {
                Ok((fd, peer)) => {
                    metrics::CONNECTIONS_ACCEPTED.increment();
                    tracing::debug!(%peer, "accepted connection");
                    return Ok(TcpStream { fd });
                }
                Err(e) if sys::is_would_block(&e) => {
                    IoReady::new(self.fd, Filter::Read).await?;
                }
                Err(e) => return Err(Error::from_io(e)),
            }
        }
    }

    /// The address this listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        sys::local_addr(self.fd).map_err(Error::from_io)
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        try_with_loop(|reactor, _| reactor.remove_fd(self.fd));
        sys::close(self.fd);
    }
}

/// A connected TCP stream.
///
/// Reads and writes take `&self`, so one task may read while another
/// writes the same stream (wrap it in an `Rc` to share). Use the `_yield`
/// variants when two tasks share a stream in a tight loop, so neither
/// starves the other.
pub struct TcpStream {
    fd: Fd,
}

impl TcpStream {
    /// Connect to `addr` with no deadline.
    pub async fn connect(addr: SocketAddr) -> Result<TcpStream, Error> {
        Self::connect_inner(addr, None).await
    }

    /// Connect to `addr`, failing with [`Error::TimedOut`] if the
    /// connection is not established by `deadline`. On timeout the
    /// pending interest is withdrawn, so a late connect event cannot
    /// resume anything.
    pub async fn connect_deadline(addr: SocketAddr, deadline: Instant) -> Result<TcpStream, Error> {
        Self::connect_inner(addr, Some(deadline)).await
    }

    async fn connect_inner(addr: SocketAddr, deadline: Option<Instant>) -> Result<TcpStream, Error> {
        let fd = sys::tcp_socket(&addr).map_err(Error::from_io)?;
        let stream = TcpStream { fd };
        metrics::CONNECTIONS_OPENED.increment();

        if loop_family() == Family::Completion {
            let connect = CompletionConnect::new(fd, addr);
            match deadline {
                Some(dl) => match timeout_at(dl, connect).await {
                    Ok(res) => res?,
                    Err(e) => return Err(e),
                },
                None => connect.await?,
            }
            tracing::debug!(%addr, "connected");
            return Ok(stream);
        }

        if sys::connect(fd, &addr).map_err(Error::from_io)? {
            tracing::debug!(%addr, "connected");
            return Ok(stream);
        }

        loop {
            if let Some(dl) = deadline
                && Instant::now() >= dl
            {
                with_loop(|reactor, _| reactor.deregister(fd, Filter::Write));
                return Err(Error::TimedOut);
            }

            let ready = IoReady::new(fd, Filter::Write);
            match deadline {
                Some(dl) => match timeout_at(dl, ready).await {
                    Ok(res) => res?,
                    // The dropped IoReady already withdrew the interest.
                    Err(e) => return Err(e),
                },
                None => ready.await?,
            }

            if let Some(err) = sys::take_socket_error(fd).map_err(Error::from_io)? {
                return Err(Error::from_io(err));
            }
            if sys::peer_addr(fd).is_ok() {
                tracing::debug!(%addr, "connected");
                return Ok(stream);
            }
            // Woken without a socket event (shared wakeup); keep waiting.
        }
    }

    /// Read into `buf`. Resolves with at least 1 on success, 0 at EOF.
    pub async fn read_some(&self, buf: &mut [u8]) -> Result<usize, Error> {
        if loop_family() == Family::Completion {
            let n = CompletionRead::new(self.fd, buf).await?;
            metrics::BYTES_READ.add(n as u64);
            return Ok(n);
        }
        loop {
            match sys::recv(self.fd, buf) {
                Ok(n) => {
                    metrics::BYTES_READ.add(n as u64);
                    return Ok(n);
                }
                Err(e) if sys::is_would_block(&e) => {
                    IoReady::new(self.fd, Filter::Read).await?;
                }
                Err(e) => return Err(Error::from_io(e)),
            }
        }
    }

    /// Write from `buf`. Resolves with the number of bytes accepted,
    /// which may be fewer than `buf.len()`.
    pub async fn write_some(&self, buf: &[u8]) -> Result<usize, Error> {
        if loop_family() == Family::Completion {
            let n = CompletionWrite::new(self.fd, buf).await?;
            metrics::BYTES_WRITTEN.add(n as u64);
            return Ok(n);
        }
        loop {
            match sys::send(self.fd, buf) {
                Ok(n) => {
                    metrics::BYTES_WRITTEN.add(n as u64);
                    return Ok(n);
                }
                Err(e) if sys::is_would_block(&e) => {
                    IoReady::new(self.fd, Filter::Write).await?;
                }
                Err(e) => return Err(Error::from_io(e)),
            }
        }
    }

    /// [`read_some`](Self::read_some) preceded by one cooperative yield.
    pub async fn read_some_yield(&self, buf: &mut [u8]) -> Result<usize, Error> {
        yield_now().await;
        self.read_some(buf).await
    }

    /// [`write_some`](Self::write_some) preceded by one cooperative yield.
    pub async fn write_some_yield(&self, buf: &[u8]) -> Result<usize, Error> {
        yield_now().await;
        self.write_some(buf).await
    }

    /// Resolve when the peer closes or the connection dies. Consumes no
    /// bytes. A reset peer resolves normally — the caller asked whether
    /// the peer is gone, and it is.
    pub async fn monitor(&self) -> Result<(), Error> {
        loop {
            match sys::peek(self.fd) {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(e) if sys::is_would_block(&e) => {}
                Err(_) => return Ok(()),
            }
            IoReady::new(self.fd, Filter::Hup).await?;
        }
    }

    /// The local address of this stream.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        sys::local_addr(self.fd).map_err(Error::from_io)
    }

    /// The peer's address.
    pub fn peer_addr(&self) -> Result<SocketAddr, Error> {
        sys::peer_addr(self.fd).map_err(Error::from_io)
    }

    /// Close the stream, releasing the fd and withdrawing its interests.
    /// Dropping the stream does the same.
    pub fn close(self) {}
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        try_with_loop(|reactor, _| reactor.remove_fd(self.fd));
        sys::close(self.fd);
        metrics::CONNECTIONS_CLOSED.increment();
    }
}
