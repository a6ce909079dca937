use std::net::SocketAddr;

use crate::error::Error;
use crate::reactor::{Filter, try_with_loop};
use crate::sys::{self, Fd};

use super::IoReady;

/// A UDP socket. Datagram I/O always takes the readiness path; the
/// io_uring backend serves it through one-shot poll submissions.
pub struct UdpSocket {
    fd: Fd,
}

impl UdpSocket {
    /// Create and bind a UDP socket. Bind to port 0 for an ephemeral
    /// local port.
    pub fn bind(addr: SocketAddr) -> Result<UdpSocket, Error> {
        let fd = sys::udp_socket(&addr).map_err(Error::from_io)?;
        let socket = UdpSocket { fd };
        sys::bind(fd, &addr).map_err(Error::from_io)?;
        Ok(socket)
    }

    /// Send one datagram to `addr`.
    pub async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize, Error> {
        loop {
            match sys::send_to(self.fd, buf, &addr) {
                Ok(n) => return Ok(n),
                Err(e) if sys::is_would_block(&e) => {
                    IoReady::new(self.fd, Filter::Write).await?;
                }
                Err(e) => return Err(Error::from_io(e)),
            }
        }
    }

    /// Receive one datagram, returning its length and origin. A datagram
    /// longer than `buf` is truncated.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), Error> {
        loop {
            match sys::recv_from(self.fd, buf) {
                Ok(ok) => return Ok(ok),
                Err(e) if sys::is_would_block(&e) => {
                    IoReady::new(self.fd, Filter::Read).await?;
                }
                Err(e) => return Err(Error::from_io(e)),
            }
        }
    }

    /// The address this socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        sys::local_addr(self.fd).map_err(Error::from_io)
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        try_with_loop(|reactor, _| reactor.remove_fd(self.fd));
        sys::close(self.fd);
    }
}
