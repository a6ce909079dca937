//! Thin wrappers over the platform socket calls.
//!
//! Everything the crate does to a socket funnels through here: creation
//! (always non-blocking and close-on-exec), the data-path syscalls used by
//! the readiness backends, and the sockaddr conversions shared with the
//! completion backends.

#[cfg(unix)]
pub(crate) use unix::*;
#[cfg(unix)]
pub(crate) type Fd = std::os::fd::RawFd;

#[cfg(windows)]
pub(crate) use windows::*;
#[cfg(windows)]
pub(crate) type Fd = windows_sys::Win32::Networking::WinSock::SOCKET;

#[cfg(unix)]
mod unix {
    use std::io;
    use std::mem;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

    use super::Fd;

    fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret)
        }
    }

    fn cvt_size(ret: libc::ssize_t) -> io::Result<usize> {
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }

    pub(crate) fn is_would_block(e: &io::Error) -> bool {
        matches!(e.raw_os_error(), Some(libc::EAGAIN | libc::EWOULDBLOCK))
    }

    pub(crate) fn is_in_progress(e: &io::Error) -> bool {
        e.raw_os_error() == Some(libc::EINPROGRESS)
    }

    fn set_nonblocking_cloexec(fd: Fd) -> io::Result<()> {
        unsafe {
            let flags = cvt(libc::fcntl(fd, libc::F_GETFL))?;
            cvt(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
            cvt(libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
        }
        Ok(())
    }

    fn new_socket(addr: &SocketAddr, ty: libc::c_int) -> io::Result<Fd> {
        let domain = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = cvt(unsafe { libc::socket(domain, ty, 0) })?;
        if let Err(e) = set_nonblocking_cloexec(fd) {
            close(fd);
            return Err(e);
        }
        // Deliver EPIPE as an error return, not a signal.
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        unsafe {
            let one: libc::c_int = 1;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                &one as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
        Ok(fd)
    }

    pub(crate) fn tcp_socket(addr: &SocketAddr) -> io::Result<Fd> {
        let fd = new_socket(addr, libc::SOCK_STREAM)?;
        let one: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
        Ok(fd)
    }

    pub(crate) fn udp_socket(addr: &SocketAddr) -> io::Result<Fd> {
        new_socket(addr, libc::SOCK_DGRAM)
    }

    pub(crate) fn bind(fd: Fd, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = addr_to_storage(addr);
        cvt(unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) })?;
        Ok(())
    }

    pub(crate) fn listen(fd: Fd, backlog: i32) -> io::Result<()> {
        cvt(unsafe { libc::listen(fd, backlog) })?;
        Ok(())
    }

    /// Start a non-blocking connect. `Ok(true)` means it finished
    /// immediately; `Ok(false)` means it is in progress.
    pub(crate) fn connect(fd: Fd, addr: &SocketAddr) -> io::Result<bool> {
        let (storage, len) = addr_to_storage(addr);
        let ret =
            unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if ret == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if is_in_progress(&err) {
            Ok(false)
        } else {
            Err(err)
        }
    }

    pub(crate) fn accept(fd: Fd) -> io::Result<(Fd, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        #[cfg(any(target_os = "linux", target_os = "android"))]
        let conn = cvt(unsafe {
            libc::accept4(
                fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        })?;

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let conn = {
            let conn = cvt(unsafe {
                libc::accept(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
            })?;
            if let Err(e) = set_nonblocking_cloexec(conn) {
                close(conn);
                return Err(e);
            }
            conn
        };

        let peer = storage_to_addr(&storage)
            .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
        Ok((conn, peer))
    }

    fn send_flags() -> libc::c_int {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            libc::MSG_NOSIGNAL
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            0
        }
    }

    pub(crate) fn recv(fd: Fd, buf: &mut [u8]) -> io::Result<usize> {
        cvt_size(unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) })
    }

    pub(crate) fn send(fd: Fd, buf: &[u8]) -> io::Result<usize> {
        cvt_size(unsafe {
            libc::send(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                send_flags(),
            )
        })
    }

    /// Non-destructive one-byte read, used to probe for peer close.
    pub(crate) fn peek(fd: Fd) -> io::Result<usize> {
        let mut byte = 0u8;
        cvt_size(unsafe {
            libc::recv(
                fd,
                &mut byte as *mut u8 as *mut libc::c_void,
                1,
                libc::MSG_PEEK,
            )
        })
    }

    pub(crate) fn recv_from(fd: Fd, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let n = cvt_size(unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        })?;
        let from = storage_to_addr(&storage)
            .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
        Ok((n, from))
    }

    pub(crate) fn send_to(fd: Fd, buf: &[u8], addr: &SocketAddr) -> io::Result<usize> {
        let (storage, len) = addr_to_storage(addr);
        cvt_size(unsafe {
            libc::sendto(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                send_flags(),
                &storage as *const _ as *const libc::sockaddr,
                len,
            )
        })
    }

    /// Fetch and clear the socket's pending error (`SO_ERROR`).
    pub(crate) fn take_socket_error(fd: Fd) -> io::Result<Option<io::Error>> {
        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        cvt(unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        })?;
        if err == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(err)))
        }
    }

    pub(crate) fn local_addr(fd: Fd) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        cvt(unsafe {
            libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        })?;
        storage_to_addr(&storage)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown address family"))
    }

    pub(crate) fn peer_addr(fd: Fd) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        cvt(unsafe {
            libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        })?;
        storage_to_addr(&storage)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown address family"))
    }

    pub(crate) fn close(fd: Fd) {
        unsafe {
            libc::close(fd);
        }
    }

    /// Build the C sockaddr for a Rust socket address.
    pub(crate) fn addr_to_storage(
        addr: &SocketAddr,
    ) -> (libc::sockaddr_storage, libc::socklen_t) {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        match addr {
            SocketAddr::V4(v4) => {
                let sa = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
                sa.sin_family = libc::AF_INET as libc::sa_family_t;
                sa.sin_port = v4.port().to_be();
                sa.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
                (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
            }
            SocketAddr::V6(v6) => {
                let sa = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
                sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sa.sin6_port = v6.port().to_be();
                sa.sin6_addr.s6_addr = v6.ip().octets();
                sa.sin6_scope_id = v6.scope_id();
                (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
            }
        }
    }

    /// Convert a `sockaddr_storage` filled by the kernel to a `SocketAddr`.
    pub(crate) fn storage_to_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
        match storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
                let port = u16::from_be(sa.sin_port);
                Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
            }
            libc::AF_INET6 => {
                let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
                let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
                let port = u16::from_be(sa.sin6_port);
                Some(SocketAddr::V6(SocketAddrV6::new(
                    ip,
                    port,
                    sa.sin6_flowinfo,
                    sa.sin6_scope_id,
                )))
            }
            _ => None,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn storage_round_trip_v4() {
            let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
            let (storage, _) = addr_to_storage(&addr);
            assert_eq!(storage_to_addr(&storage), Some(addr));
        }

        #[test]
        fn storage_round_trip_v6() {
            let addr: SocketAddr = "[::1]:9090".parse().unwrap();
            let (storage, _) = addr_to_storage(&addr);
            assert_eq!(storage_to_addr(&storage), Some(addr));
        }

        #[test]
        fn unknown_family_is_none() {
            let storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            assert_eq!(storage_to_addr(&storage), None);
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::io;
    use std::mem;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

    use windows_sys::Win32::Networking::WinSock as ws;

    use super::Fd;

    pub(crate) fn is_would_block(e: &io::Error) -> bool {
        e.raw_os_error() == Some(ws::WSAEWOULDBLOCK)
    }

    pub(crate) fn is_in_progress(e: &io::Error) -> bool {
        // Winsock reports a pending non-blocking connect as WOULDBLOCK.
        is_would_block(e)
    }

    fn last_error() -> io::Error {
        io::Error::from_raw_os_error(unsafe { ws::WSAGetLastError() })
    }

    fn new_socket(addr: &SocketAddr, ty: i32) -> io::Result<Fd> {
        let af = match addr {
            SocketAddr::V4(_) => ws::AF_INET,
            SocketAddr::V6(_) => ws::AF_INET6,
        };
        let sock = unsafe {
            ws::WSASocketW(
                af as i32,
                ty,
                0,
                std::ptr::null(),
                0,
                ws::WSA_FLAG_OVERLAPPED | ws::WSA_FLAG_NO_HANDLE_INHERIT,
            )
        };
        if sock == ws::INVALID_SOCKET {
            return Err(last_error());
        }
        let mut nonblocking: u32 = 1;
        if unsafe { ws::ioctlsocket(sock, ws::FIONBIO, &mut nonblocking) } != 0 {
            let e = last_error();
            close(sock);
            return Err(e);
        }
        Ok(sock)
    }

    pub(crate) fn tcp_socket(addr: &SocketAddr) -> io::Result<Fd> {
        new_socket(addr, ws::SOCK_STREAM as i32)
    }

    pub(crate) fn udp_socket(addr: &SocketAddr) -> io::Result<Fd> {
        new_socket(addr, ws::SOCK_DGRAM as i32)
    }

    pub(crate) fn bind(fd: Fd, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = addr_to_storage(addr);
        let ret = unsafe { ws::bind(fd, &storage as *const _ as *const ws::SOCKADDR, len) };
        if ret != 0 { Err(last_error()) } else { Ok(()) }
    }

    pub(crate) fn listen(fd: Fd, backlog: i32) -> io::Result<()> {
        let ret = unsafe { ws::listen(fd, backlog) };
        if ret != 0 { Err(last_error()) } else { Ok(()) }
    }

    pub(crate) fn connect(fd: Fd, addr: &SocketAddr) -> io::Result<bool> {
        let (storage, len) = addr_to_storage(addr);
        let ret = unsafe { ws::connect(fd, &storage as *const _ as *const ws::SOCKADDR, len) };
        if ret == 0 {
            return Ok(true);
        }
        let err = last_error();
        if is_in_progress(&err) { Ok(false) } else { Err(err) }
    }

    pub(crate) fn accept(fd: Fd) -> io::Result<(Fd, SocketAddr)> {
        let mut storage: ws::SOCKADDR_STORAGE = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<ws::SOCKADDR_STORAGE>() as i32;
        let conn =
            unsafe { ws::accept(fd, &mut storage as *mut _ as *mut ws::SOCKADDR, &mut len) };
        if conn == ws::INVALID_SOCKET {
            return Err(last_error());
        }
        let mut nonblocking: u32 = 1;
        unsafe { ws::ioctlsocket(conn, ws::FIONBIO, &mut nonblocking) };
        let peer = storage_to_addr(&storage)
            .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
        Ok((conn, peer))
    }

    pub(crate) fn recv(fd: Fd, buf: &mut [u8]) -> io::Result<usize> {
        let ret = unsafe { ws::recv(fd, buf.as_mut_ptr(), buf.len() as i32, 0) };
        if ret < 0 { Err(last_error()) } else { Ok(ret as usize) }
    }

    pub(crate) fn send(fd: Fd, buf: &[u8]) -> io::Result<usize> {
        let ret = unsafe { ws::send(fd, buf.as_ptr(), buf.len() as i32, 0) };
        if ret < 0 { Err(last_error()) } else { Ok(ret as usize) }
    }

    pub(crate) fn peek(fd: Fd) -> io::Result<usize> {
        let mut byte = 0u8;
        let ret = unsafe { ws::recv(fd, &mut byte, 1, ws::MSG_PEEK as i32) };
        if ret < 0 { Err(last_error()) } else { Ok(ret as usize) }
    }

    pub(crate) fn recv_from(fd: Fd, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut storage: ws::SOCKADDR_STORAGE = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<ws::SOCKADDR_STORAGE>() as i32;
        let ret = unsafe {
            ws::recvfrom(
                fd,
                buf.as_mut_ptr(),
                buf.len() as i32,
                0,
                &mut storage as *mut _ as *mut ws::SOCKADDR,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(last_error());
        }
        let from = storage_to_addr(&storage)
            .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
        Ok((ret as usize, from))
    }

    pub(crate) fn send_to(fd: Fd, buf: &[u8], addr: &SocketAddr) -> io::Result<usize> {
        let (storage, len) = addr_to_storage(addr);
        let ret = unsafe {
            ws::sendto(
                fd,
                buf.as_ptr(),
                buf.len() as i32,
                0,
                &storage as *const _ as *const ws::SOCKADDR,
                len,
            )
        };
        if ret < 0 { Err(last_error()) } else { Ok(ret as usize) }
    }

    pub(crate) fn take_socket_error(fd: Fd) -> io::Result<Option<io::Error>> {
        let mut err: i32 = 0;
        let mut len = mem::size_of::<i32>() as i32;
        let ret = unsafe {
            ws::getsockopt(
                fd,
                ws::SOL_SOCKET,
                ws::SO_ERROR,
                &mut err as *mut _ as *mut u8,
                &mut len,
            )
        };
        if ret != 0 {
            return Err(last_error());
        }
        if err == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(err)))
        }
    }

    pub(crate) fn local_addr(fd: Fd) -> io::Result<SocketAddr> {
        let mut storage: ws::SOCKADDR_STORAGE = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<ws::SOCKADDR_STORAGE>() as i32;
        let ret =
            unsafe { ws::getsockname(fd, &mut storage as *mut _ as *mut ws::SOCKADDR, &mut len) };
        if ret != 0 {
            return Err(last_error());
        }
        storage_to_addr(&storage)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown address family"))
    }

    pub(crate) fn peer_addr(fd: Fd) -> io::Result<SocketAddr> {
        let mut storage: ws::SOCKADDR_STORAGE = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<ws::SOCKADDR_STORAGE>() as i32;
        let ret =
            unsafe { ws::getpeername(fd, &mut storage as *mut _ as *mut ws::SOCKADDR, &mut len) };
        if ret != 0 {
            return Err(last_error());
        }
        storage_to_addr(&storage)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown address family"))
    }

    pub(crate) fn close(fd: Fd) {
        unsafe {
            ws::closesocket(fd);
        }
    }

    pub(crate) fn addr_to_storage(addr: &SocketAddr) -> (ws::SOCKADDR_STORAGE, i32) {
        let mut storage: ws::SOCKADDR_STORAGE = unsafe { mem::zeroed() };
        match addr {
            SocketAddr::V4(v4) => {
                let sa = unsafe { &mut *(&mut storage as *mut _ as *mut ws::SOCKADDR_IN) };
                sa.sin_family = ws::AF_INET;
                sa.sin_port = v4.port().to_be();
                sa.sin_addr.S_un.S_addr = u32::from(*v4.ip()).to_be();
                (storage, mem::size_of::<ws::SOCKADDR_IN>() as i32)
            }
            SocketAddr::V6(v6) => {
                let sa = unsafe { &mut *(&mut storage as *mut _ as *mut ws::SOCKADDR_IN6) };
                sa.sin6_family = ws::AF_INET6;
                sa.sin6_port = v6.port().to_be();
                sa.sin6_addr.u.Byte = v6.ip().octets();
                sa.Anonymous.sin6_scope_id = v6.scope_id();
                (storage, mem::size_of::<ws::SOCKADDR_IN6>() as i32)
            }
        }
    }

    pub(crate) fn storage_to_addr(storage: &ws::SOCKADDR_STORAGE) -> Option<SocketAddr> {
        match storage.ss_family {
            ws::AF_INET => {
                let sa = unsafe { &*(storage as *const _ as *const ws::SOCKADDR_IN) };
                let ip = Ipv4Addr::from(u32::from_be(unsafe { sa.sin_addr.S_un.S_addr }));
                let port = u16::from_be(sa.sin_port);
                Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
            }
            ws::AF_INET6 => {
                let sa = unsafe { &*(storage as *const _ as *const ws::SOCKADDR_IN6) };
                let ip = Ipv6Addr::from(unsafe { sa.sin6_addr.u.Byte });
                let port = u16::from_be(sa.sin6_port);
                Some(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, unsafe {
                    sa.Anonymous.sin6_scope_id
                })))
            }
            _ => None,
        }
    }
}
