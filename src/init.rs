use std::io;

/// Scoped process-wide socket library initialisation.
///
/// On Windows this runs `WSAStartup` and the matching `WSACleanup` on
/// drop; elsewhere it is a no-op. Hold one at the top of `main` — the
/// library never initialises the socket layer implicitly, so creating
/// loops or sockets without a live `NetInit` fails on platforms that
/// need it. Keep exactly one alive at a time.
pub struct NetInit {
    _priv: (),
}

impl NetInit {
    #[cfg(not(windows))]
    pub fn new() -> io::Result<NetInit> {
        Ok(NetInit { _priv: () })
    }

    #[cfg(windows)]
    pub fn new() -> io::Result<NetInit> {
        use windows_sys::Win32::Networking::WinSock::{WSADATA, WSAStartup};

        let mut data: WSADATA = unsafe { std::mem::zeroed() };
        // Version 2.2.
        let ret = unsafe { WSAStartup(0x0202, &mut data) };
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }
        Ok(NetInit { _priv: () })
    }
}

#[cfg(windows)]
impl Drop for NetInit {
    fn drop(&mut self) {
        unsafe {
            windows_sys::Win32::Networking::WinSock::WSACleanup();
        }
    }
}
