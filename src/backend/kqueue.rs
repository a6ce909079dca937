use std::collections::HashMap;
use std::io;
use std::ptr;
use std::time::Duration;

use super::{Backend, BackendKind, Interest, Wakeup};
use crate::sys::Fd;

/// kqueue backend (macOS and the BSDs).
///
/// Read and write are separate kernel filters, so `arm` diffs the wanted
/// filter set against the cached one and issues `EV_ADD`/`EV_DELETE`
/// changes eagerly. `EV_EOF` on the read filter doubles as the peer-close
/// signal. The epoch rides in the `udata` word.
pub(crate) struct KqueueBackend {
    kq: Fd,
    armed: HashMap<Fd, Interest>,
    events: Vec<libc::kevent>,
}

impl KqueueBackend {
    pub(crate) fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(KqueueBackend {
            kq,
            armed: HashMap::new(),
            events: vec![unsafe { std::mem::zeroed() }; 1024],
        })
    }

    fn change(&self, fd: Fd, filter: i16, flags: u16, epoch: u32) -> io::Result<()> {
        let ev = libc::kevent {
            ident: fd as usize,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: epoch as usize as *mut libc::c_void,
        };
        let ret = unsafe { libc::kevent(self.kq, &ev, 1, ptr::null_mut(), 0, ptr::null()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // Deleting a filter that is already gone is not a failure.
            if flags & libc::EV_DELETE != 0
                && matches!(err.raw_os_error(), Some(libc::ENOENT | libc::EBADF))
            {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}

impl Backend for KqueueBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Kqueue
    }

    fn arm(&mut self, fd: Fd, interest: Interest, epoch: u32) -> io::Result<()> {
        let prev = self.armed.get(&fd).copied().unwrap_or_default();
        let want_read = interest.read || interest.hup;
        let had_read = prev.read || prev.hup;

        if want_read {
            self.change(fd, libc::EVFILT_READ, libc::EV_ADD | libc::EV_ENABLE, epoch)?;
        } else if had_read {
            self.change(fd, libc::EVFILT_READ, libc::EV_DELETE, epoch)?;
        }
        if interest.write {
            self.change(fd, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_ENABLE, epoch)?;
        } else if prev.write {
            self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE, epoch)?;
        }

        if interest.is_empty() {
            self.armed.remove(&fd);
        } else {
            self.armed.insert(fd, interest);
        }
        Ok(())
    }

    fn disarm(&mut self, fd: Fd) -> io::Result<()> {
        if let Some(prev) = self.armed.remove(&fd) {
            if prev.read || prev.hup {
                self.change(fd, libc::EVFILT_READ, libc::EV_DELETE, 0)?;
            }
            if prev.write {
                self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE, 0)?;
            }
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Duration, wakeups: &mut Vec<Wakeup>) -> io::Result<()> {
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };

        let ret = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                &ts,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(err);
        }

        for ev in &self.events[..ret as usize] {
            let fd = ev.ident as Fd;
            let epoch = ev.udata as usize as u32;
            let eof = ev.flags & libc::EV_EOF != 0;
            let err = ev.flags & libc::EV_ERROR != 0;
            match ev.filter {
                libc::EVFILT_READ => wakeups.push(Wakeup::Ready {
                    fd,
                    epoch,
                    readable: true,
                    writable: false,
                    hup: eof,
                    err,
                }),
                libc::EVFILT_WRITE => wakeups.push(Wakeup::Ready {
                    fd,
                    epoch,
                    readable: false,
                    writable: true,
                    hup: eof,
                    err,
                }),
                _ => {}
            }
        }
        Ok(())
    }
}

impl Drop for KqueueBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}
