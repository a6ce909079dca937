use std::collections::HashMap;
use std::io;
use std::mem;
use std::time::Duration;

use super::{Backend, BackendKind, Interest, Wakeup};
use crate::sys::Fd;

/// `select(2)` backend. The fd sets are rebuilt from the armed map on
/// every wait, which keeps arm/disarm trivial at the cost of O(n) per
/// step. Descriptors at or above `FD_SETSIZE` cannot be watched.
pub(crate) struct SelectBackend {
    armed: HashMap<Fd, (Interest, u32)>,
}

impl SelectBackend {
    pub(crate) fn new() -> Self {
        SelectBackend {
            armed: HashMap::new(),
        }
    }
}

impl Backend for SelectBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Select
    }

    fn arm(&mut self, fd: Fd, interest: Interest, epoch: u32) -> io::Result<()> {
        if fd as usize >= libc::FD_SETSIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "fd exceeds FD_SETSIZE",
            ));
        }
        if interest.is_empty() {
            self.armed.remove(&fd);
        } else {
            self.armed.insert(fd, (interest, epoch));
        }
        Ok(())
    }

    fn disarm(&mut self, fd: Fd) -> io::Result<()> {
        self.armed.remove(&fd);
        Ok(())
    }

    fn wait(&mut self, timeout: Duration, wakeups: &mut Vec<Wakeup>) -> io::Result<()> {
        let mut rset: libc::fd_set = unsafe { mem::zeroed() };
        let mut wset: libc::fd_set = unsafe { mem::zeroed() };
        let mut eset: libc::fd_set = unsafe { mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut rset);
            libc::FD_ZERO(&mut wset);
            libc::FD_ZERO(&mut eset);
        }

        let mut max_fd: Fd = -1;
        for (&fd, &(interest, _)) in &self.armed {
            unsafe {
                // Peer-close interest rides on the read set; the waiter
                // verifies the close with a peek before resolving.
                if interest.read || interest.hup {
                    libc::FD_SET(fd, &mut rset);
                }
                if interest.write {
                    libc::FD_SET(fd, &mut wset);
                }
                libc::FD_SET(fd, &mut eset);
            }
            max_fd = max_fd.max(fd);
        }

        // Round sub-microsecond remainders up so timers never fire early.
        let micros = timeout.as_micros().min(i64::MAX as u128) as i64
            + i64::from(timeout.subsec_nanos() % 1_000 != 0);
        let mut tv = libc::timeval {
            tv_sec: (micros / 1_000_000) as libc::time_t,
            tv_usec: (micros % 1_000_000) as libc::suseconds_t,
        };

        let ret = unsafe {
            libc::select(
                max_fd + 1,
                &mut rset,
                &mut wset,
                &mut eset,
                &mut tv,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(err);
        }
        if ret == 0 {
            return Ok(());
        }

        for (&fd, &(interest, epoch)) in &self.armed {
            let readable = unsafe { libc::FD_ISSET(fd, &rset) };
            let writable = unsafe { libc::FD_ISSET(fd, &wset) };
            let err = unsafe { libc::FD_ISSET(fd, &eset) };
            if readable || writable || err {
                wakeups.push(Wakeup::Ready {
                    fd,
                    epoch,
                    readable: readable && (interest.read || interest.hup),
                    writable,
                    hup: false,
                    err,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (Fd, Fd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn reports_readable_pipe() {
        let (r, w) = pipe();
        let mut backend = SelectBackend::new();
        backend
            .arm(
                r,
                Interest {
                    read: true,
                    ..Default::default()
                },
                7,
            )
            .unwrap();

        assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) }, 1);

        let mut wakeups = Vec::new();
        backend
            .wait(Duration::from_millis(100), &mut wakeups)
            .unwrap();
        assert_eq!(wakeups.len(), 1);
        match wakeups[0] {
            Wakeup::Ready {
                fd,
                epoch,
                readable,
                ..
            } => {
                assert_eq!(fd, r);
                assert_eq!(epoch, 7);
                assert!(readable);
            }
            _ => panic!("unexpected wakeup"),
        }

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn times_out_with_nothing_ready() {
        let (r, w) = pipe();
        let mut backend = SelectBackend::new();
        backend
            .arm(
                r,
                Interest {
                    read: true,
                    ..Default::default()
                },
                0,
            )
            .unwrap();

        let mut wakeups = Vec::new();
        backend
            .wait(Duration::from_millis(10), &mut wakeups)
            .unwrap();
        assert!(wakeups.is_empty());

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn disarm_silences_fd() {
        let (r, w) = pipe();
        let mut backend = SelectBackend::new();
        backend
            .arm(
                r,
                Interest {
                    read: true,
                    ..Default::default()
                },
                0,
            )
            .unwrap();
        backend.disarm(r).unwrap();

        assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) }, 1);

        let mut wakeups = Vec::new();
        backend
            .wait(Duration::from_millis(10), &mut wakeups)
            .unwrap();
        assert!(wakeups.is_empty());

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
