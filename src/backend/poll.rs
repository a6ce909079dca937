use std::collections::HashMap;
use std::io;
use std::time::Duration;

use super::{Backend, BackendKind, Interest, Wakeup};
use crate::sys::Fd;

/// `poll(2)` backend. Like select, the pollfd array is rebuilt from the
/// armed map each wait; unlike select there is no FD_SETSIZE ceiling, and
/// `POLLRDHUP` (where available) gives a real peer-close signal.
pub(crate) struct PollBackend {
    armed: HashMap<Fd, (Interest, u32)>,
    pollfds: Vec<libc::pollfd>,
    index: Vec<(Fd, u32)>,
}

impl PollBackend {
    pub(crate) fn new() -> Self {
        PollBackend {
            armed: HashMap::new(),
            pollfds: Vec::new(),
            index: Vec::new(),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const POLL_RDHUP: libc::c_short = libc::POLLRDHUP;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const POLL_RDHUP: libc::c_short = 0;

impl Backend for PollBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Poll
    }

    fn arm(&mut self, fd: Fd, interest: Interest, epoch: u32) -> io::Result<()> {
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
        self.pollfds.clear();
        self.index.clear();
        for (&fd, &(interest, epoch)) in &self.armed {
            let mut events: libc::c_short = 0;
            if interest.read {
                events |= libc::POLLIN;
            }
            if interest.write {
                events |= libc::POLLOUT;
            }
            if interest.hup {
                // Fall back to readability where POLLRDHUP is missing;
                // the waiter confirms the close with a peek.
                events |= if POLL_RDHUP != 0 { POLL_RDHUP } else { libc::POLLIN };
            }
            self.pollfds.push(libc::pollfd {
                fd,
                events,
                revents: 0,
            });
            self.index.push((fd, epoch));
        }

        // Round up so timers never fire early.
        let millis = timeout
            .as_nanos()
            .div_ceil(1_000_000)
            .min(i32::MAX as u128) as i32;

        let ret = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                millis,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(err);
        }

        for (pollfd, &(fd, epoch)) in self.pollfds.iter().zip(&self.index) {
            let revents = pollfd.revents;
            if revents == 0 {
                continue;
            }
            wakeups.push(Wakeup::Ready {
                fd,
                epoch,
                readable: revents & libc::POLLIN != 0,
                writable: revents & libc::POLLOUT != 0,
                hup: revents & (libc::POLLHUP | POLL_RDHUP) != 0,
                err: revents & (libc::POLLERR | libc::POLLNVAL) != 0,
            });
        }
        Ok(())
    }
}
