use std::collections::HashMap;
use std::io;
use std::time::Duration;

use super::{Backend, BackendKind, Interest, Wakeup};
use crate::sys::Fd;

/// Level-triggered epoll backend (Linux).
///
/// The armed mask is cached per fd so `arm` can pick between
/// `EPOLL_CTL_ADD` and `EPOLL_CTL_MOD`; the fired directions are withdrawn
/// by the reactor re-arming after delivery, so a ready-but-unclaimed fd
/// never spins the loop. Each event carries `(fd, epoch)` packed into the
/// epoll data word.
pub(crate) struct EpollBackend {
    epfd: Fd,
    armed: HashMap<Fd, Interest>,
    events: Vec<libc::epoll_event>,
}

fn pack(fd: Fd, epoch: u32) -> u64 {
    ((epoch as u64) << 32) | fd as u32 as u64
}

fn unpack(data: u64) -> (Fd, u32) {
    (data as u32 as Fd, (data >> 32) as u32)
}

impl EpollBackend {
    pub(crate) fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollBackend {
            epfd,
            armed: HashMap::new(),
            events: vec![unsafe { std::mem::zeroed() }; 1024],
        })
    }

    fn ctl(&self, op: libc::c_int, fd: Fd, interest: Interest, epoch: u32) -> io::Result<()> {
        let mut events: u32 = 0;
        if interest.read {
            events |= libc::EPOLLIN as u32;
        }
        if interest.write {
            events |= libc::EPOLLOUT as u32;
        }
        if interest.hup {
            events |= libc::EPOLLRDHUP as u32;
        }
        let mut ev = libc::epoll_event {
            events,
            u64: pack(fd, epoch),
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl Backend for EpollBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Epoll
    }

    fn arm(&mut self, fd: Fd, interest: Interest, epoch: u32) -> io::Result<()> {
        if interest.is_empty() {
            return self.disarm(fd);
        }
        if self.armed.contains_key(&fd) {
            match self.ctl(libc::EPOLL_CTL_MOD, fd, interest, epoch) {
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                    self.ctl(libc::EPOLL_CTL_ADD, fd, interest, epoch)?
                }
                other => other?,
            }
        } else {
            match self.ctl(libc::EPOLL_CTL_ADD, fd, interest, epoch) {
                Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                    self.ctl(libc::EPOLL_CTL_MOD, fd, interest, epoch)?
                }
                other => other?,
            }
        }
        self.armed.insert(fd, interest);
        Ok(())
    }

    fn disarm(&mut self, fd: Fd) -> io::Result<()> {
        if self.armed.remove(&fd).is_none() {
            return Ok(());
        }
        let ret = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // The kernel drops closed fds from the set on its own.
            if !matches!(err.raw_os_error(), Some(libc::ENOENT | libc::EBADF)) {
                return Err(err);
            }
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Duration, wakeups: &mut Vec<Wakeup>) -> io::Result<()> {
        // Round up so timers never fire early.
        let millis = timeout
            .as_nanos()
            .div_ceil(1_000_000)
            .min(i32::MAX as u128) as i32;

        let ret = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
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

        for ev in &self.events[..ret as usize] {
            let (fd, epoch) = unpack(ev.u64);
            let bits = ev.events;
            wakeups.push(Wakeup::Ready {
                fd,
                epoch,
                readable: bits & libc::EPOLLIN as u32 != 0,
                writable: bits & libc::EPOLLOUT as u32 != 0,
                hup: bits & (libc::EPOLLRDHUP as u32 | libc::EPOLLHUP as u32) != 0,
                err: bits & libc::EPOLLERR as u32 != 0,
            });
        }
        Ok(())
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
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
    fn data_word_round_trip() {
        let (fd, epoch) = unpack(pack(1234, 0xFEED_F00D));
        assert_eq!(fd, 1234);
        assert_eq!(epoch, 0xFEED_F00D);
    }

    #[test]
    fn readable_event_carries_epoch() {
        let (r, w) = pipe();
        let mut backend = EpollBackend::new().unwrap();
        backend
            .arm(
                r,
                Interest {
                    read: true,
                    ..Default::default()
                },
                99,
            )
            .unwrap();

        assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) }, 1);

        let mut wakeups = Vec::new();
        backend
            .wait(Duration::from_millis(100), &mut wakeups)
            .unwrap();
        assert_eq!(wakeups.len(), 1);
        assert!(matches!(
            wakeups[0],
            Wakeup::Ready {
                epoch: 99,
                readable: true,
                ..
            }
        ));

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn rearm_switches_direction() {
        let (r, w) = pipe();
        let mut backend = EpollBackend::new().unwrap();
        backend
            .arm(
                w,
                Interest {
                    read: true,
                    ..Default::default()
                },
                0,
            )
            .unwrap();
        // Pipe write end is never readable; nothing fires.
        let mut wakeups = Vec::new();
        backend
            .wait(Duration::from_millis(10), &mut wakeups)
            .unwrap();
        assert!(wakeups.is_empty());

        backend
            .arm(
                w,
                Interest {
                    write: true,
                    ..Default::default()
                },
                1,
            )
            .unwrap();
        backend
            .wait(Duration::from_millis(100), &mut wakeups)
            .unwrap();
        assert_eq!(wakeups.len(), 1);
        assert!(matches!(
            wakeups[0],
            Wakeup::Ready {
                epoch: 1,
                writable: true,
                ..
            }
        ));

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
