//! io_uring completion backend (Linux).
//!
//! Operations are whole submissions: the backend owns every buffer the
//! kernel touches, so a task can be cancelled while its read is in flight
//! without freeing memory out from under the kernel. Reads copy out on
//! completion, writes and connects copy in at submission.
//!
//! Readiness-style consumers (UDP, peer-close monitoring, deadline
//! connects on the readiness path) are served by one-shot `PollAdd`
//! submissions, so `arm`/`disarm` work here exactly as they do on the
//! readiness backends.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use io_uring::{IoUring, opcode, types};

use super::{Backend, BackendKind, Family, Interest, OpDesc, OpId, SubmitError, Wakeup};
use crate::metrics;
use crate::sys::{self, Fd};

pub(crate) const DEFAULT_ENTRIES: u32 = 256;

/// Operation tags encoded in the upper 8 bits of user_data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum OpTag {
    Recv = 0,
    Send = 1,
    Connect = 2,
    Accept = 3,
    Poll = 4,
    /// `AsyncCancel` itself; its CQE is informational only.
    Cancel = 5,
}

impl OpTag {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(OpTag::Recv),
            1 => Some(OpTag::Send),
            2 => Some(OpTag::Connect),
            3 => Some(OpTag::Accept),
            4 => Some(OpTag::Poll),
            5 => Some(OpTag::Cancel),
            _ => None,
        }
    }
}

/// Encoded user_data for CQE identification.
///
/// Layout (64-bit):
/// ```text
/// Bits 63..56: OpTag (8 bits)
/// Bits 47..32: slot generation (16 bits)
/// Bits 31..0:  slot index (32 bits)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UserData(u64);

impl UserData {
    const TAG_SHIFT: u64 = 56;
    const GEN_SHIFT: u64 = 32;

    fn encode(tag: OpTag, slot: u32, generation: u16) -> Self {
        UserData(
            ((tag as u64) << Self::TAG_SHIFT)
                | ((generation as u64) << Self::GEN_SHIFT)
                | slot as u64,
        )
    }

    fn tag(self) -> Option<OpTag> {
        OpTag::from_u8((self.0 >> Self::TAG_SHIFT) as u8)
    }

    fn generation(self) -> u16 {
        (self.0 >> Self::GEN_SHIFT) as u16
    }

    fn slot(self) -> u32 {
        self.0 as u32
    }
}

#[derive(Clone, Copy)]
enum SlotState {
    InFlight,
    Done(i32),
    /// Cancelled by the owner; free the slot when the terminal CQE lands.
    Cancelled,
}

struct AddrStorage {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

struct OpSlot {
    generation: u16,
    state: SlotState,
    tag: OpTag,
    fd: Fd,
    /// Epoch of the interest this Poll op was armed for.
    epoch: u32,
    /// Poll mask this Poll op was armed with.
    poll_flags: u32,
    /// Kernel-visible buffer for Recv (filled) and Send (copied in).
    buf: Vec<u8>,
    /// Stable sockaddr for Connect / Accept; boxed so slab growth never
    /// moves it while the kernel holds the pointer.
    addr: Option<Box<AddrStorage>>,
}

pub(crate) struct UringBackend {
    ring: IoUring,
    slots: Vec<OpSlot>,
    free: Vec<u32>,
    /// In-flight PollAdd per fd, emulating readiness interests.
    polls: HashMap<Fd, OpId>,
}

impl UringBackend {
    pub(crate) fn new(entries: u32) -> io::Result<Self> {
        let ring = IoUring::new(entries)?;
        Ok(UringBackend {
            ring,
            slots: Vec::new(),
            free: Vec::new(),
            polls: HashMap::new(),
        })
    }

    /// Whether a ring can be created in this process (seccomp and kernel
    /// permitting).
    pub(crate) fn probe() -> bool {
        IoUring::new(8).is_ok()
    }

    fn alloc_slot(&mut self, tag: OpTag, fd: Fd) -> OpId {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(OpSlot {
                    generation: 0,
                    state: SlotState::InFlight,
                    tag,
                    fd,
                    epoch: 0,
                    poll_flags: 0,
                    buf: Vec::new(),
                    addr: None,
                });
                return OpId {
                    slot: self.slots.len() as u32 - 1,
                    generation: 0,
                };
            }
        };
        let entry = &mut self.slots[slot as usize];
        entry.state = SlotState::InFlight;
        entry.tag = tag;
        entry.fd = fd;
        entry.epoch = 0;
        entry.poll_flags = 0;
        entry.addr = None;
        OpId {
            slot,
            generation: entry.generation,
        }
    }

    fn free_slot(&mut self, slot: u32) {
        let entry = &mut self.slots[slot as usize];
        entry.generation = entry.generation.wrapping_add(1);
        entry.buf.clear();
        entry.addr = None;
        self.free.push(slot);
    }

    fn slot_matches(&self, op: OpId) -> bool {
        self.slots
            .get(op.slot as usize)
            .is_some_and(|s| s.generation == op.generation)
    }

    /// Queue one SQE, flushing the submission ring once if it is full.
    fn push_sqe(&mut self, entry: io_uring::squeue::Entry) -> Result<(), SubmitError> {
        let pushed = unsafe { self.ring.submission().push(&entry).is_ok() };
        if pushed {
            return Ok(());
        }
        metrics::SUBMIT_RETRIES.increment();
        self.ring.submit().map_err(SubmitError::Os)?;
        let pushed = unsafe { self.ring.submission().push(&entry).is_ok() };
        if pushed {
            Ok(())
        } else {
            Err(SubmitError::QueueFull)
        }
    }

    fn push_cancel_for(&mut self, target: UserData) {
        let sqe = opcode::AsyncCancel::new(target.0)
            .build()
            .user_data(UserData::encode(OpTag::Cancel, u32::MAX, 0).0);
        // Best effort: if even the cancel cannot be queued the completion
        // arrives normally and is discarded by the slot state.
        let _ = self.push_sqe(sqe);
    }

    fn process_cqe(&mut self, user_data: u64, result: i32, wakeups: &mut Vec<Wakeup>) {
        let ud = UserData(user_data);
        let Some(tag) = ud.tag() else {
            return;
        };
        if tag == OpTag::Cancel {
            return;
        }
        let slot = ud.slot();
        let Some((fd, epoch, cancelled)) = self
            .slots
            .get(slot as usize)
            .filter(|e| e.generation == ud.generation())
            .map(|e| (e.fd, e.epoch, matches!(e.state, SlotState::Cancelled)))
        else {
            // Stale completion for a recycled slot.
            return;
        };

        match tag {
            OpTag::Poll => {
                let this_op = OpId {
                    slot,
                    generation: ud.generation(),
                };
                if self.polls.get(&fd) == Some(&this_op) {
                    self.polls.remove(&fd);
                }
                self.free_slot(slot);
                if cancelled {
                    return;
                }
                if result < 0 {
                    if result == -libc::ECANCELED {
                        return;
                    }
                    wakeups.push(Wakeup::Ready {
                        fd,
                        epoch,
                        readable: false,
                        writable: false,
                        hup: false,
                        err: true,
                    });
                    return;
                }
                let revents = result as u32;
                wakeups.push(Wakeup::Ready {
                    fd,
                    epoch,
                    readable: revents & libc::POLLIN as u32 != 0,
                    writable: revents & libc::POLLOUT as u32 != 0,
                    hup: revents & (libc::POLLHUP as u32 | libc::POLLRDHUP as u32) != 0,
                    err: revents & (libc::POLLERR as u32 | libc::POLLNVAL as u32) != 0,
                });
            }
            OpTag::Recv | OpTag::Send | OpTag::Connect | OpTag::Accept => {
                if cancelled {
                    // An accept that raced its own cancellation may still
                    // have produced a socket nobody will ever see.
                    if tag == OpTag::Accept && result >= 0 {
                        sys::close(result as Fd);
                    }
                    self.free_slot(slot);
                    return;
                }
                self.slots[slot as usize].state = SlotState::Done(result);
                wakeups.push(Wakeup::Complete {
                    op: OpId {
                        slot,
                        generation: ud.generation(),
                    },
                    result,
                });
            }
            OpTag::Cancel => unreachable!(),
        }
    }
}

impl Backend for UringBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Uring
    }

    fn family(&self) -> Family {
        Family::Completion
    }

    fn arm(&mut self, fd: Fd, interest: Interest, epoch: u32) -> io::Result<()> {
        let mut flags: u32 = 0;
        if interest.read {
            flags |= libc::POLLIN as u32;
        }
        if interest.write {
            flags |= libc::POLLOUT as u32;
        }
        if interest.hup {
            flags |= libc::POLLRDHUP as u32;
        }

        if let Some(&op) = self.polls.get(&fd) {
            let entry = &self.slots[op.slot as usize];
            if entry.epoch == epoch && entry.poll_flags == flags && !interest.is_empty() {
                // The in-flight poll already covers this interest.
                return Ok(());
            }
            self.cancel(op);
            self.polls.remove(&fd);
        }
        if interest.is_empty() {
            return Ok(());
        }

        let op = self.alloc_slot(OpTag::Poll, fd);
        self.slots[op.slot as usize].epoch = epoch;
        self.slots[op.slot as usize].poll_flags = flags;
        let sqe = opcode::PollAdd::new(types::Fd(fd), flags)
            .build()
            .user_data(UserData::encode(OpTag::Poll, op.slot, op.generation).0);
        match self.push_sqe(sqe) {
            Ok(()) => {
                self.polls.insert(fd, op);
                Ok(())
            }
            Err(SubmitError::Os(e)) => {
                self.free_slot(op.slot);
                Err(e)
            }
            Err(_) => {
                self.free_slot(op.slot);
                Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "submission queue full",
                ))
            }
        }
    }

    fn disarm(&mut self, fd: Fd) -> io::Result<()> {
        if let Some(&op) = self.polls.get(&fd) {
            self.cancel(op);
            self.polls.remove(&fd);
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Duration, wakeups: &mut Vec<Wakeup>) -> io::Result<()> {
        if timeout.is_zero() {
            if let Err(e) = self.ring.submit() {
                if !matches!(e.raw_os_error(), Some(libc::EINTR | libc::EBUSY)) {
                    return Err(e);
                }
            }
        } else {
            let ts = types::Timespec::new()
                .sec(timeout.as_secs())
                .nsec(timeout.subsec_nanos());
            let args = types::SubmitArgs::new().timespec(&ts);
            if let Err(e) = self.ring.submitter().submit_with_args(1, &args) {
                if !matches!(
                    e.raw_os_error(),
                    Some(libc::ETIME | libc::EINTR | libc::EBUSY)
                ) {
                    return Err(e);
                }
            }
        }

        let entries: Vec<(u64, i32)> = self
            .ring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect();
        for (user_data, result) in entries {
            self.process_cqe(user_data, result, wakeups);
        }
        Ok(())
    }

    fn submit(&mut self, desc: OpDesc<'_>) -> Result<OpId, SubmitError> {
        let (op, sqe) = match desc {
            OpDesc::Recv { fd, len } => {
                let op = self.alloc_slot(OpTag::Recv, fd);
                let entry = &mut self.slots[op.slot as usize];
                entry.buf.clear();
                entry.buf.resize(len, 0);
                let sqe = opcode::Recv::new(
                    types::Fd(fd),
                    entry.buf.as_mut_ptr(),
                    entry.buf.len() as u32,
                )
                .build()
                .user_data(UserData::encode(OpTag::Recv, op.slot, op.generation).0);
                (op, sqe)
            }
            OpDesc::Send { fd, data } => {
                let op = self.alloc_slot(OpTag::Send, fd);
                let entry = &mut self.slots[op.slot as usize];
                entry.buf.clear();
                entry.buf.extend_from_slice(data);
                let sqe = opcode::Send::new(
                    types::Fd(fd),
                    entry.buf.as_ptr(),
                    entry.buf.len() as u32,
                )
                .build()
                .user_data(UserData::encode(OpTag::Send, op.slot, op.generation).0);
                (op, sqe)
            }
            OpDesc::Connect { fd, addr } => {
                let op = self.alloc_slot(OpTag::Connect, fd);
                let (storage, len) = sys::addr_to_storage(&addr);
                // Raw pointers into the box stay valid when the box moves
                // into the slot.
                let boxed = Box::new(AddrStorage { storage, len });
                let addr_ptr = &boxed.storage as *const _ as *const libc::sockaddr;
                let addr_len = boxed.len;
                self.slots[op.slot as usize].addr = Some(boxed);
                let sqe = opcode::Connect::new(types::Fd(fd), addr_ptr, addr_len)
                    .build()
                    .user_data(UserData::encode(OpTag::Connect, op.slot, op.generation).0);
                (op, sqe)
            }
            OpDesc::Accept { fd } => {
                let op = self.alloc_slot(OpTag::Accept, fd);
                let mut boxed = Box::new(AddrStorage {
                    storage: unsafe { std::mem::zeroed() },
                    len: std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
                });
                let addr_ptr = &mut boxed.storage as *mut _ as *mut libc::sockaddr;
                let len_ptr = &mut boxed.len as *mut libc::socklen_t;
                self.slots[op.slot as usize].addr = Some(boxed);
                let sqe = opcode::Accept::new(types::Fd(fd), addr_ptr, len_ptr)
                    .flags(libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK)
                    .build()
                    .user_data(UserData::encode(OpTag::Accept, op.slot, op.generation).0);
                (op, sqe)
            }
        };

        match self.push_sqe(sqe) {
            Ok(()) => Ok(op),
            Err(e) => {
                self.free_slot(op.slot);
                Err(e)
            }
        }
    }

    fn cancel(&mut self, op: OpId) {
        if !self.slot_matches(op) {
            return;
        }
        let (state, tag, generation) = {
            let entry = &self.slots[op.slot as usize];
            (entry.state, entry.tag, entry.generation)
        };
        match state {
            SlotState::Done(result) => {
                if tag == OpTag::Accept && result >= 0 {
                    sys::close(result as Fd);
                }
                self.free_slot(op.slot);
            }
            SlotState::Cancelled => {}
            SlotState::InFlight => {
                self.slots[op.slot as usize].state = SlotState::Cancelled;
                self.push_cancel_for(UserData::encode(tag, op.slot, generation));
            }
        }
    }

    fn op_result(&mut self, op: OpId) -> Option<i32> {
        if !self.slot_matches(op) {
            return None;
        }
        match self.slots[op.slot as usize].state {
            SlotState::Done(result) => Some(result),
            _ => None,
        }
    }

    fn complete_read(&mut self, op: OpId, buf: &mut [u8]) -> usize {
        if !self.slot_matches(op) {
            return 0;
        }
        let n = match self.slots[op.slot as usize].state {
            SlotState::Done(result) if result > 0 => {
                let n = (result as usize).min(buf.len());
                buf[..n].copy_from_slice(&self.slots[op.slot as usize].buf[..n]);
                n
            }
            _ => 0,
        };
        self.free_slot(op.slot);
        n
    }

    fn take_accept(&mut self, op: OpId) -> Option<(Fd, SocketAddr)> {
        if !self.slot_matches(op) {
            return None;
        }
        let result = match self.slots[op.slot as usize].state {
            SlotState::Done(result) if result >= 0 => result,
            _ => {
                self.free_slot(op.slot);
                return None;
            }
        };
        let peer = self.slots[op.slot as usize]
            .addr
            .as_ref()
            .and_then(|a| sys::storage_to_addr(&a.storage))
            .unwrap_or_else(|| SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, 0)));
        self.free_slot(op.slot);
        Some((result as Fd, peer))
    }

    fn release(&mut self, op: OpId) {
        self.cancel(op);
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

    fn ring_or_skip(entries: u32) -> Option<UringBackend> {
        match UringBackend::new(entries) {
            Ok(b) => Some(b),
            Err(e) => {
                eprintln!("skipping uring test: {e}");
                None
            }
        }
    }

    #[test]
    fn user_data_round_trip() {
        for tag in [
            OpTag::Recv,
            OpTag::Send,
            OpTag::Connect,
            OpTag::Accept,
            OpTag::Poll,
            OpTag::Cancel,
        ] {
            let ud = UserData::encode(tag, 0xCAFE_BABE, 0xBEEF);
            assert_eq!(ud.tag(), Some(tag));
            assert_eq!(ud.slot(), 0xCAFE_BABE);
            assert_eq!(ud.generation(), 0xBEEF);
        }
    }

    #[test]
    fn invalid_tag_is_none() {
        assert_eq!(UserData(0xFFu64 << 56).tag(), None);
    }

    #[test]
    fn read_completes_through_pipe() {
        let Some(mut backend) = ring_or_skip(8) else {
            return;
        };
        let (r, w) = pipe();
        assert_eq!(unsafe { libc::write(w, b"e".as_ptr() as *const _, 1) }, 1);

        let op = backend.submit(OpDesc::Recv { fd: r, len: 8 }).unwrap();
        let mut wakeups = Vec::new();
        backend
            .wait(Duration::from_millis(500), &mut wakeups)
            .unwrap();
        assert!(matches!(
            wakeups.as_slice(),
            [Wakeup::Complete { result: 1, .. }]
        ));
        assert_eq!(backend.op_result(op), Some(1));

        let mut buf = [0u8; 8];
        assert_eq!(backend.complete_read(op, &mut buf), 1);
        assert_eq!(buf[0], b'e');

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn write_completes_through_pipe() {
        let Some(mut backend) = ring_or_skip(8) else {
            return;
        };
        let (r, w) = pipe();

        let op = backend
            .submit(OpDesc::Send { fd: w, data: b"k" })
            .unwrap();
        let mut wakeups = Vec::new();
        backend
            .wait(Duration::from_millis(500), &mut wakeups)
            .unwrap();
        assert_eq!(backend.op_result(op), Some(1));
        backend.release(op);

        let mut buf = [0u8; 1];
        assert_eq!(unsafe { libc::read(r, buf.as_mut_ptr() as *mut _, 1) }, 1);
        assert_eq!(buf[0], b'k');

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn submissions_beyond_queue_capacity_flush() {
        // A two-entry ring cannot hold four reads at once; push_sqe must
        // flush mid-submission and every completion must still arrive.
        let Some(mut backend) = ring_or_skip(2) else {
            return;
        };
        let (r, w) = pipe();
        for _ in 0..4 {
            assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) }, 1);
        }

        let mut ops = Vec::new();
        for _ in 0..4 {
            ops.push(backend.submit(OpDesc::Recv { fd: r, len: 1 }).unwrap());
        }

        let mut wakeups = Vec::new();
        while wakeups.len() < 4 {
            backend
                .wait(Duration::from_millis(500), &mut wakeups)
                .unwrap();
        }
        for op in ops {
            let mut buf = [0u8; 1];
            assert_eq!(backend.complete_read(op, &mut buf), 1);
        }

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn cancelled_read_is_discarded() {
        let Some(mut backend) = ring_or_skip(8) else {
            return;
        };
        let (r, w) = pipe();

        let op = backend.submit(OpDesc::Recv { fd: r, len: 1 }).unwrap();
        backend.cancel(op);

        // Data written after the cancel must not be consumed by the dead
        // operation's completion.
        assert_eq!(unsafe { libc::write(w, b"z".as_ptr() as *const _, 1) }, 1);
        let mut wakeups = Vec::new();
        backend
            .wait(Duration::from_millis(200), &mut wakeups)
            .unwrap();
        assert!(wakeups
            .iter()
            .all(|w| !matches!(w, Wakeup::Complete { .. })));
        assert_eq!(backend.op_result(op), None);

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn poll_add_reports_readiness() {
        let Some(mut backend) = ring_or_skip(8) else {
            return;
        };
        let (r, w) = pipe();
        backend
            .arm(
                r,
                Interest {
                    read: true,
                    ..Default::default()
                },
                11,
            )
            .unwrap();

        assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) }, 1);

        let mut wakeups = Vec::new();
        backend
            .wait(Duration::from_millis(500), &mut wakeups)
            .unwrap();
        assert!(matches!(
            wakeups.as_slice(),
            [Wakeup::Ready {
                epoch: 11,
                readable: true,
                ..
            }]
        ));

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
