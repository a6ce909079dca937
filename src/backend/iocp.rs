//! I/O completion port backend (Windows).
//!
//! The completion-family counterpart of [`uring`](super::uring): whole
//! operations are posted with backend-owned buffers and an `OVERLAPPED`
//! header that carries the slot identity back through the port. Readiness
//! emulation (`arm`) is not provided — peer-close monitoring and UDP need
//! a readiness-capable backend.

use std::collections::HashSet;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::ptr;
use std::time::Duration;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::Networking::WinSock as ws;
use windows_sys::Win32::System::IO::{
    CancelIoEx, CreateIoCompletionPort, GetQueuedCompletionStatusEx, OVERLAPPED,
    OVERLAPPED_ENTRY,
};

use super::{Backend, BackendKind, Family, Interest, OpDesc, OpId, SubmitError, Wakeup};
use crate::sys::{self, Fd};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpTag {
    Recv,
    Send,
    Connect,
    Accept,
}

#[derive(Clone, Copy)]
enum SlotState {
    InFlight,
    Done(i32),
    Cancelled,
}

/// The OVERLAPPED a kernel completion points back at, plus the slot
/// identity needed to find its owner. Boxed so its address is stable for
/// the lifetime of the operation.
#[repr(C)]
struct OverlappedHeader {
    overlapped: OVERLAPPED,
    slot: u32,
    generation: u16,
}

struct OpSlot {
    generation: u16,
    state: SlotState,
    tag: OpTag,
    fd: Fd,
    header: Box<OverlappedHeader>,
    buf: Vec<u8>,
    /// Socket pre-created for AcceptEx.
    accept_sock: Option<Fd>,
    /// AcceptEx address buffer.
    addr_buf: Vec<u8>,
}

pub(crate) struct IocpBackend {
    port: HANDLE,
    slots: Vec<OpSlot>,
    free: Vec<u32>,
    associated: HashSet<Fd>,
    entries: Vec<OVERLAPPED_ENTRY>,
}

const ADDR_SPACE: usize = mem::size_of::<ws::SOCKADDR_STORAGE>() + 16;

fn last_wsa_error() -> i32 {
    unsafe { ws::WSAGetLastError() }
}

impl IocpBackend {
    pub(crate) fn new() -> io::Result<Self> {
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 1) };
        if port.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(IocpBackend {
            port,
            slots: Vec::new(),
            free: Vec::new(),
            associated: HashSet::new(),
            entries: vec![unsafe { mem::zeroed() }; 256],
        })
    }

    fn associate(&mut self, fd: Fd) -> Result<(), SubmitError> {
        if self.associated.contains(&fd) {
            return Ok(());
        }
        let ret = unsafe { CreateIoCompletionPort(fd as HANDLE, self.port, 0, 0) };
        if ret.is_null() {
            return Err(SubmitError::Os(io::Error::last_os_error()));
        }
        self.associated.insert(fd);
        Ok(())
    }

    fn alloc_slot(&mut self, tag: OpTag, fd: Fd) -> OpId {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                let slot = self.slots.len() as u32;
                self.slots.push(OpSlot {
                    generation: 0,
                    state: SlotState::InFlight,
                    tag,
                    fd,
                    header: Box::new(OverlappedHeader {
                        overlapped: unsafe { mem::zeroed() },
                        slot,
                        generation: 0,
                    }),
                    buf: Vec::new(),
                    accept_sock: None,
                    addr_buf: Vec::new(),
                });
                return OpId {
                    slot,
                    generation: 0,
                };
            }
        };
        let entry = &mut self.slots[slot as usize];
        entry.state = SlotState::InFlight;
        entry.tag = tag;
        entry.fd = fd;
        entry.header.overlapped = unsafe { mem::zeroed() };
        entry.header.slot = slot;
        entry.header.generation = entry.generation;
        entry.accept_sock = None;
        OpId {
            slot,
            generation: entry.generation,
        }
    }

    fn free_slot(&mut self, slot: u32) {
        let entry = &mut self.slots[slot as usize];
        entry.generation = entry.generation.wrapping_add(1);
        entry.header.generation = entry.generation;
        entry.buf.clear();
        entry.addr_buf.clear();
        if let Some(sock) = entry.accept_sock.take() {
            sys::close(sock);
        }
        self.free.push(slot);
    }

    fn slot_matches(&self, op: OpId) -> bool {
        self.slots
            .get(op.slot as usize)
            .is_some_and(|s| s.generation == op.generation)
    }

    /// Interpret the return convention shared by WSARecv/WSASend/ConnectEx
    /// style calls: zero means queued (completion still arrives via the
    /// port), `WSA_IO_PENDING` means in flight, anything else is a hard
    /// submission failure.
    fn check_posted(&mut self, slot: u32, ret: i32) -> Result<(), SubmitError> {
        if ret == 0 {
            return Ok(());
        }
        let err = last_wsa_error();
        if err == ws::WSA_IO_PENDING {
            return Ok(());
        }
        self.free_slot(slot);
        Err(SubmitError::Os(io::Error::from_raw_os_error(err)))
    }
}

impl Backend for IocpBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Iocp
    }

    fn family(&self) -> Family {
        Family::Completion
    }

    fn arm(&mut self, _fd: Fd, interest: Interest, _epoch: u32) -> io::Result<()> {
        if interest.is_empty() {
            return Ok(());
        }
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "readiness interests require a readiness-capable backend",
        ))
    }

    fn disarm(&mut self, _fd: Fd) -> io::Result<()> {
        Ok(())
    }

    fn wait(&mut self, timeout: Duration, wakeups: &mut Vec<Wakeup>) -> io::Result<()> {
        let millis = timeout
            .as_nanos()
            .div_ceil(1_000_000)
            .min(u32::MAX as u128 - 1) as u32;

        let mut count: u32 = 0;
        let ok = unsafe {
            GetQueuedCompletionStatusEx(
                self.port,
                self.entries.as_mut_ptr(),
                self.entries.len() as u32,
                &mut count,
                millis,
                0,
            )
        };
        if ok == 0 {
            let err = io::Error::last_os_error();
            // WAIT_TIMEOUT is the quiet path.
            if err.raw_os_error() == Some(258) {
                return Ok(());
            }
            return Err(err);
        }

        for i in 0..count as usize {
            let entry = self.entries[i];
            if entry.lpOverlapped.is_null() {
                continue;
            }
            let header = unsafe { &*(entry.lpOverlapped as *const OverlappedHeader) };
            let (slot, generation) = (header.slot, header.generation);
            if !self.slot_matches(OpId { slot, generation }) {
                continue;
            }

            let (fd, tag, cancelled) = {
                let s = &self.slots[slot as usize];
                (s.fd, s.tag, matches!(s.state, SlotState::Cancelled))
            };

            // Internal carries the NTSTATUS; re-query through Winsock for
            // a portable error code.
            let result = if entry.lpOverlapped.is_null() || header.overlapped.Internal == 0 {
                entry.dwNumberOfBytesTransferred as i32
            } else {
                let mut bytes: u32 = 0;
                let mut flags: u32 = 0;
                let ok = unsafe {
                    ws::WSAGetOverlappedResult(
                        fd,
                        entry.lpOverlapped,
                        &mut bytes,
                        0,
                        &mut flags,
                    )
                };
                if ok != 0 {
                    bytes as i32
                } else {
                    -last_wsa_error()
                }
            };

            if cancelled {
                self.free_slot(slot);
                continue;
            }
            if tag == OpTag::Connect && result >= 0 {
                // Finish the socket so getpeername and shutdown work.
                unsafe {
                    ws::setsockopt(fd, ws::SOL_SOCKET, ws::SO_UPDATE_CONNECT_CONTEXT, ptr::null(), 0);
                }
            }
            self.slots[slot as usize].state = SlotState::Done(result);
            wakeups.push(Wakeup::Complete {
                op: OpId { slot, generation },
                result,
            });
        }
        Ok(())
    }

    fn submit(&mut self, desc: OpDesc<'_>) -> Result<OpId, SubmitError> {
        match desc {
            OpDesc::Recv { fd, len } => {
                self.associate(fd)?;
                let op = self.alloc_slot(OpTag::Recv, fd);
                let entry = &mut self.slots[op.slot as usize];
                entry.buf.clear();
                entry.buf.resize(len, 0);
                let mut wsabuf = ws::WSABUF {
                    len: len as u32,
                    buf: entry.buf.as_mut_ptr(),
                };
                let mut flags: u32 = 0;
                let overlapped = &mut entry.header.overlapped as *mut OVERLAPPED;
                let ret = unsafe {
                    ws::WSARecv(fd, &mut wsabuf, 1, ptr::null_mut(), &mut flags, overlapped, None)
                };
                self.check_posted(op.slot, ret)?;
                Ok(op)
            }
            OpDesc::Send { fd, data } => {
                self.associate(fd)?;
                let op = self.alloc_slot(OpTag::Send, fd);
                let entry = &mut self.slots[op.slot as usize];
                entry.buf.clear();
                entry.buf.extend_from_slice(data);
                let mut wsabuf = ws::WSABUF {
                    len: entry.buf.len() as u32,
                    buf: entry.buf.as_mut_ptr(),
                };
                let overlapped = &mut entry.header.overlapped as *mut OVERLAPPED;
                let ret = unsafe {
                    ws::WSASend(fd, &mut wsabuf, 1, ptr::null_mut(), 0, overlapped, None)
                };
                self.check_posted(op.slot, ret)?;
                Ok(op)
            }
            OpDesc::Connect { fd, addr } => {
                self.associate(fd)?;
                // ConnectEx demands a bound socket.
                let local: SocketAddr = if addr.is_ipv4() {
                    "0.0.0.0:0".parse().expect("literal address")
                } else {
                    "[::]:0".parse().expect("literal address")
                };
                let _ = sys::bind(fd, &local);

                let connect_ex = load_connect_ex(fd).map_err(SubmitError::Os)?;
                let op = self.alloc_slot(OpTag::Connect, fd);
                let (storage, len) = sys::addr_to_storage(&addr);
                let entry = &mut self.slots[op.slot as usize];
                entry.buf.clear();
                entry
                    .buf
                    .extend_from_slice(unsafe { as_bytes(&storage) });
                let overlapped = &mut entry.header.overlapped as *mut OVERLAPPED;
                let ret = unsafe {
                    connect_ex(
                        fd,
                        entry.buf.as_ptr() as *const ws::SOCKADDR,
                        len,
                        ptr::null(),
                        0,
                        ptr::null_mut(),
                        overlapped,
                    )
                };
                // ConnectEx returns TRUE on immediate success.
                let ret = if ret != 0 { 0 } else { -1 };
                self.check_posted(op.slot, ret)?;
                Ok(op)
            }
            OpDesc::Accept { fd } => {
                self.associate(fd)?;
                let local = sys::local_addr(fd).map_err(SubmitError::Os)?;
                let accept_sock = sys::tcp_socket(&local).map_err(SubmitError::Os)?;
                let accept_ex = match load_accept_ex(fd) {
                    Ok(f) => f,
                    Err(e) => {
                        sys::close(accept_sock);
                        return Err(SubmitError::Os(e));
                    }
                };

                let op = self.alloc_slot(OpTag::Accept, fd);
                let entry = &mut self.slots[op.slot as usize];
                entry.accept_sock = Some(accept_sock);
                entry.addr_buf.clear();
                entry.addr_buf.resize(2 * ADDR_SPACE, 0);
                let mut received: u32 = 0;
                let overlapped = &mut entry.header.overlapped as *mut OVERLAPPED;
                let ret = unsafe {
                    accept_ex(
                        fd,
                        accept_sock,
                        entry.addr_buf.as_mut_ptr() as *mut _,
                        0,
                        ADDR_SPACE as u32,
                        ADDR_SPACE as u32,
                        &mut received,
                        overlapped,
                    )
                };
                let ret = if ret != 0 { 0 } else { -1 };
                self.check_posted(op.slot, ret)?;
                Ok(op)
            }
        }
    }

    fn cancel(&mut self, op: OpId) {
        if !self.slot_matches(op) {
            return;
        }
        let (state, fd) = {
            let entry = &self.slots[op.slot as usize];
            (entry.state, entry.fd)
        };
        match state {
            SlotState::Done(_) => self.free_slot(op.slot),
            SlotState::Cancelled => {}
            SlotState::InFlight => {
                let overlapped =
                    &mut self.slots[op.slot as usize].header.overlapped as *mut OVERLAPPED;
                unsafe {
                    CancelIoEx(fd as HANDLE, overlapped);
                }
                self.slots[op.slot as usize].state = SlotState::Cancelled;
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
        let done = matches!(self.slots[op.slot as usize].state, SlotState::Done(r) if r >= 0);
        if !done {
            self.free_slot(op.slot);
            return None;
        }
        let listener = self.slots[op.slot as usize].fd;
        let Some(sock) = self.slots[op.slot as usize].accept_sock.take() else {
            self.free_slot(op.slot);
            return None;
        };
        // Inherit listener properties so the usual socket calls work.
        unsafe {
            ws::setsockopt(
                sock,
                ws::SOL_SOCKET,
                ws::SO_UPDATE_ACCEPT_CONTEXT,
                &listener as *const _ as *const u8,
                mem::size_of::<Fd>() as i32,
            );
        }
        let peer = sys::peer_addr(sock)
            .unwrap_or_else(|_| SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, 0)));
        self.free_slot(op.slot);
        Some((sock, peer))
    }

    fn release(&mut self, op: OpId) {
        self.cancel(op);
    }
}

impl Drop for IocpBackend {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.port);
        }
    }
}

unsafe fn as_bytes<T>(value: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>()) }
}

/// `ConnectEx`, resolved at runtime through `WSAIoctl`.
type ConnectExFn = unsafe extern "system" fn(
    ws::SOCKET,
    *const ws::SOCKADDR,
    i32,
    *const std::ffi::c_void,
    u32,
    *mut u32,
    *mut OVERLAPPED,
) -> i32;

/// `AcceptEx`, resolved at runtime through `WSAIoctl`.
type AcceptExFn = unsafe extern "system" fn(
    ws::SOCKET,
    ws::SOCKET,
    *mut std::ffi::c_void,
    u32,
    u32,
    u32,
    *mut u32,
    *mut OVERLAPPED,
) -> i32;

fn load_connect_ex(fd: Fd) -> io::Result<ConnectExFn> {
    unsafe { load_extension::<ConnectExFn>(fd, ws::WSAID_CONNECTEX) }
}

fn load_accept_ex(fd: Fd) -> io::Result<AcceptExFn> {
    unsafe { load_extension::<AcceptExFn>(fd, ws::WSAID_ACCEPTEX) }
}

unsafe fn load_extension<F: Copy>(fd: Fd, guid: windows_sys::core::GUID) -> io::Result<F> {
    let mut func: Option<F> = None;
    let mut bytes: u32 = 0;
    let ret = unsafe {
        ws::WSAIoctl(
            fd,
            ws::SIO_GET_EXTENSION_FUNCTION_POINTER,
            &guid as *const _ as *const std::ffi::c_void,
            mem::size_of_val(&guid) as u32,
            &mut func as *mut _ as *mut std::ffi::c_void,
            mem::size_of::<Option<F>>() as u32,
            &mut bytes,
            ptr::null_mut(),
            None,
        )
    };
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(last_wsa_error()));
    }
    func.ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "extension not available"))
}
