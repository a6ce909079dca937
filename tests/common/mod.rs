//! Shared helpers for the backend-parameterised integration tests.
#![allow(dead_code)]

use netloop::{BackendKind, EventLoop, TaskHandle, TcpListener, parse_addr};
use std::net::SocketAddr;

/// Backends usable on this host. io_uring is probed at runtime and
/// silently absent where ring creation is not permitted.
pub fn backends() -> Vec<BackendKind> {
    BackendKind::available()
}

/// Run `test` once per available backend.
pub fn for_each_backend(test: impl Fn(BackendKind)) {
    for kind in backends() {
        eprintln!("--- backend: {kind}");
        test(kind);
    }
}

/// A loopback listener on an ephemeral port, already listening.
pub fn local_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind(parse_addr("127.0.0.1", 0).unwrap()).unwrap();
    listener.listen(128).unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Step the loop until every handle is done.
pub fn run_all<T>(el: &mut EventLoop, handles: &[&TaskHandle<T>]) {
    while !handles.iter().all(|h| h.done()) {
        el.step().unwrap();
    }
}
