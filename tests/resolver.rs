//! Resolver end-to-end against a canned nameserver task on loopback.

mod common;

use std::time::Duration;

use common::for_each_backend;
use netloop::{Error, EventLoop, RecordType, ResolvConf, Resolver, UdpSocket, parse_addr};

/// Build a DNS response for `query`: echo the id and question, then
/// either append one A record per address or set the given rcode.
fn dns_reply(query: &[u8], addrs: &[[u8; 4]], rcode: u8) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&query[..2]); // id
    p.extend_from_slice(&[0x81, 0x80 | rcode]); // response, RD+RA
    p.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    p.extend_from_slice(&(addrs.len() as u16).to_be_bytes()); // ANCOUNT
    p.extend_from_slice(&[0; 4]); // NSCOUNT, ARCOUNT
    p.extend_from_slice(&query[12..]); // question, verbatim
    for addr in addrs {
        p.extend_from_slice(&0xC00Cu16.to_be_bytes()); // name: pointer
        p.extend_from_slice(&[0, 1, 0, 1]); // type A, class IN
        p.extend_from_slice(&60u32.to_be_bytes()); // TTL
        p.extend_from_slice(&4u16.to_be_bytes()); // RDLENGTH
        p.extend_from_slice(addr);
    }
    p
}

fn fake_nameserver(
    el: &mut EventLoop,
    addrs: Vec<[u8; 4]>,
    rcode: u8,
) -> (netloop::TaskHandle<()>, std::net::SocketAddr) {
    let server = UdpSocket::bind(parse_addr("127.0.0.1", 0).unwrap()).unwrap();
    let ns_addr = server.local_addr().unwrap();
    let handle = el.spawn(async move {
        let mut buf = [0u8; 512];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        let reply = dns_reply(&buf[..n], &addrs, rcode);
        server.send_to(&reply, from).await.unwrap();
    });
    (handle, ns_addr)
}

#[test]
fn resolves_against_local_nameserver() {
    for_each_backend(|kind| {
        let mut el = EventLoop::with_backend(kind).unwrap();
        let (server_h, ns_addr) = fake_nameserver(&mut el, vec![[10, 1, 2, 3], [10, 1, 2, 4]], 0);

        let h = el.spawn(async move {
            let resolver = Resolver::with_nameservers(vec![ns_addr]);
            resolver.resolve("example.com", RecordType::A).await
        });
        while !(h.done() && server_h.done()) {
            el.step().unwrap();
        }
        let addrs = h.try_take().unwrap().unwrap().unwrap();
        assert_eq!(
            addrs,
            vec![
                "10.1.2.3:0".parse().unwrap(),
                "10.1.2.4:0".parse().unwrap()
            ]
        );
    });
}

#[test]
fn nxdomain_is_resolve_failure() {
    for_each_backend(|kind| {
        let mut el = EventLoop::with_backend(kind).unwrap();
        let (server_h, ns_addr) = fake_nameserver(&mut el, vec![], 3);

        let h = el.spawn(async move {
            let resolver = Resolver::with_nameservers(vec![ns_addr]);
            resolver.resolve("bad.host.name.wtf123", RecordType::A).await
        });
        while !(h.done() && server_h.done()) {
            el.step().unwrap();
        }
        match h.try_take().unwrap().unwrap() {
            Err(Error::ResolveFailed(_)) => {}
            other => panic!("expected ResolveFailed, got {other:?}"),
        }
    });
}

#[test]
fn silent_nameserver_exhausts_into_failure() {
    for_each_backend(|kind| {
        let mut el = EventLoop::with_backend(kind).unwrap();
        // A bound socket that never answers.
        let silent = UdpSocket::bind(parse_addr("127.0.0.1", 0).unwrap()).unwrap();
        let ns_addr = silent.local_addr().unwrap();

        let h = el.spawn(async move {
            let _silent = silent;
            let resolver =
                Resolver::with_nameservers(vec![ns_addr]).timeout(Duration::from_millis(50));
            resolver.resolve("example.com", RecordType::A).await
        });
        el.run_until(&h).unwrap();
        match h.try_take().unwrap().unwrap() {
            Err(Error::ResolveFailed(_)) => {}
            other => panic!("expected ResolveFailed, got {other:?}"),
        }
    });
}

#[test]
fn conf_parsing_matches_the_documented_defaults() {
    let conf = ResolvConf::parse(
        "nameserver 127.0.0.1\nnameserver 192.168.0.2\nnameserver 127.0.0.2\n    ",
    );
    assert_eq!(conf.nameservers.len(), 3);

    let conf = ResolvConf::parse("");
    assert_eq!(conf.nameservers.len(), 1);
    assert_eq!(conf.nameservers[0], "127.0.0.1:53".parse().unwrap());
}
