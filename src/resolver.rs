//! Minimal DNS stub resolver: A/AAAA queries over UDP with per-attempt
//! timeout and nameserver failover.
//!
//! The nameserver list comes from `/etc/resolv.conf` (or is given
//! explicitly); each attempt sends one query and waits up to the
//! configured timeout before moving to the next server. Response parsing
//! is just enough for a stub: header, question skip, A/AAAA answers with
//! name compression.

use std::cell::Cell;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use crate::addr::parse_addr;
use crate::error::Error;
use crate::metrics;
use crate::net::UdpSocket;
use crate::runtime::timeout;

/// Port DNS queries are sent to.
pub const DNS_PORT: u16 = 53;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// DNS record types this resolver can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// IPv4 address record.
    A,
    /// IPv6 address record.
    Aaaa,
}

impl RecordType {
    fn qtype(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Aaaa => 28,
        }
    }
}

/// Parsed nameserver configuration.
pub struct ResolvConf {
    /// Nameservers in the order they will be tried. Never empty.
    pub nameservers: Vec<SocketAddr>,
}

impl ResolvConf {
    /// Parse resolv.conf text: each `nameserver <ip>` line contributes
    /// one server, everything else is ignored. Empty or unusable input
    /// yields exactly one default server, `127.0.0.1:53`.
    pub fn parse(text: &str) -> ResolvConf {
        let mut nameservers = Vec::new();
        for line in text.lines() {
            let mut parts = line.split_whitespace();
            if parts.next() != Some("nameserver") {
                continue;
            }
            if let Some(ip) = parts.next()
                && let Ok(addr) = parse_addr(ip, DNS_PORT)
            {
                nameservers.push(addr);
            }
        }
        if nameservers.is_empty() {
            nameservers.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DNS_PORT));
        }
        ResolvConf { nameservers }
    }

    /// Read the system configuration; a missing file behaves like an
    /// empty one.
    pub fn system() -> ResolvConf {
        match std::fs::read_to_string("/etc/resolv.conf") {
            Ok(text) => Self::parse(&text),
            Err(_) => Self::parse(""),
        }
    }
}

thread_local! {
    static QUERY_ID: Cell<u16> = const { Cell::new(1) };
}

fn next_query_id() -> u16 {
    QUERY_ID.with(|c| {
        let id = c.get();
        c.set(id.wrapping_add(1).max(1));
        id
    })
}

/// DNS stub resolver bound to a fixed nameserver list.
pub struct Resolver {
    nameservers: Vec<SocketAddr>,
    timeout: Duration,
}

impl Resolver {
    /// Resolver over the system nameserver configuration.
    pub fn new() -> Resolver {
        Self::with_conf(ResolvConf::system())
    }

    /// Resolver over a parsed configuration.
    pub fn with_conf(conf: ResolvConf) -> Resolver {
        Resolver {
            nameservers: conf.nameservers,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Resolver over an explicit nameserver list.
    pub fn with_nameservers(nameservers: Vec<SocketAddr>) -> Resolver {
        Resolver {
            nameservers,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Per-nameserver attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Resolver {
        self.timeout = timeout;
        self
    }

    /// Look up `name`, returning every address in the answer section
    /// (port 0). Servers are tried in order; a timed-out attempt moves to
    /// the next server, while an authoritative failure (NXDOMAIN) fails
    /// immediately. Exhausting the list is [`Error::ResolveFailed`].
    pub async fn resolve(
        &self,
        name: &str,
        record: RecordType,
    ) -> Result<Vec<SocketAddr>, Error> {
        metrics::RESOLVER_QUERIES.increment();
        let id = next_query_id();
        let query = encode_query(id, name, record)?;

        for &nameserver in &self.nameservers {
            tracing::debug!(%nameserver, name, "querying");
            let local: SocketAddr = if nameserver.is_ipv4() {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
            } else {
                SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
            };
            let socket = UdpSocket::bind(local)?;
            if let Err(e) = socket.send_to(&query, nameserver).await {
                tracing::debug!(%nameserver, error = %e, "send failed, trying next");
                continue;
            }
            match timeout(self.timeout, recv_answer(&socket, id)).await {
                Ok(result) => return result,
                Err(_) => {
                    tracing::debug!(%nameserver, "timed out, trying next");
                }
            }
        }
        Err(Error::ResolveFailed(format!(
            "no nameserver answered for {name:?}"
        )))
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

async fn recv_answer(socket: &UdpSocket, id: u16) -> Result<Vec<SocketAddr>, Error> {
    let mut buf = [0u8; 1500];
    loop {
        let (n, _from) = socket.recv_from(&mut buf).await?;
        match decode_response(&buf[..n], id) {
            // Not ours (stray datagram or stale id): keep listening.
            None => continue,
            Some(result) => return result,
        }
    }
}

fn encode_query(id: u16, name: &str, record: RecordType) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(18 + name.len());
    out.extend_from_slice(&id.to_be_bytes());
    // Flags: standard query, recursion desired.
    out.extend_from_slice(&0x0100u16.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    out.extend_from_slice(&[0; 6]); // ANCOUNT, NSCOUNT, ARCOUNT

    let trimmed = name.trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(Error::ResolveFailed(format!("empty name {name:?}")));
    }
    for label in trimmed.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(Error::ResolveFailed(format!("malformed name {name:?}")));
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out.extend_from_slice(&record.qtype().to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // class IN
    Ok(out)
}

fn read_u16(packet: &[u8], pos: usize) -> Option<u16> {
    Some(u16::from_be_bytes([
        *packet.get(pos)?,
        *packet.get(pos + 1)?,
    ]))
}

/// Step over a (possibly compressed) name, returning the next offset.
fn skip_name(packet: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *packet.get(pos)?;
        if len == 0 {
            return Some(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            return Some(pos + 2);
        }
        pos += 1 + len as usize;
    }
}

/// Decode a response. `None` means "not the reply we are waiting for"
/// (wrong id or not parseable as DNS); `Some(Err(..))` is an
/// authoritative failure.
fn decode_response(packet: &[u8], want_id: u16) -> Option<Result<Vec<SocketAddr>, Error>> {
    if packet.len() < 12 || read_u16(packet, 0)? != want_id {
        return None;
    }
    let flags = read_u16(packet, 2)?;
    let rcode = flags & 0x000F;
    if rcode == 3 {
        return Some(Err(Error::ResolveFailed("NXDOMAIN".into())));
    }
    if rcode != 0 {
        return Some(Err(Error::ResolveFailed(format!("rcode {rcode}"))));
    }

    let qdcount = read_u16(packet, 4)?;
    let ancount = read_u16(packet, 6)?;
    let mut pos = 12;
    for _ in 0..qdcount {
        pos = skip_name(packet, pos)?;
        pos += 4; // QTYPE + QCLASS
    }

    let mut addrs = Vec::new();
    for _ in 0..ancount {
        pos = skip_name(packet, pos)?;
        let rtype = read_u16(packet, pos)?;
        let rdlen = read_u16(packet, pos + 8)? as usize;
        pos += 10;
        let rdata = packet.get(pos..pos + rdlen)?;
        match (rtype, rdlen) {
            (1, 4) => {
                let octets: [u8; 4] = rdata.try_into().ok()?;
                addrs.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), 0));
            }
            (28, 16) => {
                let octets: [u8; 16] = rdata.try_into().ok()?;
                addrs.push(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), 0));
            }
            _ => {}
        }
        pos += rdlen;
    }

    if addrs.is_empty() {
        return Some(Err(Error::ResolveFailed("no address records".into())));
    }
    Some(Ok(addrs))
}
