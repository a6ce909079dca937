use std::net::{IpAddr, SocketAddr};

use crate::error::Error;

/// Parse an IP literal (`"127.0.0.1"`, `"::1"`) plus port into a socket
/// address. Anything that is not a literal fails with
/// [`Error::InvalidAddress`] — hostname lookup is the resolver's job.
pub fn parse_addr(host: &str, port: u16) -> Result<SocketAddr, Error> {
    host.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, port))
        .map_err(|_| Error::InvalidAddress(host.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    #[test]
    fn parses_v4() {
        let addr = parse_addr("127.0.0.1", 8080).unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert!(addr.is_ipv4());
    }

    #[test]
    fn parses_v6() {
        let addr = parse_addr("::1", 9000).unwrap();
        assert_eq!(addr, "[::1]:9000".parse::<SocketAddr>().unwrap());
        assert!(addr.is_ipv6());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            parse_addr("wtf", 80),
            Err(Error::InvalidAddress(s)) if s == "wtf"
        ));
        assert!(parse_addr("", 80).is_err());
        assert!(parse_addr("256.0.0.1", 80).is_err());
        assert!(parse_addr("example.com", 80).is_err());
    }
}
