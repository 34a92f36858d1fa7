//! Resolved address handling. `SockAddr` only ever holds already-resolved
//! `SocketAddr`s — there is no DNS resolution here (see `DESIGN.md` for why).

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// One or more resolved addresses for a logical target, plus a printable
/// form for logging.
#[derive(Debug, Clone)]
pub struct SockAddr {
    addrs: Vec<SocketAddr>,
    display: String,
}

impl SockAddr {
    /// Resolves `host:port` via the standard library resolver (blocking —
    /// callers resolve before handing the result to a `Connector`, never
    /// from the loop thread).
    pub fn from_host_port(host: &str, port: u16) -> io::Result<SockAddr> {
        let display = format!("{host}:{port}");
        let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses resolved for {display}"),
            ));
        }
        Ok(SockAddr { addrs, display })
    }

    /// Binds to all interfaces (`0.0.0.0:port` and `[::]:port`) for a
    /// listener that doesn't care which interface a connection arrives on.
    pub fn from_port(port: u16) -> SockAddr {
        let addrs = vec![
            SocketAddr::from(([0, 0, 0, 0], port)),
            SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 0], port)),
        ];
        SockAddr {
            display: format!("0.0.0.0:{port}"),
            addrs,
        }
    }

    /// A single already-resolved address, skipping the resolver entirely.
    pub fn from_resolved(addr: SocketAddr) -> SockAddr {
        SockAddr {
            display: addr.to_string(),
            addrs: vec![addr],
        }
    }

    pub fn addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    pub fn display(&self) -> &str {
        &self.display
    }
}

impl std::fmt::Display for SockAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_resolved_carries_one_address() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let sa = SockAddr::from_resolved(addr);
        assert_eq!(sa.addrs(), &[addr]);
        assert_eq!(sa.display(), "127.0.0.1:9000");
    }

    #[test]
    fn from_port_binds_all_interfaces() {
        let sa = SockAddr::from_port(8080);
        assert_eq!(sa.addrs().len(), 2);
        assert!(sa.addrs().iter().any(|a| a.is_ipv4()));
        assert!(sa.addrs().iter().any(|a| a.is_ipv6()));
    }

    #[test]
    fn from_host_port_resolves_loopback() {
        let sa = SockAddr::from_host_port("127.0.0.1", 1234).unwrap();
        assert_eq!(sa.addrs(), &["127.0.0.1:1234".parse::<SocketAddr>().unwrap()]);
    }
}
