//! Numeric addresses, networks and peer endpoints

use super::error::ValueError;
use ipnet::IpNet;
use parking_lot::Mutex;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

/// How long a DNS answer for an endpoint host is reused
const RESOLUTION_TTL: Duration = Duration::from_secs(60);

/// Parse a numeric IPv4 or IPv6 address, never touching DNS
pub fn parse_address(input: &str) -> Result<IpAddr, ValueError> {
    input
        .parse()
        .map_err(|_| ValueError::Address(input.to_string()))
}

/// Parse `address[/prefix]`
///
/// A missing prefix means a host route (/32 or /128). Host bits are kept,
/// so `10.0.0.2/24` stays an interface address rather than becoming a network.
pub fn parse_network(input: &str) -> Result<IpNet, ValueError> {
    let (raw_address, raw_prefix) = match input.rsplit_once('/') {
        Some((address, prefix)) => (address, Some(prefix)),
        None => (input, None),
    };

    let address = parse_address(raw_address)?;
    let max_prefix = match address {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    let prefix = match raw_prefix {
        Some(prefix) => prefix
            .parse::<u8>()
            .map_err(|_| ValueError::Network(input.to_string()))?,
        None => max_prefix,
    };

    IpNet::new(address, prefix).map_err(|_| ValueError::Network(input.to_string()))
}

#[derive(Debug, Clone)]
struct Resolution {
    at: Instant,
    address: SocketAddr,
}

/// A peer endpoint: a numeric address or a DNS name, plus a port
///
/// Names are resolved lazily and the answer is cached for a minute. IPv4
/// answers are preferred over IPv6 ones.
pub struct InetEndpoint {
    host: String,
    port: u16,
    numeric: bool,
    resolved: Mutex<Option<Resolution>>,
}

impl InetEndpoint {
    /// Parse `host:port` or `[v6]:port`
    pub fn parse(input: &str) -> Result<Self, ValueError> {
        let invalid = |problem: &'static str| ValueError::Endpoint {
            input: input.to_string(),
            problem,
        };

        if input.contains(['/', '?', '#']) {
            return Err(invalid("forbidden characters"));
        }

        let (host, port) = if let Some(rest) = input.strip_prefix('[') {
            let (host, rest) = rest
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
            let port = rest
                .strip_prefix(':')
                .ok_or_else(|| invalid("missing port number"))?;
            (host, port)
        } else {
            let (host, port) = input
                .rsplit_once(':')
                .ok_or_else(|| invalid("missing port number"))?;
            if host.contains(':') {
                return Err(invalid("IPv6 addresses must be in brackets"));
            }
            (host, port)
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("invalid port number"))?;
        let numeric = host.parse::<IpAddr>().is_ok();
        if input.starts_with('[') && !numeric {
            return Err(invalid("bracketed host is not an IPv6 address"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            numeric,
            resolved: Mutex::new(None),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Numeric socket address for this endpoint
    ///
    /// May block on DNS. Returns `None` if the name does not resolve; a
    /// failed lookup is retried on the next call.
    pub fn resolve(&self) -> Option<SocketAddr> {
        if self.numeric {
            return self
                .host
                .parse::<IpAddr>()
                .ok()
                .map(|ip| SocketAddr::new(ip, self.port));
        }

        let mut resolved = self.resolved.lock();
        if let Some(resolution) = resolved.as_ref() {
            if resolution.at.elapsed() < RESOLUTION_TTL {
                return Some(resolution.address);
            }
        }

        match (self.host.as_str(), self.port).to_socket_addrs() {
            Ok(candidates) => {
                let candidates: Vec<SocketAddr> = candidates.collect();
                let address = candidates
                    .iter()
                    .find(|addr| addr.is_ipv4())
                    .or_else(|| candidates.first())
                    .copied()?;
                *resolved = Some(Resolution {
                    at: Instant::now(),
                    address,
                });
                Some(address)
            }
            Err(e) => {
                log::warn!("Failed to resolve endpoint {}: {}", self.host, e);
                *resolved = None;
                None
            }
        }
    }
}

impl Clone for InetEndpoint {
    fn clone(&self) -> Self {
        Self {
            host: self.host.clone(),
            port: self.port,
            numeric: self.numeric,
            resolved: Mutex::new(self.resolved.lock().clone()),
        }
    }
}

impl PartialEq for InetEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for InetEndpoint {}

impl Hash for InetEndpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for InetEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Debug for InetEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InetEndpoint({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(
            parse_address("193.138.218.74").unwrap(),
            "193.138.218.74".parse::<IpAddr>().unwrap()
        );
        assert!(parse_address("fd00::1").unwrap().is_ipv6());
        assert!(parse_address("").is_err());
        // Names are never looked up
        assert_eq!(
            parse_address("localhost").unwrap_err(),
            ValueError::Address("localhost".to_string())
        );
    }

    #[test]
    fn test_parse_network() {
        assert_eq!(parse_network("0.0.0.0/0").unwrap().to_string(), "0.0.0.0/0");
        assert_eq!(parse_network("::/0").unwrap().to_string(), "::/0");
        assert_eq!(parse_network("10.0.0.2/24").unwrap().to_string(), "10.0.0.2/24");
        assert_eq!(parse_network("10.0.0.2").unwrap().to_string(), "10.0.0.2/32");
        assert_eq!(parse_network("fd00::2").unwrap().to_string(), "fd00::2/128");
    }

    #[test]
    fn test_parse_network_invalid() {
        assert!(matches!(
            parse_network("10.0.0.0/33"),
            Err(ValueError::Network(_))
        ));
        assert!(matches!(
            parse_network("10.0.0.0/abc"),
            Err(ValueError::Network(_))
        ));
        assert!(matches!(
            parse_network("example.com/24"),
            Err(ValueError::Address(_))
        ));
    }

    #[test]
    fn test_parse_endpoint() {
        let ep = InetEndpoint::parse("vpn.example.com:51820").unwrap();
        assert_eq!(ep.host(), "vpn.example.com");
        assert_eq!(ep.port(), 51820);
        assert_eq!(ep.to_string(), "vpn.example.com:51820");

        let ep = InetEndpoint::parse("[2001:db8::1]:51820").unwrap();
        assert_eq!(ep.host(), "2001:db8::1");
        assert_eq!(ep.to_string(), "[2001:db8::1]:51820");

        let ep = InetEndpoint::parse("192.0.2.1:443").unwrap();
        assert_eq!(ep.resolve(), Some("192.0.2.1:443".parse().unwrap()));
    }

    #[test]
    fn test_parse_endpoint_invalid() {
        for input in [
            "vpn.example.com",
            "vpn.example.com:",
            "vpn.example.com:70000",
            "2001:db8::1:51820",
            "[2001:db8::1:51820",
            "[example.com]:51820",
            ":51820",
            "host/path:51820",
            "host:51820#frag",
        ] {
            assert!(
                matches!(InetEndpoint::parse(input), Err(ValueError::Endpoint { .. })),
                "{} should be rejected",
                input
            );
        }
    }

    #[test]
    fn test_endpoint_equality_ignores_cache() {
        let a = InetEndpoint::parse("192.0.2.1:51820").unwrap();
        let b = a.clone();
        let _ = a.resolve();
        assert_eq!(a, b);
        assert_ne!(a, InetEndpoint::parse("192.0.2.1:51821").unwrap());
    }

    #[test]
    fn test_resolve_ipv6_literal() {
        let ep = InetEndpoint::parse("[::1]:51820").unwrap();
        assert_eq!(ep.resolve(), Some("[::1]:51820".parse().unwrap()));
    }
}
