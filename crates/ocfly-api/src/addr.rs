// Transport addresses.
//
// OCF endpoints are URIs such as `coaps+tcp://[fe80::1%25eth0]:5684`.
// `Addr` is their normalized form (scheme + host + zone + port) and is
// the key of every connection pool.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use url::Url;

use crate::error::Error;

// ── Scheme ──────────────────────────────────────────────────────────

/// Transport scheme of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display)]
pub enum Scheme {
    /// Unsecured UDP.
    #[strum(serialize = "coap")]
    Udp,
    /// DTLS over UDP.
    #[strum(serialize = "coaps")]
    UdpSecure,
    /// Unsecured TCP.
    #[strum(serialize = "coap+tcp")]
    Tcp,
    /// TLS over TCP.
    #[strum(serialize = "coaps+tcp")]
    TcpSecure,
}

impl Scheme {
    pub fn is_secure(self) -> bool {
        matches!(self, Self::UdpSecure | Self::TcpSecure)
    }

    pub fn default_port(self) -> u16 {
        if self.is_secure() { 5684 } else { 5683 }
    }

    /// Preference when several endpoints are available: secured TCP first,
    /// then secured UDP, then the unsecured ones.
    pub fn preference(self) -> u8 {
        match self {
            Self::TcpSecure => 0,
            Self::UdpSecure => 1,
            Self::Tcp => 2,
            Self::Udp => 3,
        }
    }
}

impl FromStr for Scheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "coap" => Ok(Self::Udp),
            "coaps" => Ok(Self::UdpSecure),
            "coap+tcp" => Ok(Self::Tcp),
            "coaps+tcp" => Ok(Self::TcpSecure),
            other => Err(Error::InvalidAddress {
                address: s.to_owned(),
                reason: format!("unknown scheme '{other}'"),
            }),
        }
    }
}

// ── Addr ────────────────────────────────────────────────────────────

/// Normalized transport address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Addr {
    scheme: Scheme,
    host: String,
    zone: Option<String>,
    port: u16,
}

impl Addr {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into().to_ascii_lowercase(),
            zone: None,
            port,
        }
    }

    pub fn from_socket_addr(scheme: Scheme, addr: SocketAddr) -> Self {
        let zone = match addr {
            SocketAddr::V6(v6) if v6.scope_id() != 0 => Some(v6.scope_id().to_string()),
            _ => None,
        };
        Self {
            scheme,
            host: addr.ip().to_string(),
            zone,
            port: addr.port(),
        }
    }

    /// Parse an endpoint URI.
    pub fn parse(uri: &str) -> Result<Self, Error> {
        let invalid = |reason: String| Error::InvalidAddress {
            address: uri.to_owned(),
            reason,
        };

        let (scheme_str, rest) = uri
            .split_once("://")
            .ok_or_else(|| invalid("missing '://'".into()))?;
        let scheme: Scheme = scheme_str.parse()?;

        // `url` rejects IPv6 zone identifiers, so peel the zone off first.
        let (rest, zone) = split_zone(rest);
        let url = Url::parse(&format!("{scheme}://{rest}")).map_err(|e| invalid(e.to_string()))?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host".into()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase();

        Ok(Self {
            scheme,
            host,
            zone,
            port: url.port().unwrap_or_else(|| scheme.default_port()),
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn zone(&self) -> Option<&str> {
        self.zone.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_secure(&self) -> bool {
        self.scheme.is_secure()
    }

    /// Keep scheme and port, take host and zone from `observed`.
    pub fn with_host_of(&self, observed: &Addr) -> Self {
        Self {
            scheme: self.scheme,
            host: observed.host.clone(),
            zone: observed.zone.clone(),
            port: self.port,
        }
    }

    /// Resolve to a socket address when the host is a literal IP.
    pub fn to_socket_addr(&self) -> Result<SocketAddr, Error> {
        let ip: IpAddr = self.host.parse().map_err(|_| Error::InvalidAddress {
            address: self.to_string(),
            reason: "host is not an IP literal".into(),
        })?;
        let mut addr = SocketAddr::new(ip, self.port);
        if let (SocketAddr::V6(v6), Some(zone)) = (&mut addr, &self.zone) {
            if let Ok(scope) = zone.parse::<u32>() {
                v6.set_scope_id(scope);
            }
        }
        Ok(addr)
    }

    fn is_ipv6(&self) -> bool {
        self.host.contains(':')
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ipv6() {
            write!(f, "{}://[{}", self.scheme, self.host)?;
            if let Some(zone) = &self.zone {
                write!(f, "%25{zone}")?;
            }
            write!(f, "]:{}", self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
        }
    }
}

impl FromStr for Addr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Split `[fe80::1%25eth0]:5684` into `[fe80::1]:5684` and `eth0`.
fn split_zone(rest: &str) -> (String, Option<String>) {
    let Some(start) = rest.find('%') else {
        return (rest.to_owned(), None);
    };
    let Some(end) = rest[start..].find(']').map(|i| start + i) else {
        return (rest.to_owned(), None);
    };
    let raw = &rest[start + 1..end];
    let zone = raw.strip_prefix("25").unwrap_or(raw);
    let stripped = format!("{}{}", &rest[..start], &rest[end..]);
    (stripped, (!zone.is_empty()).then(|| zone.to_owned()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_endpoint() {
        let addr = Addr::parse("coap://192.168.1.5:5683").unwrap();
        assert_eq!(addr.scheme(), Scheme::Udp);
        assert_eq!(addr.host(), "192.168.1.5");
        assert_eq!(addr.port(), 5683);
        assert_eq!(addr.to_string(), "coap://192.168.1.5:5683");
    }

    #[test]
    fn parses_ipv6_endpoint_with_zone() {
        let addr = Addr::parse("coaps+tcp://[FE80::1%25eth0]:40000").unwrap();
        assert_eq!(addr.scheme(), Scheme::TcpSecure);
        assert_eq!(addr.host(), "fe80::1");
        assert_eq!(addr.zone(), Some("eth0"));
        assert_eq!(addr.port(), 40000);
        assert_eq!(addr.to_string(), "coaps+tcp://[fe80::1%25eth0]:40000");
    }

    #[test]
    fn missing_port_uses_scheme_default() {
        assert_eq!(Addr::parse("coaps://10.0.0.1").unwrap().port(), 5684);
        assert_eq!(Addr::parse("coap+tcp://10.0.0.1").unwrap().port(), 5683);
    }

    #[test]
    fn rejects_unknown_scheme_and_missing_separator() {
        assert!(Addr::parse("http://10.0.0.1:80").is_err());
        assert!(Addr::parse("10.0.0.1:5683").is_err());
    }

    #[test]
    fn normalizes_case_for_pool_keys() {
        let a = Addr::parse("COAP://[FF02::158]:5683").unwrap();
        let b = Addr::parse("coap://[ff02::158]:5683").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn with_host_of_keeps_scheme_and_port() {
        let advertised = Addr::parse("coaps+tcp://[fe80::aaaa]:41234").unwrap();
        let observed = Addr::parse("coap://192.168.1.77:5683").unwrap();
        let patched = advertised.with_host_of(&observed);
        assert_eq!(patched.to_string(), "coaps+tcp://192.168.1.77:41234");
    }

    #[test]
    fn socket_addr_conversion() {
        let sock: SocketAddr = "10.1.2.3:5683".parse().unwrap();
        let addr = Addr::from_socket_addr(Scheme::Udp, sock);
        assert_eq!(addr.to_socket_addr().unwrap(), sock);
        assert!(Addr::new(Scheme::Udp, "device.local", 5683)
            .to_socket_addr()
            .is_err());
    }

    #[test]
    fn scheme_preference_orders_secure_first() {
        let mut schemes = vec![Scheme::Udp, Scheme::TcpSecure, Scheme::Tcp, Scheme::UdpSecure];
        schemes.sort_by_key(|s| s.preference());
        assert_eq!(
            schemes,
            vec![Scheme::TcpSecure, Scheme::UdpSecure, Scheme::Tcp, Scheme::Udp]
        );
    }
}
