//! Port-forwarding service registry
//!
//! A session exports named services; the peer refers to them by name when
//! it opens a forwarding. Channel cookies for forwarding channels take the
//! form `pf/<tcp|udp>/<service>`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

const COOKIE_PREFIX: &str = "pf/";

/// Transport protocol of a forwarded service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PortForwardingProtocol {
    Udp = 0,
    Tcp = 1,
}

impl fmt::Display for PortForwardingProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortForwardingProtocol::Udp => write!(f, "udp"),
            PortForwardingProtocol::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for PortForwardingProtocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(PortForwardingProtocol::Udp),
            "tcp" => Ok(PortForwardingProtocol::Tcp),
            other => Err(Error::InvalidArgument(format!(
                "unsupported protocol '{}'",
                other
            ))),
        }
    }
}

/// Where a registered service lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub protocol: PortForwardingProtocol,
    pub host: String,
    pub port: u16,
}

impl ServiceEntry {
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Services this side accepts forwardings for, keyed by name
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, ServiceEntry>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        name: &str,
        protocol: PortForwardingProtocol,
        host: &str,
        port: u16,
    ) -> Result<()> {
        validate_service_name(name)?;
        if host.is_empty() {
            return Err(Error::InvalidArgument("service host is empty".to_string()));
        }
        if self.services.contains_key(name) {
            return Err(Error::AlreadyExist(format!("service '{}'", name)));
        }

        log::info!("Service '{}' registered: {} {}:{}", name, protocol, host, port);
        self.services.insert(
            name.to_string(),
            ServiceEntry {
                protocol,
                host: host.to_string(),
                port,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        match self.services.remove(name) {
            Some(_) => {
                log::info!("Service '{}' removed", name);
                Ok(())
            }
            None => Err(Error::NotExist(format!("service '{}'", name))),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&ServiceEntry> {
        self.services.get(name)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Name/protocol pairs in name order, as advertised to the peer
    pub fn advertised(&self) -> Vec<(String, PortForwardingProtocol)> {
        let mut list: Vec<_> = self
            .services
            .iter()
            .map(|(name, entry)| (name.clone(), entry.protocol))
            .collect();
        list.sort();
        list
    }
}

/// Service names: 1..=64 characters, no whitespace or '/'
pub fn validate_service_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.len() > 64
        || name.chars().any(|c| c.is_whitespace() || c == '/' || c.is_control())
    {
        return Err(Error::InvalidArgument(format!(
            "invalid service name '{}'",
            name
        )));
    }
    Ok(())
}

pub fn is_forwarding_cookie(cookie: &str) -> bool {
    cookie.starts_with(COOKIE_PREFIX)
}

pub fn forwarding_cookie(protocol: PortForwardingProtocol, service: &str) -> String {
    format!("{}{}/{}", COOKIE_PREFIX, protocol, service)
}

pub fn parse_forwarding_cookie(cookie: &str) -> Option<(PortForwardingProtocol, &str)> {
    let rest = cookie.strip_prefix(COOKIE_PREFIX)?;
    let (protocol, service) = rest.split_once('/')?;
    let protocol = protocol.parse().ok()?;
    validate_service_name(service).ok()?;
    Some((protocol, service))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_lookup() {
        let mut registry = ServiceRegistry::new();
        registry
            .add("ssh", PortForwardingProtocol::Tcp, "127.0.0.1", 22)
            .unwrap();

        let entry = registry.lookup("ssh").unwrap();
        assert_eq!(entry.protocol, PortForwardingProtocol::Tcp);
        assert_eq!(entry.address(), "127.0.0.1:22");
        assert!(registry.lookup("http").is_none());
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = ServiceRegistry::new();
        registry
            .add("dns", PortForwardingProtocol::Udp, "127.0.0.1", 53)
            .unwrap();
        let err = registry
            .add("dns", PortForwardingProtocol::Tcp, "127.0.0.1", 5353)
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExist(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut registry = ServiceRegistry::new();
        registry
            .add("web", PortForwardingProtocol::Tcp, "localhost", 80)
            .unwrap();
        registry.remove("web").unwrap();
        assert!(registry.is_empty());
        assert!(matches!(registry.remove("web"), Err(Error::NotExist(_))));
    }

    #[test]
    fn test_invalid_names() {
        let mut registry = ServiceRegistry::new();
        for name in ["", "a b", "a/b", "tab\tname"] {
            assert!(registry
                .add(name, PortForwardingProtocol::Tcp, "127.0.0.1", 1)
                .is_err());
        }
        assert!(registry
            .add("ok", PortForwardingProtocol::Tcp, "", 1)
            .is_err());
    }

    #[test]
    fn test_advertised_sorted() {
        let mut registry = ServiceRegistry::new();
        registry.add("b", PortForwardingProtocol::Udp, "h", 1).unwrap();
        registry.add("a", PortForwardingProtocol::Tcp, "h", 2).unwrap();
        assert_eq!(
            registry.advertised(),
            vec![
                ("a".to_string(), PortForwardingProtocol::Tcp),
                ("b".to_string(), PortForwardingProtocol::Udp),
            ]
        );
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!("TCP".parse::<PortForwardingProtocol>().unwrap(), PortForwardingProtocol::Tcp);
        assert!(matches!(
            "sctp".parse::<PortForwardingProtocol>(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_cookie() {
        let cookie = forwarding_cookie(PortForwardingProtocol::Tcp, "ssh");
        assert_eq!(cookie, "pf/tcp/ssh");
        assert!(is_forwarding_cookie(&cookie));
        assert_eq!(
            parse_forwarding_cookie(&cookie),
            Some((PortForwardingProtocol::Tcp, "ssh"))
        );
        assert!(!is_forwarding_cookie("svc:tcp"));
        assert_eq!(parse_forwarding_cookie("pf/sctp/ssh"), None);
        assert_eq!(parse_forwarding_cookie("pf/tcp/"), None);
    }

    #[test]
    fn test_ipv6_address() {
        let entry = ServiceEntry {
            protocol: PortForwardingProtocol::Udp,
            host: "::1".to_string(),
            port: 53,
        };
        assert_eq!(entry.address(), "[::1]:53");
    }
}
