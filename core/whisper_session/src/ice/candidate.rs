//! ICE candidates and their SDP attribute form
//!
//! Priorities follow RFC 8445 Section 5.1.2.1, per component.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// Constants (RFC 8445 Section 5.1.2.1)
// ============================================================================

const HOST_TYPE_PREF: u32 = 126;
const SRFLX_TYPE_PREF: u32 = 100;
const PRFLX_TYPE_PREF: u32 = 110;
const RELAY_TYPE_PREF: u32 = 0;

const IPV4_LOCAL_PREF: u32 = 65535;
const IPV6_LOCAL_PREF: u32 = 65534;

// ============================================================================
// Candidate Types
// ============================================================================

/// Type of ICE candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateType {
    /// Local network interface address
    Host,
    /// Public mapping of a host address
    ServerReflexive,
    /// Discovered during connectivity checks
    PeerReflexive,
    /// Relayed address
    Relay,
}

impl CandidateType {
    pub fn type_preference(&self) -> u32 {
        match self {
            CandidateType::Host => HOST_TYPE_PREF,
            CandidateType::ServerReflexive => SRFLX_TYPE_PREF,
            CandidateType::PeerReflexive => PRFLX_TYPE_PREF,
            CandidateType::Relay => RELAY_TYPE_PREF,
        }
    }

    fn from_sdp(s: &str) -> Option<Self> {
        match s {
            "host" => Some(CandidateType::Host),
            "srflx" => Some(CandidateType::ServerReflexive),
            "prflx" => Some(CandidateType::PeerReflexive),
            "relay" => Some(CandidateType::Relay),
            _ => None,
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateType::Host => write!(f, "host"),
            CandidateType::ServerReflexive => write!(f, "srflx"),
            CandidateType::PeerReflexive => write!(f, "prflx"),
            CandidateType::Relay => write!(f, "relay"),
        }
    }
}

// ============================================================================
// Candidate
// ============================================================================

/// A transport address that may be usable for one component of a stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate_type: CandidateType,
    /// Component this candidate belongs to (1-based)
    pub component: u8,
    pub address: SocketAddr,
    pub priority: u32,
    /// Candidates with the same foundation share type and base IP
    pub foundation: String,
    /// Base address for reflexive/relay candidates
    pub related_address: Option<SocketAddr>,
}

impl Candidate {
    pub fn new(
        candidate_type: CandidateType,
        component: u8,
        address: SocketAddr,
        related_address: Option<SocketAddr>,
    ) -> Self {
        let priority = calculate_priority(
            candidate_type.type_preference(),
            local_preference(&address),
            component as u32,
        );

        Self {
            candidate_type,
            component,
            address,
            priority,
            foundation: generate_foundation(candidate_type, &address),
            related_address,
        }
    }

    pub fn host(component: u8, address: SocketAddr) -> Self {
        Self::new(CandidateType::Host, component, address, None)
    }

    pub fn server_reflexive(component: u8, public_address: SocketAddr, base: SocketAddr) -> Self {
        Self::new(CandidateType::ServerReflexive, component, public_address, Some(base))
    }

    pub fn peer_reflexive(component: u8, address: SocketAddr) -> Self {
        Self::new(CandidateType::PeerReflexive, component, address, None)
    }

    pub fn is_loopback(&self) -> bool {
        self.address.ip().is_loopback()
    }

    /// Render as the value of an SDP `a=candidate:` attribute
    ///
    /// `<foundation> <component> udp <priority> <ip> <port> typ <type> [raddr <ip> rport <port>]`
    pub fn to_sdp_attribute(&self) -> String {
        let mut attr = format!(
            "{} {} udp {} {} {} typ {}",
            self.foundation,
            self.component,
            self.priority,
            self.address.ip(),
            self.address.port(),
            self.candidate_type
        );
        if let Some(related) = self.related_address {
            attr.push_str(&format!(" raddr {} rport {}", related.ip(), related.port()));
        }
        attr
    }

    /// Parse the value of an SDP `a=candidate:` attribute
    pub fn from_sdp_attribute(value: &str) -> Result<Self> {
        let invalid = || Error::InvalidArgument(format!("malformed candidate '{}'", value));
        let fields: Vec<&str> = value.split_whitespace().collect();
        if fields.len() < 8 || fields[6] != "typ" {
            return Err(invalid());
        }
        if !fields[2].eq_ignore_ascii_case("udp") {
            return Err(invalid());
        }

        let component: u8 = fields[1].parse().map_err(|_| invalid())?;
        let priority: u32 = fields[3].parse().map_err(|_| invalid())?;
        let ip: IpAddr = fields[4].parse().map_err(|_| invalid())?;
        let port: u16 = fields[5].parse().map_err(|_| invalid())?;
        let candidate_type = CandidateType::from_sdp(fields[7]).ok_or_else(invalid)?;

        let related_address = match &fields[8..] {
            [] => None,
            ["raddr", rip, "rport", rport] => {
                let rip: IpAddr = rip.parse().map_err(|_| invalid())?;
                let rport: u16 = rport.parse().map_err(|_| invalid())?;
                Some(SocketAddr::new(rip, rport))
            }
            _ => return Err(invalid()),
        };

        if component == 0 {
            return Err(invalid());
        }

        Ok(Self {
            candidate_type,
            component,
            address: SocketAddr::new(ip, port),
            priority,
            foundation: fields[0].to_string(),
            related_address,
        })
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} component {} priority {}",
            self.candidate_type, self.address, self.component, self.priority
        )
    }
}

// ============================================================================
// Priority
// ============================================================================

/// priority = (2^24 * type_preference) + (2^8 * local_preference) + (256 - component_id)
pub fn calculate_priority(type_pref: u32, local_pref: u32, component_id: u32) -> u32 {
    let type_pref = type_pref.min(126);
    let local_pref = local_pref.min(65535);
    let component_id = component_id.clamp(1, 256);

    (type_pref << 24) | (local_pref << 8) | (256 - component_id)
}

fn local_preference(addr: &SocketAddr) -> u32 {
    match addr.ip() {
        IpAddr::V4(_) => IPV4_LOCAL_PREF,
        IpAddr::V6(_) => IPV6_LOCAL_PREF,
    }
}

fn generate_foundation(candidate_type: CandidateType, addr: &SocketAddr) -> String {
    // Port does not affect the foundation
    let ip: String = addr
        .ip()
        .to_string()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    format!("{}{}", candidate_type, ip)
}

// ============================================================================
// Gathering
// ============================================================================

/// Host candidates for one component from the given local addresses
pub fn gather_host_candidates(
    component: u8,
    local_addrs: &[SocketAddr],
    include_loopback: bool,
) -> Vec<Candidate> {
    local_addrs
        .iter()
        .filter(|addr| include_loopback || !addr.ip().is_loopback())
        .map(|&addr| Candidate::host(component, addr))
        .collect()
}

/// Server reflexive candidate, unless the mapping is not actually translated
pub fn gather_reflexive_candidate(
    component: u8,
    reflexive_addr: SocketAddr,
    base_addr: SocketAddr,
) -> Option<Candidate> {
    if reflexive_addr.ip() == base_addr.ip() {
        return None;
    }
    Some(Candidate::server_reflexive(component, reflexive_addr, base_addr))
}

pub fn sort_candidates_by_priority(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
}

/// Local addresses a socket bound to `bound` can be reached on
///
/// A socket bound to a specific IP is reachable only there; an unspecified
/// bind is expanded to every IPv4 interface address.
pub fn local_addresses_for(bound: SocketAddr, include_loopback: bool) -> Vec<SocketAddr> {
    if !bound.ip().is_unspecified() {
        return vec![bound];
    }

    let mut addrs = enumerate_local_addresses(bound.port());
    if include_loopback {
        addrs.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bound.port()));
    }
    addrs
}

/// IPv4 addresses of non-loopback interfaces
#[cfg(unix)]
pub fn enumerate_local_addresses(port: u16) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();

    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            return addrs;
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;

            if !ifa.ifa_addr.is_null() && (*ifa.ifa_addr).sa_family as i32 == libc::AF_INET {
                let sockaddr_in = ifa.ifa_addr as *const libc::sockaddr_in;
                let ip_bytes = (*sockaddr_in).sin_addr.s_addr.to_ne_bytes();
                let ip = Ipv4Addr::new(ip_bytes[0], ip_bytes[1], ip_bytes[2], ip_bytes[3]);

                if !ip.is_loopback() {
                    addrs.push(SocketAddr::new(IpAddr::V4(ip), port));
                }
            }

            current = ifa.ifa_next;
        }

        libc::freeifaddrs(ifaddrs);
    }

    addrs
}

#[cfg(not(unix))]
pub fn enumerate_local_addresses(_port: u16) -> Vec<SocketAddr> {
    Vec::new()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_priority() {
        let host = calculate_priority(126, 65535, 1);
        assert_eq!(host, (126 << 24) | (65535 << 8) | 255);

        let srflx = calculate_priority(100, 65535, 1);
        let prflx = calculate_priority(110, 65535, 1);
        let relay = calculate_priority(0, 65535, 1);
        assert!(host > prflx);
        assert!(prflx > srflx);
        assert!(srflx > relay);
    }

    #[test]
    fn test_component_lowers_priority() {
        let c1 = Candidate::host(1, "192.168.1.10:5000".parse().unwrap());
        let c2 = Candidate::host(2, "192.168.1.10:5001".parse().unwrap());
        assert_eq!(c1.priority - c2.priority, 1);
    }

    #[test]
    fn test_sdp_attribute_host() {
        let candidate = Candidate::host(1, "192.168.1.100:50000".parse().unwrap());
        let attr = candidate.to_sdp_attribute();
        assert!(attr.contains(" udp "));
        assert!(attr.ends_with("typ host"));

        let parsed = Candidate::from_sdp_attribute(&attr).unwrap();
        assert_eq!(parsed, candidate);
    }

    #[test]
    fn test_sdp_attribute_related_address() {
        let candidate = Candidate::server_reflexive(
            2,
            "203.0.113.50:40000".parse().unwrap(),
            "192.168.1.100:50000".parse().unwrap(),
        );
        let attr = candidate.to_sdp_attribute();
        assert!(attr.contains("raddr 192.168.1.100 rport 50000"));

        let parsed = Candidate::from_sdp_attribute(&attr).unwrap();
        assert_eq!(parsed.related_address, candidate.related_address);
        assert_eq!(parsed.component, 2);
    }

    #[test]
    fn test_sdp_attribute_ipv6() {
        let candidate = Candidate::host(1, "[fe80::1]:6000".parse().unwrap());
        let parsed = Candidate::from_sdp_attribute(&candidate.to_sdp_attribute()).unwrap();
        assert_eq!(parsed.address, candidate.address);
        assert!(!parsed.foundation.contains(':'));
    }

    #[test]
    fn test_sdp_attribute_malformed() {
        assert!(Candidate::from_sdp_attribute("").is_err());
        assert!(Candidate::from_sdp_attribute("f 1 tcp 1 1.2.3.4 5 typ host").is_err());
        assert!(Candidate::from_sdp_attribute("f 1 udp 1 1.2.3.4 5 typ bogus").is_err());
        assert!(Candidate::from_sdp_attribute("f 0 udp 1 1.2.3.4 5 typ host").is_err());
        assert!(Candidate::from_sdp_attribute("f 1 udp 1 1.2.3.4 5 typ host raddr").is_err());
    }

    #[test]
    fn test_gather_host_candidates() {
        let addrs: Vec<SocketAddr> = vec![
            "192.168.1.100:50000".parse().unwrap(),
            "127.0.0.1:50000".parse().unwrap(),
        ];

        assert_eq!(gather_host_candidates(1, &addrs, false).len(), 1);
        assert_eq!(gather_host_candidates(1, &addrs, true).len(), 2);
    }

    #[test]
    fn test_gather_reflexive_candidate() {
        let base: SocketAddr = "192.168.1.100:50000".parse().unwrap();
        assert!(gather_reflexive_candidate(1, "203.0.113.50:50000".parse().unwrap(), base).is_some());
        assert!(gather_reflexive_candidate(1, "192.168.1.100:51000".parse().unwrap(), base).is_none());
    }

    #[test]
    fn test_sort_candidates_by_priority() {
        let mut candidates = vec![
            Candidate::server_reflexive(
                1,
                "203.0.113.50:50000".parse().unwrap(),
                "192.168.1.100:50000".parse().unwrap(),
            ),
            Candidate::host(1, "192.168.1.100:50000".parse().unwrap()),
        ];
        sort_candidates_by_priority(&mut candidates);
        assert_eq!(candidates[0].candidate_type, CandidateType::Host);
    }

    #[test]
    fn test_local_addresses_for_specific_bind() {
        let bound: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert_eq!(local_addresses_for(bound, true), vec![bound]);
    }

    #[test]
    fn test_enumerate_local_addresses() {
        for addr in enumerate_local_addresses(50000) {
            assert!(!addr.ip().is_loopback());
            assert_eq!(addr.port(), 50000);
        }
    }
}
