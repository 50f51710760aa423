//! Peer registry for routing signaling between nodes
//!
//! The registry maintains mappings between:
//! - Peer ids and the address they last registered from
//! - Addresses and the peer id bound to them (to name the sender of a Forward)
//!
//! Registrations expire unless refreshed within [`REGISTRATION_TTL`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use whisper_session::{validate_peer_id, RelayPacket};

// ============================================================================
// Constants
// ============================================================================

/// Registrations not refreshed within this window are evicted
pub const REGISTRATION_TTL: Duration = Duration::from_secs(120);

// ============================================================================
// Registry Structure
// ============================================================================

struct Registration {
    addr: SocketAddr,
    last_seen: Instant,
}

/// Registry of peers reachable through this relay
#[derive(Default)]
pub struct Registry {
    peers: HashMap<String, Registration>,
    by_addr: HashMap<SocketAddr, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `peer_id` to `addr`, replacing any earlier binding of either
    pub fn register(&mut self, peer_id: &str, addr: SocketAddr, now: Instant) {
        if let Some(previous) = self.by_addr.remove(&addr) {
            if previous != peer_id {
                log::info!("Peer '{}' at {} replaced by '{}'", previous, addr, peer_id);
                self.peers.remove(&previous);
            }
        }
        if let Some(old) = self.peers.insert(
            peer_id.to_string(),
            Registration {
                addr,
                last_seen: now,
            },
        ) {
            if old.addr != addr {
                log::info!("Peer '{}' moved {} -> {}", peer_id, old.addr, addr);
                self.by_addr.remove(&old.addr);
            }
        } else {
            log::info!("Registered peer '{}' at {}", peer_id, addr);
        }
        self.by_addr.insert(addr, peer_id.to_string());
    }

    pub fn lookup(&self, peer_id: &str) -> Option<SocketAddr> {
        self.peers.get(peer_id).map(|r| r.addr)
    }

    /// Peer id registered from `addr`
    pub fn peer_at(&self, addr: SocketAddr) -> Option<&str> {
        self.by_addr.get(&addr).map(String::as_str)
    }

    /// Drop registrations older than [`REGISTRATION_TTL`], returning their ids
    pub fn evict(&mut self, now: Instant) -> Vec<String> {
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, r)| now.saturating_duration_since(r.last_seen) >= REGISTRATION_TTL)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            if let Some(r) = self.peers.remove(id) {
                self.by_addr.remove(&r.addr);
                log::info!("Evicted peer '{}' ({})", id, r.addr);
            }
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Handle one packet from `from`, returning the packets to send back out
    pub fn route(
        &mut self,
        from: SocketAddr,
        packet: RelayPacket,
        now: Instant,
    ) -> Vec<(SocketAddr, RelayPacket)> {
        match packet {
            RelayPacket::Register { peer_id } => {
                if let Err(e) = validate_peer_id(&peer_id) {
                    log::warn!("Rejected registration from {}: {}", from, e);
                    return Vec::new();
                }
                self.register(&peer_id, from, now);
                vec![(from, RelayPacket::Registered)]
            }
            RelayPacket::Forward { to, payload } => {
                let sender = match self.peer_at(from) {
                    Some(id) => id.to_string(),
                    None => {
                        log::debug!("Forward from unregistered address {}", from);
                        return Vec::new();
                    }
                };
                match self.lookup(&to) {
                    Some(dest) => {
                        log::debug!(
                            "Relaying {} bytes '{}' -> '{}'",
                            payload.len(),
                            sender,
                            to
                        );
                        vec![(
                            dest,
                            RelayPacket::Deliver {
                                from: sender,
                                payload,
                            },
                        )]
                    }
                    None => {
                        log::debug!("No route from '{}' to '{}'", sender, to);
                        vec![(from, RelayPacket::Unreachable { to })]
                    }
                }
            }
            other => {
                log::debug!("Ignoring {:?} from {}", other, from);
                Vec::new()
            }
        }
    }
}
