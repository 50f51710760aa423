//! Messaging transport: carries session requests and responses by peer id
//!
//! The engine only needs [`MessageTransport`]. [`RelayTransport`] implements
//! it against `whisper-relay`, a UDP rendezvous that forwards opaque
//! payloads between registered peer ids:
//!
//! ```text
//!  node A                     relay                      node B
//!    │── Register{"alice"} ──►│                            │
//!    │◄──── Registered ───────│◄──── Register{"bob"} ──────│
//!    │── Forward{bob, msg} ──►│── Deliver{alice, msg} ────►│
//!    │── Forward{carol, m} ──►│                            │
//!    │◄── Unreachable{carol} ─│                            │
//! ```

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Interest, Registry, Token};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Largest relay datagram
pub const MAX_RELAY_PACKET: usize = 65_507;

/// Registrations are refreshed well inside the relay's eviction window
pub const REGISTER_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================================
// Contract
// ============================================================================

/// Delivers signaling bytes between peer ids
pub trait MessageTransport {
    fn send(&mut self, to: &str, message: &[u8]) -> Result<()>;

    /// Register the transport's socket, if it has one, with the event loop
    fn register(&mut self, _registry: &Registry, _token: Token) -> io::Result<()> {
        Ok(())
    }

    /// Messages received since the last call, as `(from, bytes)`
    fn receive(&mut self) -> Vec<(String, Vec<u8>)>;
}

// ============================================================================
// Relay wire format
// ============================================================================

/// One relay datagram (bincode)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayPacket {
    /// Peer → relay: bind `peer_id` to the sender address
    Register { peer_id: String },
    /// Relay → peer
    Registered,
    /// Peer → relay
    Forward { to: String, payload: Vec<u8> },
    /// Relay → peer
    Deliver { from: String, payload: Vec<u8> },
    /// Relay → peer: `to` is not registered
    Unreachable { to: String },
}

impl RelayPacket {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = bincode::serialize(self).map_err(|e| Error::Protocol(e.to_string()))?;
        if bytes.len() > MAX_RELAY_PACKET {
            return Err(Error::InvalidArgument(format!(
                "relay packet of {} bytes",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        bincode::deserialize(buf).map_err(|e| Error::Protocol(e.to_string()))
    }
}

// ============================================================================
// Relay client
// ============================================================================

/// [`MessageTransport`] over a `whisper-relay`
pub struct RelayTransport {
    socket: UdpSocket,
    relay: SocketAddr,
    peer_id: String,
    last_register: Option<Instant>,
    registered: bool,
}

impl RelayTransport {
    pub fn new(peer_id: &str, relay: SocketAddr) -> Result<Self> {
        let bind: SocketAddr = if relay.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        }
        .parse()
        .map_err(|_| Error::InvalidArgument("bind address".to_string()))?;
        let socket = UdpSocket::bind(bind)?;
        log::info!(
            "Relay transport for '{}' bound to {} (relay {})",
            peer_id,
            socket.local_addr()?,
            relay
        );

        let mut transport = Self {
            socket,
            relay,
            peer_id: peer_id.to_string(),
            last_register: None,
            registered: false,
        };
        transport.send_register();
        Ok(transport)
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    fn send_packet(&self, packet: &RelayPacket) -> Result<()> {
        let bytes = packet.encode()?;
        match self.socket.send_to(&bytes, self.relay) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::debug!("Relay socket full, packet dropped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn send_register(&mut self) {
        let packet = RelayPacket::Register {
            peer_id: self.peer_id.clone(),
        };
        if let Err(e) = self.send_packet(&packet) {
            log::warn!("Registration with relay {} failed: {}", self.relay, e);
        }
        self.last_register = Some(Instant::now());
    }
}

impl MessageTransport for RelayTransport {
    fn send(&mut self, to: &str, message: &[u8]) -> Result<()> {
        self.send_packet(&RelayPacket::Forward {
            to: to.to_string(),
            payload: message.to_vec(),
        })
    }

    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.socket, token, Interest::READABLE)
    }

    fn receive(&mut self) -> Vec<(String, Vec<u8>)> {
        if self
            .last_register
            .map_or(true, |t| t.elapsed() >= REGISTER_INTERVAL)
        {
            self.send_register();
        }

        let mut messages = Vec::new();
        let mut buf = vec![0u8; MAX_RELAY_PACKET];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("Relay socket recv error: {}", e);
                    break;
                }
            };
            if from != self.relay {
                log::trace!("Ignoring datagram from {}", from);
                continue;
            }
            match RelayPacket::decode(&buf[..len]) {
                Ok(RelayPacket::Deliver { from, payload }) => messages.push((from, payload)),
                Ok(RelayPacket::Registered) => {
                    if !self.registered {
                        log::info!("Registered with relay {} as '{}'", self.relay, self.peer_id);
                    }
                    self.registered = true;
                }
                Ok(RelayPacket::Unreachable { to }) => {
                    log::warn!("Peer '{}' is not registered with the relay", to);
                }
                Ok(other) => log::debug!("Unexpected relay packet {:?}", other),
                Err(e) => log::debug!("Malformed relay packet: {}", e),
            }
        }
        messages
    }
}
