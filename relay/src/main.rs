//! Whisper Relay
//!
//! A UDP rendezvous that:
//! - Binds peer ids to the address they register from
//! - Forwards opaque signaling payloads between registered peers
//! - Evicts peers that stop refreshing their registration

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use whisper_session::transport::MAX_RELAY_PACKET;
use whisper_session::RelayPacket;

mod registry;

use registry::Registry;

// ============================================================================
// Constants
// ============================================================================

/// Default relay port
const DEFAULT_PORT: u16 = 7600;

/// mio token for the UDP socket
const SOCKET_TOKEN: Token = Token(0);

/// Upper bound on one poll, so eviction and shutdown are noticed
const TICK: Duration = Duration::from_secs(1);

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // --port <port>   UDP port to listen on
    // --bind <ip>     Address to bind (default 0.0.0.0)
    let args: Vec<String> = std::env::args().collect();
    let port = match parse_arg(&args, "--port") {
        Some(p) => p.parse().map_err(|_| "Invalid port")?,
        None => DEFAULT_PORT,
    };
    let bind = parse_arg(&args, "--bind").unwrap_or_else(|| "0.0.0.0".to_string());
    let addr: SocketAddr = format!("{}:{}", bind, port)
        .parse()
        .map_err(|_| "Invalid bind address")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    log::info!("Whisper relay starting...");
    let mut relay = Relay::new(addr)?;
    relay.run(&shutdown)?;
    log::info!("Whisper relay stopped ({} peers registered)", relay.registry.len());
    Ok(())
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

// ============================================================================
// Relay Structure
// ============================================================================

struct Relay {
    poll: Poll,
    socket: UdpSocket,
    registry: Registry,
    recv_buf: Vec<u8>,
}

impl Relay {
    fn new(addr: SocketAddr) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut socket = UdpSocket::bind(addr)?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;

        log::info!("Relay listening on {}", socket.local_addr()?);

        Ok(Relay {
            poll,
            socket,
            registry: Registry::new(),
            recv_buf: vec![0u8; MAX_RELAY_PACKET],
        })
    }

    fn run(&mut self, shutdown: &AtomicBool) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);

        while !shutdown.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut events, Some(TICK)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                if event.token() == SOCKET_TOKEN {
                    self.process_socket()?;
                }
            }

            self.registry.evict(Instant::now());
        }
        Ok(())
    }

    fn process_socket(&mut self) -> io::Result<()> {
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.recv_buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            };

            let packet = match RelayPacket::decode(&self.recv_buf[..len]) {
                Ok(p) => p,
                Err(e) => {
                    log::debug!("Malformed packet from {}: {}", from, e);
                    continue;
                }
            };

            for (to, reply) in self.registry.route(from, packet, Instant::now()) {
                self.send(to, &reply);
            }
        }
        Ok(())
    }

    fn send(&self, to: SocketAddr, packet: &RelayPacket) {
        let bytes = match packet.encode() {
            Ok(b) => b,
            Err(e) => {
                log::error!("Failed to encode {:?}: {}", packet, e);
                return;
            }
        };
        match self.socket.send_to(&bytes, to) {
            Ok(_) => log::trace!("Sent {} bytes to {}", bytes.len(), to),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::debug!("Socket full, dropped packet to {}", to)
            }
            Err(e) => log::warn!("Send to {} failed: {}", to, e),
        }
    }
}
