//! Port-forwarding tunnels between local sockets and multiplexed channels
//!
//! ```text
//!  local app ──TCP──► listener (pfid) ── accept ──► OPEN "pf/tcp/ssh" ─────┐
//!                                                                        │
//!             ◄──── DATA ────────────── channel ─────────────── DATA ──►│
//!                                                                        ▼
//!                                           peer resolves "ssh" ─► connect 127.0.0.1:22
//! ```
//!
//! Backpressure runs both ways. When bytes for the local socket pile up
//! past [`HIGH_WATERMARK`] the channel is pended so the peer stops reading
//! its socket, and resumed once drained below [`LOW_WATERMARK`]. A peer PEND
//! stops reads from the local socket until RESUME.
//!
//! A TCP tunnel whose channel closes with bytes still queued for a slow
//! local reader keeps its socket until the queue drains, then shuts down
//! the write half.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, ToSocketAddrs};
use std::rc::Rc;

use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::Interest;

use crate::error::{Error, Result};
use crate::io::IoContext;
use crate::mux::{ChannelState, CloseReason, Multiplexer, MAX_CHANNEL_PAYLOAD};
use crate::services::{forwarding_cookie, parse_forwarding_cookie, PortForwardingProtocol, ServiceRegistry};

// ============================================================================
// Constants
// ============================================================================

/// Queued bytes for the local socket that trigger PEND
pub const HIGH_WATERMARK: usize = 64 * 1024;

/// Queued bytes below which a pended channel is resumed
pub const LOW_WATERMARK: usize = 16 * 1024;

/// Unacknowledged records on the link before socket reads pause
pub const LINK_BACKLOG_LIMIT: usize = 256;

/// Reads per tunnel per loop iteration
const READ_BUDGET: usize = 64;

// ============================================================================
// Types
// ============================================================================

type TunnelKey = (u8, u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TunnelState {
    /// Local side waiting for OPEN_ACK
    Opening,
    /// Serving side TCP connect in progress
    Connecting,
    Open,
    /// Channel gone, queued bytes still owed to the local socket (TCP)
    Draining,
}

enum TunnelSocket {
    Tcp(TcpStream),
    /// Local UDP side: replies go to the last sender
    UdpBound {
        socket: UdpSocket,
        peer: Option<SocketAddr>,
    },
    /// Serving UDP side, connected to the service
    UdpConnected(UdpSocket),
}

struct Tunnel {
    /// Forwarding that created it (local side only)
    pfid: Option<u32>,
    socket: TunnelSocket,
    state: TunnelState,
    /// Chunks (TCP) or datagrams (UDP) waiting for the local socket
    to_socket: VecDeque<Vec<u8>>,
    queued_bytes: usize,
    peer_pended: bool,
    local_pended: bool,
}

impl Tunnel {
    fn new(pfid: Option<u32>, socket: TunnelSocket, state: TunnelState) -> Self {
        Self {
            pfid,
            socket,
            state,
            to_socket: VecDeque::new(),
            queued_bytes: 0,
            peer_pended: false,
            local_pended: false,
        }
    }

    fn deregister(&mut self, io: &IoContext) {
        match &mut self.socket {
            TunnelSocket::Tcp(stream) => io.deregister(stream),
            TunnelSocket::UdpBound { socket, .. } | TunnelSocket::UdpConnected(socket) => {
                io.deregister(socket)
            }
        }
    }

    fn enqueue(&mut self, data: &[u8]) {
        if data.is_empty() && matches!(self.socket, TunnelSocket::Tcp(_)) {
            return;
        }
        self.queued_bytes += data.len();
        self.to_socket.push_back(data.to_vec());
    }

    /// Write queued data; Err means the socket is gone
    fn flush(&mut self) -> io::Result<()> {
        while let Some(chunk) = self.to_socket.front_mut() {
            let result = match &mut self.socket {
                TunnelSocket::Tcp(stream) => stream.write(chunk),
                TunnelSocket::UdpBound { socket, peer } => match peer {
                    Some(peer) => socket.send_to(chunk, *peer),
                    // Nobody to deliver to yet
                    None => Ok(chunk.len()),
                },
                TunnelSocket::UdpConnected(socket) => socket.send(chunk),
            };

            match result {
                Ok(0) if !chunk.is_empty() => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "socket closed"))
                }
                Ok(n) if n < chunk.len() && matches!(self.socket, TunnelSocket::Tcp(_)) => {
                    chunk.drain(..n);
                    self.queued_bytes -= n;
                }
                Ok(_) => {
                    self.queued_bytes -= chunk.len();
                    self.to_socket.pop_front();
                }
                Err(e) if is_transient(&e) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        let result = match &mut self.socket {
            TunnelSocket::Tcp(stream) => match stream.read(buf) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                other => other,
            },
            TunnelSocket::UdpBound { socket, peer } => socket.recv_from(buf).map(|(n, from)| {
                *peer = Some(from);
                n
            }),
            TunnelSocket::UdpConnected(socket) => socket.recv(buf),
        };
        match result {
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e) if is_transient(&e) => Ok(ReadOutcome::Nothing),
            Err(e) => Err(e),
        }
    }

    /// Signal EOF to the local socket and discard anything it still sends
    fn shutdown_write(&mut self) {
        let stream = match &mut self.socket {
            TunnelSocket::Tcp(stream) => stream,
            _ => return,
        };
        if let Err(e) = stream.shutdown(Shutdown::Write) {
            log::trace!("Tunnel shutdown: {}", e);
        }
        let mut sink = [0u8; 1024];
        while let Ok(n) = stream.read(&mut sink) {
            if n == 0 {
                break;
            }
        }
    }

    fn is_udp(&self) -> bool {
        !matches!(self.socket, TunnelSocket::Tcp(_))
    }

    /// Serving side TCP: has the connect finished?
    fn poll_connect(&mut self) -> io::Result<bool> {
        let stream = match &mut self.socket {
            TunnelSocket::Tcp(stream) => stream,
            _ => return Ok(true),
        };
        if let Some(e) = stream.take_error()? {
            return Err(e);
        }
        match stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }
}

enum ReadOutcome {
    Nothing,
    /// TCP peer shut down; UDP has no EOF
    Eof,
    Data(usize),
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::NotConnected
    )
}

/// A local endpoint opened by `open_port_forwarding`
struct Forwarding {
    component: u8,
    service: String,
    protocol: PortForwardingProtocol,
    /// TCP only; a UDP forwarding is its single tunnel
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
}

/// Deferred work requested while frames were being dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TunnelAction {
    Pend(u8, u32),
    Close(u8, u32, CloseReason),
}

// ============================================================================
// Forwarder
// ============================================================================

/// Every forwarding and tunnel of one stream
pub struct PortForwarder {
    io: Rc<IoContext>,
    forwardings: BTreeMap<u32, Forwarding>,
    tunnels: HashMap<TunnelKey, Tunnel>,
    actions: VecDeque<TunnelAction>,
}

impl PortForwarder {
    pub fn new(io: Rc<IoContext>) -> Self {
        Self {
            io,
            forwardings: BTreeMap::new(),
            tunnels: HashMap::new(),
            actions: VecDeque::new(),
        }
    }

    /// The channel carries a tunnel
    pub fn owns(&self, component: u8, channel: u32) -> bool {
        self.tunnels.contains_key(&(component, channel))
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    pub fn forwarding_address(&self, pfid: u32) -> Option<SocketAddr> {
        self.forwardings.get(&pfid).map(|f| f.local_addr)
    }

    pub fn has_forwarding(&self, pfid: u32) -> bool {
        self.forwardings.contains_key(&pfid)
    }

    // ------------------------------------------------------------------------
    // Local side
    // ------------------------------------------------------------------------

    /// Start listening (TCP) or bind and open the channel (UDP)
    pub fn open(
        &mut self,
        pfid: u32,
        component: u8,
        service: &str,
        protocol: PortForwardingProtocol,
        bind: SocketAddr,
        mux: &mut Multiplexer,
    ) -> Result<SocketAddr> {
        let forwarding = match protocol {
            PortForwardingProtocol::Tcp => {
                let mut listener = TcpListener::bind(bind)?;
                self.io.register(&mut listener, Interest::READABLE)?;
                let local_addr = listener.local_addr()?;
                Forwarding {
                    component,
                    service: service.to_string(),
                    protocol,
                    listener: Some(listener),
                    local_addr,
                }
            }
            PortForwardingProtocol::Udp => {
                let mut socket = UdpSocket::bind(bind)?;
                let local_addr = socket.local_addr()?;
                self.io.register(&mut socket, Interest::READABLE)?;
                // Nothing fallible after the channel exists
                let channel = match mux.open_channel(&forwarding_cookie(protocol, service)) {
                    Ok(id) => id,
                    Err(e) => {
                        self.io.deregister(&mut socket);
                        return Err(e);
                    }
                };
                self.tunnels.insert(
                    (component, channel),
                    Tunnel::new(
                        Some(pfid),
                        TunnelSocket::UdpBound { socket, peer: None },
                        TunnelState::Opening,
                    ),
                );
                Forwarding {
                    component,
                    service: service.to_string(),
                    protocol,
                    listener: None,
                    local_addr,
                }
            }
        };

        log::info!(
            "Port forwarding {} open: {} {} -> peer service '{}'",
            pfid,
            protocol,
            forwarding.local_addr,
            service
        );
        let local_addr = forwarding.local_addr;
        self.forwardings.insert(pfid, forwarding);
        Ok(local_addr)
    }

    /// Close a forwarding and every tunnel it created
    pub fn close_forwarding(&mut self, pfid: u32, mux: Option<&mut Multiplexer>) -> Result<()> {
        let mut forwarding = self
            .forwardings
            .remove(&pfid)
            .ok_or_else(|| Error::NotExist(format!("port forwarding {}", pfid)))?;
        if let Some(listener) = forwarding.listener.as_mut() {
            self.io.deregister(listener);
        }

        let keys: Vec<TunnelKey> = self
            .tunnels
            .iter()
            .filter(|(_, t)| t.pfid == Some(pfid))
            .map(|(k, _)| *k)
            .collect();
        let mut mux = mux;
        for key in keys {
            if let Some(mux) = mux.as_deref_mut() {
                if let Err(e) = mux.close_channel(key.1, CloseReason::Normal) {
                    log::debug!("Closing channel {}: {}", key.1, e);
                }
            }
            self.remove_tunnel(key);
        }

        log::info!(
            "Port forwarding {} ({} '{}') closed",
            pfid,
            forwarding.protocol,
            forwarding.service
        );
        Ok(())
    }

    pub fn forwarding_component(&self, pfid: u32) -> Option<u8> {
        self.forwardings.get(&pfid).map(|f| f.component)
    }

    // ------------------------------------------------------------------------
    // Channel events
    // ------------------------------------------------------------------------

    /// Serving side: accept a forwarding channel if the service resolves
    pub fn accept_channel(
        &mut self,
        component: u8,
        channel: u32,
        cookie: &str,
        services: &ServiceRegistry,
    ) -> bool {
        let (protocol, service) = match parse_forwarding_cookie(cookie) {
            Some(parsed) => parsed,
            None => {
                log::warn!("Malformed forwarding cookie '{}'", cookie);
                return false;
            }
        };
        let entry = match services.lookup(service) {
            Some(entry) if entry.protocol == protocol => entry,
            Some(entry) => {
                log::warn!(
                    "Forwarding to '{}' refused: service is {}, not {}",
                    service,
                    entry.protocol,
                    protocol
                );
                return false;
            }
            None => {
                log::warn!("Forwarding to unknown service '{}' refused", service);
                return false;
            }
        };

        let target = match entry.address().to_socket_addrs().map(|mut a| a.next()) {
            Ok(Some(addr)) => addr,
            _ => {
                log::warn!("Cannot resolve service '{}' at {}", service, entry.address());
                return false;
            }
        };

        match self.connect_service(protocol, target) {
            Ok((socket, state)) => {
                log::info!(
                    "Channel {} forwarded to service '{}' at {}",
                    channel,
                    service,
                    target
                );
                self.tunnels
                    .insert((component, channel), Tunnel::new(None, socket, state));
                true
            }
            Err(e) => {
                log::warn!("Connecting to service '{}' at {}: {}", service, target, e);
                false
            }
        }
    }

    fn connect_service(
        &self,
        protocol: PortForwardingProtocol,
        target: SocketAddr,
    ) -> io::Result<(TunnelSocket, TunnelState)> {
        match protocol {
            PortForwardingProtocol::Tcp => {
                let mut stream = TcpStream::connect(target)?;
                self.io
                    .register(&mut stream, Interest::READABLE | Interest::WRITABLE)?;
                Ok((TunnelSocket::Tcp(stream), TunnelState::Connecting))
            }
            PortForwardingProtocol::Udp => {
                let any = match target.ip() {
                    IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                };
                let mut socket = UdpSocket::bind(SocketAddr::new(any, 0))?;
                socket.connect(target)?;
                self.io.register(&mut socket, Interest::READABLE)?;
                Ok((TunnelSocket::UdpConnected(socket), TunnelState::Open))
            }
        }
    }

    /// Local side: the peer accepted our channel
    pub fn channel_opened(&mut self, component: u8, channel: u32) {
        if let Some(tunnel) = self.tunnels.get_mut(&(component, channel)) {
            log::debug!("Tunnel on channel {} established", channel);
            tunnel.state = TunnelState::Open;
        }
    }

    /// Bytes from the peer for the local socket
    pub fn channel_data(&mut self, component: u8, channel: u32, data: &[u8]) -> bool {
        let tunnel = match self.tunnels.get_mut(&(component, channel)) {
            Some(t) => t,
            None => return false,
        };

        tunnel.enqueue(data);
        if tunnel.state == TunnelState::Open {
            if let Err(e) = tunnel.flush() {
                log::debug!("Tunnel socket on channel {} closed: {}", channel, e);
                self.actions
                    .push_back(TunnelAction::Close(component, channel, CloseReason::Normal));
                return true;
            }
        }

        if tunnel.queued_bytes > HIGH_WATERMARK && !tunnel.local_pended {
            tunnel.local_pended = true;
            self.actions.push_back(TunnelAction::Pend(component, channel));
        }
        true
    }

    pub fn channel_pending(&mut self, component: u8, channel: u32) {
        if let Some(tunnel) = self.tunnels.get_mut(&(component, channel)) {
            tunnel.peer_pended = true;
        }
    }

    pub fn channel_resume(&mut self, component: u8, channel: u32) {
        if let Some(tunnel) = self.tunnels.get_mut(&(component, channel)) {
            tunnel.peer_pended = false;
        }
    }

    /// The channel is gone; drain queued bytes to the socket, then drop it
    pub fn channel_close(&mut self, component: u8, channel: u32, reason: CloseReason) {
        let key = (component, channel);
        let tunnel = match self.tunnels.get_mut(&key) {
            Some(t) if t.state != TunnelState::Draining => t,
            _ => return,
        };
        log::debug!("Tunnel on channel {} closed ({:?})", channel, reason);

        if tunnel.state == TunnelState::Open {
            match tunnel.flush() {
                Ok(()) if !tunnel.is_udp() && !tunnel.to_socket.is_empty() => {
                    log::debug!(
                        "Tunnel on channel {} draining {} bytes",
                        channel,
                        tunnel.queued_bytes
                    );
                    tunnel.state = TunnelState::Draining;
                    return;
                }
                Ok(()) => tunnel.shutdown_write(),
                Err(e) => log::debug!("Tunnel socket on channel {} closed: {}", channel, e),
            }
        }

        let udp_forwarding = tunnel.is_udp().then_some(tunnel.pfid).flatten();
        self.remove_tunnel(key);

        // A UDP forwarding without its channel is dead
        if let Some(pfid) = udp_forwarding {
            if let Some(forwarding) = self.forwardings.remove(&pfid) {
                log::info!(
                    "Port forwarding {} to '{}' ended",
                    pfid,
                    forwarding.service
                );
            }
        }
    }

    /// Push a closed tunnel's remaining bytes; drop it once empty or broken
    fn drain_tunnel(&mut self, key: TunnelKey) {
        let tunnel = match self.tunnels.get_mut(&key) {
            Some(t) => t,
            None => return,
        };
        match tunnel.flush() {
            Ok(()) if !tunnel.to_socket.is_empty() => return,
            Ok(()) => {
                log::debug!("Tunnel on channel {} drained", key.1);
                tunnel.shutdown_write();
            }
            Err(e) => log::warn!(
                "Tunnel socket on channel {} failed with {} bytes undelivered: {}",
                key.1,
                tunnel.queued_bytes,
                e
            ),
        }
        self.remove_tunnel(key);
    }

    fn remove_tunnel(&mut self, key: TunnelKey) {
        if let Some(mut tunnel) = self.tunnels.remove(&key) {
            tunnel.deregister(&self.io);
        }
    }

    // ------------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------------

    /// Move bytes between sockets and channels of one component
    pub fn drive(&mut self, component: u8, mux: &mut Multiplexer, link_backlog: usize) {
        self.apply_actions(component, mux);
        self.accept_connections(component, mux);

        let keys: Vec<TunnelKey> = self
            .tunnels
            .keys()
            .filter(|(c, _)| *c == component)
            .copied()
            .collect();

        let mut buf = vec![0u8; MAX_CHANNEL_PAYLOAD];
        let mut backlog = link_backlog;
        for key in keys {
            if self.tunnels.get(&key).map(|t| t.state) == Some(TunnelState::Draining) {
                self.drain_tunnel(key);
                continue;
            }
            if let Some(reason) = self.drive_tunnel(key, mux, &mut buf, &mut backlog) {
                if let Err(e) = mux.close_channel(key.1, reason) {
                    log::debug!("Closing channel {}: {}", key.1, e);
                }
                self.channel_close(key.0, key.1, reason);
            }
        }
    }

    /// Returns a close reason if the tunnel must go away
    fn drive_tunnel(
        &mut self,
        key: TunnelKey,
        mux: &mut Multiplexer,
        buf: &mut [u8],
        backlog: &mut usize,
    ) -> Option<CloseReason> {
        let tunnel = self.tunnels.get_mut(&key)?;
        let channel = key.1;

        if tunnel.state == TunnelState::Connecting {
            match tunnel.poll_connect() {
                Ok(true) => {
                    log::debug!("Tunnel on channel {} connected to service", channel);
                    tunnel.state = TunnelState::Open;
                }
                Ok(false) => return None,
                Err(e) => {
                    log::warn!("Service connection for channel {} failed: {}", channel, e);
                    return Some(CloseReason::Error);
                }
            }
        }
        if tunnel.state != TunnelState::Open {
            return None;
        }

        if let Err(e) = tunnel.flush() {
            log::debug!("Tunnel socket on channel {} closed: {}", channel, e);
            return Some(CloseReason::Normal);
        }
        if tunnel.local_pended && tunnel.queued_bytes < LOW_WATERMARK {
            tunnel.local_pended = false;
            if let Err(e) = mux.resume_channel(channel) {
                log::debug!("Resuming channel {}: {}", channel, e);
            }
        }

        for _ in 0..READ_BUDGET {
            if tunnel.peer_pended || *backlog >= LINK_BACKLOG_LIMIT {
                break;
            }
            // Read only what the channel can take right now
            if mux.channel_state(channel).ok() != Some(ChannelState::Open) {
                break;
            }
            match tunnel.read(buf) {
                Ok(ReadOutcome::Nothing) => break,
                Ok(ReadOutcome::Eof) => {
                    log::debug!("Tunnel socket on channel {} reached EOF", channel);
                    return Some(CloseReason::Normal);
                }
                Ok(ReadOutcome::Data(n)) => match mux.write_channel(channel, &buf[..n]) {
                    Ok(_) => *backlog += 1,
                    Err(Error::Busy) => break,
                    Err(e) => {
                        log::debug!("Channel {} write failed: {}", channel, e);
                        return Some(CloseReason::Error);
                    }
                },
                Err(e) => {
                    log::debug!("Tunnel socket on channel {} read error: {}", channel, e);
                    return Some(CloseReason::Normal);
                }
            }
        }
        None
    }

    fn apply_actions(&mut self, component: u8, mux: &mut Multiplexer) {
        let (mine, others): (Vec<_>, Vec<_>) = self.actions.drain(..).partition(|a| match a {
            TunnelAction::Pend(c, _) | TunnelAction::Close(c, _, _) => *c == component,
        });
        self.actions.extend(others);

        for action in mine {
            match action {
                TunnelAction::Pend(_, channel) => {
                    if let Err(e) = mux.pend_channel(channel) {
                        log::debug!("Pending channel {}: {}", channel, e);
                    }
                }
                TunnelAction::Close(c, channel, reason) => {
                    if let Err(e) = mux.close_channel(channel, reason) {
                        log::debug!("Closing channel {}: {}", channel, e);
                    }
                    self.channel_close(c, channel, reason);
                }
            }
        }
    }

    fn accept_connections(&mut self, component: u8, mux: &mut Multiplexer) {
        let mut accepted = Vec::new();
        for (pfid, forwarding) in self.forwardings.iter() {
            if forwarding.component != component {
                continue;
            }
            let listener = match &forwarding.listener {
                Some(l) => l,
                None => continue,
            };
            loop {
                match listener.accept() {
                    Ok((stream, from)) => {
                        log::debug!("Forwarding {} accepted {}", pfid, from);
                        accepted.push((*pfid, forwarding.protocol, forwarding.service.clone(), stream));
                    }
                    Err(e) if is_transient(&e) => break,
                    Err(e) => {
                        log::warn!("Forwarding {} accept failed: {}", pfid, e);
                        break;
                    }
                }
            }
        }

        for (pfid, protocol, service, mut stream) in accepted {
            let channel = match mux.open_channel(&forwarding_cookie(protocol, &service)) {
                Ok(id) => id,
                Err(e) => {
                    log::warn!("Forwarding {}: cannot open channel: {}", pfid, e);
                    continue;
                }
            };
            if let Err(e) = self
                .io
                .register(&mut stream, Interest::READABLE | Interest::WRITABLE)
            {
                log::warn!("Forwarding {}: {}", pfid, e);
                if let Err(e) = mux.close_channel(channel, CloseReason::Error) {
                    log::warn!("Forwarding {}: closing channel {}: {}", pfid, channel, e);
                }
                continue;
            }
            self.tunnels.insert(
                (component, channel),
                Tunnel::new(Some(pfid), TunnelSocket::Tcp(stream), TunnelState::Opening),
            );
        }
    }

    /// Drop every tunnel and listener; channels are closed by the caller
    pub fn shutdown(&mut self) {
        let keys: Vec<TunnelKey> = self.tunnels.keys().copied().collect();
        for key in keys {
            self.remove_tunnel(key);
        }
        for forwarding in self.forwardings.values_mut() {
            if let Some(listener) = forwarding.listener.as_mut() {
                self.io.deregister(listener);
            }
        }
        self.forwardings.clear();
        self.actions.clear();
    }
}
