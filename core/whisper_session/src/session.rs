//! One peer relationship: its streams, services and SDP handshake
//!
//! ```text
//!  Offerer                                   Answerer
//!  Created ── request() ──► RequestSent       (SessionRequestHandler::on_request)
//!                                             Created ── reply_request(0) ──► RequestAcked
//!  RequestAcked ◄── Response { status 0 } ───┘
//!  start(answer) ──► Started                  start(offer) ──► Started
//! ```
//!
//! A rejected or timed out request returns the offerer to `Created` so it
//! can try again. `close` moves to `Closed` from anywhere; every later call
//! fails with [`Error::InvalidDescriptor`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::time::Instant;

use crate::config::SessionOptions;
use crate::crypto::{Cipher, CryptoProvider};
use crate::error::{Error, Result};
use crate::ice::agent::random_u64;
use crate::ice::{IceAgent, IceCredentials, UdpIceAgent};
use crate::io::IoContext;
use crate::mux::{ChannelState, CloseReason};
use crate::sdp::{MediaDescription, SessionDescription};
use crate::services::{PortForwardingProtocol, ServiceRegistry};
use crate::signaling::{generate_tid, SessionMessage, STATUS_OK, STATUS_REFUSED};
use crate::stream::{
    Stream, StreamHandler, StreamOptions, StreamState, StreamType, MAX_COMPONENTS,
};

// ============================================================================
// Constants
// ============================================================================

/// Streams per session
pub const MAX_STREAMS: usize = 16;

const DEFAULT_FORWARDING_HOST: &str = "127.0.0.1";

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    /// Sends the request; controlling ICE agent, odd channel ids
    Offerer,
    /// Replies to the request; controlled ICE agent, even channel ids
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    RequestSent,
    RequestAcked,
    Started,
    Closed,
}

/// Answer to a session request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionResponse {
    /// 0 on success
    pub status: i32,
    pub reason: Option<String>,
    /// Answerer's SDP, present on success
    pub sdp: Option<String>,
}

impl SessionResponse {
    pub fn is_success(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// Fired once when the response arrives or the request times out
pub type RequestCompletion = Box<dyn FnOnce(Result<SessionResponse>)>;

struct OutboundRequest {
    tid: u64,
    deadline: Instant,
    completion: RequestCompletion,
}

struct InboundRequest {
    tid: u64,
    sdp: String,
}

// ============================================================================
// Session
// ============================================================================

pub struct Session {
    local_id: String,
    peer: String,
    role: SessionRole,
    state: SessionState,
    session_id: u64,
    options: SessionOptions,
    io: Rc<IoContext>,
    crypto: Rc<dyn CryptoProvider>,
    streams: Vec<Option<Stream>>,
    services: ServiceRegistry,
    remote_services: Vec<(String, PortForwardingProtocol)>,
    outbound: Option<OutboundRequest>,
    inbound: Option<InboundRequest>,
    outbox: VecDeque<SessionMessage>,
    next_pfid: u32,
    /// Port forwarding id → stream id
    forwardings: HashMap<u32, u32>,
}

impl Session {
    pub(crate) fn new(
        local_id: &str,
        peer: &str,
        role: SessionRole,
        options: SessionOptions,
        io: Rc<IoContext>,
        crypto: Rc<dyn CryptoProvider>,
    ) -> Self {
        log::info!("Session with {} created ({:?})", peer, role);
        Self {
            local_id: local_id.to_string(),
            peer: peer.to_string(),
            role,
            state: SessionState::Created,
            session_id: random_u64() >> 1,
            options,
            io,
            crypto,
            streams: Vec::new(),
            services: ServiceRegistry::new(),
            remote_services: Vec::new(),
            outbound: None,
            inbound: None,
            outbox: VecDeque::new(),
            next_pfid: 1,
            forwardings: HashMap::new(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::InvalidDescriptor);
        }
        Ok(())
    }

    fn wrong_state(&self, operation: &str) -> Error {
        Error::WrongState(format!("{} in session state {:?}", operation, self.state))
    }

    // ------------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------------

    /// Add a stream; allowed until the session starts
    pub fn add_stream(
        &mut self,
        stream_type: StreamType,
        options: StreamOptions,
        components: u8,
        handler: Box<dyn StreamHandler>,
    ) -> Result<u32> {
        self.check_open()?;
        if self.state == SessionState::Started {
            return Err(Error::AlreadyRun);
        }
        if components == 0 || components as usize > MAX_COMPONENTS {
            return Err(Error::InvalidArgument(format!(
                "{} components (1..={} allowed)",
                components, MAX_COMPONENTS
            )));
        }
        options.validate()?;

        let slot = match self.streams.iter().position(Option::is_none) {
            Some(slot) => slot,
            None if self.streams.len() < MAX_STREAMS => {
                self.streams.push(None);
                self.streams.len() - 1
            }
            None => return Err(Error::Busy),
        };

        let controlling = self.role == SessionRole::Offerer;
        let credentials = IceCredentials::generate();
        let mut agents: Vec<Box<dyn IceAgent>> = Vec::with_capacity(components as usize);
        for component in 1..=components {
            let agent = UdpIceAgent::new(self.io.clone(), component, controlling, &self.options)?
                .with_credentials(credentials.clone());
            agents.push(Box::new(agent));
        }

        let id = slot as u32;
        let stream = Stream::new(
            id,
            stream_type,
            options,
            agents,
            handler,
            self.io.clone(),
            controlling,
        )?;
        log::info!(
            "Session {}: stream {} added ({}, options {:#04x}, {} components)",
            self.peer,
            id,
            stream_type,
            options.bits(),
            components
        );
        self.streams[slot] = Some(stream);
        Ok(id)
    }

    /// Tear a stream down; its channels are reported closed first
    pub fn remove_stream(&mut self, id: u32) -> Result<()> {
        self.check_open()?;
        let mut stream = self
            .streams
            .get_mut(id as usize)
            .and_then(Option::take)
            .ok_or_else(|| Error::NotExist(format!("stream {}", id)))?;
        stream.close(&self.services);
        self.forwardings.retain(|_, s| *s != id);
        log::info!("Session {}: stream {} removed", self.peer, id);
        Ok(())
    }

    fn stream(&self, id: u32) -> Result<&Stream> {
        self.check_open()?;
        self.streams
            .get(id as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::NotExist(format!("stream {}", id)))
    }

    fn stream_mut(&mut self, id: u32) -> Result<&mut Stream> {
        self.check_open()?;
        self.streams
            .get_mut(id as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::NotExist(format!("stream {}", id)))
    }

    pub fn stream_ids(&self) -> Vec<u32> {
        self.streams
            .iter()
            .flatten()
            .map(Stream::id)
            .collect()
    }

    pub fn stream_type(&self, id: u32) -> Result<StreamType> {
        Ok(self.stream(id)?.stream_type())
    }

    /// Change the informational type; only before the session starts
    pub fn set_stream_type(&mut self, id: u32, stream_type: StreamType) -> Result<()> {
        self.check_open()?;
        if self.state == SessionState::Started {
            return Err(Error::AlreadyRun);
        }
        self.stream_mut(id)?.set_stream_type(stream_type);
        Ok(())
    }

    pub fn stream_options(&self, id: u32) -> Result<StreamOptions> {
        Ok(self.stream(id)?.options())
    }

    pub fn stream_state(&self, id: u32) -> Result<StreamState> {
        Ok(self.stream(id)?.state())
    }

    /// The error that drove the stream to `Failed`
    pub fn stream_failure(&self, id: u32) -> Result<Option<&Error>> {
        Ok(self.stream(id)?.failure())
    }

    pub fn write(&mut self, stream: u32, component: u8, data: &[u8]) -> Result<usize> {
        self.stream_mut(stream)?.write(component, data)
    }

    // ------------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------------

    pub fn open_channel(&mut self, stream: u32, component: u8, cookie: &str) -> Result<u32> {
        self.stream_mut(stream)?.open_channel(component, cookie)
    }

    pub fn write_channel(
        &mut self,
        stream: u32,
        component: u8,
        channel: u32,
        data: &[u8],
    ) -> Result<usize> {
        self.stream_mut(stream)?
            .write_channel(component, channel, data)
    }

    pub fn pend_channel(&mut self, stream: u32, component: u8, channel: u32) -> Result<()> {
        self.stream_mut(stream)?.pend_channel(component, channel)
    }

    pub fn resume_channel(&mut self, stream: u32, component: u8, channel: u32) -> Result<()> {
        self.stream_mut(stream)?.resume_channel(component, channel)
    }

    pub fn close_channel(
        &mut self,
        stream: u32,
        component: u8,
        channel: u32,
        reason: CloseReason,
    ) -> Result<()> {
        self.stream_mut(stream)?
            .close_channel(component, channel, reason)
    }

    pub fn channel_state(&mut self, stream: u32, component: u8, channel: u32) -> Result<ChannelState> {
        self.stream_mut(stream)?.channel_state(component, channel)
    }

    // ------------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------------

    /// Export a local service to the peer
    pub fn add_service(
        &mut self,
        name: &str,
        protocol: PortForwardingProtocol,
        host: &str,
        port: u16,
    ) -> Result<()> {
        self.check_open()?;
        self.services.add(name, protocol, host, port)
    }

    pub fn remove_service(&mut self, name: &str) -> Result<()> {
        self.check_open()?;
        self.services.remove(name)
    }

    /// Services the peer advertised in its SDP
    pub fn remote_services(&self) -> &[(String, PortForwardingProtocol)] {
        &self.remote_services
    }

    // ------------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------------

    /// Describe the local streams and services, gathering candidates
    pub fn local_description(&mut self) -> Result<SessionDescription> {
        self.check_open()?;
        let mut streams: Vec<MediaDescription> = Vec::new();
        for stream in self.streams.iter_mut().flatten() {
            streams.push(stream.local_description()?);
        }
        Ok(SessionDescription {
            origin: self.local_id.clone(),
            session_id: self.session_id,
            services: self.services.advertised(),
            streams,
        })
    }

    /// Offer the session to the peer
    pub fn request(&mut self, completion: RequestCompletion) -> Result<()> {
        self.check_open()?;
        if self.role != SessionRole::Offerer {
            return Err(Error::WrongState("only the offerer sends requests".to_string()));
        }
        if self.state != SessionState::Created || self.outbound.is_some() {
            return Err(self.wrong_state("request"));
        }

        let sdp = self.local_description()?.to_string();
        let tid = generate_tid();
        self.outbox.push_back(SessionMessage::Request { tid, sdp });
        self.outbound = Some(OutboundRequest {
            tid,
            deadline: Instant::now() + self.options.request_timeout(),
            completion,
        });
        self.state = SessionState::RequestSent;
        log::info!("Session request {:#x} sent to {}", tid, self.peer);
        Ok(())
    }

    /// Answer the pending inbound request; status 0 accepts it
    pub fn reply_request(&mut self, status: i32, reason: Option<&str>) -> Result<()> {
        self.check_open()?;
        let request = match self.inbound.as_ref() {
            Some(r) if self.state == SessionState::Created => r,
            _ => return Err(Error::WrongState("no request pending".to_string())),
        };
        let tid = request.tid;

        let sdp = if status == STATUS_OK {
            Some(self.local_description()?.to_string())
        } else {
            None
        };
        self.outbox.push_back(SessionMessage::Response {
            tid,
            status,
            reason: reason.map(str::to_string),
            sdp,
        });

        if status == STATUS_OK {
            self.state = SessionState::RequestAcked;
            log::info!("Session request {:#x} from {} accepted", tid, self.peer);
        } else {
            self.inbound = None;
            log::info!(
                "Session request {:#x} from {} rejected ({})",
                tid,
                self.peer,
                status
            );
        }
        Ok(())
    }

    /// SDP of the inbound request this session answers
    pub fn remote_offer(&self) -> Option<&str> {
        self.inbound.as_ref().map(|r| r.sdp.as_str())
    }

    /// Match the peer's streams to ours and begin ICE on all of them
    pub fn start(&mut self, remote_sdp: &str) -> Result<()> {
        self.check_open()?;
        match self.state {
            SessionState::RequestAcked => {}
            SessionState::Started => return Err(Error::AlreadyRun),
            _ => return Err(self.wrong_state("start")),
        }
        let remote: SessionDescription = remote_sdp.parse()?;

        // The n-th local stream of a type pairs with the peer's n-th of that type
        let mut pairs: Vec<(usize, usize)> = Vec::new();
        let mut used: HashMap<StreamType, usize> = HashMap::new();
        for (slot, stream) in self.streams.iter().enumerate() {
            let stream = match stream {
                Some(s) => s,
                None => continue,
            };
            let ordinal = used.entry(stream.stream_type()).or_insert(0);
            let index = remote
                .streams
                .iter()
                .enumerate()
                .filter(|(_, m)| m.stream_type == stream.stream_type())
                .nth(*ordinal)
                .map(|(i, _)| i)
                .ok_or_else(|| {
                    Error::NotExist(format!(
                        "no remote {} stream for local stream {}",
                        stream.stream_type(),
                        stream.id()
                    ))
                })?;
            *ordinal += 1;

            let media = &remote.streams[index];
            if media.components != stream.component_count() || media.options != stream.options() {
                return Err(Error::InvalidArgument(format!(
                    "remote stream {} does not match local stream {}",
                    media.stream_id,
                    stream.id()
                )));
            }
            pairs.push((slot, index));
        }

        let encrypted = self
            .streams
            .iter()
            .flatten()
            .any(|s| s.options().contains(StreamOptions::ENCRYPT));
        let cipher = if encrypted {
            let key = self.crypto.derive_session_key(&self.peer)?;
            Some(Cipher::new(self.crypto.clone(), key))
        } else {
            None
        };

        for (slot, index) in pairs {
            if let Some(stream) = self.streams[slot].as_mut() {
                let stream_cipher = stream
                    .options()
                    .contains(StreamOptions::ENCRYPT)
                    .then(|| cipher.clone())
                    .flatten();
                stream.start(&remote.streams[index], stream_cipher)?;
            }
        }

        self.remote_services = remote.services;
        self.inbound = None;
        self.state = SessionState::Started;
        log::info!("Session with {} started", self.peer);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Port forwarding
    // ------------------------------------------------------------------------

    /// Forward a local endpoint to the peer's service `service`
    ///
    /// `host` defaults to `127.0.0.1`; port 0 picks a free port, see
    /// [`Session::port_forwarding_address`].
    pub fn open_port_forwarding(
        &mut self,
        stream: u32,
        component: u8,
        service: &str,
        protocol: PortForwardingProtocol,
        host: Option<&str>,
        port: u16,
    ) -> Result<u32> {
        self.check_open()?;
        match self.remote_services.iter().find(|(name, _)| name == service) {
            None => {
                return Err(Error::NotExist(format!(
                    "service '{}' is not registered by {}",
                    service, self.peer
                )))
            }
            Some((_, advertised)) if *advertised != protocol => {
                return Err(Error::InvalidArgument(format!(
                    "service '{}' is {}, not {}",
                    service, advertised, protocol
                )))
            }
            Some(_) => {}
        }

        let host = host.unwrap_or(DEFAULT_FORWARDING_HOST);
        let bind: SocketAddr = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::InvalidArgument(format!("{}:{}: {}", host, port, e)))?
            .next()
            .ok_or_else(|| Error::InvalidArgument(format!("{}:{} does not resolve", host, port)))?;

        let pfid = self.next_pfid;
        self.stream_mut(stream)?
            .open_port_forwarding(pfid, component, service, protocol, bind)?;
        self.next_pfid += 1;
        self.forwardings.insert(pfid, stream);
        Ok(pfid)
    }

    pub fn close_port_forwarding(&mut self, pfid: u32) -> Result<()> {
        self.check_open()?;
        let stream = self
            .forwardings
            .remove(&pfid)
            .ok_or_else(|| Error::NotExist(format!("port forwarding {}", pfid)))?;
        self.stream_mut(stream)?.close_port_forwarding(pfid)
    }

    /// Local address a forwarding listens on
    pub fn port_forwarding_address(&self, pfid: u32) -> Result<SocketAddr> {
        let stream = self
            .forwardings
            .get(&pfid)
            .ok_or_else(|| Error::NotExist(format!("port forwarding {}", pfid)))?;
        self.stream(*stream)?
            .port_forwarding_address(pfid)
            .ok_or_else(|| Error::NotExist(format!("port forwarding {}", pfid)))
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Close every stream; later calls are no-ops
    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Some(request) = self.inbound.take() {
            if self.state == SessionState::Created {
                self.outbox.push_back(SessionMessage::Response {
                    tid: request.tid,
                    status: STATUS_REFUSED,
                    reason: Some("closed".to_string()),
                    sdp: None,
                });
            }
        }
        // A closed session makes no more callbacks, the completion included
        self.outbound = None;

        for stream in self.streams.iter_mut().flatten() {
            stream.close(&self.services);
        }
        self.streams.clear();
        self.forwardings.clear();
        self.state = SessionState::Closed;
        log::info!("Session with {} closed", self.peer);
    }

    // ------------------------------------------------------------------------
    // Manager hooks
    // ------------------------------------------------------------------------

    pub(crate) fn adopt_request(&mut self, tid: u64, sdp: String) {
        log::debug!("Session with {} adopts request {:#x}", self.peer, tid);
        self.inbound = Some(InboundRequest { tid, sdp });
    }

    /// An answerer created ahead of the peer's request can take it
    pub(crate) fn awaits_request(&self) -> bool {
        self.role == SessionRole::Answerer
            && self.state == SessionState::Created
            && self.inbound.is_none()
    }

    pub(crate) fn handle_response(
        &mut self,
        tid: u64,
        status: i32,
        reason: Option<String>,
        sdp: Option<String>,
    ) {
        let request = match self.outbound.take() {
            Some(r) if r.tid == tid => r,
            other => {
                self.outbound = other;
                log::debug!("Response {:#x} from {} matches no request", tid, self.peer);
                return;
            }
        };

        if status == STATUS_OK {
            self.state = SessionState::RequestAcked;
            log::info!("Session request {:#x} accepted by {}", tid, self.peer);
        } else {
            self.state = SessionState::Created;
            log::info!(
                "Session request {:#x} rejected by {}: {} {}",
                tid,
                self.peer,
                status,
                reason.as_deref().unwrap_or("")
            );
        }
        (request.completion)(Ok(SessionResponse { status, reason, sdp }));
    }

    /// Timers and I/O of every stream
    pub(crate) fn drive(&mut self, now: Instant) {
        if self.is_closed() {
            return;
        }
        if let Some(request) = self.outbound.as_ref() {
            if now >= request.deadline {
                if let Some(request) = self.outbound.take() {
                    log::warn!("Session request {:#x} to {} timed out", request.tid, self.peer);
                    self.state = SessionState::Created;
                    (request.completion)(Err(Error::Timeout));
                }
            }
        }
        for stream in self.streams.iter_mut().flatten() {
            stream.drive(now, &self.services);
        }
    }

    pub(crate) fn take_outbox(&mut self) -> Vec<SessionMessage> {
        self.outbox.drain(..).collect()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("streams", &self.stream_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SharedSecretCrypto;
    use std::cell::RefCell;
    use std::time::Duration;

    struct Quiet;
    impl StreamHandler for Quiet {}

    fn session(role: SessionRole) -> (Session, mio::Poll) {
        let poll = mio::Poll::new().unwrap();
        let io = Rc::new(IoContext::new(poll.registry().try_clone().unwrap()));
        let crypto: Rc<dyn CryptoProvider> = Rc::new(SharedSecretCrypto::new("alice", b"secret"));
        let s = Session::new("alice", "bob", role, SessionOptions::loopback(), io, crypto);
        (s, poll)
    }

    #[test]
    fn test_add_stream_validation() {
        let (mut s, _poll) = session(SessionRole::Offerer);
        assert!(matches!(
            s.add_stream(StreamType::Audio, StreamOptions::default(), 5, Box::new(Quiet)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            s.add_stream(StreamType::Audio, StreamOptions::default(), 0, Box::new(Quiet)),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            s.add_stream(StreamType::Application, StreamOptions::MULTIPLEXING, 1, Box::new(Quiet)),
            Err(Error::InvalidArgument(_))
        ));
        let id = s
            .add_stream(StreamType::Audio, StreamOptions::RELIABLE, 2, Box::new(Quiet))
            .unwrap();
        assert_eq!(s.stream_type(id).unwrap(), StreamType::Audio);
        assert_eq!(s.stream_state(id).unwrap(), StreamState::Initialized);
        assert!(s.stream_failure(id).unwrap().is_none());

        s.set_stream_type(id, StreamType::Video).unwrap();
        assert_eq!(s.stream_type(id).unwrap(), StreamType::Video);
        assert!(matches!(
            s.set_stream_type(99, StreamType::Text),
            Err(Error::NotExist(_))
        ));
    }

    #[test]
    fn test_streams_reflected_in_offer() {
        let (mut s, _poll) = session(SessionRole::Offerer);
        s.add_stream(StreamType::Audio, StreamOptions::RELIABLE | StreamOptions::ENCRYPT, 1, Box::new(Quiet))
            .unwrap();
        s.add_stream(StreamType::Video, StreamOptions::default(), 2, Box::new(Quiet))
            .unwrap();
        s.add_service("ssh", PortForwardingProtocol::Tcp, "127.0.0.1", 22)
            .unwrap();

        let sdp = s.local_description().unwrap();
        assert_eq!(sdp.streams.len(), 2);
        assert_eq!(sdp.streams[1].components, 2);
        assert_eq!(sdp.service("ssh"), Some(PortForwardingProtocol::Tcp));
        assert!(!sdp.streams[0].candidates.is_empty());

        // Unchanged on a second look
        let again = s.local_description().unwrap();
        assert_eq!(again.to_string(), sdp.to_string());
    }

    #[test]
    fn test_stream_slots_are_reused() {
        let (mut s, _poll) = session(SessionRole::Offerer);
        let a = s.add_stream(StreamType::Text, StreamOptions::default(), 1, Box::new(Quiet)).unwrap();
        let b = s.add_stream(StreamType::Text, StreamOptions::default(), 1, Box::new(Quiet)).unwrap();
        s.remove_stream(a).unwrap();
        assert!(matches!(s.remove_stream(a), Err(Error::NotExist(_))));
        assert_eq!(
            s.add_stream(StreamType::Text, StreamOptions::default(), 1, Box::new(Quiet)).unwrap(),
            a
        );
        assert_ne!(a, b);
    }

    #[test]
    fn test_request_lifecycle() {
        let (mut s, _poll) = session(SessionRole::Offerer);
        s.add_stream(StreamType::Audio, StreamOptions::RELIABLE, 1, Box::new(Quiet)).unwrap();

        let result: Rc<RefCell<Option<Result<SessionResponse>>>> = Rc::default();
        let sink = result.clone();
        s.request(Box::new(move |r| *sink.borrow_mut() = Some(r))).unwrap();
        assert_eq!(s.state(), SessionState::RequestSent);
        assert!(matches!(s.request(Box::new(|_| {})), Err(Error::WrongState(_))));

        let tid = match s.take_outbox().pop() {
            Some(SessionMessage::Request { tid, .. }) => tid,
            other => panic!("expected request, got {:?}", other),
        };

        // Unknown tid is ignored
        s.handle_response(tid ^ 1, STATUS_OK, None, None);
        assert!(result.borrow().is_none());

        s.handle_response(tid, STATUS_REFUSED, Some("no".to_string()), None);
        assert_eq!(s.state(), SessionState::Created);
        let response = result.borrow_mut().take().unwrap().unwrap();
        assert!(!response.is_success());
        assert_eq!(response.reason.as_deref(), Some("no"));
    }

    #[test]
    fn test_request_timeout() {
        let (mut s, _poll) = session(SessionRole::Offerer);
        let result: Rc<RefCell<Option<Result<SessionResponse>>>> = Rc::default();
        let sink = result.clone();
        s.request(Box::new(move |r| *sink.borrow_mut() = Some(r))).unwrap();

        s.drive(Instant::now());
        assert!(result.borrow().is_none());
        s.drive(Instant::now() + s.options.request_timeout() + Duration::from_millis(1));
        assert!(matches!(result.borrow_mut().take(), Some(Err(Error::Timeout))));
        assert_eq!(s.state(), SessionState::Created);
    }

    #[test]
    fn test_answerer_preconditions() {
        let (mut s, _poll) = session(SessionRole::Answerer);
        assert!(matches!(s.request(Box::new(|_| {})), Err(Error::WrongState(_))));
        assert!(matches!(s.reply_request(0, None), Err(Error::WrongState(_))));
        assert!(matches!(s.start("v=0\n"), Err(Error::WrongState(_))));

        s.adopt_request(9, "v=0\n".to_string());
        assert_eq!(s.remote_offer(), Some("v=0\n"));
        s.reply_request(0, None).unwrap();
        assert_eq!(s.state(), SessionState::RequestAcked);
        match s.take_outbox().pop() {
            Some(SessionMessage::Response { tid, status, sdp, .. }) => {
                assert_eq!(tid, 9);
                assert_eq!(status, STATUS_OK);
                assert!(sdp.is_some());
            }
            other => panic!("expected response, got {:?}", other),
        }
        assert!(matches!(s.start("garbage"), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_start_requires_matching_streams() {
        let (mut offerer, _p1) = session(SessionRole::Offerer);
        let (mut answerer, _p2) = session(SessionRole::Answerer);
        offerer.add_stream(StreamType::Audio, StreamOptions::default(), 1, Box::new(Quiet)).unwrap();
        answerer.add_stream(StreamType::Video, StreamOptions::default(), 1, Box::new(Quiet)).unwrap();

        let offer = offerer.local_description().unwrap().to_string();
        answerer.adopt_request(1, offer);
        answerer.reply_request(0, None).unwrap();
        let offer = offerer.local_description().unwrap().to_string();
        assert!(matches!(answerer.start(&offer), Err(Error::NotExist(_))));
        assert_eq!(answerer.state(), SessionState::RequestAcked);
    }

    #[test]
    fn test_port_forwarding_to_unknown_service() {
        let (mut s, _poll) = session(SessionRole::Offerer);
        let id = s
            .add_stream(
                StreamType::Application,
                StreamOptions::RELIABLE | StreamOptions::MULTIPLEXING | StreamOptions::PORT_FORWARDING,
                1,
                Box::new(Quiet),
            )
            .unwrap();
        assert!(matches!(
            s.open_port_forwarding(id, 1, "ssh", PortForwardingProtocol::Tcp, None, 0),
            Err(Error::NotExist(_))
        ));
        assert!(matches!(s.close_port_forwarding(1), Err(Error::NotExist(_))));
    }

    #[test]
    fn test_closed_session_rejects_everything() {
        let (mut s, _poll) = session(SessionRole::Offerer);
        let id = s.add_stream(StreamType::Audio, StreamOptions::default(), 1, Box::new(Quiet)).unwrap();
        s.close();
        s.close();
        assert!(s.is_closed());
        assert!(matches!(s.stream_state(id), Err(Error::InvalidDescriptor)));
        assert!(matches!(s.write(id, 1, b"x"), Err(Error::InvalidDescriptor)));
        assert!(matches!(
            s.add_service("x", PortForwardingProtocol::Udp, "h", 1),
            Err(Error::InvalidDescriptor)
        ));
        assert!(matches!(s.request(Box::new(|_| {})), Err(Error::InvalidDescriptor)));
    }
}
