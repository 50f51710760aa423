//! ICE agent driving one (stream, component) transport path
//!
//! Every datagram on an agent socket starts with a one-byte tag:
//!
//! | Tag    | Payload                                  |
//! |--------|------------------------------------------|
//! | `0x01` | bincode [`BindingMessage`]               |
//! | `0x02` | application data (after connect)         |
//! | `0x03` | keepalive request (8-byte nonce)         |
//! | `0x04` | keepalive response (echoed nonce)        |
//! | `0x05` | peer closed the path                     |

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::Interest;
use ring::rand::{SecureRandom, SystemRandom};

use super::candidate::{
    gather_host_candidates, gather_reflexive_candidate, local_addresses_for, Candidate,
};
use super::connectivity::{
    decode_binding, encode_binding, BindingMessage, BindingRequest, BindingResponse, CheckList,
};
use crate::config::SessionOptions;
use crate::error::{Error, Result};
use crate::io::IoContext;
use crate::stream::StreamState;
use crate::MAX_DATAGRAM_SIZE;

// ============================================================================
// Constants
// ============================================================================

const TAG_BINDING: u8 = 0x01;
const TAG_DATA: u8 = 0x02;
const TAG_KEEPALIVE: u8 = 0x03;
const TAG_KEEPALIVE_ACK: u8 = 0x04;
const TAG_CLOSE: u8 = 0x05;

const UFRAG_LEN: usize = 8;
const PWD_LEN: usize = 24;

/// Data datagrams held while the path is still being negotiated
const MAX_EARLY_DATAGRAMS: usize = 256;

const RECV_BUFFER_SIZE: usize = 2048;

// ============================================================================
// Agent contract
// ============================================================================

/// ICE username fragment and password
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    pub fn generate() -> Self {
        Self {
            ufrag: random_token(UFRAG_LEN),
            pwd: random_token(PWD_LEN),
        }
    }
}

/// Progress and data reported by an agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    StateChanged(StreamState),
    Received(Vec<u8>),
}

/// One component's connectivity engine
///
/// The agent walks `Initialized → CandidateGathered → IceReady →
/// Negotiating → Connected`, ending in `Failed` or `Deactivated`. Every
/// change is reported once through [`IceAgent::drive`].
pub trait IceAgent {
    fn component(&self) -> u8;

    fn credentials(&self) -> &IceCredentials;

    fn state(&self) -> StreamState;

    /// Gather local candidates; later calls return the same set
    fn gather_candidates(&mut self) -> Result<Vec<Candidate>>;

    /// Install the peer's candidates and credentials and begin checks
    fn set_remote(&mut self, candidates: Vec<Candidate>, credentials: IceCredentials) -> Result<()>;

    /// Send on the selected pair
    fn send(&mut self, data: &[u8]) -> Result<usize>;

    /// Process socket input and timers
    fn drive(&mut self, now: Instant) -> Vec<AgentEvent>;

    /// Release the path, telling the peer if connected
    fn close(&mut self);
}

// ============================================================================
// UDP agent
// ============================================================================

/// [`IceAgent`] over one non-blocking UDP socket
pub struct UdpIceAgent {
    io: Rc<IoContext>,
    socket: UdpSocket,
    component: u8,
    controlling: bool,
    local: IceCredentials,
    remote: Option<IceCredentials>,
    local_candidates: Vec<Candidate>,
    gathered: bool,
    include_loopback: bool,
    public_address: Option<SocketAddr>,
    checklist: Option<CheckList>,
    state: StreamState,
    /// Remote address of the selected pair
    selected: Option<SocketAddr>,
    /// Address the controlling peer nominated (controlled side)
    peer_nominated: Option<SocketAddr>,
    nominating: bool,
    started_at: Option<Instant>,
    ice_timeout: Duration,
    keepalive_interval: Duration,
    keepalive_misses: u32,
    last_keepalive: Option<Instant>,
    missed_keepalives: u32,
    early: VecDeque<(SocketAddr, Vec<u8>)>,
    events: Vec<AgentEvent>,
    closed: bool,
}

impl UdpIceAgent {
    pub fn new(
        io: Rc<IoContext>,
        component: u8,
        controlling: bool,
        options: &SessionOptions,
    ) -> Result<Self> {
        let mut socket = UdpSocket::bind(SocketAddr::new(options.bind_address, 0))?;
        io.register(&mut socket, Interest::READABLE)?;

        log::debug!(
            "ICE component {} bound to {} ({})",
            component,
            socket.local_addr()?,
            if controlling { "controlling" } else { "controlled" }
        );

        Ok(Self {
            io,
            socket,
            component,
            controlling,
            local: IceCredentials::generate(),
            remote: None,
            local_candidates: Vec::new(),
            gathered: false,
            include_loopback: options.include_loopback,
            public_address: options.public_address,
            checklist: None,
            state: StreamState::Initialized,
            selected: None,
            peer_nominated: None,
            nominating: false,
            started_at: None,
            ice_timeout: options.ice_timeout(),
            keepalive_interval: options.keepalive_interval(),
            keepalive_misses: options.keepalive_misses,
            last_keepalive: None,
            missed_keepalives: 0,
            early: VecDeque::new(),
            events: Vec::new(),
            closed: false,
        })
    }

    /// Share one set of credentials across a stream's components
    pub fn with_credentials(mut self, credentials: IceCredentials) -> Self {
        self.local = credentials;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn selected_address(&self) -> Option<SocketAddr> {
        self.selected
    }

    fn set_state(&mut self, state: StreamState) {
        if self.state == state || self.state.is_terminal() {
            return;
        }
        log::debug!(
            "ICE component {}: {:?} -> {:?}",
            self.component,
            self.state,
            state
        );
        self.state = state;
        self.events.push(AgentEvent::StateChanged(state));
    }

    fn is_negotiating(&self) -> bool {
        matches!(self.state, StreamState::IceReady | StreamState::Negotiating)
    }

    fn send_tagged(&self, tag: u8, payload: &[u8], to: SocketAddr) -> io::Result<usize> {
        let mut datagram = Vec::with_capacity(1 + payload.len());
        datagram.push(tag);
        datagram.extend_from_slice(payload);
        self.socket.send_to(&datagram, to)
    }

    fn send_binding(&self, msg: &BindingMessage, to: SocketAddr) {
        let result = encode_binding(msg)
            .and_then(|bytes| self.send_tagged(TAG_BINDING, &bytes, to).map_err(Error::from));
        if let Err(e) = result {
            log::trace!("Binding message to {} not sent: {}", to, e);
        }
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    fn receive_all(&mut self) {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    if len > 0 {
                        self.process_datagram(from, &buf[..len]);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::trace!("ICE component {} recv error: {}", self.component, e);
                    break;
                }
            }
        }
    }

    fn process_datagram(&mut self, from: SocketAddr, datagram: &[u8]) {
        let payload = &datagram[1..];
        match datagram[0] {
            TAG_BINDING => match decode_binding(payload) {
                Ok(BindingMessage::Request(request)) => self.handle_binding_request(from, request),
                Ok(BindingMessage::Response(response)) => self.handle_binding_response(response),
                Err(e) => log::trace!("Malformed binding message from {}: {}", from, e),
            },
            TAG_DATA => self.handle_data(from, payload),
            TAG_KEEPALIVE => {
                self.note_alive(from);
                if Some(from) == self.selected {
                    if let Err(e) = self.send_tagged(TAG_KEEPALIVE_ACK, payload, from) {
                        log::trace!("Keepalive reply to {} failed: {}", from, e);
                    }
                }
            }
            TAG_KEEPALIVE_ACK => self.note_alive(from),
            TAG_CLOSE => {
                if self.state == StreamState::Connected && Some(from) == self.selected {
                    log::info!("ICE component {}: peer closed the path", self.component);
                    self.set_state(StreamState::Deactivated);
                }
            }
            tag => log::trace!("Unknown datagram tag {:#04x} from {}", tag, from),
        }
    }

    fn handle_binding_request(&mut self, from: SocketAddr, request: BindingRequest) {
        if request.target_ufrag() != Some(self.local.ufrag.as_str()) || !request.verify(&self.local.pwd)
        {
            log::trace!("Unauthenticated binding request from {}", from);
            return;
        }

        let response = BindingResponse::success(request.transaction_id, from).sign(&self.local.pwd);
        self.send_binding(&BindingMessage::Response(response), from);

        if let Some(checklist) = self.checklist.as_mut() {
            checklist.trigger(from);
        }

        if !self.controlling && request.use_candidate && self.selected.is_none() {
            if self.peer_nominated.is_none() {
                log::debug!("ICE component {}: peer nominated {}", self.component, from);
            }
            self.peer_nominated = Some(from);
        }
    }

    fn handle_binding_response(&mut self, response: BindingResponse) {
        let verified = match &self.remote {
            Some(remote) => response.verify(&remote.pwd),
            None => false,
        };
        if !verified {
            log::trace!("Unauthenticated binding response dropped");
            return;
        }

        let checklist = match self.checklist.as_mut() {
            Some(c) => c,
            None => return,
        };
        let outcome = match checklist.handle_response(&response) {
            Some(o) => o,
            None => return,
        };

        if !self.controlling || self.selected.is_some() {
            return;
        }

        match (outcome.succeeded, outcome.nominated) {
            (true, true) => {
                if let Some(pair) = checklist.get_pair(outcome.index) {
                    let remote = pair.remote.address;
                    self.connect(remote);
                }
            }
            (true, false) if !self.nominating => {
                self.nominating = checklist.nominate(outcome.index);
            }
            (false, true) => {
                log::warn!("ICE component {}: nomination failed", self.component);
                self.set_state(StreamState::Failed);
            }
            _ => {}
        }
    }

    fn handle_data(&mut self, from: SocketAddr, payload: &[u8]) {
        match self.state {
            StreamState::Connected if Some(from) == self.selected => {
                self.missed_keepalives = 0;
                self.events.push(AgentEvent::Received(payload.to_vec()));
            }
            state if !state.is_terminal() && state != StreamState::Connected => {
                if self.early.len() < MAX_EARLY_DATAGRAMS {
                    self.early.push_back((from, payload.to_vec()));
                }
            }
            _ => log::trace!("Data from unselected address {} dropped", from),
        }
    }

    fn note_alive(&mut self, from: SocketAddr) {
        if Some(from) == self.selected {
            self.missed_keepalives = 0;
        }
    }

    fn connect(&mut self, remote: SocketAddr) {
        self.selected = Some(remote);
        self.set_state(StreamState::Negotiating);
        self.set_state(StreamState::Connected);
        self.last_keepalive = Some(Instant::now());
        log::info!(
            "ICE component {} connected to {}",
            self.component,
            Candidate::peer_reflexive(self.component, remote)
        );

        for (from, data) in std::mem::take(&mut self.early) {
            if from == remote {
                self.events.push(AgentEvent::Received(data));
            }
        }
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    fn run_checks(&mut self, now: Instant) {
        if let Some(started) = self.started_at {
            if now.duration_since(started) >= self.ice_timeout {
                log::warn!("ICE component {}: negotiation timed out", self.component);
                self.set_state(StreamState::Failed);
                return;
            }
        }

        if !self.controlling {
            if let Some(remote) = self.peer_nominated {
                self.connect(remote);
                return;
            }
        }

        let (remote_pwd, checklist) = match (&self.remote, self.checklist.as_mut()) {
            (Some(remote), Some(checklist)) => (remote.pwd.clone(), checklist),
            _ => return,
        };

        checklist.handle_timeouts(now);
        if self.controlling && checklist.is_complete() && !checklist.has_succeeded() {
            log::warn!("ICE component {}: all candidate pairs failed", self.component);
            self.set_state(StreamState::Failed);
            return;
        }

        if let Some((_, request, to)) = checklist.next_request(now) {
            let msg = BindingMessage::Request(request.sign(&remote_pwd));
            self.send_binding(&msg, to);
            self.set_state(StreamState::Negotiating);
        }
    }

    fn run_keepalive(&mut self, now: Instant) {
        let (selected, last) = match (self.selected, self.last_keepalive) {
            (Some(s), Some(l)) => (s, l),
            _ => return,
        };
        if now.duration_since(last) < self.keepalive_interval {
            return;
        }

        if self.missed_keepalives >= self.keepalive_misses {
            log::warn!(
                "ICE component {}: {} keepalives unanswered",
                self.component,
                self.missed_keepalives
            );
            self.set_state(StreamState::Deactivated);
            return;
        }

        self.missed_keepalives += 1;
        self.last_keepalive = Some(now);
        let nonce = random_u64().to_be_bytes();
        if let Err(e) = self.send_tagged(TAG_KEEPALIVE, &nonce, selected) {
            log::trace!("Keepalive to {} failed: {}", selected, e);
        }
    }
}

impl IceAgent for UdpIceAgent {
    fn component(&self) -> u8 {
        self.component
    }

    fn credentials(&self) -> &IceCredentials {
        &self.local
    }

    fn state(&self) -> StreamState {
        self.state
    }

    fn gather_candidates(&mut self) -> Result<Vec<Candidate>> {
        if !self.gathered {
            let bound = self.socket.local_addr()?;
            let addrs = local_addresses_for(bound, self.include_loopback);
            let mut candidates = gather_host_candidates(self.component, &addrs, self.include_loopback);

            if let Some(public) = self.public_address {
                let mapped = SocketAddr::new(public.ip(), bound.port());
                if let Some(base) = candidates.first().map(|c| c.address) {
                    candidates.extend(gather_reflexive_candidate(self.component, mapped, base));
                }
            }

            if candidates.is_empty() {
                log::warn!("ICE component {}: no usable local addresses", self.component);
            }
            self.local_candidates = candidates;
            self.gathered = true;
            self.set_state(StreamState::CandidateGathered);
        }
        Ok(self.local_candidates.clone())
    }

    fn set_remote(&mut self, candidates: Vec<Candidate>, credentials: IceCredentials) -> Result<()> {
        if self.checklist.is_some() || self.state.is_terminal() {
            return Err(Error::WrongState("ICE negotiation already started".to_string()));
        }
        let local = self.gather_candidates()?;

        let remote: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| c.component == self.component)
            .collect();

        let mut checklist = CheckList::new(
            self.controlling,
            format!("{}:{}", credentials.ufrag, self.local.ufrag),
        );
        checklist.add_pairs(&local, &remote);
        log::debug!(
            "ICE component {}: {} candidate pairs",
            self.component,
            checklist.pair_count()
        );

        self.checklist = Some(checklist);
        self.remote = Some(credentials);
        self.started_at = Some(Instant::now());
        self.set_state(StreamState::IceReady);
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<usize> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(Error::InvalidArgument(format!(
                "datagram of {} bytes exceeds {}",
                data.len(),
                MAX_DATAGRAM_SIZE
            )));
        }
        let to = match (self.state, self.selected) {
            (StreamState::Connected, Some(to)) => to,
            _ => return Err(Error::NotReady),
        };

        match self.send_tagged(TAG_DATA, data, to) {
            Ok(_) => Ok(data.len()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::trace!("Socket full, datagram dropped");
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn drive(&mut self, now: Instant) -> Vec<AgentEvent> {
        if !self.closed {
            self.receive_all();

            if self.is_negotiating() {
                self.run_checks(now);
            }
            if self.state == StreamState::Connected {
                self.run_keepalive(now);
            }
        }
        std::mem::take(&mut self.events)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        if let (StreamState::Connected, Some(to)) = (self.state, self.selected) {
            if let Err(e) = self.send_tagged(TAG_CLOSE, &[], to) {
                log::trace!("Close notification to {} failed: {}", to, e);
            }
        }
        self.io.deregister(&mut self.socket);
        self.closed = true;
        self.set_state(StreamState::Closed);
    }
}

impl Drop for UdpIceAgent {
    fn drop(&mut self) {
        if !self.closed {
            self.io.deregister(&mut self.socket);
        }
    }
}

// ============================================================================
// Randomness
// ============================================================================

const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Random alphanumeric string of `len` characters
pub fn random_token(len: usize) -> String {
    let rng = SystemRandom::new();
    let mut bytes = vec![0u8; len];
    if rng.fill(&mut bytes).is_err() {
        bytes.iter_mut().enumerate().for_each(|(i, b)| {
            *b = (random_fallback() >> (i % 8)) as u8;
        });
    }
    bytes
        .iter()
        .map(|b| TOKEN_ALPHABET[*b as usize % TOKEN_ALPHABET.len()] as char)
        .collect()
}

pub fn random_u64() -> u64 {
    let mut bytes = [0u8; 8];
    match SystemRandom::new().fill(&mut bytes) {
        Ok(()) => u64::from_be_bytes(bytes),
        Err(_) => random_fallback(),
    }
}

fn random_fallback() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll};

    fn agent_pair(poll: &Poll) -> (UdpIceAgent, UdpIceAgent) {
        let io = Rc::new(IoContext::new(poll.registry().try_clone().unwrap()));
        let options = SessionOptions::loopback();
        let offerer = UdpIceAgent::new(io.clone(), 1, true, &options).unwrap();
        let answerer = UdpIceAgent::new(io, 1, false, &options).unwrap();
        (offerer, answerer)
    }

    fn run_until<F>(poll: &mut Poll, a: &mut UdpIceAgent, b: &mut UdpIceAgent, mut done: F)
    where
        F: FnMut(&[AgentEvent], &[AgentEvent]) -> bool,
    {
        let mut events = Events::with_capacity(16);
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen_a = Vec::new();
        let mut seen_b = Vec::new();
        while Instant::now() < deadline {
            poll.poll(&mut events, Some(Duration::from_millis(5))).unwrap();
            let now = Instant::now();
            seen_a.extend(a.drive(now));
            seen_b.extend(b.drive(now));
            if done(&seen_a, &seen_b) {
                return;
            }
        }
        panic!("agents did not reach the expected state");
    }

    #[test]
    fn test_random_token() {
        let token = random_token(24);
        assert_eq!(token.len(), 24);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(random_token(24), token);
    }

    #[test]
    fn test_gather_is_idempotent() {
        let poll = Poll::new().unwrap();
        let (mut agent, _) = agent_pair(&poll);

        let first = agent.gather_candidates().unwrap();
        assert_eq!(first.len(), 1);
        assert!(first[0].is_loopback());
        assert_eq!(agent.gather_candidates().unwrap(), first);
        assert_eq!(
            agent.drive(Instant::now()),
            vec![AgentEvent::StateChanged(StreamState::CandidateGathered)]
        );
    }

    #[test]
    fn test_send_before_connect() {
        let poll = Poll::new().unwrap();
        let (mut agent, _) = agent_pair(&poll);
        assert!(matches!(agent.send(b"hello"), Err(Error::NotReady)));
    }

    #[test]
    fn test_loopback_negotiation() {
        let mut poll = Poll::new().unwrap();
        let (mut a, mut b) = agent_pair(&poll);

        let a_candidates = a.gather_candidates().unwrap();
        let b_candidates = b.gather_candidates().unwrap();
        let a_creds = a.credentials().clone();
        let b_creds = b.credentials().clone();
        b.set_remote(a_candidates, a_creds).unwrap();
        a.set_remote(b_candidates, b_creds).unwrap();

        let connected = AgentEvent::StateChanged(StreamState::Connected);
        run_until(&mut poll, &mut a, &mut b, |ea, eb| {
            ea.contains(&connected) && eb.contains(&connected)
        });

        assert_eq!(a.selected_address(), Some(b.local_addr().unwrap()));
        assert_eq!(b.selected_address(), Some(a.local_addr().unwrap()));

        a.send(b"ping").unwrap();
        let expected = AgentEvent::Received(b"ping".to_vec());
        run_until(&mut poll, &mut a, &mut b, |_, eb| eb.contains(&expected));

        a.close();
        let deactivated = AgentEvent::StateChanged(StreamState::Deactivated);
        run_until(&mut poll, &mut a, &mut b, |_, eb| eb.contains(&deactivated));
    }

    #[test]
    fn test_wrong_password_never_connects() {
        let mut poll = Poll::new().unwrap();
        let io = Rc::new(IoContext::new(poll.registry().try_clone().unwrap()));
        let options = SessionOptions {
            ice_timeout_ms: 300,
            ..SessionOptions::loopback()
        };
        let mut a = UdpIceAgent::new(io.clone(), 1, true, &options).unwrap();
        let mut b = UdpIceAgent::new(io, 1, false, &options).unwrap();

        let b_candidates = b.gather_candidates().unwrap();
        let forged = IceCredentials {
            ufrag: b.credentials().ufrag.clone(),
            pwd: "not-the-password".to_string(),
        };
        a.set_remote(b_candidates, forged).unwrap();

        let failed = AgentEvent::StateChanged(StreamState::Failed);
        run_until(&mut poll, &mut a, &mut b, |ea, _| ea.contains(&failed));
        assert!(a.selected_address().is_none());
    }
}
