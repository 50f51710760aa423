//! Streams: the typed transports of a session
//!
//! Each component of a stream is its own path through the layers below,
//! selected by the stream options:
//!
//! ```text
//!   StreamHandler ◄── stream_data ───────────────┐
//!   StreamHandler ◄── channel_* ── Multiplexer ◄─┤  (MULTIPLEXING)
//!                     PortForwarder ◄────────────┤  (PORT_FORWARDING)
//!                                                │
//!                                  ReliableLink ◄┤  (RELIABLE)
//!                                        Cipher ◄┤  (ENCRYPT)
//!                                      IceAgent ◄┘
//! ```
//!
//! The stream state is the least advanced component state. It moves one
//! step at a time through `Initialized → CandidateGathered → IceReady →
//! Negotiating → Connected` and ends in `Closed`, `Deactivated` or `Failed`.

use std::fmt;
use std::net::SocketAddr;
use std::ops::BitOr;
use std::rc::Rc;
use std::str::FromStr;
use std::time::Instant;

use crate::crypto::Cipher;
use crate::error::{Error, Result};
use crate::ice::{AgentEvent, IceAgent, IceCredentials};
use crate::io::IoContext;
use crate::mux::{ChannelObserver, ChannelState, CloseReason, Frame, Multiplexer};
use crate::reliable::ReliableLink;
use crate::sdp::MediaDescription;
use crate::services::{is_forwarding_cookie, PortForwardingProtocol, ServiceRegistry};
use crate::tunnel::{PortForwarder, LINK_BACKLOG_LIMIT};
use crate::MAX_RECORD_SIZE;

// ============================================================================
// Constants
// ============================================================================

/// Components per stream
pub const MAX_COMPONENTS: usize = 4;

// ============================================================================
// Stream attributes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Initialized,
    CandidateGathered,
    IceReady,
    Negotiating,
    Connected,
    Closed,
    Deactivated,
    Failed,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamState::Closed | StreamState::Deactivated | StreamState::Failed
        )
    }

    /// Position on the way to `Connected`
    fn progress(&self) -> Option<u8> {
        match self {
            StreamState::Initialized => Some(0),
            StreamState::CandidateGathered => Some(1),
            StreamState::IceReady => Some(2),
            StreamState::Negotiating => Some(3),
            StreamState::Connected => Some(4),
            _ => None,
        }
    }

    fn next(&self) -> Option<StreamState> {
        match self {
            StreamState::Initialized => Some(StreamState::CandidateGathered),
            StreamState::CandidateGathered => Some(StreamState::IceReady),
            StreamState::IceReady => Some(StreamState::Negotiating),
            StreamState::Negotiating => Some(StreamState::Connected),
            _ => None,
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Initialized => "initialized",
            StreamState::CandidateGathered => "candidate_gathered",
            StreamState::IceReady => "ice_ready",
            StreamState::Negotiating => "negotiating",
            StreamState::Connected => "connected",
            StreamState::Closed => "closed",
            StreamState::Deactivated => "deactivated",
            StreamState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Informational only; matched by position during `start`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Audio,
    Video,
    Text,
    Application,
    Message,
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamType::Audio => "audio",
            StreamType::Video => "video",
            StreamType::Text => "text",
            StreamType::Application => "application",
            StreamType::Message => "message",
        };
        f.write_str(name)
    }
}

impl FromStr for StreamType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "audio" => Ok(StreamType::Audio),
            "video" => Ok(StreamType::Video),
            "text" => Ok(StreamType::Text),
            "application" => Ok(StreamType::Application),
            "message" => Ok(StreamType::Message),
            other => Err(Error::InvalidArgument(format!("stream type '{}'", other))),
        }
    }
}

/// Option bitset of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamOptions(u8);

impl StreamOptions {
    pub const ENCRYPT: StreamOptions = StreamOptions(0x01);
    pub const RELIABLE: StreamOptions = StreamOptions(0x02);
    pub const MULTIPLEXING: StreamOptions = StreamOptions(0x04);
    pub const PORT_FORWARDING: StreamOptions = StreamOptions(0x08);

    const ALL: u8 = 0x0f;

    pub fn from_bits(bits: u8) -> Result<Self> {
        if bits & !Self::ALL != 0 {
            return Err(Error::InvalidArgument(format!("stream options {:#04x}", bits)));
        }
        Ok(StreamOptions(bits))
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, other: StreamOptions) -> bool {
        self.0 & other.0 == other.0
    }

    /// Multiplexing needs ordered delivery; forwarding needs channels
    pub fn validate(&self) -> Result<()> {
        if self.contains(Self::MULTIPLEXING) && !self.contains(Self::RELIABLE) {
            return Err(Error::InvalidArgument(
                "multiplexing requires the reliable option".to_string(),
            ));
        }
        if self.contains(Self::PORT_FORWARDING) && !self.contains(Self::MULTIPLEXING) {
            return Err(Error::InvalidArgument(
                "port forwarding requires the multiplexing option".to_string(),
            ));
        }
        Ok(())
    }
}

impl BitOr for StreamOptions {
    type Output = StreamOptions;

    fn bitor(self, rhs: StreamOptions) -> StreamOptions {
        StreamOptions(self.0 | rhs.0)
    }
}

// ============================================================================
// Application callbacks
// ============================================================================

/// Events of one stream, delivered from the event loop
///
/// A multiplexing stream reports only the `channel_*` events; any other
/// stream reports only `stream_data`. Channels carrying port forwardings
/// are handled inside the engine and never show up here.
pub trait StreamHandler {
    fn state_changed(&mut self, _stream: u32, _state: StreamState) {}

    fn stream_data(&mut self, _stream: u32, _component: u8, _data: &[u8]) {}

    /// The peer opens a channel; return true to accept it
    fn channel_open(&mut self, _stream: u32, _component: u8, _channel: u32, _cookie: &str) -> bool {
        false
    }

    fn channel_opened(&mut self, _stream: u32, _component: u8, _channel: u32) {}

    fn channel_close(&mut self, _stream: u32, _component: u8, _channel: u32, _reason: CloseReason) {}

    /// Return false to close the channel with [`CloseReason::Error`]
    fn channel_data(&mut self, _stream: u32, _component: u8, _channel: u32, _data: &[u8]) -> bool {
        true
    }

    fn channel_pending(&mut self, _stream: u32, _component: u8, _channel: u32) {}

    fn channel_resume(&mut self, _stream: u32, _component: u8, _channel: u32) {}
}

/// Splits channel events between the port forwarder and the application
struct ChannelRouter<'a> {
    stream: u32,
    component: u8,
    forwarding: bool,
    handler: &'a mut dyn StreamHandler,
    forwarder: &'a mut PortForwarder,
    services: &'a ServiceRegistry,
}

impl ChannelObserver for ChannelRouter<'_> {
    fn channel_open(&mut self, channel: u32, cookie: &str) -> bool {
        if is_forwarding_cookie(cookie) {
            return self.forwarding
                && self
                    .forwarder
                    .accept_channel(self.component, channel, cookie, self.services);
        }
        self.handler
            .channel_open(self.stream, self.component, channel, cookie)
    }

    fn channel_opened(&mut self, channel: u32) {
        if self.forwarder.owns(self.component, channel) {
            self.forwarder.channel_opened(self.component, channel);
        } else {
            self.handler
                .channel_opened(self.stream, self.component, channel);
        }
    }

    fn channel_close(&mut self, channel: u32, reason: CloseReason) {
        if self.forwarder.owns(self.component, channel) {
            self.forwarder.channel_close(self.component, channel, reason);
        } else {
            self.handler
                .channel_close(self.stream, self.component, channel, reason);
        }
    }

    fn channel_data(&mut self, channel: u32, data: &[u8]) -> bool {
        if self.forwarder.owns(self.component, channel) {
            self.forwarder.channel_data(self.component, channel, data)
        } else {
            self.handler
                .channel_data(self.stream, self.component, channel, data)
        }
    }

    fn channel_pending(&mut self, channel: u32) {
        if self.forwarder.owns(self.component, channel) {
            self.forwarder.channel_pending(self.component, channel);
        } else {
            self.handler
                .channel_pending(self.stream, self.component, channel);
        }
    }

    fn channel_resume(&mut self, channel: u32) {
        if self.forwarder.owns(self.component, channel) {
            self.forwarder.channel_resume(self.component, channel);
        } else {
            self.handler
                .channel_resume(self.stream, self.component, channel);
        }
    }
}

// ============================================================================
// Stream
// ============================================================================

struct Component {
    id: u8,
    agent: Box<dyn IceAgent>,
    link: Option<ReliableLink>,
    mux: Option<Multiplexer>,
    state: StreamState,
}

pub struct Stream {
    id: u32,
    stream_type: StreamType,
    options: StreamOptions,
    credentials: IceCredentials,
    components: Vec<Component>,
    handler: Box<dyn StreamHandler>,
    forwarder: PortForwarder,
    cipher: Option<Cipher>,
    state: StreamState,
    failure: Option<Error>,
    started: bool,
}

impl Stream {
    /// `agents` supplies one agent per component, numbered from 1
    pub fn new(
        id: u32,
        stream_type: StreamType,
        options: StreamOptions,
        agents: Vec<Box<dyn IceAgent>>,
        handler: Box<dyn StreamHandler>,
        io: Rc<IoContext>,
        offerer: bool,
    ) -> Result<Self> {
        options.validate()?;
        if agents.is_empty() || agents.len() > MAX_COMPONENTS {
            return Err(Error::InvalidArgument(format!(
                "{} components (1..={} allowed)",
                agents.len(),
                MAX_COMPONENTS
            )));
        }
        let credentials = agents[0].credentials().clone();

        let components = agents
            .into_iter()
            .map(|agent| Component {
                id: agent.component(),
                state: agent.state(),
                agent,
                link: options
                    .contains(StreamOptions::RELIABLE)
                    .then(ReliableLink::new),
                mux: options
                    .contains(StreamOptions::MULTIPLEXING)
                    .then(|| Multiplexer::new(offerer)),
            })
            .collect();

        Ok(Self {
            id,
            stream_type,
            options,
            credentials,
            components,
            handler,
            forwarder: PortForwarder::new(io),
            cipher: None,
            state: StreamState::Initialized,
            failure: None,
            started: false,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn set_stream_type(&mut self, stream_type: StreamType) {
        self.stream_type = stream_type;
    }

    pub fn options(&self) -> StreamOptions {
        self.options
    }

    pub fn component_count(&self) -> u8 {
        self.components.len() as u8
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// The error that failed the stream, if one did
    pub fn failure(&self) -> Option<&Error> {
        self.failure.as_ref()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    fn component_mut(&mut self, component: u8) -> Result<&mut Component> {
        let count = self.components.len();
        component
            .checked_sub(1)
            .and_then(|i| self.components.get_mut(i as usize))
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "component {} (stream has {})",
                    component, count
                ))
            })
    }

    fn mux_mut(&mut self, component: u8) -> Result<&mut Multiplexer> {
        if self.state.is_terminal() {
            return Err(Error::NotReady);
        }
        if !self.options.contains(StreamOptions::MULTIPLEXING) {
            return Err(Error::WrongState("stream is not multiplexing".to_string()));
        }
        let c = self.component_mut(component)?;
        if c.state != StreamState::Connected {
            return Err(Error::NotReady);
        }
        c.mux.as_mut().ok_or(Error::NotReady)
    }

    // ------------------------------------------------------------------------
    // Negotiation
    // ------------------------------------------------------------------------

    /// Gather candidates and describe this stream for the SDP
    pub fn local_description(&mut self) -> Result<MediaDescription> {
        let mut candidates = Vec::new();
        for c in self.components.iter_mut() {
            candidates.extend(c.agent.gather_candidates()?);
        }
        Ok(MediaDescription {
            stream_id: self.id,
            stream_type: self.stream_type,
            options: self.options,
            components: self.component_count(),
            credentials: self.credentials.clone(),
            candidates,
        })
    }

    /// Begin connectivity checks against the peer's description
    pub fn start(&mut self, remote: &MediaDescription, cipher: Option<Cipher>) -> Result<()> {
        if self.started {
            return Err(Error::AlreadyRun);
        }
        if remote.components != self.component_count() {
            return Err(Error::InvalidArgument(format!(
                "stream {}: peer has {} components, we have {}",
                self.id,
                remote.components,
                self.component_count()
            )));
        }
        if remote.options != self.options {
            return Err(Error::InvalidArgument(format!(
                "stream {}: peer options {:#04x} differ from {:#04x}",
                self.id,
                remote.options.bits(),
                self.options.bits()
            )));
        }
        if self.options.contains(StreamOptions::ENCRYPT) && cipher.is_none() {
            return Err(Error::EncryptionFailure);
        }

        for c in self.components.iter_mut() {
            let candidates = remote
                .candidates
                .iter()
                .filter(|cand| cand.component == c.id)
                .cloned()
                .collect();
            c.agent.set_remote(candidates, remote.credentials.clone())?;
        }
        self.cipher = cipher;
        self.started = true;
        log::info!(
            "Stream {} ({}) started with peer stream {}",
            self.id,
            self.stream_type,
            remote.stream_id
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Data
    // ------------------------------------------------------------------------

    /// Send raw data on a non-multiplexing stream
    pub fn write(&mut self, component: u8, data: &[u8]) -> Result<usize> {
        if self.options.contains(StreamOptions::MULTIPLEXING) {
            return Err(Error::WrongState(
                "write on a multiplexing stream; use channels".to_string(),
            ));
        }
        if data.len() > MAX_RECORD_SIZE {
            return Err(Error::InvalidArgument(format!(
                "{} bytes exceeds record limit {}",
                data.len(),
                MAX_RECORD_SIZE
            )));
        }
        if self.state.is_terminal() {
            return Err(Error::NotReady);
        }
        let cipher = self.cipher.clone();
        let c = self.component_mut(component)?;
        if c.state != StreamState::Connected {
            return Err(Error::NotReady);
        }

        match c.link.as_mut() {
            Some(link) => {
                if link.backlog() >= LINK_BACKLOG_LIMIT {
                    return Err(Error::Busy);
                }
                link.send(data.to_vec());
                Ok(data.len())
            }
            None => {
                transmit(c, cipher.as_ref(), data)?;
                Ok(data.len())
            }
        }
    }

    pub fn open_channel(&mut self, component: u8, cookie: &str) -> Result<u32> {
        if is_forwarding_cookie(cookie) {
            return Err(Error::InvalidArgument(format!(
                "cookie '{}' is reserved for port forwarding",
                cookie
            )));
        }
        self.mux_mut(component)?.open_channel(cookie)
    }

    pub fn write_channel(&mut self, component: u8, channel: u32, data: &[u8]) -> Result<usize> {
        self.check_app_channel(component, channel)?;
        self.mux_mut(component)?.write_channel(channel, data)
    }

    pub fn pend_channel(&mut self, component: u8, channel: u32) -> Result<()> {
        self.check_app_channel(component, channel)?;
        self.mux_mut(component)?.pend_channel(channel)
    }

    pub fn resume_channel(&mut self, component: u8, channel: u32) -> Result<()> {
        self.check_app_channel(component, channel)?;
        self.mux_mut(component)?.resume_channel(channel)
    }

    /// Close a channel; no `channel_close` callback follows
    pub fn close_channel(&mut self, component: u8, channel: u32, reason: CloseReason) -> Result<()> {
        self.check_app_channel(component, channel)?;
        self.mux_mut(component)?.close_channel(channel, reason)
    }

    pub fn channel_state(&mut self, component: u8, channel: u32) -> Result<ChannelState> {
        self.check_app_channel(component, channel)?;
        let c = self.component_mut(component)?;
        match c.mux.as_ref() {
            Some(mux) => mux.channel_state(channel),
            None => Err(Error::WrongState("stream is not multiplexing".to_string())),
        }
    }

    /// Tunnel channels are not the application's to touch
    fn check_app_channel(&self, component: u8, channel: u32) -> Result<()> {
        if self.forwarder.owns(component, channel) {
            return Err(Error::NotExist(format!("channel {}", channel)));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Port forwarding
    // ------------------------------------------------------------------------

    pub fn supports_forwarding(&self) -> bool {
        self.options.contains(StreamOptions::PORT_FORWARDING)
    }

    pub fn open_port_forwarding(
        &mut self,
        pfid: u32,
        component: u8,
        service: &str,
        protocol: PortForwardingProtocol,
        bind: SocketAddr,
    ) -> Result<SocketAddr> {
        if !self.supports_forwarding() {
            return Err(Error::WrongState(format!(
                "stream {} does not allow port forwarding",
                self.id
            )));
        }
        self.mux_mut(component)?;
        let mux = self.components[component as usize - 1]
            .mux
            .as_mut()
            .ok_or(Error::NotReady)?;
        self.forwarder
            .open(pfid, component, service, protocol, bind, mux)
    }

    pub fn close_port_forwarding(&mut self, pfid: u32) -> Result<()> {
        let component = self
            .forwarder
            .forwarding_component(pfid)
            .ok_or_else(|| Error::NotExist(format!("port forwarding {}", pfid)))?;
        let index = component as usize - 1;
        let mux = self.components.get_mut(index).and_then(|c| c.mux.as_mut());
        self.forwarder.close_forwarding(pfid, mux)
    }

    pub fn has_port_forwarding(&self, pfid: u32) -> bool {
        self.forwarder.has_forwarding(pfid)
    }

    pub fn port_forwarding_address(&self, pfid: u32) -> Option<SocketAddr> {
        self.forwarder.forwarding_address(pfid)
    }

    // ------------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------------

    /// Process input, timers and tunnels of every component
    pub fn drive(&mut self, now: Instant, services: &ServiceRegistry) {
        if self.state.is_terminal() {
            return;
        }
        for index in 0..self.components.len() {
            let events = self.components[index].agent.drive(now);
            for event in events {
                match event {
                    AgentEvent::StateChanged(state) => {
                        self.components[index].state = state;
                        self.update_state(services);
                    }
                    AgentEvent::Received(datagram) => self.receive(index, datagram, services),
                }
                if self.state.is_terminal() {
                    return;
                }
            }
            self.flush(index, now, services);
            if self.state.is_terminal() {
                return;
            }
        }
    }

    fn receive(&mut self, index: usize, datagram: Vec<u8>, services: &ServiceRegistry) {
        let plaintext = match self.cipher.as_ref().map(|c| c.open(&datagram)) {
            None => datagram,
            Some(Ok(p)) => p,
            Some(Err(e)) => {
                log::warn!(
                    "Stream {} component {}: payload failed to decrypt",
                    self.id,
                    self.components[index].id
                );
                self.fail_component(index, e, services);
                return;
            }
        };

        let component = &mut self.components[index];
        let records = match component.link.as_mut() {
            Some(link) => match link.receive(&plaintext) {
                Ok(records) => records,
                Err(e) => {
                    log::trace!("Stream {}: bad reliable packet: {}", self.id, e);
                    return;
                }
            },
            None => vec![plaintext],
        };

        for record in records {
            let component = &mut self.components[index];
            match component.mux.as_mut() {
                Some(mux) => match Frame::decode(&record) {
                    Ok(frame) => {
                        let mut router = ChannelRouter {
                            stream: self.id,
                            component: component.id,
                            forwarding: self.options.contains(StreamOptions::PORT_FORWARDING),
                            handler: self.handler.as_mut(),
                            forwarder: &mut self.forwarder,
                            services,
                        };
                        mux.handle_frame(frame, &mut router);
                    }
                    Err(e) => log::warn!("Stream {}: bad channel frame: {}", self.id, e),
                },
                None => self.handler.stream_data(self.id, component.id, &record),
            }
        }
    }

    /// Move tunnel bytes and queued frames onto the wire
    fn flush(&mut self, index: usize, now: Instant, services: &ServiceRegistry) {
        let component = &mut self.components[index];
        if component.state != StreamState::Connected {
            return;
        }

        if let Some(mux) = component.mux.as_mut() {
            let backlog = component.link.as_ref().map_or(0, ReliableLink::backlog);
            self.forwarder.drive(component.id, mux, backlog);
            if let Some(link) = component.link.as_mut() {
                for frame in mux.take_outbox() {
                    link.send(frame.encode());
                }
            }
        }

        let packets = match component.link.as_mut() {
            Some(link) if link.is_failed() => None,
            Some(link) => Some(link.poll_transmit(now)),
            None => Some(Vec::new()),
        };
        let packets = match packets {
            Some(p) => p,
            None => {
                log::warn!(
                    "Stream {} component {}: peer stopped acknowledging",
                    self.id,
                    component.id
                );
                component.state = StreamState::Deactivated;
                self.update_state(services);
                return;
            }
        };

        for packet in packets {
            if let Err(e) = transmit(component, self.cipher.as_ref(), &packet) {
                log::debug!("Stream {} component {}: send failed: {}", self.id, component.id, e);
            }
        }
    }

    fn fail_component(&mut self, index: usize, error: Error, services: &ServiceRegistry) {
        self.components[index].state = StreamState::Failed;
        if self.failure.is_none() {
            self.failure = Some(error);
        }
        self.update_state(services);
    }

    /// Least advanced component state; any lost path ends the stream
    fn aggregate(&self) -> StreamState {
        let mut lowest = StreamState::Connected;
        for c in &self.components {
            match c.state {
                StreamState::Failed => return StreamState::Failed,
                StreamState::Closed | StreamState::Deactivated => {
                    return if self.state == StreamState::Connected {
                        StreamState::Deactivated
                    } else {
                        StreamState::Failed
                    };
                }
                state => {
                    if state.progress() < lowest.progress() {
                        lowest = state;
                    }
                }
            }
        }
        lowest
    }

    fn update_state(&mut self, services: &ServiceRegistry) {
        if self.state.is_terminal() {
            return;
        }
        let target = self.aggregate();

        if target.is_terminal() {
            if target == StreamState::Failed && self.failure.is_none() {
                self.failure = Some(if self.started {
                    Error::Timeout
                } else {
                    Error::NotReady
                });
            }
            self.set_state(target);
            self.teardown(CloseReason::Error, services);
            return;
        }

        while self.state.progress() < target.progress() {
            match self.state.next() {
                Some(next) => self.set_state(next),
                None => break,
            }
        }
    }

    fn set_state(&mut self, state: StreamState) {
        log::info!("Stream {}: {} -> {}", self.id, self.state, state);
        self.state = state;
        self.handler.state_changed(self.id, state);
    }

    /// Report open channels, drop tunnels and release every path
    fn teardown(&mut self, reason: CloseReason, services: &ServiceRegistry) {
        let forwarding = self.options.contains(StreamOptions::PORT_FORWARDING);
        for component in self.components.iter_mut() {
            if let Some(mux) = component.mux.as_mut() {
                let mut router = ChannelRouter {
                    stream: self.id,
                    component: component.id,
                    forwarding,
                    handler: self.handler.as_mut(),
                    forwarder: &mut self.forwarder,
                    services,
                };
                mux.close_all(reason, &mut router);

                // Best effort: let the peer see the CLOSE frames
                if component.state == StreamState::Connected {
                    if let Some(link) = component.link.as_mut() {
                        for frame in mux.take_outbox() {
                            link.send(frame.encode());
                        }
                        for packet in link.poll_transmit(Instant::now()) {
                            if let Err(e) = transmit(component, self.cipher.as_ref(), &packet) {
                                log::warn!(
                                    "Stream {}/{}: closing frames not sent: {}",
                                    self.id,
                                    component.id,
                                    e
                                );
                                break;
                            }
                        }
                    }
                }
            }
        }
        self.forwarder.shutdown();
        for component in self.components.iter_mut() {
            component.agent.close();
        }
    }

    /// Close the stream: live channels are reported closed, then the state
    pub fn close(&mut self, services: &ServiceRegistry) {
        if self.state.is_terminal() {
            for component in self.components.iter_mut() {
                component.agent.close();
            }
            return;
        }
        self.teardown(CloseReason::Normal, services);
        self.set_state(StreamState::Closed);
    }
}

fn transmit(component: &mut Component, cipher: Option<&Cipher>, payload: &[u8]) -> Result<usize> {
    match cipher {
        Some(cipher) => {
            let sealed = cipher.seal(payload)?;
            component.agent.send(&sealed)
        }
        None => component.agent.send(payload),
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("type", &self.stream_type)
            .field("options", &self.options)
            .field("components", &self.components.len())
            .field("state", &self.state)
            .finish()
    }
}
