//! Node driver: offers or answers sessions and wires up forwardings
//!
//! Every session carries one application stream with port forwarding
//! enabled. The offering node opens its configured forwardings once the
//! stream connects; the answering side serves its exported services.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use whisper_session::{
    CloseReason, RelayTransport, SessionManager, SessionRequestHandler, SessionResponse,
    SessionRole, SharedSecretCrypto, StreamHandler, StreamOptions, StreamState, StreamType,
    STATUS_OK,
};

use crate::config::NodeConfig;

// ============================================================================
// Constants
// ============================================================================

/// Upper bound on one poll, so shutdown is noticed
const TICK: Duration = Duration::from_millis(100);

/// Options of the stream every session carries
fn stream_options() -> StreamOptions {
    StreamOptions::ENCRYPT
        | StreamOptions::RELIABLE
        | StreamOptions::MULTIPLEXING
        | StreamOptions::PORT_FORWARDING
}

type Outcome = Rc<RefCell<Option<whisper_session::Result<SessionResponse>>>>;

// ============================================================================
// Callbacks
// ============================================================================

/// Queues inbound requests; they are answered between polls
struct RequestQueue(Rc<RefCell<VecDeque<String>>>);

impl SessionRequestHandler for RequestQueue {
    fn on_request(&mut self, from: &str, _sdp: &str) -> bool {
        log::info!("Session request from '{}'", from);
        self.0.borrow_mut().push_back(from.to_string());
        true
    }
}

struct StreamLog {
    peer: String,
}

impl StreamHandler for StreamLog {
    fn state_changed(&mut self, stream: u32, state: StreamState) {
        log::info!("[{}] stream {} {}", self.peer, stream, state);
    }

    fn stream_data(&mut self, stream: u32, component: u8, data: &[u8]) {
        log::debug!(
            "[{}] stream {}/{}: {} bytes ignored",
            self.peer,
            stream,
            component,
            data.len()
        );
    }

    fn channel_open(&mut self, stream: u32, _component: u8, channel: u32, cookie: &str) -> bool {
        log::info!(
            "[{}] stream {}: refusing channel {} ('{}')",
            self.peer,
            stream,
            channel,
            cookie
        );
        false
    }

    fn channel_close(&mut self, stream: u32, _component: u8, channel: u32, reason: CloseReason) {
        log::debug!(
            "[{}] stream {}: channel {} closed ({:?})",
            self.peer,
            stream,
            channel,
            reason
        );
    }
}

// ============================================================================
// Node
// ============================================================================

/// The session we offered
struct Outbound {
    peer: String,
    stream: u32,
    response: Outcome,
    forwarding: bool,
}

pub struct Node {
    config: NodeConfig,
    manager: SessionManager,
    requests: Rc<RefCell<VecDeque<String>>>,
    outbound: Option<Outbound>,
    /// Answered sessions, as `(peer, stream)`
    answered: Vec<(String, u32)>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let transport = RelayTransport::new(&config.id, config.relay_addr()?)?;
        let crypto = Rc::new(SharedSecretCrypto::new(&config.id, config.secret.as_bytes()));
        let mut manager = SessionManager::new(
            &config.id,
            config.session.clone(),
            Box::new(transport),
            crypto,
        )?;

        let requests = Rc::new(RefCell::new(VecDeque::new()));
        manager.set_request_handler(Box::new(RequestQueue(requests.clone())));

        Ok(Node {
            config,
            manager,
            requests,
            outbound: None,
            answered: Vec::new(),
        })
    }

    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(peer) = self.config.connect.clone() {
            self.offer(&peer)?;
        }

        let result = loop {
            if shutdown.load(Ordering::Relaxed) {
                log::info!("Shutting down");
                break Ok(());
            }
            if let Err(e) = self.step() {
                break Err(e);
            }
        };

        self.manager.cleanup();
        result
    }

    fn step(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.manager.poll(Some(TICK))?;

        let pending: Vec<String> = self.requests.borrow_mut().drain(..).collect();
        for peer in pending {
            if let Err(e) = self.answer(&peer) {
                log::warn!("Could not answer '{}': {}", peer, e);
                if let Err(e) = self.manager.close_session(&peer) {
                    log::debug!("Closing session with '{}': {}", peer, e);
                }
            }
        }

        self.reap_answered();
        self.drive_outbound()
    }

    // ========================================================================
    // Offering side
    // ========================================================================

    fn offer(&mut self, peer: &str) -> Result<(), Box<dyn std::error::Error>> {
        log::info!("Offering a session to '{}'", peer);
        let session = self.manager.new_session(peer, SessionRole::Offerer)?;
        let stream = session.add_stream(
            StreamType::Application,
            stream_options(),
            1,
            Box::new(StreamLog {
                peer: peer.to_string(),
            }),
        )?;
        for spec in &self.config.services {
            session.add_service(&spec.name, spec.protocol, &spec.host, spec.port)?;
        }

        let response: Outcome = Rc::default();
        let sink = response.clone();
        session.request(Box::new(move |r| *sink.borrow_mut() = Some(r)))?;

        self.outbound = Some(Outbound {
            peer: peer.to_string(),
            stream,
            response,
            forwarding: false,
        });
        Ok(())
    }

    fn drive_outbound(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let out = match self.outbound.as_mut() {
            Some(o) => o,
            None => return Ok(()),
        };
        let session = match self.manager.session(&out.peer) {
            Some(s) => s,
            None => return Err(format!("session to '{}' is gone", out.peer).into()),
        };

        let response = out.response.borrow_mut().take();
        if let Some(response) = response {
            let response = response?;
            if !response.is_success() {
                return Err(format!(
                    "'{}' declined the session: {} {}",
                    out.peer,
                    response.status,
                    response.reason.unwrap_or_default()
                )
                .into());
            }
            let sdp = response
                .sdp
                .ok_or_else(|| format!("'{}' answered without a description", out.peer))?;
            session.start(&sdp)?;
        }

        let state = session.stream_state(out.stream)?;
        if state.is_terminal() {
            return Err(format!("stream to '{}' ended: {}", out.peer, state).into());
        }
        if state != StreamState::Connected || out.forwarding {
            return Ok(());
        }

        out.forwarding = true;
        for spec in &self.config.forwards {
            let pfid = session.open_port_forwarding(
                out.stream,
                1,
                &spec.name,
                spec.protocol,
                Some(&spec.host),
                spec.port,
            )?;
            log::info!(
                "Forwarding {} {} -> '{}' service '{}'",
                spec.protocol,
                session.port_forwarding_address(pfid)?,
                out.peer,
                spec.name
            );
        }
        Ok(())
    }

    // ========================================================================
    // Answering side
    // ========================================================================

    fn answer(&mut self, peer: &str) -> Result<(), Box<dyn std::error::Error>> {
        let session = self.manager.new_session(peer, SessionRole::Answerer)?;
        let stream = session.add_stream(
            StreamType::Application,
            stream_options(),
            1,
            Box::new(StreamLog {
                peer: peer.to_string(),
            }),
        )?;
        for spec in &self.config.services {
            session.add_service(&spec.name, spec.protocol, &spec.host, spec.port)?;
        }

        session.reply_request(STATUS_OK, None)?;
        let offer = session
            .remote_offer()
            .ok_or_else(|| format!("no offer from '{}'", peer))?
            .to_string();
        session.start(&offer)?;

        log::info!("Answered '{}'", peer);
        self.answered.push((peer.to_string(), stream));
        Ok(())
    }

    /// Release answered sessions whose stream ended, so the peer can return
    fn reap_answered(&mut self) {
        let manager = &mut self.manager;
        self.answered.retain(|(peer, stream)| {
            let ended = match manager.session(peer) {
                Some(s) => s.stream_state(*stream).map_or(true, |st| st.is_terminal()),
                None => return false,
            };
            if ended {
                log::info!("Session with '{}' ended", peer);
                if let Err(e) = manager.close_session(peer) {
                    log::debug!("Closing session with '{}': {}", peer, e);
                }
            }
            !ended
        });
    }
}
