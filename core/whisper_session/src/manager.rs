//! Process-wide registry of sessions and the event loop that drives them

use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::{Events, Poll};

use crate::config::SessionOptions;
use crate::crypto::CryptoProvider;
use crate::error::{Error, Result};
use crate::io::{IoContext, TRANSPORT_TOKEN};
use crate::session::{Session, SessionRole};
use crate::signaling::{decode_message, encode_message, SessionMessage, STATUS_REFUSED};
use crate::transport::MessageTransport;

// ============================================================================
// Constants
// ============================================================================

/// Longest a single `poll` waits; timers are checked at least this often
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Maximum length of each part of a peer id
pub const MAX_ID_LEN: usize = 45;

const EVENTS_CAPACITY: usize = 1024;

// ============================================================================
// Peer ids
// ============================================================================

/// `userid` or `userid@nodeid`, each part 1..=45 ASCII letters and digits
pub fn validate_peer_id(id: &str) -> Result<()> {
    let valid_part =
        |p: &str| !p.is_empty() && p.len() <= MAX_ID_LEN && p.chars().all(|c| c.is_ascii_alphanumeric());
    let valid = match id.split_once('@') {
        Some((user, node)) => valid_part(user) && valid_part(node),
        None => valid_part(id),
    };
    if !valid {
        return Err(Error::InvalidArgument(format!("peer id '{}'", id)));
    }
    Ok(())
}

// ============================================================================
// Manager
// ============================================================================

/// Decides on inbound session requests
pub trait SessionRequestHandler {
    /// Return true to take the request; the application then creates an
    /// answerer session for `from` and calls `reply_request` on it
    fn on_request(&mut self, from: &str, sdp: &str) -> bool;
}

struct PendingRequest {
    tid: u64,
    sdp: String,
    received: Instant,
}

pub struct SessionManager {
    local_id: String,
    options: SessionOptions,
    poll: Poll,
    events: Events,
    io: Rc<IoContext>,
    transport: Box<dyn MessageTransport>,
    crypto: Rc<dyn CryptoProvider>,
    sessions: HashMap<String, Session>,
    /// Accepted requests waiting for `new_session`
    pending: HashMap<String, PendingRequest>,
    handler: Option<Box<dyn SessionRequestHandler>>,
}

impl SessionManager {
    pub fn new(
        local_id: &str,
        options: SessionOptions,
        mut transport: Box<dyn MessageTransport>,
        crypto: Rc<dyn CryptoProvider>,
    ) -> Result<Self> {
        validate_peer_id(local_id)?;
        options.validate()?;

        let poll = Poll::new()?;
        transport.register(poll.registry(), TRANSPORT_TOKEN)?;
        let io = Rc::new(IoContext::new(poll.registry().try_clone()?));

        log::info!("Session manager for '{}' ready", local_id);
        Ok(Self {
            local_id: local_id.to_string(),
            options,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            io,
            transport,
            crypto,
            sessions: HashMap::new(),
            pending: HashMap::new(),
            handler: None,
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn set_request_handler(&mut self, handler: Box<dyn SessionRequestHandler>) {
        self.handler = Some(handler);
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    /// Create a session with `peer`; an answerer adopts a waiting request
    pub fn new_session(&mut self, peer: &str, role: SessionRole) -> Result<&mut Session> {
        validate_peer_id(peer)?;
        if peer == self.local_id {
            return Err(Error::InvalidArgument("session with self".to_string()));
        }
        if self.sessions.get(peer).map_or(false, |s| !s.is_closed()) {
            return Err(Error::AlreadyExist(format!("session with {}", peer)));
        }

        let mut session = Session::new(
            &self.local_id,
            peer,
            role,
            self.options.clone(),
            self.io.clone(),
            self.crypto.clone(),
        );
        if role == SessionRole::Answerer {
            if let Some(request) = self.pending.remove(peer) {
                session.adopt_request(request.tid, request.sdp);
            }
        }

        self.sessions.insert(peer.to_string(), session);
        self.sessions
            .get_mut(peer)
            .ok_or_else(|| Error::NotExist(format!("session with {}", peer)))
    }

    pub fn session(&mut self, peer: &str) -> Option<&mut Session> {
        self.sessions.get_mut(peer).filter(|s| !s.is_closed())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.values().filter(|s| !s.is_closed()).count()
    }

    pub fn close_session(&mut self, peer: &str) -> Result<()> {
        let mut session = self
            .sessions
            .remove(peer)
            .ok_or_else(|| Error::NotExist(format!("session with {}", peer)))?;
        session.close();
        self.flush_session(&mut session);
        Ok(())
    }

    /// Close every session
    pub fn cleanup(&mut self) {
        let peers: Vec<String> = self.sessions.keys().cloned().collect();
        for peer in peers {
            if let Err(e) = self.close_session(&peer) {
                log::debug!("Closing session with {}: {}", peer, e);
            }
        }
        self.pending.clear();
    }

    // ------------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------------

    /// Inbound signaling from the messaging transport
    pub fn on_message(&mut self, from: &str, bytes: &[u8]) {
        let message = match decode_message(bytes) {
            Ok((message, _)) => message,
            Err(e) => {
                log::warn!("Malformed session message from {}: {}", from, e);
                return;
            }
        };

        match message {
            SessionMessage::Request { tid, sdp } => self.handle_request(from, tid, sdp),
            SessionMessage::Response {
                tid,
                status,
                reason,
                sdp,
            } => match self.sessions.get_mut(from) {
                Some(session) if !session.is_closed() => {
                    session.handle_response(tid, status, reason, sdp)
                }
                _ => log::debug!("Response {:#x} from {} has no session", tid, from),
            },
        }
    }

    fn handle_request(&mut self, from: &str, tid: u64, sdp: String) {
        if validate_peer_id(from).is_err() {
            log::warn!("Session request from invalid peer id '{}' dropped", from);
            return;
        }
        log::info!("Session request {:#x} from {}", tid, from);

        let waiting = match self.sessions.get(from) {
            Some(session) if !session.is_closed() => {
                if !session.awaits_request() {
                    self.reply(from, tid, Error::Busy.status_code(), "busy");
                    return;
                }
                true
            }
            _ => false,
        };

        let accepted = match self.handler.as_mut() {
            Some(handler) => handler.on_request(from, &sdp),
            None => false,
        };
        if !accepted {
            self.reply(from, tid, STATUS_REFUSED, "refused");
            return;
        }

        match self.sessions.get_mut(from) {
            Some(session) if waiting => session.adopt_request(tid, sdp),
            _ => {
                self.pending.insert(
                    from.to_string(),
                    PendingRequest {
                        tid,
                        sdp,
                        received: Instant::now(),
                    },
                );
            }
        }
    }

    fn reply(&mut self, to: &str, tid: u64, status: i32, reason: &str) {
        let message = SessionMessage::Response {
            tid,
            status,
            reason: Some(reason.to_string()),
            sdp: None,
        };
        self.send(to, &message);
        log::info!("Session request {:#x} from {} answered {} ({})", tid, to, status, reason);
    }

    fn send(&mut self, to: &str, message: &SessionMessage) {
        let result = encode_message(message).and_then(|bytes| self.transport.send(to, &bytes));
        if let Err(e) = result {
            log::warn!("Session message to {} not sent: {}", to, e);
        }
    }

    fn flush_session(&mut self, session: &mut Session) {
        for message in session.take_outbox() {
            self.send(session.peer(), &message);
        }
    }

    // ------------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------------

    /// One loop iteration: wait for I/O, then drive every session
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.map_or(POLL_INTERVAL, |t| t.min(POLL_INTERVAL));
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }

        for (from, bytes) in self.transport.receive() {
            self.on_message(&from, &bytes);
        }

        let now = Instant::now();
        let peers: Vec<String> = self.sessions.keys().cloned().collect();
        for peer in peers {
            if let Some(mut session) = self.sessions.remove(&peer) {
                session.drive(now);
                self.flush_session(&mut session);
                if session.is_closed() {
                    log::debug!("Session with {} reaped", peer);
                } else {
                    self.sessions.insert(peer, session);
                }
            }
        }

        let expiry = self.options.request_timeout();
        self.pending.retain(|peer, request| {
            let live = request.received.elapsed() < expiry;
            if !live {
                log::info!("Request {:#x} from {} never answered", request.tid, peer);
            }
            live
        });
        Ok(())
    }

    /// Poll until `done` returns true or `timeout` elapses
    pub fn run_until<F>(&mut self, timeout: Duration, mut done: F) -> Result<bool>
    where
        F: FnMut(&mut SessionManager) -> bool,
    {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            self.poll(Some(POLL_INTERVAL))?;
            if done(self) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SharedSecretCrypto;
    use crate::signaling::STATUS_OK;
    use std::cell::RefCell;

    type Sent = Rc<RefCell<Vec<(String, Vec<u8>)>>>;

    struct Capture(Sent);

    impl MessageTransport for Capture {
        fn send(&mut self, to: &str, message: &[u8]) -> Result<()> {
            self.0.borrow_mut().push((to.to_string(), message.to_vec()));
            Ok(())
        }
        fn receive(&mut self) -> Vec<(String, Vec<u8>)> {
            Vec::new()
        }
    }

    struct Accept(bool);

    impl SessionRequestHandler for Accept {
        fn on_request(&mut self, _from: &str, _sdp: &str) -> bool {
            self.0
        }
    }

    fn manager(id: &str) -> (SessionManager, Sent) {
        let sent: Sent = Rc::default();
        let m = SessionManager::new(
            id,
            SessionOptions::loopback(),
            Box::new(Capture(sent.clone())),
            Rc::new(SharedSecretCrypto::new(id, b"secret")),
        )
        .unwrap();
        (m, sent)
    }

    fn request(tid: u64) -> Vec<u8> {
        encode_message(&SessionMessage::Request {
            tid,
            sdp: "v=0\n".to_string(),
        })
        .unwrap()
    }

    fn last_status(sent: &Sent) -> i32 {
        let (_, bytes) = sent.borrow().last().cloned().unwrap();
        match decode_message(&bytes).unwrap().0 {
            SessionMessage::Response { status, .. } => status,
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_peer_ids() {
        assert!(validate_peer_id("alice").is_ok());
        assert!(validate_peer_id("alice@node7").is_ok());
        assert!(validate_peer_id(&"a".repeat(MAX_ID_LEN)).is_ok());
        for bad in ["", "@node", "alice@", "al ice", "a@b@c", "ünï"] {
            assert!(validate_peer_id(bad).is_err(), "{}", bad);
        }
        assert!(validate_peer_id(&"a".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_new_session_checks() {
        let (mut m, _) = manager("alice");
        assert!(matches!(
            m.new_session("bad id", SessionRole::Offerer),
            Err(Error::InvalidArgument(_))
        ));
        m.new_session("bob", SessionRole::Offerer).unwrap();
        assert!(matches!(
            m.new_session("bob", SessionRole::Offerer),
            Err(Error::AlreadyExist(_))
        ));
        m.close_session("bob").unwrap();
        assert!(m.session("bob").is_none());
        m.new_session("bob", SessionRole::Answerer).unwrap();
        assert_eq!(m.session_count(), 1);
    }

    #[test]
    fn test_request_without_handler_is_refused() {
        let (mut m, sent) = manager("alice");
        m.on_message("bob", &request(5));
        assert_eq!(last_status(&sent), STATUS_REFUSED);

        m.set_request_handler(Box::new(Accept(false)));
        m.on_message("bob", &request(6));
        assert_eq!(last_status(&sent), STATUS_REFUSED);
    }

    #[test]
    fn test_accepted_request_is_adopted() {
        let (mut m, sent) = manager("alice");
        m.set_request_handler(Box::new(Accept(true)));
        m.on_message("bob", &request(7));
        assert!(sent.borrow().is_empty());

        let session = m.new_session("bob", SessionRole::Answerer).unwrap();
        assert_eq!(session.remote_offer(), Some("v=0\n"));
        session.reply_request(STATUS_OK, None).unwrap();
        m.poll(Some(Duration::from_millis(1))).unwrap();
        assert_eq!(last_status(&sent), STATUS_OK);

        // A second request while the first is in progress
        m.on_message("bob", &request(8));
        assert_eq!(last_status(&sent), Error::Busy.status_code());
    }

    #[test]
    fn test_garbage_and_stray_responses_ignored() {
        let (mut m, sent) = manager("alice");
        m.on_message("bob", b"\x00\x00");
        let stray = encode_message(&SessionMessage::Response {
            tid: 1,
            status: STATUS_OK,
            reason: None,
            sdp: None,
        })
        .unwrap();
        m.on_message("bob", &stray);
        assert!(sent.borrow().is_empty());
    }
}
