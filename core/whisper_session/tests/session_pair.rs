//! Two session managers in one process, talking over loopback UDP
//!
//! Signaling goes through an in-memory bus; every stream byte crosses real
//! sockets, ICE checks included.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use whisper_session::{
    ChannelState, CloseReason, Error, MessageTransport, PortForwardingProtocol, SessionManager, SessionOptions,
    SessionRequestHandler, SessionResponse, SessionRole, SharedSecretCrypto, StreamHandler,
    StreamOptions, StreamState, StreamType, STATUS_OK,
};

const TIMEOUT: Duration = Duration::from_secs(15);

// ============================================================================
// Harness
// ============================================================================

type Mailboxes = Rc<RefCell<HashMap<String, VecDeque<(String, Vec<u8>)>>>>;

struct BusTransport {
    id: String,
    mailboxes: Mailboxes,
}

impl MessageTransport for BusTransport {
    fn send(&mut self, to: &str, message: &[u8]) -> whisper_session::Result<()> {
        self.mailboxes
            .borrow_mut()
            .entry(to.to_string())
            .or_default()
            .push_back((self.id.clone(), message.to_vec()));
        Ok(())
    }

    fn receive(&mut self) -> Vec<(String, Vec<u8>)> {
        self.mailboxes
            .borrow_mut()
            .get_mut(&self.id)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    State(StreamState),
    Data(Vec<u8>),
    ChannelOpen(u32, String),
    ChannelOpened(u32),
    ChannelClose(u32, CloseReason),
    ChannelData(u32, Vec<u8>),
}

type Events = Rc<RefCell<Vec<Event>>>;

struct Recorder {
    events: Events,
    accept_channels: bool,
    accept_data: Rc<Cell<bool>>,
}

impl StreamHandler for Recorder {
    fn state_changed(&mut self, _stream: u32, state: StreamState) {
        self.events.borrow_mut().push(Event::State(state));
    }

    fn stream_data(&mut self, _stream: u32, _component: u8, data: &[u8]) {
        self.events.borrow_mut().push(Event::Data(data.to_vec()));
    }

    fn channel_open(&mut self, _stream: u32, _component: u8, channel: u32, cookie: &str) -> bool {
        self.events
            .borrow_mut()
            .push(Event::ChannelOpen(channel, cookie.to_string()));
        self.accept_channels
    }

    fn channel_opened(&mut self, _stream: u32, _component: u8, channel: u32) {
        self.events.borrow_mut().push(Event::ChannelOpened(channel));
    }

    fn channel_close(&mut self, _stream: u32, _component: u8, channel: u32, reason: CloseReason) {
        self.events
            .borrow_mut()
            .push(Event::ChannelClose(channel, reason));
    }

    fn channel_data(&mut self, _stream: u32, _component: u8, channel: u32, data: &[u8]) -> bool {
        self.events
            .borrow_mut()
            .push(Event::ChannelData(channel, data.to_vec()));
        self.accept_data.get()
    }
}

struct Requests(Rc<RefCell<Vec<String>>>);

impl SessionRequestHandler for Requests {
    fn on_request(&mut self, from: &str, _sdp: &str) -> bool {
        self.0.borrow_mut().push(from.to_string());
        true
    }
}

struct Pair {
    alice: SessionManager,
    bob: SessionManager,
    alice_events: Events,
    bob_events: Events,
    alice_stream: u32,
    bob_accepts_data: Rc<Cell<bool>>,
}

impl Pair {
    fn poll(&mut self) {
        self.alice.poll(Some(Duration::from_millis(1))).unwrap();
        self.bob.poll(Some(Duration::from_millis(1))).unwrap();
    }

    fn pump_until<F: FnMut(&mut Pair) -> bool>(&mut self, done: F) -> bool {
        self.pump_within(TIMEOUT, done)
    }

    fn pump_within<F: FnMut(&mut Pair) -> bool>(&mut self, limit: Duration, mut done: F) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            self.poll();
            if done(self) {
                return true;
            }
        }
        false
    }
}

fn manager(id: &str, options: SessionOptions, mailboxes: &Mailboxes) -> SessionManager {
    SessionManager::new(
        id,
        options,
        Box::new(BusTransport {
            id: id.to_string(),
            mailboxes: mailboxes.clone(),
        }),
        Rc::new(SharedSecretCrypto::new(id, b"shared pair secret")),
    )
    .unwrap()
}

fn connected(events: &Events) -> bool {
    events
        .borrow()
        .contains(&Event::State(StreamState::Connected))
}

/// Negotiate one stream between alice (offerer) and bob (answerer)
fn negotiate(
    stream_type: StreamType,
    options: StreamOptions,
    bob_accepts_channels: bool,
    bob_services: &[(&str, PortForwardingProtocol, u16)],
) -> Pair {
    let (mut pair, answer) = offer_and_answer(
        SessionOptions::loopback(),
        stream_type,
        options,
        bob_accepts_channels,
        bob_services,
    );
    pair.alice.session("bob").unwrap().start(&answer).unwrap();

    assert!(pair.pump_until(|p| connected(&p.alice_events) && connected(&p.bob_events)));
    pair
}

/// Everything up to alice starting with bob's answer, which is returned
fn offer_and_answer(
    session_options: SessionOptions,
    stream_type: StreamType,
    options: StreamOptions,
    bob_accepts_channels: bool,
    bob_services: &[(&str, PortForwardingProtocol, u16)],
) -> (Pair, String) {
    let mailboxes: Mailboxes = Rc::default();
    let mut alice = manager("alice", session_options.clone(), &mailboxes);
    let mut bob = manager("bob", session_options, &mailboxes);
    let requests = Rc::new(RefCell::new(Vec::new()));
    bob.set_request_handler(Box::new(Requests(requests.clone())));

    let alice_events: Events = Rc::default();
    let bob_events: Events = Rc::default();

    let response: Rc<RefCell<Option<whisper_session::Result<SessionResponse>>>> = Rc::default();
    let alice_stream = {
        let session = alice.new_session("bob", SessionRole::Offerer).unwrap();
        let id = session
            .add_stream(
                stream_type,
                options,
                1,
                Box::new(Recorder {
                    events: alice_events.clone(),
                    accept_channels: true,
                    accept_data: Rc::new(Cell::new(true)),
                }),
            )
            .unwrap();
        let sink = response.clone();
        session
            .request(Box::new(move |r| *sink.borrow_mut() = Some(r)))
            .unwrap();
        id
    };

    let mut pair = Pair {
        alice,
        bob,
        alice_events,
        bob_events,
        alice_stream,
        bob_accepts_data: Rc::new(Cell::new(true)),
    };

    assert!(pair.pump_until(|_| !requests.borrow().is_empty()));
    assert_eq!(requests.borrow()[0], "alice");

    {
        let session = pair.bob.new_session("alice", SessionRole::Answerer).unwrap();
        session
            .add_stream(
                stream_type,
                options,
                1,
                Box::new(Recorder {
                    events: pair.bob_events.clone(),
                    accept_channels: bob_accepts_channels,
                    accept_data: pair.bob_accepts_data.clone(),
                }),
            )
            .unwrap();
        for (name, protocol, port) in bob_services {
            session.add_service(name, *protocol, "127.0.0.1", *port).unwrap();
        }
        session.reply_request(STATUS_OK, None).unwrap();
        let offer = session.remote_offer().unwrap().to_string();
        session.start(&offer).unwrap();
    }

    assert!(pair.pump_until(|_| response.borrow().is_some()));
    let answer = response.borrow_mut().take().unwrap().unwrap();
    assert!(answer.is_success());
    (pair, answer.sdp.unwrap())
}

fn open_channels(pair: &mut Pair, cookies: &[&str]) -> Vec<u32> {
    let stream = pair.alice_stream;
    let channels: Vec<u32> = cookies
        .iter()
        .map(|cookie| {
            pair.alice
                .session("bob")
                .unwrap()
                .open_channel(stream, 1, cookie)
                .unwrap()
        })
        .collect();
    assert!(pair.pump_until(|p| {
        let events = p.alice_events.borrow();
        channels
            .iter()
            .all(|c| events.contains(&Event::ChannelOpened(*c)))
    }));
    channels
}

fn forwarding_options() -> StreamOptions {
    StreamOptions::RELIABLE | StreamOptions::MULTIPLEXING | StreamOptions::PORT_FORWARDING
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_reliable_encrypted_audio_stream() {
    let mut pair = negotiate(
        StreamType::Audio,
        StreamOptions::RELIABLE | StreamOptions::ENCRYPT,
        false,
        &[],
    );

    let states: Vec<Event> = pair
        .alice_events
        .borrow()
        .iter()
        .filter(|e| matches!(e, Event::State(_)))
        .cloned()
        .collect();
    assert_eq!(
        states,
        vec![
            Event::State(StreamState::CandidateGathered),
            Event::State(StreamState::IceReady),
            Event::State(StreamState::Negotiating),
            Event::State(StreamState::Connected),
        ]
    );

    let stream = pair.alice_stream;
    let payload = b"hello over whisper".to_vec();
    assert_eq!(
        pair.alice
            .session("bob")
            .unwrap()
            .write(stream, 1, &payload)
            .unwrap(),
        payload.len()
    );
    let expected = Event::Data(payload);
    assert!(pair.pump_until(|p| p.bob_events.borrow().contains(&expected)));
}

#[test]
fn test_refused_channel_reports_normal_close() {
    let mut pair = negotiate(
        StreamType::Application,
        StreamOptions::RELIABLE | StreamOptions::MULTIPLEXING,
        false,
        &[],
    );

    let stream = pair.alice_stream;
    let channel = pair
        .alice
        .session("bob")
        .unwrap()
        .open_channel(stream, 1, "svc:tcp")
        .unwrap();

    let closed = Event::ChannelClose(channel, CloseReason::Normal);
    assert!(pair.pump_until(|p| p.alice_events.borrow().contains(&closed)));
    assert!(!pair
        .alice_events
        .borrow()
        .contains(&Event::ChannelOpened(channel)));
    assert!(pair
        .bob_events
        .borrow()
        .contains(&Event::ChannelOpen(channel, "svc:tcp".to_string())));
}

#[test]
fn test_channel_data_round_trip() {
    let mut pair = negotiate(
        StreamType::Application,
        StreamOptions::RELIABLE | StreamOptions::MULTIPLEXING,
        true,
        &[],
    );

    let stream = pair.alice_stream;
    let channel = pair
        .alice
        .session("bob")
        .unwrap()
        .open_channel(stream, 1, "chat")
        .unwrap();
    assert!(pair.pump_until(|p| p
        .alice_events
        .borrow()
        .contains(&Event::ChannelOpened(channel))));

    let session = pair.alice.session("bob").unwrap();
    let max = whisper_session::mux::MAX_CHANNEL_PAYLOAD;
    session.write_channel(stream, 1, channel, b"").unwrap();
    session
        .write_channel(stream, 1, channel, &vec![0xab; max])
        .unwrap();
    assert!(matches!(
        session.write_channel(stream, 1, channel, &vec![0; max + 1]),
        Err(Error::InvalidArgument(_))
    ));

    let empty = Event::ChannelData(channel, Vec::new());
    let full = Event::ChannelData(channel, vec![0xab; max]);
    assert!(pair.pump_until(|p| p.bob_events.borrow().contains(&full)));
    let events = pair.bob_events.borrow();
    let first = events.iter().position(|e| *e == empty).unwrap();
    let second = events.iter().position(|e| *e == full).unwrap();
    assert!(first < second);
}

#[test]
fn test_session_close_reports_every_channel() {
    let mut pair = negotiate(
        StreamType::Application,
        StreamOptions::RELIABLE | StreamOptions::MULTIPLEXING,
        true,
        &[],
    );

    let stream = pair.alice_stream;
    let mut channels = Vec::new();
    for cookie in ["one", "two", "three"] {
        channels.push(
            pair.alice
                .session("bob")
                .unwrap()
                .open_channel(stream, 1, cookie)
                .unwrap(),
        );
    }
    assert!(pair.pump_until(|p| {
        let events = p.alice_events.borrow();
        channels
            .iter()
            .all(|c| events.contains(&Event::ChannelOpened(*c)))
    }));

    let before = pair.alice_events.borrow().len();
    pair.alice.close_session("bob").unwrap();
    let teardown: Vec<Event> = pair.alice_events.borrow()[before..].to_vec();
    let closes = teardown
        .iter()
        .filter(|e| matches!(e, Event::ChannelClose(..)))
        .count();
    assert_eq!(closes, 3);
    assert_eq!(teardown.last(), Some(&Event::State(StreamState::Closed)));

    // Nothing more for alice; bob loses the path
    let after = pair.alice_events.borrow().len();
    assert!(pair.pump_until(|p| p
        .bob_events
        .borrow()
        .iter()
        .any(|e| matches!(e, Event::State(StreamState::Deactivated)))));
    assert_eq!(pair.alice_events.borrow().len(), after);
    assert!(pair.alice.session("bob").is_none());
}

#[test]
fn test_forwarding_to_unregistered_service() {
    let mut pair = negotiate(StreamType::Application, forwarding_options(), false, &[]);

    let stream = pair.alice_stream;
    let session = pair.alice.session("bob").unwrap();
    assert!(matches!(
        session.open_port_forwarding(stream, 1, "ssh", PortForwardingProtocol::Tcp, None, 0),
        Err(Error::NotExist(_))
    ));
    // No channel was created for it
    assert!(matches!(
        session.channel_state(stream, 1, 1),
        Err(Error::NotExist(_))
    ));
}

#[test]
fn test_forwarding_protocol_mismatch() {
    let mut pair = negotiate(
        StreamType::Application,
        forwarding_options(),
        false,
        &[("dns", PortForwardingProtocol::Udp, 53)],
    );

    let stream = pair.alice_stream;
    let session = pair.alice.session("bob").unwrap();
    assert!(matches!(
        session.open_port_forwarding(stream, 1, "dns", PortForwardingProtocol::Tcp, None, 0),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_tcp_forwarding_echo() {
    let echo = TcpListener::bind("127.0.0.1:0").unwrap();
    let echo_port = echo.local_addr().unwrap().port();
    thread::spawn(move || {
        if let Ok((mut conn, _)) = echo.accept() {
            let mut buf = [0u8; 4096];
            while let Ok(n) = conn.read(&mut buf) {
                if n == 0 || conn.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
        }
    });

    let mut pair = negotiate(
        StreamType::Application,
        forwarding_options(),
        false,
        &[("echo", PortForwardingProtocol::Tcp, echo_port)],
    );

    let stream = pair.alice_stream;
    let session = pair.alice.session("bob").unwrap();
    let pfid = session
        .open_port_forwarding(stream, 1, "echo", PortForwardingProtocol::Tcp, None, 0)
        .unwrap();
    let local = session.port_forwarding_address(pfid).unwrap();

    let message: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let expected = message.clone();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let result = (|| -> std::io::Result<Vec<u8>> {
            let mut client = TcpStream::connect(local)?;
            client.set_read_timeout(Some(TIMEOUT))?;
            client.write_all(&message)?;
            let mut back = vec![0u8; message.len()];
            client.read_exact(&mut back)?;
            Ok(back)
        })();
        let _ = tx.send(result.map_err(|e| e.to_string()));
    });

    let mut echoed = None;
    assert!(pair.pump_until(|_| match rx.try_recv() {
        Ok(r) => {
            echoed = Some(r);
            true
        }
        Err(_) => false,
    }));
    assert_eq!(echoed.unwrap().unwrap(), expected);

    // Tunnel channels never reach the application
    assert!(!pair
        .bob_events
        .borrow()
        .iter()
        .any(|e| matches!(e, Event::ChannelOpen(..))));

    let session = pair.alice.session("bob").unwrap();
    session.close_port_forwarding(pfid).unwrap();
    assert!(matches!(
        session.close_port_forwarding(pfid),
        Err(Error::NotExist(_))
    ));
}

#[test]
fn test_unanswered_checks_fail_with_timeout() {
    let options = SessionOptions {
        ice_timeout_ms: 500,
        ..SessionOptions::loopback()
    };
    let (mut pair, answer) = offer_and_answer(
        options,
        StreamType::Video,
        StreamOptions::default(),
        false,
        &[],
    );
    pair.alice.session("bob").unwrap().start(&answer).unwrap();

    // Bob goes silent: nobody answers alice's checks
    let failed = Event::State(StreamState::Failed);
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline && !pair.alice_events.borrow().contains(&failed) {
        pair.alice.poll(Some(Duration::from_millis(1))).unwrap();
    }
    assert!(pair.alice_events.borrow().contains(&failed));
    assert!(!connected(&pair.alice_events));

    let stream = pair.alice_stream;
    let session = pair.alice.session("bob").unwrap();
    assert_eq!(session.stream_state(stream).unwrap(), StreamState::Failed);
    assert!(matches!(
        session.stream_failure(stream).unwrap(),
        Some(Error::Timeout)
    ));
}

#[test]
fn test_remove_stream_reports_every_channel() {
    let mut pair = negotiate(
        StreamType::Application,
        StreamOptions::RELIABLE | StreamOptions::MULTIPLEXING,
        true,
        &[],
    );
    let channels = open_channels(&mut pair, &["one", "two"]);

    let before = pair.alice_events.borrow().len();
    let stream = pair.alice_stream;
    let session = pair.alice.session("bob").unwrap();
    session.remove_stream(stream).unwrap();
    assert!(matches!(
        session.stream_state(stream),
        Err(Error::NotExist(_))
    ));

    let teardown: Vec<Event> = pair.alice_events.borrow()[before..].to_vec();
    for channel in &channels {
        assert_eq!(
            teardown
                .iter()
                .filter(|e| matches!(e, Event::ChannelClose(c, _) if c == channel))
                .count(),
            1
        );
    }
    assert_eq!(teardown.last(), Some(&Event::State(StreamState::Closed)));

    // Bob hears about each channel too
    assert!(pair.pump_until(|p| {
        let events = p.bob_events.borrow();
        channels.iter().all(|c| {
            events
                .iter()
                .any(|e| matches!(e, Event::ChannelClose(id, _) if id == c))
        })
    }));
}

#[test]
fn test_refused_channel_data_closes_with_error() {
    let mut pair = negotiate(
        StreamType::Application,
        StreamOptions::RELIABLE | StreamOptions::MULTIPLEXING,
        true,
        &[],
    );
    let channel = open_channels(&mut pair, &["chat"])[0];
    pair.bob_accepts_data.set(false);

    let stream = pair.alice_stream;
    pair.alice
        .session("bob")
        .unwrap()
        .write_channel(stream, 1, channel, b"unwanted")
        .unwrap();

    let refused = Event::ChannelClose(channel, CloseReason::Error);
    assert!(pair.pump_until(|p| p.alice_events.borrow().contains(&refused)));
    assert!(pair
        .bob_events
        .borrow()
        .contains(&Event::ChannelData(channel, b"unwanted".to_vec())));
    assert!(pair.bob_events.borrow().contains(&refused));
    assert_eq!(
        pair.alice
            .session("bob")
            .unwrap()
            .channel_state(stream, 1, channel)
            .unwrap(),
        ChannelState::Closed
    );
}

#[test]
fn test_tcp_forwarding_drains_to_slow_reader() {
    const TOTAL: usize = 4 * 1024 * 1024;
    let pattern = |i: usize| (i % 251) as u8;

    // Writes everything at once, then hangs up
    let bulk = TcpListener::bind("127.0.0.1:0").unwrap();
    let bulk_port = bulk.local_addr().unwrap().port();
    thread::spawn(move || {
        if let Ok((mut conn, _)) = bulk.accept() {
            let data: Vec<u8> = (0..TOTAL).map(pattern).collect();
            let _ = conn.write_all(&data);
        }
    });

    let mut pair = negotiate(
        StreamType::Application,
        forwarding_options(),
        false,
        &[("bulk", PortForwardingProtocol::Tcp, bulk_port)],
    );
    let stream = pair.alice_stream;
    let session = pair.alice.session("bob").unwrap();
    let pfid = session
        .open_port_forwarding(stream, 1, "bulk", PortForwardingProtocol::Tcp, None, 0)
        .unwrap();
    let local = session.port_forwarding_address(pfid).unwrap();

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let result = (|| -> std::io::Result<Vec<u8>> {
            let mut client = TcpStream::connect(local)?;
            client.set_read_timeout(Some(Duration::from_secs(60)))?;
            let mut received = Vec::with_capacity(TOTAL);
            let mut buf = [0u8; 8 * 1024];
            loop {
                let n = client.read(&mut buf)?;
                if n == 0 {
                    return Ok(received);
                }
                received.extend_from_slice(&buf[..n]);
                thread::sleep(Duration::from_millis(1));
            }
        })();
        let _ = tx.send(result.map_err(|e| e.to_string()));
    });

    let mut outcome = None;
    assert!(pair.pump_within(Duration::from_secs(120), |_| match rx.try_recv() {
        Ok(r) => {
            outcome = Some(r);
            true
        }
        Err(_) => false,
    }));
    let received = outcome.unwrap().unwrap();
    assert_eq!(received.len(), TOTAL);
    assert!(received.iter().enumerate().all(|(i, b)| *b == pattern(i)));
}
