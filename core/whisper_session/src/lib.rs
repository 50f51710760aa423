//! Whisper session engine
//!
//! Lets two peers identified by opaque ids negotiate direct, NAT-traversed
//! transports, open typed streams over them, and optionally carve a stream
//! into many flow-controlled channels, including TCP/UDP port forwardings.
//!
//! ```text
//!  SessionManager ── mio::Poll ── MessageTransport (signaling)
//!        │
//!        └── Session (per peer) ── SDP offer/answer, service registry
//!               │
//!               └── Stream (≤16) ── StreamHandler callbacks
//!                      │
//!                      └── component (≤4): IceAgent → Cipher → ReliableLink
//!                                                       → Multiplexer → PortForwarder
//! ```
//!
//! Everything runs on the thread that calls [`SessionManager::poll`].
//! Public operations never block; their outcome arrives through the
//! request completion or the [`StreamHandler`] callbacks.

// ============================================================================
// Modules
// ============================================================================

pub mod config;
pub mod crypto;
pub mod error;
pub mod ice;
pub mod io;
pub mod manager;
pub mod mux;
pub mod reliable;
pub mod sdp;
pub mod services;
pub mod session;
pub mod signaling;
pub mod stream;
pub mod transport;
pub mod tunnel;

pub use config::SessionOptions;
pub use crypto::{CryptoProvider, SessionKey, SharedSecretCrypto};
pub use error::{Error, Result};
pub use manager::{validate_peer_id, SessionManager, SessionRequestHandler};
pub use mux::{ChannelState, CloseReason};
pub use services::PortForwardingProtocol;
pub use session::{Session, SessionResponse, SessionRole, SessionState};
pub use signaling::{STATUS_OK, STATUS_REFUSED};
pub use stream::{StreamHandler, StreamOptions, StreamState, StreamType};
pub use transport::{MessageTransport, RelayPacket, RelayTransport};

// ============================================================================
// Constants
// ============================================================================

/// Largest UDP payload an ICE socket sends
pub const MAX_DATAGRAM_SIZE: usize = 1350;

/// Largest record handed to a component, before reliability and encryption headers
pub const MAX_RECORD_SIZE: usize = 1280;
