//! NAT traversal for stream components
//!
//! - [`candidate`]: candidate types, RFC 8445 priorities, SDP attribute form
//! - [`connectivity`]: authenticated binding checks and the check list
//! - [`agent`]: the [`IceAgent`] contract and its UDP implementation

pub mod agent;
pub mod candidate;
pub mod connectivity;

pub use agent::{AgentEvent, IceAgent, IceCredentials, UdpIceAgent};
pub use candidate::{Candidate, CandidateType};
pub use connectivity::{CandidatePair, CheckList, CheckState};
