//! Connectivity checks between candidate pairs
//!
//! ```text
//! Controlling (offerer)                          Controlled (answerer)
//!   │                                                    │
//!   │─── BindingRequest (txn, priority) ────────────────►│
//!   │◄─── BindingResponse (txn, mapped) ─────────────────│
//!   │                                                    │
//!   │   first pair to succeed is nominated               │
//!   │─── BindingRequest (txn', use_candidate) ──────────►│ selects pair
//!   │◄─── BindingResponse (txn') ────────────────────────│
//!   │ selects pair                                       │
//! ```
//!
//! Requests carry `remote_ufrag:local_ufrag` and both directions are
//! authenticated with HMAC-SHA256 keyed by the responder's ICE password.
//!
//! Pair priority (RFC 8445 Section 6.1.2.3), with G the controlling and D the
//! controlled candidate priority:
//!
//! ```text
//! pair_priority = 2^32 * MIN(G,D) + 2 * MAX(G,D) + (G > D ? 1 : 0)
//! ```

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

use super::candidate::Candidate;
use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

pub const TRANSACTION_ID_LEN: usize = 12;

/// Initial retransmit interval
pub const INITIAL_RTO: Duration = Duration::from_millis(100);

/// Maximum retransmit interval
pub const MAX_RTO: Duration = Duration::from_millis(1600);

/// Transmissions per check before the pair fails
pub const MAX_RETRANSMITS: u32 = 5;

/// Interval between consecutive binding requests
pub const PACE_INTERVAL: Duration = Duration::from_millis(20);

// ============================================================================
// Binding Messages
// ============================================================================

/// Binding request sent to verify connectivity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRequest {
    pub transaction_id: [u8; TRANSACTION_ID_LEN],
    /// Priority of the candidate pair
    pub priority: u64,
    /// Set by the controlling agent to nominate the pair
    pub use_candidate: bool,
    /// `<responder ufrag>:<requester ufrag>`
    pub username: String,
    pub integrity: Vec<u8>,
}

/// Binding response confirming connectivity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingResponse {
    pub transaction_id: [u8; TRANSACTION_ID_LEN],
    pub success: bool,
    /// Source address the request was seen from
    pub mapped_address: Option<SocketAddr>,
    pub integrity: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingMessage {
    Request(BindingRequest),
    Response(BindingResponse),
}

impl BindingRequest {
    pub fn new(priority: u64, use_candidate: bool, username: String) -> Self {
        Self::with_transaction_id(generate_transaction_id(), priority, use_candidate, username)
    }

    pub fn with_transaction_id(
        transaction_id: [u8; TRANSACTION_ID_LEN],
        priority: u64,
        use_candidate: bool,
        username: String,
    ) -> Self {
        Self {
            transaction_id,
            priority,
            use_candidate,
            username,
            integrity: Vec::new(),
        }
    }

    fn signed_fields(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(TRANSACTION_ID_LEN + 9 + self.username.len());
        data.extend_from_slice(&self.transaction_id);
        data.extend_from_slice(&self.priority.to_be_bytes());
        data.push(self.use_candidate as u8);
        data.extend_from_slice(self.username.as_bytes());
        data
    }

    pub fn sign(mut self, password: &str) -> Self {
        self.integrity = compute_integrity(password, &self.signed_fields());
        self
    }

    pub fn verify(&self, password: &str) -> bool {
        verify_integrity(password, &self.signed_fields(), &self.integrity)
    }

    /// Ufrag of the agent this request is addressed to
    pub fn target_ufrag(&self) -> Option<&str> {
        self.username.split_once(':').map(|(target, _)| target)
    }
}

impl BindingResponse {
    pub fn success(transaction_id: [u8; TRANSACTION_ID_LEN], mapped_address: SocketAddr) -> Self {
        Self {
            transaction_id,
            success: true,
            mapped_address: Some(mapped_address),
            integrity: Vec::new(),
        }
    }

    pub fn failure(transaction_id: [u8; TRANSACTION_ID_LEN]) -> Self {
        Self {
            transaction_id,
            success: false,
            mapped_address: None,
            integrity: Vec::new(),
        }
    }

    fn signed_fields(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(TRANSACTION_ID_LEN + 1 + 32);
        data.extend_from_slice(&self.transaction_id);
        data.push(self.success as u8);
        if let Some(addr) = self.mapped_address {
            data.extend_from_slice(addr.to_string().as_bytes());
        }
        data
    }

    pub fn sign(mut self, password: &str) -> Self {
        self.integrity = compute_integrity(password, &self.signed_fields());
        self
    }

    pub fn verify(&self, password: &str) -> bool {
        verify_integrity(password, &self.signed_fields(), &self.integrity)
    }
}

fn compute_integrity(password: &str, data: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, password.as_bytes());
    hmac::sign(&key, data).as_ref().to_vec()
}

fn verify_integrity(password: &str, data: &[u8], tag: &[u8]) -> bool {
    let key = hmac::Key::new(hmac::HMAC_SHA256, password.as_bytes());
    hmac::verify(&key, data, tag).is_ok()
}

fn generate_transaction_id() -> [u8; TRANSACTION_ID_LEN] {
    let mut id = [0u8; TRANSACTION_ID_LEN];
    if SystemRandom::new().fill(&mut id).is_err() {
        // Uniqueness is all that matters here
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        id[0..8].copy_from_slice(&nanos.to_le_bytes());
        id[8..12].copy_from_slice(&std::process::id().to_le_bytes());
    }
    id
}

// ============================================================================
// Candidate Pairs
// ============================================================================

/// A pair of local and remote candidates for connectivity checking
#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub local: Candidate,
    pub remote: Candidate,
    /// Pair priority (higher = try first)
    pub priority: u64,
    pub foundation: String,
    pub state: CheckState,
    pub transmit_count: u32,
    pub last_sent: Option<Instant>,
    /// Transaction ID of the outstanding request
    pub transaction_id: Option<[u8; TRANSACTION_ID_LEN]>,
    /// The outstanding (or succeeded) check carried USE-CANDIDATE
    pub nominated: bool,
}

/// State of a connectivity check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Frozen,
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

impl CandidatePair {
    pub fn new(local: Candidate, remote: Candidate, is_controlling: bool) -> Self {
        let priority = calculate_pair_priority(local.priority, remote.priority, is_controlling);
        let foundation = format!("{}:{}", local.foundation, remote.foundation);

        Self {
            local,
            remote,
            priority,
            foundation,
            state: CheckState::Frozen,
            transmit_count: 0,
            last_sent: None,
            transaction_id: None,
            nominated: false,
        }
    }

    pub fn needs_retransmit(&self, now: Instant) -> bool {
        if self.state != CheckState::InProgress || self.transmit_count >= MAX_RETRANSMITS {
            return false;
        }
        match self.last_sent {
            Some(sent) => now.duration_since(sent) >= self.current_rto(),
            None => true,
        }
    }

    /// Retransmit timeout with exponential backoff
    pub fn current_rto(&self) -> Duration {
        let multiplier = 1u32 << self.transmit_count.min(4);
        (INITIAL_RTO * multiplier).min(MAX_RTO)
    }

    /// Every transmission went unanswered
    pub fn is_exhausted(&self, now: Instant) -> bool {
        self.state == CheckState::InProgress
            && self.transmit_count >= MAX_RETRANSMITS
            && self
                .last_sent
                .map_or(true, |sent| now.duration_since(sent) >= self.current_rto())
    }

    fn start_check(&mut self, now: Instant, username: &str) -> BindingRequest {
        let request = BindingRequest::new(self.priority, self.nominated, username.to_string());
        self.transaction_id = Some(request.transaction_id);
        self.state = CheckState::InProgress;
        self.transmit_count = 1;
        self.last_sent = Some(now);
        request
    }

    fn record_retransmit(&mut self, now: Instant) {
        self.transmit_count += 1;
        self.last_sent = Some(now);
    }

    /// Returns true if the response belongs to this pair's check
    pub fn handle_response(&mut self, response: &BindingResponse) -> bool {
        if self.transaction_id != Some(response.transaction_id) {
            return false;
        }
        self.state = if response.success {
            CheckState::Succeeded
        } else {
            CheckState::Failed
        };
        self.transaction_id = None;
        true
    }

    pub fn mark_failed(&mut self) {
        self.state = CheckState::Failed;
    }
}

pub fn calculate_pair_priority(
    local_priority: u32,
    remote_priority: u32,
    is_controlling: bool,
) -> u64 {
    let (g, d) = if is_controlling {
        (local_priority as u64, remote_priority as u64)
    } else {
        (remote_priority as u64, local_priority as u64)
    };

    let tie_breaker = if g > d { 1u64 } else { 0u64 };
    (1u64 << 32) * g.min(d) + 2 * g.max(d) + tie_breaker
}

// ============================================================================
// Check List
// ============================================================================

/// Result of matching a binding response against the check list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckOutcome {
    pub index: usize,
    pub succeeded: bool,
    /// The check was a nomination
    pub nominated: bool,
}

/// All candidate pairs of one component and their checks
#[derive(Debug)]
pub struct CheckList {
    /// Sorted by priority, highest first
    pairs: Vec<CandidatePair>,
    is_controlling: bool,
    /// `<remote ufrag>:<local ufrag>`
    username: String,
    next_check_index: usize,
    /// Pairs to check ahead of the ordinary schedule
    triggered: VecDeque<usize>,
    last_check_time: Option<Instant>,
}

impl CheckList {
    pub fn new(is_controlling: bool, username: String) -> Self {
        Self {
            pairs: Vec::new(),
            is_controlling,
            username,
            next_check_index: 0,
            triggered: VecDeque::new(),
            last_check_time: None,
        }
    }

    /// Pair every local candidate with every remote candidate of the same
    /// component and IP family
    pub fn add_pairs(&mut self, local_candidates: &[Candidate], remote_candidates: &[Candidate]) {
        for local in local_candidates {
            for remote in remote_candidates {
                if local.component != remote.component
                    || local.address.is_ipv4() != remote.address.is_ipv4()
                {
                    continue;
                }
                let pair = CandidatePair::new(local.clone(), remote.clone(), self.is_controlling);
                self.pairs.push(pair);
            }
        }

        self.pairs.sort_by(|a, b| b.priority.cmp(&a.priority));
        self.unfreeze_initial_pairs();
    }

    /// Unfreeze the first pair with each unique foundation
    fn unfreeze_initial_pairs(&mut self) {
        let mut seen_foundations = HashSet::new();
        for pair in &mut self.pairs {
            if pair.state == CheckState::Frozen && seen_foundations.insert(pair.foundation.clone()) {
                pair.state = CheckState::Waiting;
            }
        }
    }

    /// Next binding request to send, paced by [`PACE_INTERVAL`]
    ///
    /// Retransmissions go first, then triggered checks, then the ordinary
    /// schedule.
    pub fn next_request(&mut self, now: Instant) -> Option<(usize, BindingRequest, SocketAddr)> {
        if let Some(last) = self.last_check_time {
            if now.duration_since(last) < PACE_INTERVAL {
                return None;
            }
        }

        for (idx, pair) in self.pairs.iter_mut().enumerate() {
            if pair.needs_retransmit(now) {
                if let Some(txn_id) = pair.transaction_id {
                    pair.record_retransmit(now);
                    let request = BindingRequest::with_transaction_id(
                        txn_id,
                        pair.priority,
                        pair.nominated,
                        self.username.clone(),
                    );
                    self.last_check_time = Some(now);
                    return Some((idx, request, pair.remote.address));
                }
            }
        }

        while let Some(idx) = self.triggered.pop_front() {
            if self.pairs[idx].state == CheckState::Waiting {
                return Some(self.begin_check(idx, now));
            }
        }

        while self.next_check_index < self.pairs.len() {
            let idx = self.next_check_index;
            self.next_check_index += 1;
            if self.pairs[idx].state == CheckState::Waiting {
                return Some(self.begin_check(idx, now));
            }
        }

        // Pairs unfrozen after the schedule passed them
        if let Some(idx) = self
            .pairs
            .iter()
            .position(|p| p.state == CheckState::Waiting)
        {
            return Some(self.begin_check(idx, now));
        }

        None
    }

    fn begin_check(&mut self, idx: usize, now: Instant) -> (usize, BindingRequest, SocketAddr) {
        let request = self.pairs[idx].start_check(now, &self.username);
        self.last_check_time = Some(now);
        (idx, request, self.pairs[idx].remote.address)
    }

    pub fn handle_response(&mut self, response: &BindingResponse) -> Option<CheckOutcome> {
        let idx = self
            .pairs
            .iter_mut()
            .position(|pair| pair.handle_response(response))?;

        let pair = &self.pairs[idx];
        let outcome = CheckOutcome {
            index: idx,
            succeeded: pair.state == CheckState::Succeeded,
            nominated: pair.nominated,
        };

        if outcome.succeeded {
            let foundation = pair.foundation.clone();
            self.unfreeze_by_foundation(&foundation);
        }

        Some(outcome)
    }

    fn unfreeze_by_foundation(&mut self, foundation: &str) {
        for pair in &mut self.pairs {
            if pair.state == CheckState::Frozen && pair.foundation == foundation {
                pair.state = CheckState::Waiting;
            }
        }
    }

    /// Fail checks whose retransmissions ran out
    pub fn handle_timeouts(&mut self, now: Instant) {
        for pair in &mut self.pairs {
            if pair.is_exhausted(now) {
                pair.mark_failed();
            }
        }

        // Nothing left to wake frozen pairs: give them their own chance
        let active = self
            .pairs
            .iter()
            .any(|p| matches!(p.state, CheckState::Waiting | CheckState::InProgress));
        if !active {
            for pair in &mut self.pairs {
                if pair.state == CheckState::Frozen {
                    pair.state = CheckState::Waiting;
                }
            }
        }
    }

    /// Re-check a succeeded pair with USE-CANDIDATE set
    pub fn nominate(&mut self, index: usize) -> bool {
        match self.pairs.get_mut(index) {
            Some(pair) if pair.state == CheckState::Succeeded && !pair.nominated => {
                pair.nominated = true;
                pair.state = CheckState::Waiting;
                pair.transmit_count = 0;
                self.triggered.push_front(index);
                true
            }
            _ => false,
        }
    }

    /// Check the pair towards `remote` next (RFC 8445 triggered check)
    pub fn trigger(&mut self, remote: SocketAddr) {
        if let Some(idx) = self.pairs.iter().position(|p| {
            p.remote.address == remote && matches!(p.state, CheckState::Frozen | CheckState::Waiting)
        }) {
            self.pairs[idx].state = CheckState::Waiting;
            self.triggered.push_back(idx);
        }
    }

    pub fn best_succeeded(&self) -> Option<&CandidatePair> {
        self.pairs
            .iter()
            .filter(|p| p.state == CheckState::Succeeded)
            .max_by_key(|p| p.priority)
    }

    pub fn is_complete(&self) -> bool {
        self.pairs
            .iter()
            .all(|p| matches!(p.state, CheckState::Succeeded | CheckState::Failed))
    }

    pub fn has_succeeded(&self) -> bool {
        self.pairs.iter().any(|p| p.state == CheckState::Succeeded)
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    pub fn pairs_by_state(&self, state: CheckState) -> impl Iterator<Item = &CandidatePair> {
        self.pairs.iter().filter(move |p| p.state == state)
    }

    pub fn get_pair(&self, index: usize) -> Option<&CandidatePair> {
        self.pairs.get(index)
    }

    /// Earliest instant a check or retransmission could be due
    pub fn next_deadline(&self) -> Option<Instant> {
        let pace = self.last_check_time.map(|t| t + PACE_INTERVAL);
        let rto = self
            .pairs
            .iter()
            .filter(|p| p.state == CheckState::InProgress)
            .filter_map(|p| p.last_sent.map(|sent| sent + p.current_rto()))
            .min();
        match (pace, rto) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

// ============================================================================
// Message Encoding
// ============================================================================

pub fn encode_binding(msg: &BindingMessage) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(|e| Error::Protocol(e.to_string()))
}

pub fn decode_binding(data: &[u8]) -> Result<BindingMessage> {
    bincode::deserialize(data).map_err(|e| Error::Protocol(e.to_string()))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ice::candidate::CandidateType;

    fn host_candidate(addr: &str) -> Candidate {
        Candidate::host(1, addr.parse().unwrap())
    }

    fn srflx_candidate(public: &str, base: &str) -> Candidate {
        Candidate::server_reflexive(1, public.parse().unwrap(), base.parse().unwrap())
    }

    fn single_pair_list() -> CheckList {
        let mut list = CheckList::new(true, "remote:local".to_string());
        list.add_pairs(
            &[host_candidate("192.168.1.100:5000")],
            &[host_candidate("192.168.1.200:5000")],
        );
        list
    }

    #[test]
    fn test_binding_request_integrity() {
        let req = BindingRequest::new(1000, false, "bob:alice".to_string()).sign("secretpwd");
        assert!(req.verify("secretpwd"));
        assert!(!req.verify("otherpwd"));
        assert_eq!(req.target_ufrag(), Some("bob"));

        let mut tampered = req.clone();
        tampered.use_candidate = true;
        assert!(!tampered.verify("secretpwd"));
    }

    #[test]
    fn test_binding_response_integrity() {
        let addr: SocketAddr = "192.168.1.1:5000".parse().unwrap();
        let resp = BindingResponse::success([1u8; 12], addr).sign("pwd");
        assert!(resp.success);
        assert!(resp.verify("pwd"));

        let mut tampered = resp.clone();
        tampered.mapped_address = Some("10.0.0.1:5000".parse().unwrap());
        assert!(!tampered.verify("pwd"));
    }

    #[test]
    fn test_binding_message_encoding() {
        let msg = BindingMessage::Request(BindingRequest::new(5000, true, "a:b".to_string()));
        let decoded = decode_binding(&encode_binding(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert!(decode_binding(&[0xff, 0xff]).is_err());
    }

    #[test]
    fn test_pair_priority() {
        let expected = (1u64 << 32) * 50 + 2 * 100 + 1;
        assert_eq!(calculate_pair_priority(100, 50, true), expected);
        assert_eq!(calculate_pair_priority(50, 100, false), expected);
    }

    #[test]
    fn test_pairs_only_within_component() {
        let mut list = CheckList::new(true, "r:l".to_string());
        let local = vec![
            Candidate::host(1, "192.168.1.100:5000".parse().unwrap()),
            Candidate::host(2, "192.168.1.100:5001".parse().unwrap()),
        ];
        let remote = vec![Candidate::host(1, "192.168.1.200:5000".parse().unwrap())];
        list.add_pairs(&local, &remote);
        assert_eq!(list.pair_count(), 1);
    }

    #[test]
    fn test_ipv4_ipv6_separation() {
        let mut list = CheckList::new(true, "r:l".to_string());
        let local = vec![
            host_candidate("192.168.1.100:5000"),
            host_candidate("[::1]:5000"),
        ];
        list.add_pairs(&local, &[host_candidate("192.168.1.200:5000")]);
        assert_eq!(list.pair_count(), 1);
    }

    #[test]
    fn test_priority_sorting() {
        let mut list = CheckList::new(true, "r:l".to_string());
        let local = vec![
            srflx_candidate("203.0.113.1:5000", "192.168.1.100:5000"),
            host_candidate("192.168.1.100:5000"),
        ];
        list.add_pairs(&local, &[host_candidate("192.168.1.200:5000")]);
        assert_eq!(list.get_pair(0).unwrap().local.candidate_type, CandidateType::Host);
        assert!(list.pairs_by_state(CheckState::Waiting).count() >= 1);
    }

    #[test]
    fn test_check_and_nominate() {
        let mut list = single_pair_list();
        let now = Instant::now();

        let (idx, request, addr) = list.next_request(now).unwrap();
        assert_eq!(idx, 0);
        assert!(!request.use_candidate);
        assert_eq!(request.username, "remote:local");
        assert_eq!(addr, "192.168.1.200:5000".parse::<SocketAddr>().unwrap());

        let response = BindingResponse::success(request.transaction_id, addr);
        let outcome = list.handle_response(&response).unwrap();
        assert!(outcome.succeeded);
        assert!(!outcome.nominated);
        assert!(list.is_complete());

        assert!(list.nominate(0));
        assert!(!list.nominate(0));

        // Pacing holds the nomination back briefly
        assert!(list.next_request(now).is_none());
        let later = now + PACE_INTERVAL;
        let (idx, nomination, _) = list.next_request(later).unwrap();
        assert_eq!(idx, 0);
        assert!(nomination.use_candidate);

        let outcome = list
            .handle_response(&BindingResponse::success(nomination.transaction_id, addr))
            .unwrap();
        assert!(outcome.nominated);
        assert!(list.best_succeeded().unwrap().nominated);
    }

    #[test]
    fn test_unknown_response_ignored() {
        let mut list = single_pair_list();
        list.next_request(Instant::now()).unwrap();
        let stray = BindingResponse::success([9u8; 12], "1.2.3.4:5".parse().unwrap());
        assert!(list.handle_response(&stray).is_none());
        assert!(!list.has_succeeded());
    }

    #[test]
    fn test_retransmit_then_fail() {
        let mut list = single_pair_list();
        let mut now = Instant::now();
        let (_, first, _) = list.next_request(now).unwrap();

        for _ in 1..MAX_RETRANSMITS {
            now += MAX_RTO;
            let (_, again, _) = list.next_request(now).unwrap();
            assert_eq!(again.transaction_id, first.transaction_id);
        }

        now += MAX_RTO;
        assert!(list.next_request(now).is_none());
        list.handle_timeouts(now);
        assert!(list.is_complete());
        assert!(!list.has_succeeded());
    }

    #[test]
    fn test_exponential_backoff() {
        let mut pair = CandidatePair::new(
            host_candidate("192.168.1.100:5000"),
            host_candidate("192.168.1.200:5000"),
            true,
        );
        let now = Instant::now();
        pair.state = CheckState::Waiting;
        pair.start_check(now, "r:l");
        assert_eq!(pair.current_rto(), Duration::from_millis(200));

        pair.record_retransmit(now);
        assert_eq!(pair.current_rto(), Duration::from_millis(400));
        pair.record_retransmit(now);
        pair.record_retransmit(now);
        assert_eq!(pair.current_rto(), Duration::from_millis(1600));
        pair.record_retransmit(now);
        assert_eq!(pair.current_rto(), Duration::from_millis(1600));
    }

    #[test]
    fn test_triggered_check_goes_first() {
        let mut list = CheckList::new(false, "r:l".to_string());
        list.add_pairs(
            &[host_candidate("192.168.1.100:5000")],
            &[
                host_candidate("192.168.1.200:5000"),
                host_candidate("10.0.0.9:5000"),
            ],
        );
        let target: SocketAddr = "10.0.0.9:5000".parse().unwrap();
        list.trigger(target);
        let (_, _, addr) = list.next_request(Instant::now()).unwrap();
        assert_eq!(addr, target);
    }
}
