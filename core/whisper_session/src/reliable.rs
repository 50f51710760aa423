//! Ordered, retransmitting delivery over a datagram path
//!
//! Packet layout:
//! ```text
//! ┌──────────┬────────────┬────────────┬─────────────┐
//! │ Kind (1) │ Seq (4 BE) │ Ack (4 BE) │ Payload     │
//! └──────────┴────────────┴────────────┴─────────────┘
//! ```
//!
//! `ack` is cumulative: the next sequence number the sender expects.
//! Sequence numbers wrap; they are compared in serial-number order.
//! Every data packet has its own retransmit timer; out-of-order packets
//! wait in a reorder buffer until the gap fills.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::error::Error;

// ============================================================================
// Constants
// ============================================================================

pub const HEADER_LEN: usize = 9;

const KIND_DATA: u8 = 0x01;
const KIND_ACK: u8 = 0x02;

/// Packets in flight before new records wait in the backlog
pub const WINDOW: usize = 128;

pub const INITIAL_RTO: Duration = Duration::from_millis(200);
pub const MAX_RTO: Duration = Duration::from_millis(3200);

/// Transmissions of one packet before the link is declared dead
pub const MAX_TRANSMITS: u32 = 10;

/// Serial-number order: `a` comes before `b` within half the sequence space
fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

// ============================================================================
// Packets
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Data,
    Ack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub seq: u32,
    pub ack: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("unknown packet kind {0:#04x}")]
    UnknownKind(u8),
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(match self.kind {
            PacketKind::Data => KIND_DATA,
            PacketKind::Ack => KIND_ACK,
        });
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.ack.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::TooShort(buf.len()));
        }
        let kind = match buf[0] {
            KIND_DATA => PacketKind::Data,
            KIND_ACK => PacketKind::Ack,
            other => return Err(DecodeError::UnknownKind(other)),
        };
        Ok(Self {
            kind,
            seq: u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]),
            ack: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]),
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

// ============================================================================
// Link
// ============================================================================

#[derive(Debug)]
struct InFlight {
    payload: Vec<u8>,
    sent_at: Instant,
    transmits: u32,
    rto: Duration,
}

/// One direction-pair of reliable delivery for a stream component
#[derive(Debug, Default)]
pub struct ReliableLink {
    next_seq: u32,
    in_flight: BTreeMap<u32, InFlight>,
    backlog: VecDeque<Vec<u8>>,
    recv_next: u32,
    reorder: BTreeMap<u32, Vec<u8>>,
    ack_pending: bool,
    failed: bool,
}

impl ReliableLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a record for delivery
    pub fn send(&mut self, record: Vec<u8>) {
        self.backlog.push_back(record);
    }

    /// Records queued or awaiting acknowledgement
    pub fn backlog(&self) -> usize {
        self.backlog.len() + self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.backlog() == 0 && !self.ack_pending
    }

    /// A packet exhausted its retransmissions
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Process one inbound packet, returning records now deliverable in order
    pub fn receive(&mut self, buf: &[u8]) -> Result<Vec<Vec<u8>>, DecodeError> {
        let packet = Packet::decode(buf)?;

        // Cumulative ack releases everything below it
        self.in_flight.retain(|seq, _| !seq_before(*seq, packet.ack));

        let mut delivered = Vec::new();
        if packet.kind == PacketKind::Ack {
            return Ok(delivered);
        }

        self.ack_pending = true;
        if seq_before(packet.seq, self.recv_next) {
            log::trace!("Duplicate packet {} (expecting {})", packet.seq, self.recv_next);
        } else if packet.seq == self.recv_next {
            delivered.push(packet.payload);
            self.recv_next = self.recv_next.wrapping_add(1);
            while let Some(payload) = self.reorder.remove(&self.recv_next) {
                delivered.push(payload);
                self.recv_next = self.recv_next.wrapping_add(1);
            }
        } else if packet.seq.wrapping_sub(self.recv_next) as usize <= 2 * WINDOW {
            self.reorder.entry(packet.seq).or_insert(packet.payload);
        } else {
            log::trace!("Packet {} beyond reorder window dropped", packet.seq);
        }

        Ok(delivered)
    }

    /// Packets to put on the wire now
    pub fn poll_transmit(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        if self.failed {
            return out;
        }

        for (seq, entry) in self.in_flight.iter_mut() {
            if now.duration_since(entry.sent_at) < entry.rto {
                continue;
            }
            if entry.transmits >= MAX_TRANSMITS {
                log::warn!("Packet {} unacknowledged after {} transmits", seq, entry.transmits);
                self.failed = true;
                return Vec::new();
            }
            entry.transmits += 1;
            entry.sent_at = now;
            entry.rto = (entry.rto * 2).min(MAX_RTO);
            out.push(
                Packet {
                    kind: PacketKind::Data,
                    seq: *seq,
                    ack: self.recv_next,
                    payload: entry.payload.clone(),
                }
                .encode(),
            );
        }

        while self.in_flight.len() < WINDOW {
            let payload = match self.backlog.pop_front() {
                Some(p) => p,
                None => break,
            };
            let seq = self.next_seq;
            self.next_seq = self.next_seq.wrapping_add(1);
            out.push(
                Packet {
                    kind: PacketKind::Data,
                    seq,
                    ack: self.recv_next,
                    payload: payload.clone(),
                }
                .encode(),
            );
            self.in_flight.insert(
                seq,
                InFlight {
                    payload,
                    sent_at: now,
                    transmits: 1,
                    rto: INITIAL_RTO,
                },
            );
        }

        if out.is_empty() && self.ack_pending {
            out.push(
                Packet {
                    kind: PacketKind::Ack,
                    seq: self.next_seq,
                    ack: self.recv_next,
                    payload: Vec::new(),
                }
                .encode(),
            );
        }
        self.ack_pending = false;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(from: &mut ReliableLink, to: &mut ReliableLink, now: Instant) -> Vec<Vec<u8>> {
        let mut delivered = Vec::new();
        for packet in from.poll_transmit(now) {
            delivered.extend(to.receive(&packet).unwrap());
        }
        delivered
    }

    #[test]
    fn test_packet_decode() {
        let packet = Packet {
            kind: PacketKind::Data,
            seq: 7,
            ack: 3,
            payload: b"abc".to_vec(),
        };
        let encoded = packet.encode();
        assert_eq!(encoded.len(), HEADER_LEN + 3);
        assert_eq!(Packet::decode(&encoded).unwrap(), packet);

        assert_eq!(Packet::decode(&[1, 2]), Err(DecodeError::TooShort(2)));
        assert_eq!(
            Packet::decode(&[9, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(DecodeError::UnknownKind(9))
        );
    }

    #[test]
    fn test_in_order_delivery_and_ack() {
        let now = Instant::now();
        let mut a = ReliableLink::new();
        let mut b = ReliableLink::new();

        a.send(b"one".to_vec());
        a.send(b"two".to_vec());
        assert_eq!(a.backlog(), 2);

        let delivered = transfer(&mut a, &mut b, now);
        assert_eq!(delivered, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(a.backlog(), 2);

        // Pure ack back
        transfer(&mut b, &mut a, now);
        assert_eq!(a.backlog(), 0);
        assert!(a.is_idle());
    }

    #[test]
    fn test_loss_and_reorder() {
        let mut now = Instant::now();
        let mut a = ReliableLink::new();
        let mut b = ReliableLink::new();

        for i in 0..3u8 {
            a.send(vec![i]);
        }
        let packets = a.poll_transmit(now);
        assert_eq!(packets.len(), 3);

        // First packet lost, third arrives before second
        assert!(b.receive(&packets[2]).unwrap().is_empty());
        assert!(b.receive(&packets[1]).unwrap().is_empty());

        // Ack for nothing yet; then the retransmit fills the gap
        transfer(&mut b, &mut a, now);
        now += INITIAL_RTO;
        let delivered = transfer(&mut a, &mut b, now);
        assert_eq!(delivered, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn test_duplicates_not_redelivered() {
        let now = Instant::now();
        let mut a = ReliableLink::new();
        let mut b = ReliableLink::new();

        a.send(b"x".to_vec());
        let packets = a.poll_transmit(now);
        assert_eq!(b.receive(&packets[0]).unwrap().len(), 1);
        assert!(b.receive(&packets[0]).unwrap().is_empty());
    }

    #[test]
    fn test_window_limits_in_flight() {
        let now = Instant::now();
        let mut a = ReliableLink::new();
        for _ in 0..WINDOW + 10 {
            a.send(vec![0]);
        }
        assert_eq!(a.poll_transmit(now).len(), WINDOW);
        assert_eq!(a.backlog(), WINDOW + 10);
    }

    #[test]
    fn test_sequence_numbers_wrap() {
        let mut now = Instant::now();
        let start = u32::MAX - 1;
        let mut a = ReliableLink {
            next_seq: start,
            ..ReliableLink::default()
        };
        let mut b = ReliableLink {
            recv_next: start,
            ..ReliableLink::default()
        };

        for i in 0..4u8 {
            a.send(vec![i]);
        }
        let packets = a.poll_transmit(now);
        let seqs: Vec<u32> = packets
            .iter()
            .map(|p| Packet::decode(p).unwrap().seq)
            .collect();
        assert_eq!(seqs, vec![u32::MAX - 1, u32::MAX, 0, 1]);

        // Post-wrap packets arrive first and wait for the gap
        assert!(b.receive(&packets[2]).unwrap().is_empty());
        assert!(b.receive(&packets[3]).unwrap().is_empty());
        assert_eq!(b.receive(&packets[0]).unwrap(), vec![vec![0]]);
        assert_eq!(b.receive(&packets[1]).unwrap(), vec![vec![1], vec![2], vec![3]]);
        // Pre-wrap packet replayed after the wrap is a duplicate
        assert!(b.receive(&packets[0]).unwrap().is_empty());

        transfer(&mut b, &mut a, now);
        assert_eq!(a.backlog(), 0);
        now += MAX_RTO;
        assert!(a.poll_transmit(now).is_empty());
        assert!(!a.is_failed());
    }

    #[test]
    fn test_fails_after_max_transmits() {
        let mut now = Instant::now();
        let mut a = ReliableLink::new();
        a.send(b"lost".to_vec());

        for _ in 0..MAX_TRANSMITS {
            assert!(!a.poll_transmit(now).is_empty());
            now += MAX_RTO;
        }
        assert!(a.poll_transmit(now).is_empty());
        assert!(a.is_failed());
    }
}
