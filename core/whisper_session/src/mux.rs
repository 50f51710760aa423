//! Channel multiplexing over one reliable stream component
//!
//! Every record on a multiplexed component is one frame:
//! ```text
//! ┌────────────────┬──────────┬────────────┬─────────────────┐
//! │ Channel (4 BE) │ Kind (1) │ Len (2 BE) │ Payload         │
//! └────────────────┴──────────┴────────────┴─────────────────┘
//! ```
//!
//! Channel lifecycle:
//! ```text
//!            OPEN sent                  OPEN_ACK
//! (local) ─────────────► Opening ─────────────────► Open ◄──┐
//!                           │ CLOSE                  │ PEND  │ RESUME
//!                           ▼                        ▼       │
//!                         Closed                  Pending ───┘
//!
//! Open/Pending ── close_channel ──► Closing ── peer CLOSE ──► Closed
//! Open/Pending ── peer CLOSE ─────► Closed (CLOSE echoed back)
//! ```
//!
//! The offering side allocates odd channel ids and the answering side even
//! ones, so both ends can open concurrently. Ids grow monotonically and are
//! never handed out twice by one multiplexer.

use std::collections::{BTreeMap, VecDeque};

use thiserror::Error;

use crate::error::{Error, Result};
use crate::MAX_RECORD_SIZE;

// ============================================================================
// Constants
// ============================================================================

pub const FRAME_HEADER_LEN: usize = 7;

/// Largest payload one DATA frame can carry
pub const MAX_CHANNEL_PAYLOAD: usize = MAX_RECORD_SIZE - FRAME_HEADER_LEN;

const KIND_OPEN: u8 = 1;
const KIND_OPEN_ACK: u8 = 2;
const KIND_DATA: u8 = 3;
const KIND_PEND: u8 = 4;
const KIND_RESUME: u8 = 5;
const KIND_CLOSE: u8 = 6;

// ============================================================================
// Frames
// ============================================================================

/// Why a channel was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    Normal = 0,
    Timeout = 1,
    Error = 2,
}

impl CloseReason {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CloseReason::Normal,
            1 => CloseReason::Timeout,
            _ => CloseReason::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    /// Payload is the cookie
    Open(String),
    OpenAck,
    Data(Vec<u8>),
    Pend,
    Resume,
    Close(CloseReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: u32,
    pub kind: FrameKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("incomplete frame, need {0} more bytes")]
    Incomplete(usize),
    #[error("trailing {0} bytes after frame")]
    Trailing(usize),
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
    #[error("malformed {0} frame")]
    Malformed(&'static str),
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl Frame {
    pub fn new(channel: u32, kind: FrameKind) -> Self {
        Self { channel, kind }
    }

    pub fn encode(&self) -> Vec<u8> {
        let reason_byte;
        let (kind, payload): (u8, &[u8]) = match &self.kind {
            FrameKind::Open(cookie) => (KIND_OPEN, cookie.as_bytes()),
            FrameKind::OpenAck => (KIND_OPEN_ACK, &[][..]),
            FrameKind::Data(data) => (KIND_DATA, data.as_slice()),
            FrameKind::Pend => (KIND_PEND, &[][..]),
            FrameKind::Resume => (KIND_RESUME, &[][..]),
            FrameKind::Close(reason) => {
                reason_byte = [*reason as u8];
                (KIND_CLOSE, &reason_byte[..])
            }
        };
        let mut buf = self.header(kind, payload.len());
        buf.extend_from_slice(payload);
        buf
    }

    fn header(&self, kind: u8, len: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + len);
        buf.extend_from_slice(&self.channel.to_be_bytes());
        buf.push(kind);
        buf.extend_from_slice(&(len as u16).to_be_bytes());
        buf
    }

    /// Decode a record holding exactly one frame
    pub fn decode(buf: &[u8]) -> std::result::Result<Self, FrameError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(FrameError::Incomplete(FRAME_HEADER_LEN - buf.len()));
        }
        let channel = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let kind = buf[4];
        let len = u16::from_be_bytes([buf[5], buf[6]]) as usize;

        let total = FRAME_HEADER_LEN + len;
        if buf.len() < total {
            return Err(FrameError::Incomplete(total - buf.len()));
        }
        if buf.len() > total {
            return Err(FrameError::Trailing(buf.len() - total));
        }
        let payload = &buf[FRAME_HEADER_LEN..];

        let kind = match kind {
            KIND_OPEN => FrameKind::Open(
                String::from_utf8(payload.to_vec()).map_err(|_| FrameError::Malformed("OPEN"))?,
            ),
            KIND_OPEN_ACK => FrameKind::OpenAck,
            KIND_DATA => FrameKind::Data(payload.to_vec()),
            KIND_PEND => FrameKind::Pend,
            KIND_RESUME => FrameKind::Resume,
            KIND_CLOSE => match payload {
                [reason] => FrameKind::Close(CloseReason::from_u8(*reason)),
                _ => return Err(FrameError::Malformed("CLOSE")),
            },
            other => return Err(FrameError::UnknownKind(other)),
        };

        Ok(Frame { channel, kind })
    }
}

// ============================================================================
// Channels
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    /// The peer asked us to hold writes
    Pending,
    /// Closed locally, waiting for the peer's CLOSE
    Closing,
    Closed,
}

#[derive(Debug)]
struct Channel {
    state: ChannelState,
    /// We asked the peer to hold writes
    local_pended: bool,
}

/// Receives channel events as frames are processed
pub trait ChannelObserver {
    /// Peer wants to open a channel; return false to refuse it
    fn channel_open(&mut self, channel: u32, cookie: &str) -> bool;
    fn channel_opened(&mut self, channel: u32);
    fn channel_close(&mut self, channel: u32, reason: CloseReason);
    /// Return false to close the channel with [`CloseReason::Error`]
    fn channel_data(&mut self, channel: u32, data: &[u8]) -> bool;
    fn channel_pending(&mut self, channel: u32);
    fn channel_resume(&mut self, channel: u32);
}

/// Channel table and frame outbox for one (stream, component)
#[derive(Debug)]
pub struct Multiplexer {
    next_id: u32,
    /// Highest id the peer has opened
    last_remote_id: u32,
    remote_parity: u32,
    channels: BTreeMap<u32, Channel>,
    outbox: VecDeque<Frame>,
}

impl Multiplexer {
    /// `offerer` selects the odd id space
    pub fn new(offerer: bool) -> Self {
        Self {
            next_id: if offerer { 1 } else { 2 },
            last_remote_id: 0,
            remote_parity: if offerer { 0 } else { 1 },
            channels: BTreeMap::new(),
            outbox: VecDeque::new(),
        }
    }

    /// Frames waiting to be sent, oldest first
    pub fn take_outbox(&mut self) -> Vec<Frame> {
        self.outbox.drain(..).collect()
    }

    pub fn channel_count(&self) -> usize {
        self.channels
            .values()
            .filter(|c| c.state != ChannelState::Closing)
            .count()
    }

    /// Channels the application can still see (not closing)
    pub fn live_channels(&self) -> Vec<u32> {
        self.channels
            .iter()
            .filter(|(_, c)| c.state != ChannelState::Closing)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn channel_state(&self, channel: u32) -> Result<ChannelState> {
        if let Some(c) = self.channels.get(&channel) {
            return Ok(c.state);
        }
        let ours = channel % 2 != self.remote_parity;
        let retired = if ours {
            channel != 0 && channel < self.next_id
        } else {
            channel != 0 && channel <= self.last_remote_id
        };
        if retired {
            Ok(ChannelState::Closed)
        } else {
            Err(Error::NotExist(format!("channel {}", channel)))
        }
    }

    pub fn is_pended_locally(&self, channel: u32) -> bool {
        self.channels
            .get(&channel)
            .map_or(false, |c| c.local_pended)
    }

    // ------------------------------------------------------------------------
    // Local operations
    // ------------------------------------------------------------------------

    pub fn open_channel(&mut self, cookie: &str) -> Result<u32> {
        if cookie.len() > MAX_CHANNEL_PAYLOAD {
            return Err(Error::InvalidArgument("cookie too long".to_string()));
        }
        let id = self.next_id;
        // Two ids per step; the top of the space is never allocated
        if id > u32::MAX - 2 {
            return Err(Error::Busy);
        }
        self.next_id += 2;

        self.channels.insert(
            id,
            Channel {
                state: ChannelState::Opening,
                local_pended: false,
            },
        );
        self.outbox
            .push_back(Frame::new(id, FrameKind::Open(cookie.to_string())));
        log::debug!("Channel {} opening ({})", id, cookie);
        Ok(id)
    }

    pub fn write_channel(&mut self, channel: u32, data: &[u8]) -> Result<usize> {
        let c = self.live_channel(channel)?;
        match c.state {
            ChannelState::Open => {}
            ChannelState::Pending => return Err(Error::Busy),
            state => {
                return Err(Error::WrongState(format!(
                    "channel {} is {:?}",
                    channel, state
                )))
            }
        }
        if data.len() > MAX_CHANNEL_PAYLOAD {
            return Err(Error::InvalidArgument(format!(
                "{} bytes exceeds channel payload limit {}",
                data.len(),
                MAX_CHANNEL_PAYLOAD
            )));
        }

        self.outbox
            .push_back(Frame::new(channel, FrameKind::Data(data.to_vec())));
        Ok(data.len())
    }

    /// Ask the peer to stop writing on `channel`
    pub fn pend_channel(&mut self, channel: u32) -> Result<()> {
        let c = self.live_channel(channel)?;
        if !matches!(c.state, ChannelState::Open | ChannelState::Pending) {
            return Err(Error::WrongState(format!("channel {} is {:?}", channel, c.state)));
        }
        if !c.local_pended {
            c.local_pended = true;
            self.outbox.push_back(Frame::new(channel, FrameKind::Pend));
        }
        Ok(())
    }

    /// Let the peer write on `channel` again
    pub fn resume_channel(&mut self, channel: u32) -> Result<()> {
        let c = self.live_channel(channel)?;
        if !matches!(c.state, ChannelState::Open | ChannelState::Pending) {
            return Err(Error::WrongState(format!("channel {} is {:?}", channel, c.state)));
        }
        if c.local_pended {
            c.local_pended = false;
            self.outbox.push_back(Frame::new(channel, FrameKind::Resume));
        }
        Ok(())
    }

    /// Close without notifying the local observer
    pub fn close_channel(&mut self, channel: u32, reason: CloseReason) -> Result<()> {
        let c = self.live_channel(channel)?;
        c.state = ChannelState::Closing;
        self.outbox
            .push_back(Frame::new(channel, FrameKind::Close(reason)));
        log::debug!("Channel {} closing ({:?})", channel, reason);
        Ok(())
    }

    /// Close every channel, reporting each visible one to `observer` once
    pub fn close_all(&mut self, reason: CloseReason, observer: &mut dyn ChannelObserver) {
        let channels = std::mem::take(&mut self.channels);
        for (id, channel) in channels {
            if channel.state == ChannelState::Closing {
                continue;
            }
            self.outbox.push_back(Frame::new(id, FrameKind::Close(reason)));
            observer.channel_close(id, reason);
        }
    }

    fn live_channel(&mut self, channel: u32) -> Result<&mut Channel> {
        match self.channels.get_mut(&channel) {
            Some(c) if c.state == ChannelState::Closing => Err(Error::WrongState(format!(
                "channel {} is closing",
                channel
            ))),
            Some(c) => Ok(c),
            None => Err(Error::NotExist(format!("channel {}", channel))),
        }
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    pub fn handle_frame(&mut self, frame: Frame, observer: &mut dyn ChannelObserver) {
        let id = frame.channel;
        match frame.kind {
            FrameKind::Open(cookie) => self.handle_open(id, &cookie, observer),
            FrameKind::OpenAck => match self.channels.get_mut(&id) {
                Some(c) if c.state == ChannelState::Opening => {
                    c.state = ChannelState::Open;
                    log::debug!("Channel {} open", id);
                    observer.channel_opened(id);
                }
                _ => log::trace!("Stray OPEN_ACK for channel {}", id),
            },
            FrameKind::Data(data) => {
                let accepting = matches!(
                    self.channels.get(&id).map(|c| c.state),
                    Some(ChannelState::Open) | Some(ChannelState::Pending)
                );
                if !accepting {
                    log::trace!("DATA for inactive channel {} discarded", id);
                    return;
                }
                if !observer.channel_data(id, &data) {
                    log::debug!("Channel {} refused data, closing", id);
                    if let Some(c) = self.channels.get_mut(&id) {
                        c.state = ChannelState::Closing;
                    }
                    self.outbox
                        .push_back(Frame::new(id, FrameKind::Close(CloseReason::Error)));
                    observer.channel_close(id, CloseReason::Error);
                }
            }
            FrameKind::Pend => match self.channels.get_mut(&id) {
                Some(c) if c.state == ChannelState::Open => {
                    c.state = ChannelState::Pending;
                    observer.channel_pending(id);
                }
                _ => log::trace!("PEND for channel {} ignored", id),
            },
            FrameKind::Resume => match self.channels.get_mut(&id) {
                Some(c) if c.state == ChannelState::Pending => {
                    c.state = ChannelState::Open;
                    observer.channel_resume(id);
                }
                _ => log::trace!("RESUME for channel {} ignored", id),
            },
            FrameKind::Close(reason) => match self.channels.remove(&id) {
                Some(c) => match c.state {
                    ChannelState::Closing => log::debug!("Channel {} closed", id),
                    ChannelState::Opening => {
                        log::debug!("Channel {} refused by peer ({:?})", id, reason);
                        observer.channel_close(id, reason);
                    }
                    _ => {
                        log::debug!("Channel {} closed by peer ({:?})", id, reason);
                        self.outbox
                            .push_back(Frame::new(id, FrameKind::Close(CloseReason::Normal)));
                        observer.channel_close(id, reason);
                    }
                },
                None => log::trace!("CLOSE for unknown channel {}", id),
            },
        }
    }

    fn handle_open(&mut self, id: u32, cookie: &str, observer: &mut dyn ChannelObserver) {
        if id % 2 != self.remote_parity {
            log::warn!("Peer opened channel {} with our parity, refusing", id);
            self.outbox
                .push_back(Frame::new(id, FrameKind::Close(CloseReason::Error)));
            return;
        }
        // Ids only grow, so anything at or below the last one is a duplicate
        if id <= self.last_remote_id {
            log::debug!("Duplicate OPEN for channel {} ignored", id);
            return;
        }
        self.last_remote_id = id;

        if !observer.channel_open(id, cookie) {
            log::debug!("Channel {} ({}) refused", id, cookie);
            self.outbox
                .push_back(Frame::new(id, FrameKind::Close(CloseReason::Normal)));
            return;
        }

        self.channels.insert(
            id,
            Channel {
                state: ChannelState::Open,
                local_pended: false,
            },
        );
        self.outbox.push_back(Frame::new(id, FrameKind::OpenAck));
        log::debug!("Channel {} ({}) accepted", id, cookie);
        observer.channel_opened(id);
    }
}
