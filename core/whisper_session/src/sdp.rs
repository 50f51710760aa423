//! Session descriptions and their RFC 4566 style text form
//!
//! ```text
//! v=0
//! o=alice@node1 8837461920 1 IN IP4 0.0.0.0
//! s=whisper
//! t=0 0
//! a=x-service:ssh tcp
//! m=audio 9 UDP/WHISPER 1
//! a=x-options:3
//! a=x-components:1
//! a=ice-ufrag:Fq2bX0aP
//! a=ice-pwd:Zk4Mw2rN8sQe1tYh6LpA0cVd
//! a=candidate:host12700001 1 udp 2130706431 127.0.0.1 50000 typ host
//! ```
//!
//! Lines other than the ones above are ignored when parsing.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::ice::{Candidate, IceCredentials};
use crate::services::PortForwardingProtocol;
use crate::stream::{StreamOptions, StreamType, MAX_COMPONENTS};

const TRANSPORT: &str = "UDP/WHISPER";

/// Structured offer or answer for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    /// Peer id of the side that produced the description
    pub origin: String,
    pub session_id: u64,
    /// Port-forwarding services the producer accepts
    pub services: Vec<(String, PortForwardingProtocol)>,
    pub streams: Vec<MediaDescription>,
}

/// One stream of a [`SessionDescription`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub stream_id: u32,
    pub stream_type: StreamType,
    pub options: StreamOptions,
    pub components: u8,
    pub credentials: IceCredentials,
    pub candidates: Vec<Candidate>,
}

impl SessionDescription {
    /// Streams of one type, in the order they were described
    pub fn streams_of_type(&self, stream_type: StreamType) -> impl Iterator<Item = &MediaDescription> {
        self.streams
            .iter()
            .filter(move |m| m.stream_type == stream_type)
    }

    pub fn service(&self, name: &str) -> Option<PortForwardingProtocol> {
        self.services
            .iter()
            .find(|(service, _)| service == name)
            .map(|(_, protocol)| *protocol)
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "v=0")?;
        writeln!(f, "o={} {} 1 IN IP4 0.0.0.0", self.origin, self.session_id)?;
        writeln!(f, "s=whisper")?;
        writeln!(f, "t=0 0")?;
        for (name, protocol) in &self.services {
            writeln!(f, "a=x-service:{} {}", name, protocol)?;
        }
        for media in &self.streams {
            writeln!(f, "m={} 9 {} {}", media.stream_type, TRANSPORT, media.stream_id)?;
            writeln!(f, "a=x-options:{}", media.options.bits())?;
            writeln!(f, "a=x-components:{}", media.components)?;
            writeln!(f, "a=ice-ufrag:{}", media.credentials.ufrag)?;
            writeln!(f, "a=ice-pwd:{}", media.credentials.pwd)?;
            for candidate in &media.candidates {
                writeln!(f, "a=candidate:{}", candidate.to_sdp_attribute())?;
            }
        }
        Ok(())
    }
}

/// Media section under construction
struct PartialMedia {
    stream_id: u32,
    stream_type: StreamType,
    options: Option<StreamOptions>,
    components: Option<u8>,
    ufrag: Option<String>,
    pwd: Option<String>,
    candidates: Vec<Candidate>,
}

impl PartialMedia {
    fn finish(self) -> Result<MediaDescription> {
        let stream_id = self.stream_id;
        let missing =
            |what: &str| Error::InvalidArgument(format!("stream {} has no {}", stream_id, what));
        let components = self.components.ok_or_else(|| missing("x-components"))?;
        if components == 0 || components as usize > MAX_COMPONENTS {
            return Err(Error::InvalidArgument(format!(
                "stream {} has {} components",
                stream_id, components
            )));
        }
        if let Some(c) = self.candidates.iter().find(|c| c.component > components) {
            return Err(Error::InvalidArgument(format!(
                "candidate for component {} of a {}-component stream",
                c.component, components
            )));
        }

        Ok(MediaDescription {
            stream_id: self.stream_id,
            stream_type: self.stream_type,
            options: self.options.unwrap_or_default(),
            components,
            credentials: IceCredentials {
                ufrag: self.ufrag.ok_or_else(|| missing("ice-ufrag"))?,
                pwd: self.pwd.ok_or_else(|| missing("ice-pwd"))?,
            },
            candidates: self.candidates,
        })
    }
}

impl FromStr for SessionDescription {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let invalid = |line: &str| Error::InvalidArgument(format!("malformed SDP line '{}'", line));

        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        if lines.next() != Some("v=0") {
            return Err(Error::InvalidArgument("SDP must start with v=0".to_string()));
        }

        let mut origin = None;
        let mut services = Vec::new();
        let mut streams = Vec::new();
        let mut current: Option<PartialMedia> = None;

        for line in lines {
            let (kind, value) = line.split_once('=').ok_or_else(|| invalid(line))?;
            match kind {
                "o" => {
                    let mut fields = value.split_whitespace();
                    let id = fields.next().ok_or_else(|| invalid(line))?;
                    let session_id: u64 = fields
                        .next()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| invalid(line))?;
                    origin = Some((id.to_string(), session_id));
                }
                "m" => {
                    if let Some(media) = current.take() {
                        streams.push(media.finish()?);
                    }
                    let fields: Vec<&str> = value.split_whitespace().collect();
                    if fields.len() != 4 || fields[2] != TRANSPORT {
                        return Err(invalid(line));
                    }
                    current = Some(PartialMedia {
                        stream_id: fields[3].parse().map_err(|_| invalid(line))?,
                        stream_type: fields[0].parse()?,
                        options: None,
                        components: None,
                        ufrag: None,
                        pwd: None,
                        candidates: Vec::new(),
                    });
                }
                "a" => {
                    let (attr, arg) = value.split_once(':').unwrap_or((value, ""));
                    match (attr, current.as_mut()) {
                        ("x-service", None) => {
                            let (name, protocol) =
                                arg.split_once(' ').ok_or_else(|| invalid(line))?;
                            services.push((name.to_string(), protocol.trim().parse()?));
                        }
                        ("x-options", Some(media)) => {
                            let bits: u8 = arg.parse().map_err(|_| invalid(line))?;
                            media.options = Some(StreamOptions::from_bits(bits)?);
                        }
                        ("x-components", Some(media)) => {
                            media.components = Some(arg.parse().map_err(|_| invalid(line))?);
                        }
                        ("ice-ufrag", Some(media)) if !arg.is_empty() => {
                            media.ufrag = Some(arg.to_string())
                        }
                        ("ice-pwd", Some(media)) if !arg.is_empty() => {
                            media.pwd = Some(arg.to_string())
                        }
                        ("candidate", Some(media)) => {
                            media.candidates.push(Candidate::from_sdp_attribute(arg)?);
                        }
                        ("ice-ufrag", _) | ("ice-pwd", _) => return Err(invalid(line)),
                        _ => {}
                    }
                }
                _ if kind.len() == 1 => {}
                _ => return Err(invalid(line)),
            }
        }

        if let Some(media) = current.take() {
            streams.push(media.finish()?);
        }

        let (origin, session_id) =
            origin.ok_or_else(|| Error::InvalidArgument("SDP has no origin line".to_string()))?;

        Ok(SessionDescription {
            origin,
            session_id,
            services,
            streams,
        })
    }
}
