//! Session engine configuration

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default STUN/TURN port when a server is given without one
pub const DEFAULT_STUN_PORT: u16 = 3478;

/// Options shared by every session of a [`SessionManager`](crate::SessionManager)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Session request deadline (offer sent → response received)
    pub request_timeout_ms: u64,
    /// Per-component ICE negotiation deadline
    pub ice_timeout_ms: u64,
    /// Interval between keepalives on a connected component
    pub keepalive_interval_ms: u64,
    /// Consecutive unanswered keepalives before a component is deactivated
    pub keepalive_misses: u32,
    /// Local address ICE sockets bind to
    pub bind_address: IpAddr,
    /// Gather loopback host candidates
    pub include_loopback: bool,
    /// Statically known public mapping of this host (server-reflexive candidate)
    pub public_address: Option<SocketAddr>,
    /// STUN server, `host[:port]`
    pub stun_server: Option<String>,
    /// TURN server, `host[:port]`
    pub turn_server: Option<String>,
    pub turn_username: Option<String>,
    pub turn_password: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            request_timeout_ms: 15_000,
            ice_timeout_ms: 10_000,
            keepalive_interval_ms: 15_000,
            keepalive_misses: 3,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            include_loopback: false,
            public_address: None,
            stun_server: None,
            turn_server: None,
            turn_username: None,
            turn_password: None,
        }
    }
}

impl SessionOptions {
    /// Options for peers that only ever talk over loopback (tests, single host)
    pub fn loopback() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            include_loopback: true,
            ..Self::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ice_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    /// Validate option values, returning the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 || self.ice_timeout_ms == 0 {
            return Err(Error::InvalidArgument("timeouts must be non-zero".to_string()));
        }
        if self.keepalive_interval_ms == 0 || self.keepalive_misses == 0 {
            return Err(Error::InvalidArgument(
                "keepalive interval and misses must be non-zero".to_string(),
            ));
        }
        if let Some(server) = &self.stun_server {
            parse_server(server)?;
        }
        if let Some(server) = &self.turn_server {
            parse_server(server)?;
            if self.turn_username.is_none() || self.turn_password.is_none() {
                return Err(Error::InvalidArgument(
                    "TURN server requires username and password".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Split `server_name_or_ip[:port]` into host and port (default 3478)
pub fn parse_server(server: &str) -> Result<(String, u16)> {
    let invalid = || Error::InvalidArgument(format!("invalid server address '{}'", server));

    if server.is_empty() {
        return Err(invalid());
    }

    // Bracketed IPv6: [::1]:3478
    if let Some(rest) = server.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| invalid())?,
            None if tail.is_empty() => DEFAULT_STUN_PORT,
            None => return Err(invalid()),
        };
        return Ok((host.to_string(), port));
    }

    match server.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            if host.is_empty() {
                return Err(invalid());
            }
            let port = port.parse().map_err(|_| invalid())?;
            Ok((host.to_string(), port))
        }
        _ => Ok((server.to_string(), DEFAULT_STUN_PORT)),
    }
}
