//! Node configuration: JSON file plus command-line overrides

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use whisper_session::{validate_peer_id, PortForwardingProtocol, SessionOptions};

// ============================================================================
// Constants
// ============================================================================

/// Default relay address
pub const DEFAULT_RELAY: &str = "127.0.0.1:7600";

// ============================================================================
// Endpoint specs
// ============================================================================

/// `name:proto:host:port`, used by both `--service` and `--forward`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct EndpointSpec {
    pub name: String,
    pub protocol: PortForwardingProtocol,
    pub host: String,
    pub port: u16,
}

impl FromStr for EndpointSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Host may be an IPv6 literal, so split the fixed fields from both ends
        let (name, rest) = s
            .split_once(':')
            .ok_or_else(|| format!("'{}': expected name:proto:host:port", s))?;
        let (proto, rest) = rest
            .split_once(':')
            .ok_or_else(|| format!("'{}': missing protocol", s))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| format!("'{}': missing port", s))?;

        if name.is_empty() {
            return Err(format!("'{}': empty name", s));
        }
        let protocol = proto.parse().map_err(|e| format!("'{}': {}", s, e))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(format!("'{}': empty host", s));
        }
        let port = port
            .parse()
            .map_err(|_| format!("'{}': invalid port '{}'", s, port))?;

        Ok(EndpointSpec {
            name: name.to_string(),
            protocol,
            host: host.to_string(),
            port,
        })
    }
}

impl TryFrom<String> for EndpointSpec {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for EndpointSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.name, self.protocol, self.host, self.port)
    }
}

// ============================================================================
// Node configuration
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Our peer id
    pub id: String,
    /// Relay carrying session requests
    pub relay: String,
    /// Shared secret for encrypted streams
    pub secret: String,
    /// Peer to offer a session to; answer inbound requests when unset
    pub connect: Option<String>,
    /// Local services exported to peers
    pub services: Vec<EndpointSpec>,
    /// Peer services forwarded to local ports (offering side only)
    pub forwards: Vec<EndpointSpec>,
    /// Engine options
    pub session: SessionOptions,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            relay: DEFAULT_RELAY.to_string(),
            secret: String::new(),
            connect: None,
            services: Vec::new(),
            forwards: Vec::new(),
            session: SessionOptions::default(),
        }
    }
}

impl NodeConfig {
    /// Build from `--config <file>`, then apply the remaining flags on top
    pub fn from_args(args: &[String]) -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = match parse_arg(args, "--config") {
            Some(path) => Self::load(Path::new(&path))?,
            None => Self::default(),
        };

        if let Some(id) = parse_arg(args, "--id") {
            config.id = id;
        }
        if let Some(relay) = parse_arg(args, "--relay") {
            config.relay = relay;
        }
        if let Some(secret) = parse_arg(args, "--secret") {
            config.secret = secret;
        }
        if let Some(peer) = parse_arg(args, "--connect") {
            config.connect = Some(peer);
        }
        for spec in parse_args(args, "--service") {
            config.services.push(spec.parse()?);
        }
        for spec in parse_args(args, "--forward") {
            config.forwards.push(spec.parse()?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("{}: {}", path.display(), e))?;
        let config = serde_json::from_str(&text)
            .map_err(|e| format!("{}: {}", path.display(), e))?;
        Ok(config)
    }

    pub fn relay_addr(&self) -> Result<SocketAddr, String> {
        self.relay
            .parse()
            .map_err(|_| format!("invalid relay address '{}'", self.relay))
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        validate_peer_id(&self.id).map_err(|e| format!("--id: {}", e))?;
        if let Some(peer) = &self.connect {
            validate_peer_id(peer).map_err(|e| format!("--connect: {}", e))?;
        }
        if self.secret.is_empty() {
            return Err("a shared secret is required (--secret)".into());
        }
        if !self.forwards.is_empty() && self.connect.is_none() {
            return Err("--forward needs --connect".into());
        }
        self.relay_addr()?;
        self.session.validate()?;
        Ok(())
    }
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// Every value of a repeatable flag
fn parse_args<'a>(args: &'a [String], flag: &'a str) -> impl Iterator<Item = &'a String> {
    args.windows(2).filter(move |w| w[0] == flag).map(|w| &w[1])
}
