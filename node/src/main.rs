//! Whisper Node
//!
//! A peer process that:
//! - Registers its peer id with a whisper relay
//! - Exports local TCP/UDP services to its peers
//! - Offers a session to one peer and forwards local ports to its services,
//!   or answers inbound session requests

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

mod config;
mod peer;

use config::NodeConfig;
use peer::Node;

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // --config <file>                    JSON configuration
    // --id <peer id>                     Our peer id
    // --relay <addr:port>                Relay address
    // --secret <secret>                  Shared secret for stream encryption
    // --connect <peer id>                Offer a session to this peer
    // --service name:proto:host:port     Export a local service (repeatable)
    // --forward service:proto:host:port  Forward a local port to a peer service (repeatable)
    let args: Vec<String> = std::env::args().collect();
    let config = NodeConfig::from_args(&args)?;

    log::info!("Whisper node starting...");
    log::info!("  Id:       {}", config.id);
    log::info!("  Relay:    {}", config.relay);
    log::info!(
        "  Mode:     {}",
        config.connect.as_deref().map_or("answer".to_string(), |p| format!("connect to '{}'", p))
    );
    for spec in &config.services {
        log::info!("  Service:  {}", spec);
    }
    for spec in &config.forwards {
        log::info!("  Forward:  {}", spec);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    let mut node = Node::new(config)?;
    node.run(&shutdown)
}
