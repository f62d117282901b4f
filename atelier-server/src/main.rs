use atelier_collab::server::{ServerConfig, SyncServer};
use log::info;

/// Overlay `ATELIER_*` variables on the default config. Unparseable values
/// are logged and ignored.
fn config_from(lookup: impl Fn(&str) -> Option<String>) -> ServerConfig {
    let mut config = ServerConfig::default();

    if let Some(addr) = lookup("ATELIER_BIND_ADDR") {
        config.bind_addr = addr;
    }
    if let Some(value) = parse_var(&lookup, "ATELIER_MAX_PEERS") {
        config.max_peers_per_room = value;
    }
    if let Some(value) = parse_var(&lookup, "ATELIER_BROADCAST_CAPACITY") {
        config.broadcast_capacity = value;
    }
    if let Some(value) = parse_var(&lookup, "ATELIER_HEARTBEAT_SECS") {
        config.heartbeat_interval_secs = value;
    }
    config
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring {key}={raw}: not a number");
            None
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = config_from(|key| std::env::var(key).ok());
    info!(
        "Starting Atelier relay on {} (max {} peers per room)",
        config.bind_addr, config.max_peers_per_room
    );

    let server = SyncServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
