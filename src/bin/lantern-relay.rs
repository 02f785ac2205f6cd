//! The Relay process: accepts clients, tracks presence, routes frames, and
//! runs the announcements ring (C4). Ships separately from the client.

use lantern::config::Config;
use lantern::discovery;
use lantern::relay::{build_router, new_state, spawn_announcement_sweep};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    let state = new_state();
    spawn_announcement_sweep(state.clone());

    let instance_name = config
        .instance
        .clone()
        .unwrap_or_else(|| "lantern-relay".to_string());
    let _mdns_handle = match discovery::advertise(config.relay_port, None, &instance_name) {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(%err, "mDNS advertisement failed; continuing without discovery");
            None
        }
    };

    let addr = format!("0.0.0.0:{}", config.relay_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|err| panic!("failed to bind {addr}: {err}"));
    info!(%addr, "lantern-relay listening");

    axum::serve(listener, build_router(state))
        .await
        .expect("relay server error");
}
