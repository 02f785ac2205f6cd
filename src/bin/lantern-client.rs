//! The Lantern client process. Wires a no-op UI adapter — it logs every
//! `UiEvent` instead of rendering anything — so the crate demonstrates a
//! complete, runnable client without depending on a UI toolkit. A real UI
//! would replace `log_ui_events` with its own event-loop binding.

use lantern::client::{Client, UiEvent};
use lantern::config::Config;
use lantern::discovery;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    let (client, mut events_rx) = Client::start(&config)
        .await
        .unwrap_or_else(|err| panic!("failed to start client: {err}"));

    spawn_mdns_browser(client.transport.clone());

    info!("lantern-client started");
    while let Some(event) = events_rx.recv().await {
        log_ui_event(event);
    }
}

fn log_ui_event(event: UiEvent) {
    match event {
        UiEvent::UiToast { message } => info!(%message, "toast"),
        other => debug!(?other, "ui event"),
    }
}

/// Browses for Relay instances and feeds discovered endpoints into the
/// connection manager (§4.5 step 3). `mdns_sd`'s receiver is synchronous,
/// so it runs on a blocking thread rather than inside the async runtime.
fn spawn_mdns_browser(transport: lantern::client::connection::RelayClientHandle) {
    let Ok(receiver) = discovery::browser() else {
        warn!("mDNS browse unavailable; relying on manual/fallback endpoint");
        return;
    };
    tokio::task::spawn_blocking(move || {
        while let Ok(event) = receiver.recv() {
            if let mdns_sd::ServiceEvent::ServiceResolved(info) = event {
                let port = info.get_port();
                for addr in info.get_addresses() {
                    transport.observe_endpoint(addr.to_string(), port);
                }
            }
        }
    });
}
