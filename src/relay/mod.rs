//! Relay session (server side, C4). Built with `axum` + `axum::extract::ws`
//! the way the wider example pack structures a WebSocket relay: split the
//! socket, drive writes from a channel-fed task, and keep the app state in
//! `Arc` behind minimal locking (`RwLock` for presence, `Mutex` for the
//! announcements ring) so no handler holds a lock across an `.await`.

pub mod announcements;
pub mod presence;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tracing::info;

use crate::frame::{AnnouncementExpiredPayload, Envelope};
use announcements::{AnnouncementsRing, SWEEP_INTERVAL_SECS};
use presence::PresenceTable;
use session::{handle_socket, now_ms, RelayState};

pub fn build_router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

async fn ws_handler(
    State(state): State<Arc<RelayState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn healthz_handler() -> &'static str {
    "ok"
}

pub fn new_state() -> Arc<RelayState> {
    Arc::new(RelayState {
        presence: Arc::new(PresenceTable::new()),
        announcements: Arc::new(AnnouncementsRing::new()),
    })
}

/// Periodic sweep (§4.4, §5: "announcement sweep ≤ 60s") that expires
/// announcements and broadcasts their ids, the same structural shape as the
/// teacher's `retention::spawn_retention_task`.
pub fn spawn_announcement_sweep(state: Arc<RelayState>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(SWEEP_INTERVAL_SECS)).await;
            let expired = state.announcements.sweep_expired(now_ms());
            if expired.is_empty() {
                continue;
            }
            info!(count = expired.len(), "announcements expired");
            let envelope = Envelope::AnnouncementExpired(AnnouncementExpiredPayload {
                message_ids: expired,
            });
            if let Ok(text) = serde_json::to_string(&envelope) {
                for tx in state.presence.all_outbound() {
                    let _ = tx.send(axum::extract::ws::Message::Text(text.clone().into()));
                }
            }
        }
    });
}
