//! Per-connection Relay session (C4, spec §4.4).
//!
//! State machine: `AWAITING_HELLO -> LIVE -> CLOSED`. The socket is split
//! into read/write halves; the write half is driven exclusively by this
//! task through an unbounded channel so writes stay FIFO per §5(a) — the
//! same shape as the teacher's WebSocket relay pattern in the wider example
//! pack, generalized from plaintext room routing to Lantern's hello/
//! presence/announcement/file-routing envelopes.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::frame::{
    Envelope, Frame, FramePayload, HelloPayload, PresenceDeltaPayload, PresenceOp,
    PresenceSnapshotPayload, RelayErrorCode, RelayErrorPayload, RelaySendAckPayload,
};
use crate::models::{DeviceId, PeerSource};

use super::announcements::AnnouncementsRing;
use super::presence::{PresenceChange, PresenceTable};

/// §4.4 invariant d: idle sessions are terminated after this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(45);

pub struct RelayState {
    pub presence: Arc<PresenceTable>,
    pub announcements: Arc<AnnouncementsRing>,
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = outbound_rx.recv() => {
                    match maybe {
                        Some(msg) => {
                            if ws_sink.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(20)) => {
                    if ws_sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let device_id = await_hello(&mut ws_stream, &outbound_tx, &state).await;

    if let Some(device_id) = device_id {
        live_loop(&mut ws_stream, &outbound_tx, &state, &device_id).await;
        teardown(&state, &device_id).await;
    }

    drop(outbound_tx);
    writer.abort();
}

async fn send_envelope(tx: &mpsc::UnboundedSender<Message>, envelope: Envelope) {
    if let Ok(text) = serde_json::to_string(&envelope) {
        let _ = tx.send(Message::Text(text.into()));
    }
}

/// `AWAITING_HELLO` state: only `relay:hello` is accepted (§4.4).
async fn await_hello(
    ws_stream: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    outbound_tx: &mpsc::UnboundedSender<Message>,
    state: &Arc<RelayState>,
) -> Option<DeviceId> {
    while let Some(Ok(msg)) = ws_stream.next().await {
        let Message::Text(text) = msg else { continue };
        let envelope: Envelope = match serde_json::from_str(text.as_str()) {
            Ok(e) => e,
            Err(_) => continue,
        };

        return match envelope {
            Envelope::Hello(HelloPayload { mut profile }) => {
                profile.created_at = profile.created_at.max(0);
                let now = now_ms();
                let peer = crate::models::Peer {
                    device_id: profile.device_id.clone(),
                    display_name: profile.display_name,
                    avatar_emoji: profile.avatar_emoji,
                    avatar_bg: profile.avatar_bg,
                    status_message: profile.status_message,
                    app_version: String::new(),
                    last_seen_at: now,
                    source: PeerSource::Relay,
                    address: None,
                    port: None,
                };
                let device_id = peer.device_id.clone();
                let (previous, change) = state.presence.register(peer.clone(), now, outbound_tx.clone());
                if let Some(previous) = previous {
                    let _ = previous.send(Message::Close(None));
                }

                send_envelope(outbound_tx, Envelope::HelloOk).await;
                broadcast_presence_change(state, change, Some(&device_id)).await;

                let (frames, reactions_map) = state.announcements.snapshot(now);
                let reactions = reactions_map
                    .into_iter()
                    .map(|(k, v)| {
                        (
                            k,
                            serde_json::to_value(v).unwrap_or(serde_json::Value::Null),
                        )
                    })
                    .collect();
                send_envelope(
                    outbound_tx,
                    Envelope::AnnouncementSnapshot(
                        crate::frame::AnnouncementSnapshotPayload { frames, reactions },
                    ),
                )
                .await;

                info!(device_id = %device_id, "relay session live");
                Some(device_id)
            }
            _ => {
                send_envelope(
                    outbound_tx,
                    Envelope::Error(RelayErrorPayload {
                        code: RelayErrorCode::NotReady,
                        message: "expected relay:hello".to_string(),
                    }),
                )
                .await;
                None
            }
        };
    }
    None
}

/// `LIVE` state: dispatch envelopes until disconnect or idle timeout.
async fn live_loop(
    ws_stream: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    outbound_tx: &mpsc::UnboundedSender<Message>,
    state: &Arc<RelayState>,
    device_id: &str,
) {
    loop {
        let next = tokio::time::timeout(IDLE_TIMEOUT, ws_stream.next()).await;
        let msg = match next {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {
                debug!(device_id, "relay session idle timeout");
                break;
            }
        };

        let Message::Text(text) = msg else {
            if matches!(msg, Message::Close(_)) {
                break;
            }
            continue;
        };

        state.presence.touch(device_id, now_ms());

        let envelope: Envelope = match serde_json::from_str(text.as_str()) {
            Ok(e) => e,
            Err(_) => continue,
        };

        handle_envelope(envelope, outbound_tx, state, device_id).await;
    }
}

async fn handle_envelope(
    envelope: Envelope,
    outbound_tx: &mpsc::UnboundedSender<Message>,
    state: &Arc<RelayState>,
    device_id: &str,
) {
    match envelope {
        Envelope::Heartbeat => {
            send_envelope(outbound_tx, Envelope::Pong).await;
        }
        Envelope::UpdateProfile(HelloPayload { profile }) => {
            let peer = crate::models::Peer {
                device_id: device_id.to_string(),
                display_name: profile.display_name,
                avatar_emoji: profile.avatar_emoji,
                avatar_bg: profile.avatar_bg,
                status_message: profile.status_message,
                app_version: String::new(),
                last_seen_at: now_ms(),
                source: PeerSource::Relay,
                address: None,
                port: None,
            };
            if let Some(change) = state.presence.update_profile(device_id, peer) {
                broadcast_presence_change(state, change, None).await;
            }
        }
        Envelope::PresenceRequest => {
            let (peers, revision) = state.presence.snapshot();
            send_envelope(
                outbound_tx,
                Envelope::Presence(PresenceSnapshotPayload { peers, revision }),
            )
            .await;
        }
        Envelope::Send(frame) => {
            handle_send(frame, outbound_tx, state).await;
        }
        _ => {
            warn!(device_id, "ignoring unexpected envelope in LIVE state");
        }
    }
}

/// `relay:send` routing (§4.4): announce/announce-react/announce-delete go
/// to the ring and fan out; addressed frames are delivered only if the
/// target is live; replies with `relay:send:ack`.
async fn handle_send(frame: Frame, outbound_tx: &mpsc::UnboundedSender<Message>, state: &Arc<RelayState>) {
    let frame_message_id = frame.message_id.clone();
    let mut delivered_to = Vec::new();

    match &frame.payload {
        FramePayload::Announce(_) => {
            state.announcements.insert(frame.clone());
            delivered_to = broadcast_frame(state, &frame).await;
        }
        FramePayload::ChatReact(payload) if frame.to.is_none() => {
            state.announcements.set_reaction(
                &payload.target_message_id,
                &frame.from,
                payload.reaction.map(crate::models::ReactionEmoji::as_str),
            );
            delivered_to = broadcast_frame(state, &frame).await;
        }
        FramePayload::ChatDelete(_) if frame.to.is_none() => {
            state.announcements.delete(&frame.message_id);
            delivered_to = broadcast_frame(state, &frame).await;
        }
        _ => {
            if frame.to.is_none() {
                delivered_to = broadcast_frame(state, &frame).await;
            } else if let Some(target) = &frame.to {
                if let Some(target_tx) = state.presence.outbound_for(target) {
                    send_envelope(&target_tx, Envelope::Deliver(frame.clone())).await;
                    delivered_to.push(target.clone());
                }
            }
        }
    }

    send_envelope(
        outbound_tx,
        Envelope::SendAck(RelaySendAckPayload {
            frame_message_id,
            delivered_to,
        }),
    )
    .await;
}

async fn broadcast_frame(state: &Arc<RelayState>, frame: &Frame) -> Vec<DeviceId> {
    let outbounds = state.presence.all_outbound();
    for tx in &outbounds {
        send_envelope(tx, Envelope::Deliver(frame.clone())).await;
    }
    let (peers, _) = state.presence.snapshot();
    peers.into_iter().map(|p| p.device_id).collect()
}

async fn broadcast_presence_change(
    state: &Arc<RelayState>,
    change: PresenceChange,
    skip_device_id: Option<&str>,
) {
    let (payload, device_id_of_change) = match change {
        PresenceChange::Upsert { peer, revision } => (
            PresenceDeltaPayload {
                op: PresenceOp::Upsert,
                peer: Some(peer.clone()),
                device_id: None,
                revision,
            },
            peer.device_id,
        ),
        PresenceChange::Remove { device_id, revision } => (
            PresenceDeltaPayload {
                op: PresenceOp::Remove,
                peer: None,
                device_id: Some(device_id.clone()),
                revision,
            },
            device_id,
        ),
    };

    let (_, _) = (&device_id_of_change, skip_device_id);
    for tx in state.presence.all_outbound() {
        send_envelope(&tx, Envelope::PresenceDelta(payload.clone())).await;
    }
}

async fn teardown(state: &Arc<RelayState>, device_id: &str) {
    if let Some(change) = state.presence.remove(device_id) {
        broadcast_presence_change(state, change, None).await;
    }
    info!(device_id, "relay session closed");
}
