//! Control loop (C10, spec §4.10): the single task that demultiplexes
//! inbound Relay envelopes and connection lifecycle events into the other
//! client services. Mirrors the cooperative-ownership pattern in
//! `connection.rs`'s `Machine` — one task owns `PeerDirectory`,
//! `TransferArena`, `SyncCooldowns`, and the typing-expiry map, and every
//! mutation happens on this task so nothing downstream needs its own lock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::warn;

use crate::client::connection::{ClientEvent, Phase, RelayClientHandle};
use crate::client::events::{EventBus, RelayConnectionState, TransferDirection, UiEvent};
use crate::client::messages::{now_ms, MessageService};
use crate::client::presence::PeerDirectory;
use crate::client::sync::{self, SyncCooldowns};
use crate::frame::{ChatAckPayload, ChatSyncRequestPayload, Frame, FramePayload};
use crate::models::{Conversation, DeviceId, Message, MessageDirection, MessageStatus, MessageType, Peer, PeerSource};
use crate::store::Store;
use crate::transfer::{IncomingTransfer, TransferArena, TransferOutcome};

/// How long a `typing: true` indicator is shown before it auto-expires in
/// the absence of a refresh or an explicit `typing: false` (§4.9).
const TYPING_TTL: Duration = Duration::from_millis(3200);
const TYPING_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// `limit` for the sync request issued on a peer's offline→online
/// transition (§4.7). Distinct from `sync::MAX_SYNC_LIMIT`, which bounds
/// `buildSyncMessages`'s own clamp range on the responding side.
const ONLINE_SYNC_LIMIT: u32 = 1000;

struct Inner {
    store: Arc<Store>,
    messages: MessageService,
    transport: RelayClientHandle,
    events: EventBus,
    local_device_id: DeviceId,
    attachments_root: PathBuf,
    peers: PeerDirectory,
    sync_cooldowns: SyncCooldowns,
    transfers: TransferArena,
    typing: HashMap<DeviceId, Instant>,
}

/// A peer added through the manual overlay (§4.8) rather than observed live
/// via Relay/mDNS — e.g. a contact the user typed in directly.
enum PeerCommand {
    AddManual(Peer),
    RemoveManual(DeviceId),
}

/// Handle for driving the manual-peer overlay from outside the control
/// loop, the same channel-plus-command shape as [`RelayClientHandle`].
#[derive(Clone)]
pub struct ControlHandle {
    commands: mpsc::UnboundedSender<PeerCommand>,
}

impl ControlHandle {
    pub fn add_manual_peer(&self, peer: crate::models::Peer) {
        let _ = self.commands.send(PeerCommand::AddManual(peer));
    }

    pub fn remove_manual_peer(&self, device_id: &str) {
        let _ = self.commands.send(PeerCommand::RemoveManual(device_id.to_string()));
    }
}

/// Spawns the control loop task. `client_events` is the receiver half of
/// the channel passed to `connection::spawn`. Seeds the cache overlay from
/// the store's persisted peer cache (§4.8: "known-peers, from local cache")
/// so a restarted client doesn't forget everyone it has already met.
pub fn spawn(
    store: Arc<Store>,
    messages: MessageService,
    transport: RelayClientHandle,
    events: EventBus,
    local_device_id: DeviceId,
    attachments_root: PathBuf,
    client_events: mpsc::UnboundedReceiver<ClientEvent>,
) -> ControlHandle {
    let mut peers = PeerDirectory::new();
    for peer in store.list_cached_peers().unwrap_or_default() {
        peers.set_cache(peer);
    }

    let inner = Inner {
        store,
        messages,
        transport,
        events,
        local_device_id,
        attachments_root,
        peers,
        sync_cooldowns: SyncCooldowns::new(),
        transfers: TransferArena::new(),
        typing: HashMap::new(),
    };
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    tokio::spawn(run(inner, client_events, commands_rx));
    ControlHandle { commands: commands_tx }
}

async fn run(
    mut inner: Inner,
    mut client_events: mpsc::UnboundedReceiver<ClientEvent>,
    mut commands: mpsc::UnboundedReceiver<PeerCommand>,
) {
    loop {
        let sweep = tokio::time::sleep(TYPING_SWEEP_INTERVAL);
        tokio::select! {
            event = client_events.recv() => {
                match event {
                    Some(event) => handle_client_event(&mut inner, event).await,
                    None => return,
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(PeerCommand::AddManual(peer)) => {
                        inner.peers.set_manual(peer);
                        inner.events.emit(UiEvent::PeersUpdated(inner.peers.merged_view()));
                    }
                    Some(PeerCommand::RemoveManual(device_id)) => {
                        inner.peers.remove_manual(&device_id);
                        inner.events.emit(UiEvent::PeersUpdated(inner.peers.merged_view()));
                    }
                    None => {}
                }
            }
            _ = sweep => {
                sweep_typing(&mut inner);
                inner.peers.tick_forgotten(now_ms());
            }
        }
    }
}

fn sweep_typing(inner: &mut Inner) {
    let now = Instant::now();
    let expired: Vec<DeviceId> = inner
        .typing
        .iter()
        .filter(|(_, started)| now.duration_since(**started) >= TYPING_TTL)
        .map(|(id, _)| id.clone())
        .collect();
    for peer_id in expired {
        inner.typing.remove(&peer_id);
        inner.events.emit(UiEvent::TypingUpdate { peer_id, is_typing: false });
    }
}

async fn handle_client_event(inner: &mut Inner, event: ClientEvent) {
    match event {
        ClientEvent::ConnectionState(phase) => handle_connection_state(inner, phase),
        ClientEvent::Deliver(frame) => handle_deliver(inner, frame).await,
        ClientEvent::PresenceSnapshot(snapshot) => handle_presence_snapshot(inner, snapshot),
        ClientEvent::PresenceDelta(delta) => handle_presence_delta(inner, delta).await,
        ClientEvent::AnnouncementSnapshot(snapshot) => handle_announcement_snapshot(inner, snapshot),
        ClientEvent::AnnouncementExpired(expired) => {
            inner.events.emit(UiEvent::UiToast {
                message: format!("{} announcement(s) expired", expired.message_ids.len()),
            });
        }
    }
}

fn handle_connection_state(inner: &mut Inner, phase: Phase) {
    let state = match phase {
        Phase::Idle => RelayConnectionState::Idle,
        Phase::Connecting => RelayConnectionState::Connecting,
        Phase::Ready => RelayConnectionState::Ready,
        Phase::Closed => RelayConnectionState::Closed,
    };
    inner.events.emit(UiEvent::RelayConnection(state));
}

fn handle_presence_snapshot(inner: &mut Inner, snapshot: crate::frame::PresenceSnapshotPayload) {
    for peer in &snapshot.peers {
        inner.peers.set_live(peer.clone());
        let _ = inner.store.upsert_cached_peer(&cache_copy(peer));
    }
    inner.events.emit(UiEvent::PeersUpdated(inner.peers.merged_view()));
}

async fn handle_presence_delta(inner: &mut Inner, delta: crate::frame::PresenceDeltaPayload) {
    match delta.op {
        crate::frame::PresenceOp::Upsert => {
            if let Some(peer) = delta.peer {
                let is_new = !inner.peers.is_live(&peer.device_id);
                let _ = inner.store.upsert_cached_peer(&cache_copy(&peer));
                inner.peers.set_live(peer.clone());
                if is_new {
                    on_peer_came_online(inner, &peer.device_id).await;
                }
            }
        }
        crate::frame::PresenceOp::Remove => {
            if let Some(device_id) = delta.device_id {
                inner.peers.remove_live(&device_id);
            }
        }
    }
    inner.events.emit(UiEvent::PeersUpdated(inner.peers.merged_view()));
}

fn cache_copy(peer: &Peer) -> Peer {
    let mut cached = peer.clone();
    cached.source = PeerSource::Cache;
    cached
}

/// §4.7/§4.6: a peer transitioning offline→online triggers a cooldown-gated
/// sync request and a replay of anything queued for them.
async fn on_peer_came_online(inner: &mut Inner, peer_id: &str) {
    let _ = inner.messages.retry_failed_messages_for_peer(peer_id).await;
    let _ = inner.messages.replay_pending_files_for_peer(peer_id).await;

    if !inner.sync_cooldowns.try_begin(peer_id) {
        return;
    }
    let conversation_id = Conversation::dm_id(peer_id);
    let since = inner.store.latest_dm_timestamp(&conversation_id).unwrap_or(0);
    let frame = Frame {
        message_id: uuid::Uuid::new_v4().to_string(),
        from: inner.local_device_id.clone(),
        to: Some(peer_id.to_string()),
        created_at: now_ms(),
        payload: FramePayload::ChatSyncRequest(ChatSyncRequestPayload {
            since,
            limit: ONLINE_SYNC_LIMIT,
        }),
    };
    inner.events.emit(UiEvent::SyncStatus { peer_id: peer_id.to_string(), in_progress: true });
    let _ = inner.transport.send_frame(frame).await;
}

async fn handle_announcement_snapshot(inner: &mut Inner, snapshot: crate::frame::AnnouncementSnapshotPayload) {
    let now = now_ms();
    let _ = inner.store.ensure_conversation(&Conversation::announcements(now));
    for frame in &snapshot.frames {
        if let Some(row) = frame_to_announcement_row(frame) {
            let _ = inner.store.save_message(&row);
        }
    }
    inner.events.emit(UiEvent::Navigate {
        conversation_id: Conversation::ANNOUNCEMENTS_ID.to_string(),
    });
}

fn frame_to_announcement_row(frame: &Frame) -> Option<Message> {
    let text = match &frame.payload {
        FramePayload::Announce(p) => p.text.clone(),
        _ => return None,
    };
    Some(Message {
        message_id: frame.message_id.clone(),
        conversation_id: Conversation::ANNOUNCEMENTS_ID.to_string(),
        direction: MessageDirection::In,
        sender_device_id: frame.from.clone(),
        receiver_device_id: None,
        message_type: MessageType::Announcement,
        body_text: Some(text),
        file_id: None,
        file_name: None,
        file_size: None,
        file_sha256: None,
        file_path: None,
        status: Some(MessageStatus::Delivered),
        reaction: None,
        deleted_at: None,
        created_at: frame.created_at,
    })
}

/// §4.8/§8 invariant 7: from the moment a peer is forgotten until the Relay
/// reports it offline once, every non-`announce` frame from that peer is
/// dropped.
async fn handle_deliver(inner: &mut Inner, frame: Frame) {
    if inner.peers.is_forgotten_and_waiting(&frame.from) && !matches!(frame.payload, FramePayload::Announce(_)) {
        return;
    }
    match &frame.payload {
        FramePayload::ChatText(p) => handle_chat_text(inner, &frame, &p.text).await,
        FramePayload::ChatAck(p) => handle_chat_ack(inner, p),
        FramePayload::ChatReact(p) => handle_chat_react(inner, &frame, p),
        FramePayload::ChatDelete(p) => handle_chat_delete(inner, &frame, &p.target_message_id),
        FramePayload::ChatClear(_) => handle_chat_clear(inner, &frame).await,
        FramePayload::ChatForget(_) => handle_chat_forget(inner, &frame),
        FramePayload::ChatSyncRequest(p) => handle_sync_request(inner, &frame, p).await,
        FramePayload::ChatSyncResponse(p) => handle_sync_response(inner, &frame, p).await,
        FramePayload::Announce(_) => {
            if let Some(row) = frame_to_announcement_row(&frame) {
                let _ = inner.store.ensure_conversation(&Conversation::announcements(now_ms()));
                if inner.store.save_message(&row).unwrap_or(false) {
                    inner.events.emit(UiEvent::MessageReceived {
                        conversation_id: Conversation::ANNOUNCEMENTS_ID.to_string(),
                        message_id: row.message_id,
                    });
                }
            }
        }
        FramePayload::FileOffer(p) => handle_file_offer(inner, &frame, p.clone()).await,
        FramePayload::FileChunk(p) => handle_file_chunk(inner, p.clone()).await,
        FramePayload::FileComplete(p) => handle_file_complete(inner, p.file_id.clone()).await,
        FramePayload::Typing(p) => handle_typing(inner, &frame.from, p.is_typing),
        FramePayload::Unknown => {}
    }
}

async fn handle_chat_text(inner: &mut Inner, frame: &Frame, text: &str) {
    let conversation_id = Conversation::dm_id(&frame.from);
    let _ = inner
        .store
        .ensure_conversation(&Conversation::dm(&frame.from, &frame.from, frame.created_at));

    let row = Message {
        message_id: frame.message_id.clone(),
        conversation_id: conversation_id.clone(),
        direction: MessageDirection::In,
        sender_device_id: frame.from.clone(),
        receiver_device_id: Some(inner.local_device_id.clone()),
        message_type: MessageType::Text,
        body_text: Some(text.to_string()),
        file_id: None,
        file_name: None,
        file_size: None,
        file_sha256: None,
        file_path: None,
        status: Some(MessageStatus::Delivered),
        reaction: None,
        deleted_at: None,
        created_at: frame.created_at,
    };
    let inserted = inner.store.save_message(&row).unwrap_or(false);
    if inserted {
        inner.events.emit(UiEvent::MessageReceived {
            conversation_id,
            message_id: row.message_id.clone(),
        });
    }

    let ack = Frame {
        message_id: uuid::Uuid::new_v4().to_string(),
        from: inner.local_device_id.clone(),
        to: Some(frame.from.clone()),
        created_at: now_ms(),
        payload: FramePayload::ChatAck(ChatAckPayload {
            ack_message_id: frame.message_id.clone(),
            status: MessageStatus::Delivered,
        }),
    };
    let _ = inner.transport.send_frame(ack).await;
}

fn handle_chat_ack(inner: &mut Inner, ack: &ChatAckPayload) {
    let _ = inner.store.set_message_status(&ack.ack_message_id, ack.status);
    inner.events.emit(UiEvent::MessageStatus {
        message_id: ack.ack_message_id.clone(),
        status: ack.status,
    });
}

fn handle_chat_react(inner: &mut Inner, frame: &Frame, payload: &crate::frame::ChatReactPayload) {
    let _ = inner
        .store
        .set_message_reaction(&payload.target_message_id, payload.reaction);
    let reactions = payload
        .reaction
        .map(|r| vec![(frame.from.clone(), r)])
        .unwrap_or_default();
    if frame.to.is_none() {
        inner.events.emit(UiEvent::AnnouncementReactions {
            message_id: payload.target_message_id.clone(),
            reactions,
        });
    } else {
        inner.events.emit(UiEvent::MessageReactions {
            message_id: payload.target_message_id.clone(),
            reactions,
        });
    }
}

fn handle_chat_delete(inner: &mut Inner, frame: &Frame, target_message_id: &str) {
    if let Ok(Some(existing)) = inner.store.get_message(target_message_id) {
        let _ = inner
            .store
            .delete_message_for_everyone(target_message_id, frame.created_at);
        inner.events.emit(UiEvent::MessageRemoved {
            conversation_id: existing.conversation_id,
            message_id: target_message_id.to_string(),
        });
    }
}

async fn handle_chat_clear(inner: &mut Inner, frame: &Frame) {
    let conversation_id = Conversation::dm_id(&frame.from);
    if let Ok(paths) = inner.store.clear_conversation(&conversation_id) {
        for path in paths {
            let path = PathBuf::from(path);
            if path.starts_with(&inner.attachments_root) {
                tokio::fs::remove_file(&path).await.ok();
            }
        }
        inner.events.emit(UiEvent::ConversationCleared { conversation_id });
    }
}

fn handle_chat_forget(inner: &mut Inner, frame: &Frame) {
    let now = now_ms();
    inner.peers.forget(&frame.from, now);
    let _ = inner.store.set_forgotten(&frame.from, true, now);
    let _ = inner.store.remove_cached_peer(&frame.from);
    inner.events.emit(UiEvent::PeersUpdated(inner.peers.merged_view()));
}

async fn handle_sync_request(inner: &mut Inner, frame: &Frame, payload: &ChatSyncRequestPayload) {
    let messages = sync::build_sync_messages(&inner.store, &frame.from, payload.since, payload.limit)
        .unwrap_or_default();
    let response = Frame {
        message_id: uuid::Uuid::new_v4().to_string(),
        from: inner.local_device_id.clone(),
        to: Some(frame.from.clone()),
        created_at: now_ms(),
        payload: FramePayload::ChatSyncResponse(crate::frame::ChatSyncResponsePayload {
            messages: messages.iter().map(crate::models::SyncMessage::from).collect(),
        }),
    };
    let _ = inner.transport.send_frame(response).await;
}

/// §4.7: idempotent under replay — a row already present returns
/// `inserted: false` and must not re-emit `message:received`, and every
/// newly-inserted incoming row gets a `chat:ack { status: delivered }` back
/// to the sender so upstream status bubbles up (mirrors `handle_chat_text`).
async fn handle_sync_response(inner: &mut Inner, frame: &Frame, payload: &crate::frame::ChatSyncResponsePayload) {
    let known_peers = inner.peers.online_device_ids();
    let now = now_ms();
    for synced in &payload.messages {
        let row = Message {
            message_id: synced.message_id.clone(),
            conversation_id: String::new(),
            direction: synced.direction,
            sender_device_id: synced.sender_device_id.clone(),
            receiver_device_id: synced.receiver_device_id.clone(),
            message_type: synced.message_type,
            body_text: synced.body_text.clone(),
            file_id: synced.file_id.clone(),
            file_name: synced.file_name.clone(),
            file_size: synced.file_size,
            file_sha256: synced.file_sha256.clone(),
            file_path: None,
            status: synced.status,
            reaction: synced.reaction,
            deleted_at: synced.deleted_at,
            created_at: synced.created_at,
        };
        if let Ok(Some(applied)) =
            sync::apply_synced_message(&inner.store, &inner.local_device_id, row, &known_peers, now)
        {
            if !applied.inserted {
                continue;
            }
            inner.events.emit(UiEvent::MessageReceived {
                conversation_id: applied.row.conversation_id,
                message_id: applied.row.message_id.clone(),
            });
            if applied.row.direction == MessageDirection::In
                && matches!(applied.row.message_type, MessageType::Text | MessageType::Announcement)
            {
                let ack = Frame {
                    message_id: uuid::Uuid::new_v4().to_string(),
                    from: inner.local_device_id.clone(),
                    to: Some(frame.from.clone()),
                    created_at: now_ms(),
                    payload: FramePayload::ChatAck(ChatAckPayload {
                        ack_message_id: applied.row.message_id,
                        status: MessageStatus::Delivered,
                    }),
                };
                let _ = inner.transport.send_frame(ack).await;
            }
        }
    }
    inner.events.emit(UiEvent::SyncStatus { peer_id: frame.from.clone(), in_progress: false });
}

fn handle_typing(inner: &mut Inner, peer_id: &str, is_typing: bool) {
    if is_typing {
        inner.typing.insert(peer_id.to_string(), Instant::now());
    } else {
        inner.typing.remove(peer_id);
    }
    inner.events.emit(UiEvent::TypingUpdate {
        peer_id: peer_id.to_string(),
        is_typing,
    });
}

/// Idempotent-success policy for a re-offer of an already-finalized
/// `fileId` (§9 Open Question): a transfer still in flight is left alone,
/// a transfer already delivered is acknowledged without restarting it, and
/// only a genuinely new `fileId` opens a new arena slot.
async fn handle_file_offer(inner: &mut Inner, frame: &Frame, payload: crate::frame::FileOfferPayload) {
    if inner.transfers.contains(&payload.file_id) {
        return;
    }
    if let Ok(Some(existing)) = inner.store.get_message(&payload.message_id) {
        if existing.file_path.is_some() && existing.status == Some(MessageStatus::Delivered) {
            return;
        }
    }

    let conversation_id = Conversation::dm_id(&frame.from);
    let _ = inner
        .store
        .ensure_conversation(&Conversation::dm(&frame.from, &frame.from, frame.created_at));

    let row = Message {
        message_id: payload.message_id.clone(),
        conversation_id: conversation_id.clone(),
        direction: MessageDirection::In,
        sender_device_id: frame.from.clone(),
        receiver_device_id: Some(inner.local_device_id.clone()),
        message_type: MessageType::File,
        body_text: None,
        file_id: Some(payload.file_id.clone()),
        file_name: Some(payload.filename.clone()),
        file_size: Some(payload.size),
        file_sha256: Some(payload.sha256.clone()),
        file_path: None,
        status: Some(MessageStatus::Sent),
        reaction: None,
        deleted_at: None,
        created_at: frame.created_at,
    };
    let _ = inner.store.save_message(&row);

    match IncomingTransfer::open(
        &inner.attachments_root,
        &payload.message_id,
        &frame.from,
        &payload.file_id,
        &payload.filename,
        crate::transfer::chunk_count(payload.size),
        &payload.sha256,
        payload.size,
    )
    .await
    {
        Ok(transfer) => inner.transfers.insert(transfer),
        Err(err) => warn!(%err, "failed to open incoming transfer"),
    }

    inner.events.emit(UiEvent::TransferProgress {
        direction: TransferDirection::Receive,
        file_id: payload.file_id,
        message_id: row.message_id,
        peer_id: frame.from.clone(),
        transferred: 0,
        total: payload.size,
    });
}

async fn handle_file_chunk(inner: &mut Inner, payload: crate::frame::FileChunkPayload) {
    let Some(transfer) = inner.transfers.get_mut(&payload.file_id) else {
        return;
    };
    if let Err(err) = transfer
        .accept_chunk(payload.index, payload.total, &payload.data_base64)
        .await
    {
        warn!(%err, file_id = %payload.file_id, "rejecting bad chunk");
        return;
    }
    inner.events.emit(UiEvent::TransferProgress {
        direction: TransferDirection::Receive,
        file_id: payload.file_id.clone(),
        message_id: transfer.message_id.clone(),
        peer_id: transfer.sender_device_id.clone(),
        transferred: transfer.transferred_bytes(),
        total: payload.total * crate::transfer::CHUNK_SIZE as u64,
    });
}

async fn handle_file_complete(inner: &mut Inner, file_id: String) {
    let Some(transfer) = inner.transfers.remove(&file_id) else {
        return;
    };
    let message_id = transfer.message_id.clone();
    let conversation_id = Conversation::dm_id(&transfer.sender_device_id);

    match transfer.finalize().await {
        Ok(TransferOutcome::Delivered { path }) => {
            let _ = inner.store.merge_message_state_from_sync(
                &message_id,
                None,
                None,
                None,
                None,
                Some(MessageStatus::Delivered),
                None,
                None,
            );
            let _ = inner
                .store
                .set_message_file_path(&message_id, &path.to_string_lossy());
            inner.events.emit(UiEvent::MessageUpdated { conversation_id, message_id });
        }
        Ok(TransferOutcome::Failed) | Err(_) => {
            let _ = inner.store.set_message_status(&message_id, MessageStatus::Failed);
            inner.events.emit(UiEvent::MessageUpdated { conversation_id, message_id });
        }
    }
}
