//! Message service (C6, spec §4.6). All operations are idempotent on
//! `messageId`. Depends only on the `Transport` capability exposed by
//! [`RelayClientHandle`] (§9 "MessageService depends on a Transport
//! capability"), never on the connection manager's internals directly.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use crate::client::connection::RelayClientHandle;
use crate::client::events::{EventBus, TransferDirection, UiEvent};
use crate::error::MessageError;
use crate::frame::{
    AnnouncePayload, ChatDeletePayload, ChatReactPayload, ChatTextPayload, FileChunkPayload,
    FileCompletePayload, FileOfferPayload, Frame, FramePayload,
};
use crate::models::{
    Conversation, DeviceId, Message, MessageDirection, MessageType, ReactionEmoji,
};
use crate::store::Store;
use crate::transfer::{self, ChunkReader};

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Clone)]
pub struct MessageService {
    store: Arc<Store>,
    transport: RelayClientHandle,
    events: EventBus,
    local_device_id: DeviceId,
    attachments_root: PathBuf,
}

impl MessageService {
    pub fn new(
        store: Arc<Store>,
        transport: RelayClientHandle,
        events: EventBus,
        local_device_id: DeviceId,
        attachments_root: PathBuf,
    ) -> Self {
        Self {
            store,
            transport,
            events,
            local_device_id,
            attachments_root,
        }
    }

    fn ensure_dm(&self, peer_id: &str, now: i64) -> Result<String, MessageError> {
        let conversation_id = Conversation::dm_id(peer_id);
        self.store
            .ensure_conversation(&Conversation::dm(peer_id, peer_id, now))?;
        Ok(conversation_id)
    }

    pub async fn send_text(&self, peer_id: &str, text: &str) -> Result<Message, MessageError> {
        let now = now_ms();
        let conversation_id = self.ensure_dm(peer_id, now)?;
        let created_at = self.store.reserve_conversation_timestamp(&conversation_id, now)?;

        let frame = Frame {
            message_id: Uuid::new_v4().to_string(),
            from: self.local_device_id.clone(),
            to: Some(peer_id.to_string()),
            created_at,
            payload: FramePayload::ChatText(ChatTextPayload { text: text.to_string() }),
        };

        let ack = self.transport.send_frame(frame.clone()).await;
        let delivered = matches!(&ack, Ok(to) if to.contains(&peer_id.to_string()));

        let row = Message {
            message_id: frame.message_id.clone(),
            conversation_id: conversation_id.clone(),
            direction: MessageDirection::Out,
            sender_device_id: self.local_device_id.clone(),
            receiver_device_id: Some(peer_id.to_string()),
            message_type: MessageType::Text,
            body_text: Some(text.to_string()),
            file_id: None,
            file_name: None,
            file_size: None,
            file_sha256: None,
            file_path: None,
            status: Some(if delivered {
                crate::models::MessageStatus::Sent
            } else {
                crate::models::MessageStatus::Failed
            }),
            reaction: None,
            deleted_at: None,
            created_at,
        };
        self.store.save_message(&row)?;
        self.events.emit(UiEvent::MessageReceived {
            conversation_id,
            message_id: row.message_id.clone(),
        });

        if !delivered {
            return Err(MessageError::PeerOffline);
        }
        Ok(row)
    }

    pub async fn send_announcement(&self, text: &str) -> Result<Message, MessageError> {
        let now = now_ms();
        self.store
            .ensure_conversation(&Conversation::announcements(now))?;
        let created_at = self
            .store
            .reserve_conversation_timestamp(Conversation::ANNOUNCEMENTS_ID, now)?;

        let frame = Frame {
            message_id: Uuid::new_v4().to_string(),
            from: self.local_device_id.clone(),
            to: None,
            created_at,
            payload: FramePayload::Announce(AnnouncePayload { text: text.to_string() }),
        };
        let _ = self.transport.send_frame(frame.clone()).await;

        let row = Message {
            message_id: frame.message_id,
            conversation_id: Conversation::ANNOUNCEMENTS_ID.to_string(),
            direction: MessageDirection::Out,
            sender_device_id: self.local_device_id.clone(),
            receiver_device_id: None,
            message_type: MessageType::Announcement,
            body_text: Some(text.to_string()),
            file_id: None,
            file_name: None,
            file_size: None,
            file_sha256: None,
            file_path: None,
            status: Some(crate::models::MessageStatus::Sent),
            reaction: None,
            deleted_at: None,
            created_at,
        };
        self.store.save_message(&row)?;
        Ok(row)
    }

    /// `sendFile` (§4.6): persists immediately with the local path, then
    /// drives offer/chunks/complete on a separate task so the caller never
    /// blocks on transport I/O.
    pub async fn send_file(&self, peer_id: &str, source: &Path) -> Result<Message, MessageError> {
        let now = now_ms();
        let conversation_id = self.ensure_dm(peer_id, now)?;
        let created_at = self.store.reserve_conversation_timestamp(&conversation_id, now)?;
        let message_id = Uuid::new_v4().to_string();
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "arquivo".to_string());

        let (path, sha256, size) = transfer::prepare_outgoing_file(
            source,
            &self.attachments_root,
            &message_id,
            &file_name,
        )
        .await
        .map_err(MessageError::Transfer)?;

        let row = Message {
            message_id: message_id.clone(),
            conversation_id: conversation_id.clone(),
            direction: MessageDirection::Out,
            sender_device_id: self.local_device_id.clone(),
            receiver_device_id: Some(peer_id.to_string()),
            message_type: MessageType::File,
            body_text: None,
            file_id: Some(Uuid::new_v4().to_string()),
            file_name: Some(file_name.clone()),
            file_size: Some(size),
            file_sha256: Some(sha256.clone()),
            file_path: Some(path.to_string_lossy().into_owned()),
            status: Some(crate::models::MessageStatus::Sent),
            reaction: None,
            deleted_at: None,
            created_at,
        };
        self.store.save_message(&row)?;
        self.events.emit(UiEvent::TransferProgress {
            direction: TransferDirection::Send,
            file_id: row.file_id.clone().unwrap_or_default(),
            message_id: row.message_id.clone(),
            peer_id: peer_id.to_string(),
            transferred: 0,
            total: size,
        });

        let service = self.clone();
        let peer_id = peer_id.to_string();
        let row_clone = row.clone();
        tokio::spawn(async move {
            if let Err(err) = service.run_file_transfer(&peer_id, &row_clone, &path).await {
                warn!(%err, message_id = %row_clone.message_id, "file transfer failed");
                let _ = service.store.set_message_status(
                    &row_clone.message_id,
                    crate::models::MessageStatus::Failed,
                );
                service.events.emit(UiEvent::UiToast {
                    message: format!("failed to send {}", row_clone.file_name.unwrap_or_default()),
                });
            }
        });

        Ok(row)
    }

    async fn run_file_transfer(
        &self,
        peer_id: &str,
        row: &Message,
        path: &Path,
    ) -> Result<(), MessageError> {
        let file_id = row.file_id.clone().unwrap_or_default();
        let mut reader = ChunkReader::open(path, 0).await.map_err(MessageError::Transfer)?;
        let total_chunks = reader.total();

        let offer = Frame {
            message_id: Uuid::new_v4().to_string(),
            from: self.local_device_id.clone(),
            to: Some(peer_id.to_string()),
            created_at: now_ms(),
            payload: FramePayload::FileOffer(FileOfferPayload {
                file_id: file_id.clone(),
                message_id: row.message_id.clone(),
                filename: row.file_name.clone().unwrap_or_default(),
                size: row.file_size.unwrap_or(0),
                sha256: row.file_sha256.clone().unwrap_or_default(),
            }),
        };
        self.transport.send_frame(offer).await?;

        let mut index = 0;
        let mut transferred = 0u64;
        while let Some((idx, data)) = reader.next_chunk(index).await.map_err(MessageError::Transfer)? {
            let chunk_len = data.len() as u64 * 3 / 4;
            let chunk = Frame {
                message_id: Uuid::new_v4().to_string(),
                from: self.local_device_id.clone(),
                to: Some(peer_id.to_string()),
                created_at: now_ms(),
                payload: FramePayload::FileChunk(FileChunkPayload {
                    file_id: file_id.clone(),
                    index: idx,
                    total: total_chunks,
                    data_base64: data,
                }),
            };
            self.transport.send_frame(chunk).await?;
            transferred += chunk_len;
            self.events.emit(UiEvent::TransferProgress {
                direction: TransferDirection::Send,
                file_id: file_id.clone(),
                message_id: row.message_id.clone(),
                peer_id: peer_id.to_string(),
                transferred,
                total: row.file_size.unwrap_or(0),
            });
            index += 1;
        }

        let complete = Frame {
            message_id: Uuid::new_v4().to_string(),
            from: self.local_device_id.clone(),
            to: Some(peer_id.to_string()),
            created_at: now_ms(),
            payload: FramePayload::FileComplete(FileCompletePayload { file_id }),
        };
        self.transport.send_frame(complete).await?;
        self.store
            .set_message_status(&row.message_id, crate::models::MessageStatus::Delivered)?;
        Ok(())
    }

    /// Peer transitioned offline→online: retry failed text and replay
    /// pending files, in creation order (§4.6).
    pub async fn retry_failed_messages_for_peer(&self, peer_id: &str) -> Result<(), MessageError> {
        let conversation_id = Conversation::dm_id(peer_id);
        for row in self.store.failed_text_messages(&conversation_id)? {
            if let Some(text) = &row.body_text {
                let _ = self.send_text(peer_id, text).await;
            }
        }
        Ok(())
    }

    pub async fn replay_pending_files_for_peer(&self, peer_id: &str) -> Result<(), MessageError> {
        let conversation_id = Conversation::dm_id(peer_id);
        for row in self.store.pending_file_messages(&conversation_id)? {
            if let Some(path) = &row.file_path {
                let path = PathBuf::from(path);
                if path.exists() {
                    let service = self.clone();
                    let peer_id = peer_id.to_string();
                    let row_clone = row.clone();
                    tokio::spawn(async move {
                        let _ = service.run_file_transfer(&peer_id, &row_clone, &path).await;
                    });
                }
            }
        }
        Ok(())
    }

    /// Upsert-or-delete a reaction locally, emit the appropriate event, and
    /// gossip `chat:react` to the counterpart (DM) or broadcast it
    /// (announcement) (§4.6).
    pub async fn react_to_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        reaction: Option<ReactionEmoji>,
    ) -> Result<(), MessageError> {
        self.store.set_message_reaction(message_id, reaction)?;

        let conversation = self.store.get_conversation(conversation_id)?;
        let to = conversation.as_ref().and_then(|c| c.peer_device_id.clone());

        let frame = Frame {
            message_id: Uuid::new_v4().to_string(),
            from: self.local_device_id.clone(),
            to: to.clone(),
            created_at: now_ms(),
            payload: FramePayload::ChatReact(ChatReactPayload {
                target_message_id: message_id.to_string(),
                reaction,
            }),
        };
        let _ = self.transport.send_frame(frame).await;

        let event = if to.is_some() {
            UiEvent::MessageReactions {
                message_id: message_id.to_string(),
                reactions: reaction
                    .map(|r| vec![(self.local_device_id.clone(), r)])
                    .unwrap_or_default(),
            }
        } else {
            UiEvent::AnnouncementReactions {
                message_id: message_id.to_string(),
                reactions: reaction
                    .map(|r| vec![(self.local_device_id.clone(), r)])
                    .unwrap_or_default(),
            }
        };
        self.events.emit(event);
        Ok(())
    }

    /// Only outgoing messages may be deleted for everyone (§4.6).
    pub async fn delete_message_for_everyone(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<(), MessageError> {
        let existing = self.store.get_message(message_id)?.ok_or(MessageError::NotFound)?;
        if existing.direction != MessageDirection::Out {
            return Err(MessageError::NotOwner);
        }

        let deleted_at = now_ms();
        if let Some(path) = &existing.file_path {
            let path = PathBuf::from(path);
            if path.starts_with(&self.attachments_root) {
                tokio::fs::remove_file(&path).await.ok();
            }
        }
        self.store.delete_message_for_everyone(message_id, deleted_at)?;

        let conversation = self.store.get_conversation(conversation_id)?;
        let to = conversation.as_ref().and_then(|c| c.peer_device_id.clone());
        let frame = Frame {
            message_id: Uuid::new_v4().to_string(),
            from: self.local_device_id.clone(),
            to,
            created_at: deleted_at,
            payload: FramePayload::ChatDelete(ChatDeletePayload {
                target_message_id: message_id.to_string(),
            }),
        };
        let _ = self.transport.send_frame(frame).await;

        self.events.emit(UiEvent::MessageRemoved {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
        });
        Ok(())
    }
}
