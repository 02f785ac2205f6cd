//! Sync service (C7, spec §4.7): pairwise history reconciliation.
//!
//! Announcements are never synced pairwise — the Relay's snapshot/expiry is
//! authoritative for those (§4.7).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::models::{Conversation, DeviceId, Message, MessageDirection};
use crate::store::Store;

pub const MIN_SYNC_LIMIT: u32 = 100;
pub const MAX_SYNC_LIMIT: u32 = 2000;
pub const SYNC_COOLDOWN: Duration = Duration::from_secs(12);

pub fn clamp_limit(limit: u32) -> u32 {
    limit.clamp(MIN_SYNC_LIMIT, MAX_SYNC_LIMIT)
}

/// `buildSyncMessages` (§4.7): DM rows with `type in {text, file}` and
/// `createdAt > since`, ordered `(createdAt, messageId)`, capped at `limit`.
pub fn build_sync_messages(
    store: &Store,
    peer_id: &str,
    since: i64,
    limit: u32,
) -> Result<Vec<Message>, crate::error::StoreError> {
    store.dm_messages_since(&Conversation::dm_id(peer_id), since, clamp_limit(limit))
}

pub struct ApplyResult {
    pub inserted: bool,
    pub row: Message,
}

/// `applySyncedMessage` (§4.7): determines the counterpart, ensures the DM
/// conversation, normalizes `createdAt`, then inserts-or-merges.
pub fn apply_synced_message(
    store: &Store,
    local_device_id: &str,
    mut row: Message,
    known_peers: &[DeviceId],
    now: i64,
) -> Result<Option<ApplyResult>, crate::error::StoreError> {
    let counterpart = match row.direction {
        MessageDirection::In => row.sender_device_id.clone(),
        MessageDirection::Out => row
            .receiver_device_id
            .clone()
            .unwrap_or_else(|| row.sender_device_id.clone()),
    };
    if counterpart == local_device_id {
        return Ok(None);
    }
    if !known_peers.contains(&counterpart) {
        return Ok(None);
    }

    let conversation_id = Conversation::dm_id(&counterpart);
    row.conversation_id = conversation_id.clone();
    store.ensure_conversation(&Conversation::dm(&counterpart, &counterpart, now))?;

    if row.direction == MessageDirection::In && row.created_at > now {
        row.created_at = now;
    }

    if store.save_message(&row)? {
        Ok(Some(ApplyResult { inserted: true, row }))
    } else {
        let merged = store
            .merge_message_state_from_sync(
                &row.message_id,
                row.file_id.as_deref(),
                row.file_name.as_deref(),
                row.file_size,
                row.file_sha256.as_deref(),
                row.status,
                row.reaction,
                row.deleted_at,
            )?
            .unwrap_or(row);
        Ok(Some(ApplyResult { inserted: false, row: merged }))
    }
}

/// Per-peer sync-request cooldown (§4.7: "subject to a per-peer cooldown of 12s").
#[derive(Default)]
pub struct SyncCooldowns {
    last_requested: HashMap<DeviceId, Instant>,
}

impl SyncCooldowns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_begin(&mut self, peer_id: &str) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_requested.get(peer_id) {
            if now.duration_since(*last) < SYNC_COOLDOWN {
                return false;
            }
        }
        self.last_requested.insert(peer_id.to_string(), now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageStatus, MessageType};

    fn msg(id: &str, direction: MessageDirection, created_at: i64) -> Message {
        Message {
            message_id: id.to_string(),
            conversation_id: "placeholder".to_string(),
            direction,
            sender_device_id: if direction == MessageDirection::In { "bob".into() } else { "me".into() },
            receiver_device_id: if direction == MessageDirection::In { Some("me".into()) } else { Some("bob".into()) },
            message_type: MessageType::Text,
            body_text: Some("hi".into()),
            file_id: None,
            file_name: None,
            file_size: None,
            file_sha256: None,
            file_path: None,
            status: Some(MessageStatus::Sent),
            reaction: None,
            deleted_at: None,
            created_at,
        }
    }

    #[test]
    fn applying_twice_is_idempotent() {
        let store = Store::open(std::env::temp_dir().join(format!("lantern_sync_test_{}.db", uuid::Uuid::new_v4())))
            .unwrap();
        let known = vec!["bob".to_string()];
        let first = apply_synced_message(&store, "me", msg("m1", MessageDirection::In, 10), &known, 100)
            .unwrap()
            .unwrap();
        assert!(first.inserted);
        let second = apply_synced_message(&store, "me", msg("m1", MessageDirection::In, 10), &known, 100)
            .unwrap()
            .unwrap();
        assert!(!second.inserted);
    }

    #[test]
    fn unknown_counterpart_is_dropped() {
        let store = Store::open(std::env::temp_dir().join(format!("lantern_sync_test_{}.db", uuid::Uuid::new_v4())))
            .unwrap();
        let result = apply_synced_message(&store, "me", msg("m1", MessageDirection::In, 10), &[], 100).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn cooldown_blocks_repeated_requests() {
        let mut cooldowns = SyncCooldowns::new();
        assert!(cooldowns.try_begin("bob"));
        assert!(!cooldowns.try_begin("bob"));
    }
}
