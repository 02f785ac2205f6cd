//! Data model (spec §3). Timestamps are unix milliseconds (`i64`) throughout,
//! matching the wire frame's `createdAt` so storage needs no conversion at
//! the sync boundary.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub type DeviceId = String;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Profile {
    pub device_id: DeviceId,
    pub display_name: String,
    pub avatar_emoji: String,
    pub avatar_bg: String,
    pub status_message: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Profile {
    /// Created on first launch with a freshly generated id (spec §3).
    pub fn new_local(display_name: impl Into<String>, now: i64) -> Self {
        Self {
            device_id: uuid::Uuid::new_v4().to_string(),
            display_name: display_name.into(),
            avatar_emoji: "🏮".to_string(),
            avatar_bg: "4A4A4A".to_string(),
            status_message: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Observation source for a peer. Ordered so `relay > manual > udp > mdns >
/// cache` per the merge-priority rule in spec §3.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum PeerSource {
    Cache,
    Mdns,
    Udp,
    Manual,
    Relay,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Peer {
    pub device_id: DeviceId,
    pub display_name: String,
    pub avatar_emoji: String,
    pub avatar_bg: String,
    pub status_message: String,
    pub app_version: String,
    pub last_seen_at: i64,
    pub source: PeerSource,
    /// Last-known address, persisted by the `cache` source entry only.
    pub address: Option<String>,
    pub port: Option<u16>,
}

impl Peer {
    /// Merge two observations of the same peer per spec §3: higher source
    /// priority wins; on equal priority, the newer `last_seen_at` wins.
    pub fn merge_preferred<'a>(a: &'a Peer, b: &'a Peer) -> &'a Peer {
        match a.source.cmp(&b.source) {
            Ordering::Greater => a,
            Ordering::Less => b,
            Ordering::Equal => {
                if a.last_seen_at >= b.last_seen_at {
                    a
                } else {
                    b
                }
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Announcements,
    Dm,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub kind: ConversationKind,
    pub peer_device_id: Option<DeviceId>,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub unread_count: i64,
}

impl Conversation {
    pub const ANNOUNCEMENTS_ID: &'static str = "announcements";

    pub fn dm_id(peer_device_id: &str) -> String {
        format!("dm:{peer_device_id}")
    }

    pub fn announcements(now: i64) -> Self {
        Self {
            id: Self::ANNOUNCEMENTS_ID.to_string(),
            kind: ConversationKind::Announcements,
            peer_device_id: None,
            title: "Announcements".to_string(),
            created_at: now,
            updated_at: now,
            unread_count: 0,
        }
    }

    pub fn dm(peer_device_id: &str, title: impl Into<String>, now: i64) -> Self {
        Self {
            id: Self::dm_id(peer_device_id),
            kind: ConversationKind::Dm,
            peer_device_id: Some(peer_device_id.to_string()),
            title: title.into(),
            created_at: now,
            updated_at: now,
            unread_count: 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    In,
    Out,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    File,
    Announcement,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Failed,
}

impl MessageStatus {
    /// Precedence used when merging synced state (spec §4.2): delivered >
    /// sent > failed.
    fn rank(self) -> u8 {
        match self {
            MessageStatus::Delivered => 2,
            MessageStatus::Sent => 1,
            MessageStatus::Failed => 0,
        }
    }

    pub fn merge(current: Option<MessageStatus>, incoming: MessageStatus) -> MessageStatus {
        match current {
            Some(cur) if cur.rank() >= incoming.rank() => cur,
            _ => incoming,
        }
    }
}

/// Fixed six-emoji reaction enum (spec §6).
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ReactionEmoji {
    #[serde(rename = "👍")]
    ThumbsUp,
    #[serde(rename = "👎")]
    ThumbsDown,
    #[serde(rename = "❤️")]
    Heart,
    #[serde(rename = "😢")]
    Sad,
    #[serde(rename = "😊")]
    Smile,
    #[serde(rename = "😂")]
    Laugh,
}

impl ReactionEmoji {
    pub fn as_str(self) -> &'static str {
        match self {
            ReactionEmoji::ThumbsUp => "👍",
            ReactionEmoji::ThumbsDown => "👎",
            ReactionEmoji::Heart => "❤️",
            ReactionEmoji::Sad => "😢",
            ReactionEmoji::Smile => "😊",
            ReactionEmoji::Laugh => "😂",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "👍" => Some(Self::ThumbsUp),
            "👎" => Some(Self::ThumbsDown),
            "❤️" => Some(Self::Heart),
            "😢" => Some(Self::Sad),
            "😊" => Some(Self::Smile),
            "😂" => Some(Self::Laugh),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub message_id: String,
    pub conversation_id: String,
    pub direction: MessageDirection,
    pub sender_device_id: DeviceId,
    pub receiver_device_id: Option<DeviceId>,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub body_text: Option<String>,
    pub file_id: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub file_sha256: Option<String>,
    pub file_path: Option<String>,
    pub status: Option<MessageStatus>,
    pub reaction: Option<ReactionEmoji>,
    pub deleted_at: Option<i64>,
    pub created_at: i64,
}

impl Message {
    /// Apply a delete-for-everyone tombstone in place: clears body/file
    /// fields but preserves `message_id`, `created_at`, and `deleted_at`
    /// (spec §3 invariant c).
    pub fn tombstone(&mut self, deleted_at: i64) {
        self.body_text = None;
        self.file_id = None;
        self.file_name = None;
        self.file_size = None;
        self.file_sha256 = None;
        self.file_path = None;
        self.reaction = None;
        self.deleted_at = Some(deleted_at);
    }
}

/// A synced message row: the persisted row stripped of `file_path` and
/// `conversation_id` (spec §6 `SyncMessage`).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SyncMessage {
    pub message_id: String,
    pub direction: MessageDirection,
    pub sender_device_id: DeviceId,
    pub receiver_device_id: Option<DeviceId>,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub body_text: Option<String>,
    pub file_id: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub file_sha256: Option<String>,
    pub status: Option<MessageStatus>,
    pub reaction: Option<ReactionEmoji>,
    pub deleted_at: Option<i64>,
    pub created_at: i64,
}

impl From<&Message> for SyncMessage {
    fn from(m: &Message) -> Self {
        Self {
            message_id: m.message_id.clone(),
            direction: m.direction,
            sender_device_id: m.sender_device_id.clone(),
            receiver_device_id: m.receiver_device_id.clone(),
            message_type: m.message_type,
            body_text: m.body_text.clone(),
            file_id: m.file_id.clone(),
            file_name: m.file_name.clone(),
            file_size: m.file_size,
            file_sha256: m.file_sha256.clone(),
            status: m.status,
            reaction: m.reaction,
            deleted_at: m.deleted_at,
            created_at: m.created_at,
        }
    }
}

/// Client-only bookkeeping for a just-forgotten peer (spec §3). Hidden from
/// the UI until the relay reports the peer offline at least once.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForgottenPeerState {
    pub waiting_for_offline: bool,
    pub updated_at: i64,
}

impl ForgottenPeerState {
    pub const EXPIRY_MS: i64 = 24 * 3600 * 1000;

    pub fn new(now: i64) -> Self {
        Self {
            waiting_for_offline: true,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        !self.waiting_for_offline && now - self.updated_at >= Self::EXPIRY_MS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_merge_prefers_higher_source_priority() {
        let relay = Peer {
            device_id: "d1".into(),
            display_name: "a".into(),
            avatar_emoji: "🙂".into(),
            avatar_bg: "000000".into(),
            status_message: String::new(),
            app_version: "1.0".into(),
            last_seen_at: 1,
            source: PeerSource::Relay,
            address: None,
            port: None,
        };
        let mut cache = relay.clone();
        cache.source = PeerSource::Cache;
        cache.last_seen_at = 1_000_000;

        assert_eq!(Peer::merge_preferred(&relay, &cache).source, PeerSource::Relay);
        assert_eq!(Peer::merge_preferred(&cache, &relay).source, PeerSource::Relay);
    }

    #[test]
    fn peer_merge_prefers_newer_on_equal_priority() {
        let mut older = Peer {
            device_id: "d1".into(),
            display_name: "a".into(),
            avatar_emoji: "🙂".into(),
            avatar_bg: "000000".into(),
            status_message: String::new(),
            app_version: "1.0".into(),
            last_seen_at: 1,
            source: PeerSource::Mdns,
            address: None,
            port: None,
        };
        let mut newer = older.clone();
        newer.last_seen_at = 2;
        older.last_seen_at = 1;

        assert_eq!(Peer::merge_preferred(&older, &newer).last_seen_at, 2);
    }

    #[test]
    fn message_status_merge_precedence() {
        assert_eq!(
            MessageStatus::merge(Some(MessageStatus::Delivered), MessageStatus::Sent),
            MessageStatus::Delivered
        );
        assert_eq!(
            MessageStatus::merge(Some(MessageStatus::Sent), MessageStatus::Delivered),
            MessageStatus::Delivered
        );
        assert_eq!(
            MessageStatus::merge(Some(MessageStatus::Failed), MessageStatus::Sent),
            MessageStatus::Sent
        );
        assert_eq!(MessageStatus::merge(None, MessageStatus::Sent), MessageStatus::Sent);
    }

    #[test]
    fn forgotten_peer_state_expiry() {
        let state = ForgottenPeerState {
            waiting_for_offline: false,
            updated_at: 0,
        };
        assert!(!state.is_expired(ForgottenPeerState::EXPIRY_MS - 1));
        assert!(state.is_expired(ForgottenPeerState::EXPIRY_MS));

        let waiting = ForgottenPeerState::new(0);
        assert!(!waiting.is_expired(ForgottenPeerState::EXPIRY_MS * 10));
    }
}
