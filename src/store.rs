//! Local store (C2, spec §4.2): durable profile, peer cache, conversations,
//! messages, reactions, and settings over a single `rusqlite` connection.
//!
//! Single-writer per §5: all access goes through `conn: Mutex<Connection>`,
//! the same pattern as the teacher's `Db`. Migrations run once at `open`
//! through a sequence of `CREATE TABLE IF NOT EXISTS` and idempotent
//! `ALTER TABLE ... ADD COLUMN` statements whose errors are discarded with
//! `.ok()`, so re-running against an already-migrated database is a no-op.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;
use crate::models::{
    Conversation, ConversationKind, Message, MessageDirection, MessageStatus, MessageType, Peer,
    PeerSource, Profile, ReactionEmoji,
};

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|_| StoreError::Poisoned)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Store {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS profile (
                device_id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                avatar_emoji TEXT NOT NULL,
                avatar_bg TEXT NOT NULL,
                status_message TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS peers_cache (
                device_id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                avatar_emoji TEXT NOT NULL,
                avatar_bg TEXT NOT NULL,
                status_message TEXT NOT NULL DEFAULT '',
                app_version TEXT NOT NULL DEFAULT '',
                last_seen_at INTEGER NOT NULL,
                source TEXT NOT NULL,
                address TEXT,
                port INTEGER
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                peer_device_id TEXT,
                title TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                unread_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                direction TEXT NOT NULL,
                sender_device_id TEXT NOT NULL,
                receiver_device_id TEXT,
                type TEXT NOT NULL,
                body_text TEXT,
                file_id TEXT,
                file_name TEXT,
                file_size INTEGER,
                file_sha256 TEXT,
                file_path TEXT,
                status TEXT,
                reaction TEXT,
                deleted_at INTEGER,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conv_created
                ON messages(conversation_id, created_at);

            CREATE TABLE IF NOT EXISTS reactions (
                message_id TEXT NOT NULL REFERENCES messages(message_id) ON DELETE CASCADE,
                reactor_device_id TEXT NOT NULL,
                emoji TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (message_id, reactor_device_id)
            );
            CREATE INDEX IF NOT EXISTS idx_reactions_message ON reactions(message_id);

            CREATE TABLE IF NOT EXISTS forgotten_peers (
                device_id TEXT PRIMARY KEY,
                waiting_for_offline INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;

        // Idempotent additive migrations for columns introduced after the
        // tables above first shipped (spec.md §6: "support adding the
        // status-message, reaction, and tombstone columns to pre-existing
        // databases").
        conn.execute_batch("ALTER TABLE peers_cache ADD COLUMN status_message TEXT NOT NULL DEFAULT '';")
            .ok();
        conn.execute_batch("ALTER TABLE messages ADD COLUMN reaction TEXT;")
            .ok();
        conn.execute_batch("ALTER TABLE messages ADD COLUMN deleted_at INTEGER;")
            .ok();

        Ok(())
    }

    // ---- profile ----------------------------------------------------

    pub fn get_profile(&self) -> Result<Option<Profile>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT device_id, display_name, avatar_emoji, avatar_bg, status_message,
                    created_at, updated_at
             FROM profile LIMIT 1",
            [],
            |row| {
                Ok(Profile {
                    device_id: row.get(0)?,
                    display_name: row.get(1)?,
                    avatar_emoji: row.get(2)?,
                    avatar_bg: row.get(3)?,
                    status_message: row.get(4)?,
                    created_at: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            },
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn save_profile(&self, profile: &Profile) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM profile", [])?;
        conn.execute(
            "INSERT INTO profile
                (device_id, display_name, avatar_emoji, avatar_bg, status_message,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                profile.device_id,
                profile.display_name,
                profile.avatar_emoji,
                profile.avatar_bg,
                profile.status_message,
                profile.created_at,
                profile.updated_at,
            ],
        )?;
        Ok(())
    }

    // ---- peer cache ---------------------------------------------------

    pub fn upsert_cached_peer(&self, peer: &Peer) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO peers_cache
                (device_id, display_name, avatar_emoji, avatar_bg, status_message,
                 app_version, last_seen_at, source, address, port)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(device_id) DO UPDATE SET
                display_name=excluded.display_name,
                avatar_emoji=excluded.avatar_emoji,
                avatar_bg=excluded.avatar_bg,
                status_message=excluded.status_message,
                app_version=excluded.app_version,
                last_seen_at=excluded.last_seen_at,
                source=excluded.source,
                address=excluded.address,
                port=excluded.port",
            params![
                peer.device_id,
                peer.display_name,
                peer.avatar_emoji,
                peer.avatar_bg,
                peer.status_message,
                peer.app_version,
                peer.last_seen_at,
                source_tag(peer.source),
                peer.address,
                peer.port,
            ],
        )?;
        Ok(())
    }

    pub fn remove_cached_peer(&self, device_id: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM peers_cache WHERE device_id = ?1", [device_id])?;
        Ok(())
    }

    pub fn list_cached_peers(&self) -> Result<Vec<Peer>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT device_id, display_name, avatar_emoji, avatar_bg, status_message,
                    app_version, last_seen_at, source, address, port
             FROM peers_cache",
        )?;
        let rows = stmt
            .query_map([], |row| Ok(row_to_peer(row)?))?
            .collect::<Result<Vec<_>, rusqlite::Error>>()?;
        Ok(rows)
    }

    // ---- forgotten peers ------------------------------------------------

    pub fn set_forgotten(&self, device_id: &str, waiting_for_offline: bool, now: i64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO forgotten_peers (device_id, waiting_for_offline, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(device_id) DO UPDATE SET
                waiting_for_offline=excluded.waiting_for_offline,
                updated_at=excluded.updated_at",
            params![device_id, waiting_for_offline, now],
        )?;
        Ok(())
    }

    pub fn clear_forgotten(&self, device_id: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM forgotten_peers WHERE device_id = ?1", [device_id])?;
        Ok(())
    }

    pub fn list_forgotten(&self) -> Result<Vec<(String, bool, i64)>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT device_id, waiting_for_offline, updated_at FROM forgotten_peers")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?, row.get::<_, i64>(2)?))
            })?
            .collect::<Result<Vec<_>, rusqlite::Error>>()?;
        Ok(rows)
    }

    // ---- conversations --------------------------------------------------

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, kind, peer_device_id, title, created_at, updated_at, unread_count
             FROM conversations WHERE id = ?1",
            [id],
            |row| Ok(row_to_conversation(row)?),
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn ensure_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO conversations
                (id, kind, peer_device_id, title, created_at, updated_at, unread_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO NOTHING",
            params![
                conversation.id,
                kind_tag(conversation.kind),
                conversation.peer_device_id,
                conversation.title,
                conversation.created_at,
                conversation.updated_at,
                conversation.unread_count,
            ],
        )?;
        Ok(())
    }

    /// `reserveConversationTimestamp` (§4.2): `max(proposed, lastInConversation+1)`,
    /// preserving strict per-conversation monotonicity (§3 invariant b).
    pub fn reserve_conversation_timestamp(
        &self,
        conversation_id: &str,
        proposed: i64,
    ) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        let last: Option<i64> = conn
            .query_row(
                "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1",
                [conversation_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(match last {
            Some(last) => proposed.max(last + 1),
            None => proposed,
        })
    }

    // ---- messages ---------------------------------------------------

    /// `saveMessage` (§4.2): insert if unseen, bump the conversation's
    /// `updatedAt`. Never raises on duplicate; returns whether a row was
    /// actually inserted (§8 invariant 1).
    pub fn save_message(&self, row: &Message) -> Result<bool, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT INTO messages
                (message_id, conversation_id, direction, sender_device_id,
                 receiver_device_id, type, body_text, file_id, file_name, file_size,
                 file_sha256, file_path, status, reaction, deleted_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(message_id) DO NOTHING",
            params![
                row.message_id,
                row.conversation_id,
                direction_tag(row.direction),
                row.sender_device_id,
                row.receiver_device_id,
                type_tag(row.message_type),
                row.body_text,
                row.file_id,
                row.file_name,
                row.file_size,
                row.file_sha256,
                row.file_path,
                row.status.map(status_tag),
                row.reaction.map(ReactionEmoji::as_str),
                row.deleted_at,
                row.created_at,
            ],
        )? > 0;

        if inserted {
            tx.execute(
                "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                params![row.created_at, row.conversation_id],
            )?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn get_message(&self, message_id: &str) -> Result<Option<Message>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT message_id, conversation_id, direction, sender_device_id,
                    receiver_device_id, type, body_text, file_id, file_name, file_size,
                    file_sha256, file_path, status, reaction, deleted_at, created_at
             FROM messages WHERE message_id = ?1",
            [message_id],
            |row| Ok(row_to_message(row)?),
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// `mergeMessageStateFromSync` (§4.2): applies non-null file fields,
    /// merges `status` with delivered > sent > failed precedence, replaces
    /// `reaction`, applies `deletedAt`.
    pub fn merge_message_state_from_sync(
        &self,
        message_id: &str,
        file_id: Option<&str>,
        file_name: Option<&str>,
        file_size: Option<u64>,
        file_sha256: Option<&str>,
        status: Option<MessageStatus>,
        reaction: Option<ReactionEmoji>,
        deleted_at: Option<i64>,
    ) -> Result<Option<Message>, StoreError> {
        let existing = match self.get_message(message_id)? {
            Some(m) => m,
            None => return Ok(None),
        };

        let merged_status = match status {
            Some(incoming) => Some(MessageStatus::merge(existing.status, incoming)),
            None => existing.status,
        };

        let conn = self.lock()?;
        conn.execute(
            "UPDATE messages SET
                file_id = COALESCE(?2, file_id),
                file_name = COALESCE(?3, file_name),
                file_size = COALESCE(?4, file_size),
                file_sha256 = COALESCE(?5, file_sha256),
                status = ?6,
                reaction = ?7,
                deleted_at = COALESCE(?8, deleted_at)
             WHERE message_id = ?1",
            params![
                message_id,
                file_id,
                file_name,
                file_size,
                file_sha256,
                merged_status.map(status_tag),
                reaction.map(ReactionEmoji::as_str),
                deleted_at,
            ],
        )?;
        drop(conn);
        self.get_message(message_id)
    }

    /// Case-insensitive substring search over body and file name (§4.2),
    /// escaping `%`, `_`, and `\` so user input cannot inject LIKE wildcards.
    pub fn search_conversation_message_ids(
        &self,
        conversation_id: &str,
        query: &str,
        limit: u32,
    ) -> Result<Vec<String>, StoreError> {
        let escaped = escape_like(query);
        let pattern = format!("%{escaped}%");
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT message_id FROM messages
             WHERE conversation_id = ?1
               AND deleted_at IS NULL
               AND (body_text LIKE ?2 ESCAPE '\\' OR file_name LIKE ?2 ESCAPE '\\')
             ORDER BY created_at ASC
             LIMIT ?3",
        )?;
        let ids = stmt
            .query_map(params![conversation_id, pattern, limit], |row| row.get(0))?
            .collect::<Result<Vec<String>, rusqlite::Error>>()?;
        Ok(ids)
    }

    /// `clearConversation` (§4.2): deletes rows and reactions, returns the
    /// managed attachment paths the caller must delete on disk.
    pub fn clear_conversation(&self, id: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let paths = {
            let mut stmt = tx.prepare(
                "SELECT file_path FROM messages WHERE conversation_id = ?1 AND file_path IS NOT NULL",
            )?;
            stmt.query_map([id], |row| row.get(0))?
                .collect::<Result<Vec<String>, rusqlite::Error>>()?
        };
        tx.execute("DELETE FROM messages WHERE conversation_id = ?1", [id])?;
        tx.commit()?;
        Ok(paths)
    }

    /// `deleteMessageForEveryone` (§4.2): writes a tombstone. Reactions
    /// cascade away with the column reset below; callers still gossip a
    /// `chat:delete` frame themselves.
    pub fn delete_message_for_everyone(&self, id: &str, deleted_at: i64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE messages SET
                body_text = NULL, file_id = NULL, file_name = NULL, file_size = NULL,
                file_sha256 = NULL, file_path = NULL, reaction = NULL, deleted_at = ?2
             WHERE message_id = ?1",
            params![id, deleted_at],
        )?;
        conn.execute("DELETE FROM reactions WHERE message_id = ?1", [id])?;
        Ok(())
    }

    /// Records the final on-disk path once an inbound transfer finalizes;
    /// only the receiver ever learns this, so it is not part of
    /// `merge_message_state_from_sync` (§4.3 step 3).
    pub fn set_message_file_path(&self, id: &str, path: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE messages SET file_path = ?2 WHERE message_id = ?1",
            params![id, path],
        )?;
        Ok(())
    }

    pub fn set_message_status(&self, id: &str, status: MessageStatus) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE messages SET status = ?2 WHERE message_id = ?1",
            params![id, status_tag(status)],
        )?;
        Ok(())
    }

    pub fn set_message_reaction(
        &self,
        id: &str,
        reaction: Option<ReactionEmoji>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE messages SET reaction = ?2 WHERE message_id = ?1",
            params![id, reaction.map(ReactionEmoji::as_str)],
        )?;
        Ok(())
    }

    /// Rows with `type IN (text, file)` and `createdAt > since`, ordered by
    /// `(createdAt, messageId)`, used to build `chat:sync:response` (§4.7).
    pub fn dm_messages_since(
        &self,
        conversation_id: &str,
        since: i64,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT message_id, conversation_id, direction, sender_device_id,
                    receiver_device_id, type, body_text, file_id, file_name, file_size,
                    file_sha256, file_path, status, reaction, deleted_at, created_at
             FROM messages
             WHERE conversation_id = ?1 AND created_at > ?2 AND type IN ('text', 'file')
             ORDER BY created_at ASC, message_id ASC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![conversation_id, since, limit], |row| Ok(row_to_message(row)?))?
            .collect::<Result<Vec<_>, rusqlite::Error>>()?;
        Ok(rows)
    }

    pub fn latest_dm_timestamp(&self, conversation_id: &str) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT COALESCE(MAX(created_at), 0) FROM messages WHERE conversation_id = ?1",
                [conversation_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0))
    }

    pub fn failed_text_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT message_id, conversation_id, direction, sender_device_id,
                    receiver_device_id, type, body_text, file_id, file_name, file_size,
                    file_sha256, file_path, status, reaction, deleted_at, created_at
             FROM messages
             WHERE conversation_id = ?1 AND direction = 'out' AND type = 'text'
               AND status = 'failed' AND deleted_at IS NULL
             ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([conversation_id], |row| Ok(row_to_message(row)?))?
            .collect::<Result<Vec<_>, rusqlite::Error>>()?;
        Ok(rows)
    }

    pub fn pending_file_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT message_id, conversation_id, direction, sender_device_id,
                    receiver_device_id, type, body_text, file_id, file_name, file_size,
                    file_sha256, file_path, status, reaction, deleted_at, created_at
             FROM messages
             WHERE conversation_id = ?1 AND direction = 'out' AND type = 'file'
               AND (status IS NULL OR status != 'delivered') AND deleted_at IS NULL
               AND file_path IS NOT NULL
             ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([conversation_id], |row| Ok(row_to_message(row)?))?
            .collect::<Result<Vec<_>, rusqlite::Error>>()?;
        Ok(rows)
    }
}

fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn source_tag(source: PeerSource) -> &'static str {
    match source {
        PeerSource::Relay => "relay",
        PeerSource::Manual => "manual",
        PeerSource::Udp => "udp",
        PeerSource::Mdns => "mdns",
        PeerSource::Cache => "cache",
    }
}

fn parse_source(tag: &str) -> PeerSource {
    match tag {
        "relay" => PeerSource::Relay,
        "manual" => PeerSource::Manual,
        "udp" => PeerSource::Udp,
        "mdns" => PeerSource::Mdns,
        _ => PeerSource::Cache,
    }
}

fn kind_tag(kind: ConversationKind) -> &'static str {
    match kind {
        ConversationKind::Announcements => "announcements",
        ConversationKind::Dm => "dm",
    }
}

fn parse_kind(tag: &str) -> ConversationKind {
    match tag {
        "announcements" => ConversationKind::Announcements,
        _ => ConversationKind::Dm,
    }
}

fn direction_tag(direction: MessageDirection) -> &'static str {
    match direction {
        MessageDirection::In => "in",
        MessageDirection::Out => "out",
    }
}

fn parse_direction(tag: &str) -> MessageDirection {
    match tag {
        "out" => MessageDirection::Out,
        _ => MessageDirection::In,
    }
}

fn type_tag(message_type: MessageType) -> &'static str {
    match message_type {
        MessageType::Text => "text",
        MessageType::File => "file",
        MessageType::Announcement => "announcement",
    }
}

fn parse_type(tag: &str) -> MessageType {
    match tag {
        "file" => MessageType::File,
        "announcement" => MessageType::Announcement,
        _ => MessageType::Text,
    }
}

fn status_tag(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Sent => "sent",
        MessageStatus::Delivered => "delivered",
        MessageStatus::Failed => "failed",
    }
}

fn parse_status(tag: &str) -> MessageStatus {
    match tag {
        "delivered" => MessageStatus::Delivered,
        "failed" => MessageStatus::Failed,
        _ => MessageStatus::Sent,
    }
}

fn row_to_peer(row: &rusqlite::Row) -> rusqlite::Result<Peer> {
    let source: String = row.get(7)?;
    Ok(Peer {
        device_id: row.get(0)?,
        display_name: row.get(1)?,
        avatar_emoji: row.get(2)?,
        avatar_bg: row.get(3)?,
        status_message: row.get(4)?,
        app_version: row.get(5)?,
        last_seen_at: row.get(6)?,
        source: parse_source(&source),
        address: row.get(8)?,
        port: row.get(9)?,
    })
}

fn row_to_conversation(row: &rusqlite::Row) -> rusqlite::Result<Conversation> {
    let kind: String = row.get(1)?;
    Ok(Conversation {
        id: row.get(0)?,
        kind: parse_kind(&kind),
        peer_device_id: row.get(2)?,
        title: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        unread_count: row.get(6)?,
    })
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let direction: String = row.get(2)?;
    let message_type: String = row.get(5)?;
    let status: Option<String> = row.get(12)?;
    let reaction: Option<String> = row.get(13)?;
    Ok(Message {
        message_id: row.get(0)?,
        conversation_id: row.get(1)?,
        direction: parse_direction(&direction),
        sender_device_id: row.get(3)?,
        receiver_device_id: row.get(4)?,
        message_type: parse_type(&message_type),
        body_text: row.get(6)?,
        file_id: row.get(7)?,
        file_name: row.get(8)?,
        file_size: row.get(9)?,
        file_sha256: row.get(10)?,
        file_path: row.get(11)?,
        status: status.as_deref().map(parse_status),
        reaction: reaction.as_deref().and_then(ReactionEmoji::from_str),
        deleted_at: row.get(14)?,
        created_at: row.get(15)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> Store {
        let path = std::env::temp_dir().join(format!("lantern_store_test_{}.db", uuid::Uuid::new_v4()));
        Store::open(path).unwrap()
    }

    fn sample_message(id: &str, conv: &str, created_at: i64) -> Message {
        Message {
            message_id: id.to_string(),
            conversation_id: conv.to_string(),
            direction: MessageDirection::Out,
            sender_device_id: "me".to_string(),
            receiver_device_id: Some("bob".to_string()),
            message_type: MessageType::Text,
            body_text: Some("hi".to_string()),
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
    fn save_message_is_idempotent() {
        let store = open_temp();
        store.ensure_conversation(&Conversation::dm("bob", "Bob", 0)).unwrap();
        let msg = sample_message("m1", "dm:bob", 10);
        assert!(store.save_message(&msg).unwrap());
        assert!(!store.save_message(&msg).unwrap());
        assert_eq!(store.get_message("m1").unwrap().unwrap().body_text.as_deref(), Some("hi"));
    }

    #[test]
    fn reserve_conversation_timestamp_is_monotonic() {
        let store = open_temp();
        store.ensure_conversation(&Conversation::dm("bob", "Bob", 0)).unwrap();
        let t1 = store.reserve_conversation_timestamp("dm:bob", 5).unwrap();
        store.save_message(&sample_message("m1", "dm:bob", t1)).unwrap();
        let t2 = store.reserve_conversation_timestamp("dm:bob", t1).unwrap();
        assert!(t2 > t1);
    }

    #[test]
    fn delete_for_everyone_preserves_identity_fields() {
        let store = open_temp();
        store.ensure_conversation(&Conversation::dm("bob", "Bob", 0)).unwrap();
        let msg = sample_message("m1", "dm:bob", 10);
        store.save_message(&msg).unwrap();
        store.delete_message_for_everyone("m1", 99).unwrap();
        let after = store.get_message("m1").unwrap().unwrap();
        assert_eq!(after.message_id, "m1");
        assert_eq!(after.created_at, 10);
        assert_eq!(after.deleted_at, Some(99));
        assert!(after.body_text.is_none());
    }

    #[test]
    fn clear_conversation_returns_attachment_paths() {
        let store = open_temp();
        store.ensure_conversation(&Conversation::dm("bob", "Bob", 0)).unwrap();
        let mut msg = sample_message("m1", "dm:bob", 10);
        msg.message_type = MessageType::File;
        msg.file_path = Some("/tmp/attachments/m1_file.bin".to_string());
        store.save_message(&msg).unwrap();
        let paths = store.clear_conversation("dm:bob").unwrap();
        assert_eq!(paths, vec!["/tmp/attachments/m1_file.bin".to_string()]);
        assert!(store.get_message("m1").unwrap().is_none());
    }

    #[test]
    fn merge_from_sync_prefers_higher_status() {
        let store = open_temp();
        store.ensure_conversation(&Conversation::dm("bob", "Bob", 0)).unwrap();
        store.save_message(&sample_message("m1", "dm:bob", 10)).unwrap();
        store
            .merge_message_state_from_sync(
                "m1",
                None,
                None,
                None,
                None,
                Some(MessageStatus::Delivered),
                None,
                None,
            )
            .unwrap();
        store
            .merge_message_state_from_sync("m1", None, None, None, None, Some(MessageStatus::Sent), None, None)
            .unwrap();
        assert_eq!(store.get_message("m1").unwrap().unwrap().status, Some(MessageStatus::Delivered));
    }
}
