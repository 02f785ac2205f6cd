//! The Relay's announcements ring (spec §3 `AnnouncementsRing`, §4.4).
//!
//! Bounded by TTL rather than count: every frame expires `createdAt + 24h`
//! after insertion, and a periodic sweep (every ≤ 60s, mirroring the
//! teacher's `retention.rs` sweep loop) removes expired entries and reports
//! their ids so clients purge them too.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::frame::Frame;

/// Matches §5's announcement TTL.
pub const ANNOUNCEMENT_TTL_MS: i64 = 24 * 3600 * 1000;
/// Matches §5's sweep cadence ("announcement sweep ≤ 60s").
pub const SWEEP_INTERVAL_SECS: u64 = 60;

struct Entry {
    frame: Frame,
    expires_at: i64,
    /// `reactorDeviceId -> emoji` (addressable by `(messageId, deviceId)` per §3).
    reactions: HashMap<String, String>,
}

#[derive(Default)]
pub struct AnnouncementsRing {
    entries: Mutex<HashMap<String, Entry>>,
}

impl AnnouncementsRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, frame: Frame) {
        let expires_at = frame.created_at + ANNOUNCEMENT_TTL_MS;
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            frame.message_id.clone(),
            Entry {
                frame,
                expires_at,
                reactions: HashMap::new(),
            },
        );
    }

    pub fn set_reaction(&self, message_id: &str, reactor: &str, emoji: Option<&str>) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(message_id) {
            match emoji {
                Some(e) => {
                    entry.reactions.insert(reactor.to_string(), e.to_string());
                }
                None => {
                    entry.reactions.remove(reactor);
                }
            }
        }
    }

    pub fn reactions_for(&self, message_id: &str) -> HashMap<String, String> {
        self.entries
            .lock()
            .unwrap()
            .get(message_id)
            .map(|e| e.reactions.clone())
            .unwrap_or_default()
    }

    pub fn delete(&self, message_id: &str) {
        self.entries.lock().unwrap().remove(message_id);
    }

    /// Full non-expired snapshot for `relay:announcement:snapshot` (§4.4),
    /// sent to a newly hello'd client.
    pub fn snapshot(&self, now: i64) -> (Vec<Frame>, HashMap<String, HashMap<String, String>>) {
        let entries = self.entries.lock().unwrap();
        let mut frames = Vec::new();
        let mut reactions = HashMap::new();
        for entry in entries.values() {
            if entry.expires_at > now {
                frames.push(entry.frame.clone());
                reactions.insert(entry.frame.message_id.clone(), entry.reactions.clone());
            }
        }
        (frames, reactions)
    }

    /// Removes everything past its TTL and returns the removed ids, for
    /// `relay:announcement:expired` (§4.4).
    pub fn sweep_expired(&self, now: i64) -> Vec<String> {
        let mut entries = self.entries.lock().unwrap();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            entries.remove(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{AnnouncePayload, FramePayload};

    fn frame(id: &str, created_at: i64) -> Frame {
        Frame {
            message_id: id.to_string(),
            from: "a".to_string(),
            to: None,
            created_at,
            payload: FramePayload::Announce(AnnouncePayload {
                text: "hi".to_string(),
            }),
        }
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let ring = AnnouncementsRing::new();
        ring.insert(frame("m1", 0));
        ring.insert(frame("m2", 1_000_000));

        let expired = ring.sweep_expired(ANNOUNCEMENT_TTL_MS + 1);
        assert_eq!(expired, vec!["m1".to_string()]);

        let (remaining, _) = ring.snapshot(ANNOUNCEMENT_TTL_MS + 1);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].message_id, "m2");
    }

    #[test]
    fn reactions_are_addressable_by_message_and_device() {
        let ring = AnnouncementsRing::new();
        ring.insert(frame("m1", 0));
        ring.set_reaction("m1", "bob", Some("👍"));
        assert_eq!(ring.reactions_for("m1").get("bob"), Some(&"👍".to_string()));
        ring.set_reaction("m1", "bob", None);
        assert!(ring.reactions_for("m1").get("bob").is_none());
    }
}
