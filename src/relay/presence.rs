//! Relay presence table (C4, spec §4.4).
//!
//! Invariants enforced here: (a) at most one active session per `deviceId`;
//! (b) every state change bumps a monotonic `revision`; (c) `lastSeenAt`
//! advances on any received envelope; (d) idle sessions older than 45s are
//! reaped by the caller's sweep loop.

use std::collections::HashMap;
use std::sync::RwLock;

use axum::extract::ws::Message;
use tokio::sync::mpsc;

use crate::models::{DeviceId, Peer, PeerSource};

pub struct Session {
    pub peer: Peer,
    pub connected_at: i64,
    pub last_seen_at: i64,
    pub outbound: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<DeviceId, Session>,
    revision: u64,
}

/// Presence deltas emitted on state changes, for the caller to broadcast.
pub enum PresenceChange {
    Upsert { peer: Peer, revision: u64 },
    Remove { device_id: DeviceId, revision: u64 },
}

#[derive(Default)]
pub struct PresenceTable {
    inner: RwLock<Inner>,
}

impl PresenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hello'd session. If a session for this `deviceId` already
    /// exists, returns its previous outbound sender so the caller can close
    /// it (§4.4 invariant a: "a new hello from an existing id replaces the
    /// prior session").
    pub fn register(
        &self,
        peer: Peer,
        now: i64,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> (Option<mpsc::UnboundedSender<Message>>, PresenceChange) {
        let mut inner = self.inner.write().unwrap();
        let previous = inner.sessions.remove(&peer.device_id).map(|s| s.outbound);
        inner.revision += 1;
        let revision = inner.revision;
        inner.sessions.insert(
            peer.device_id.clone(),
            Session {
                peer: peer.clone(),
                connected_at: now,
                last_seen_at: now,
                outbound,
            },
        );
        (previous, PresenceChange::Upsert { peer, revision })
    }

    pub fn touch(&self, device_id: &str, now: i64) {
        let mut inner = self.inner.write().unwrap();
        if let Some(session) = inner.sessions.get_mut(device_id) {
            session.last_seen_at = now;
        }
    }

    pub fn update_profile(&self, device_id: &str, mut peer: Peer) -> Option<PresenceChange> {
        let mut inner = self.inner.write().unwrap();
        if inner.sessions.contains_key(device_id) {
            inner.revision += 1;
            let revision = inner.revision;
            peer.source = PeerSource::Relay;
            if let Some(session) = inner.sessions.get_mut(device_id) {
                session.peer = peer.clone();
            }
            Some(PresenceChange::Upsert { peer, revision })
        } else {
            None
        }
    }

    pub fn remove(&self, device_id: &str) -> Option<PresenceChange> {
        let mut inner = self.inner.write().unwrap();
        if inner.sessions.remove(device_id).is_some() {
            inner.revision += 1;
            Some(PresenceChange::Remove {
                device_id: device_id.to_string(),
                revision: inner.revision,
            })
        } else {
            None
        }
    }

    pub fn is_live(&self, device_id: &str) -> bool {
        self.inner.read().unwrap().sessions.contains_key(device_id)
    }

    pub fn outbound_for(&self, device_id: &str) -> Option<mpsc::UnboundedSender<Message>> {
        self.inner
            .read()
            .unwrap()
            .sessions
            .get(device_id)
            .map(|s| s.outbound.clone())
    }

    pub fn snapshot(&self) -> (Vec<Peer>, u64) {
        let inner = self.inner.read().unwrap();
        (
            inner.sessions.values().map(|s| s.peer.clone()).collect(),
            inner.revision,
        )
    }

    pub fn all_outbound(&self) -> Vec<mpsc::UnboundedSender<Message>> {
        self.inner
            .read()
            .unwrap()
            .sessions
            .values()
            .map(|s| s.outbound.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> Peer {
        Peer {
            device_id: id.to_string(),
            display_name: id.to_string(),
            avatar_emoji: "🙂".to_string(),
            avatar_bg: "000000".to_string(),
            status_message: String::new(),
            app_version: "1.0".to_string(),
            last_seen_at: 0,
            source: PeerSource::Relay,
            address: None,
            port: None,
        }
    }

    #[test]
    fn revision_is_monotonic_across_changes() {
        let table = PresenceTable::new();
        let (_tx, _rx) = mpsc::unbounded_channel();
        let (_, change1) = table.register(peer("a"), 0, _tx.clone());
        let rev1 = match change1 {
            PresenceChange::Upsert { revision, .. } => revision,
            _ => unreachable!(),
        };
        let change2 = table.remove("a").unwrap();
        let rev2 = match change2 {
            PresenceChange::Remove { revision, .. } => revision,
            _ => unreachable!(),
        };
        assert!(rev2 > rev1);
    }

    #[test]
    fn new_hello_replaces_prior_session() {
        let table = PresenceTable::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        table.register(peer("a"), 0, tx1);
        let (previous, _) = table.register(peer("a"), 1, tx2);
        assert!(previous.is_some());
        assert!(table.is_live("a"));
    }
}
