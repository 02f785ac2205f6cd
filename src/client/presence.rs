//! Presence & identity (C8, spec §4.8).
//!
//! `PeerDirectory` owns the four per-peer overlays — live (Relay-sourced),
//! cache (persisted), forgotten, and manual — and exposes a pure merge
//! function so the UI's merged view is independently testable (§9 "model
//! peers as a sum of per-source observations; resolve with a pure merge
//! function").

use std::collections::HashMap;

use crate::models::{DeviceId, ForgottenPeerState, Peer, PeerSource};

#[derive(Default)]
pub struct PeerDirectory {
    live: HashMap<DeviceId, Peer>,
    cache: HashMap<DeviceId, Peer>,
    forgotten: HashMap<DeviceId, ForgottenPeerState>,
    manual: HashMap<DeviceId, Peer>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_live(&mut self, peer: Peer) {
        self.live.insert(peer.device_id.clone(), peer);
    }

    pub fn remove_live(&mut self, device_id: &str) {
        self.live.remove(device_id);
    }

    pub fn set_cache(&mut self, peer: Peer) {
        self.cache.insert(peer.device_id.clone(), peer);
    }

    pub fn set_manual(&mut self, peer: Peer) {
        self.manual.insert(peer.device_id.clone(), peer);
    }

    pub fn remove_manual(&mut self, device_id: &str) {
        self.manual.remove(device_id);
    }

    pub fn is_live(&self, device_id: &str) -> bool {
        self.live.contains_key(device_id)
    }

    /// Forgetting a peer (§4.8): clears the cache row and inserts a
    /// forgotten-state with `waitingForOffline=true`. Caller still owns the
    /// `chat:clear`/`chat:forget` gossip and conversation wipe.
    pub fn forget(&mut self, device_id: &str, now: i64) {
        self.cache.remove(device_id);
        self.manual.remove(device_id);
        self.forgotten
            .insert(device_id.to_string(), ForgottenPeerState::new(now));
    }

    /// One Relay presence tick's worth of forgotten-state bookkeeping
    /// (§4.8): flips `waitingForOffline` to false once the peer drops off
    /// `live`, and expires entries 24h after that.
    pub fn tick_forgotten(&mut self, now: i64) {
        let live = &self.live;
        let mut expired = Vec::new();
        for (device_id, state) in self.forgotten.iter_mut() {
            if state.waiting_for_offline {
                if !live.contains_key(device_id) {
                    state.waiting_for_offline = false;
                    state.updated_at = now;
                }
            } else if state.is_expired(now) {
                expired.push(device_id.clone());
            }
        }
        for device_id in expired {
            self.forgotten.remove(&device_id);
        }
    }

    pub fn is_forgotten_and_waiting(&self, device_id: &str) -> bool {
        self.forgotten
            .get(device_id)
            .map(|s| s.waiting_for_offline)
            .unwrap_or(false)
    }

    /// Hidden only while waiting for the Relay to confirm the peer offline
    /// (§4.8 scenario 5); once that tick lands, a reappearing peer is
    /// visible again.
    pub fn is_hidden(&self, device_id: &str) -> bool {
        self.forgotten
            .get(device_id)
            .map(|s| s.waiting_for_offline)
            .unwrap_or(false)
    }

    /// Merged view served to the UI: a peer not in `live` is treated
    /// offline; hidden (forgotten) peers are omitted entirely.
    pub fn merged_view(&self) -> Vec<Peer> {
        let mut merged: HashMap<DeviceId, Peer> = HashMap::new();
        for source in [&self.cache, &self.manual, &self.live] {
            for (device_id, peer) in source {
                merged
                    .entry(device_id.clone())
                    .and_modify(|existing| {
                        *existing = Peer::merge_preferred(existing, peer).clone();
                    })
                    .or_insert_with(|| peer.clone());
            }
        }
        merged
            .into_values()
            .filter(|p| !self.is_hidden(&p.device_id))
            .collect()
    }

    pub fn online_device_ids(&self) -> Vec<DeviceId> {
        self.live.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str, source: PeerSource, last_seen_at: i64) -> Peer {
        Peer {
            device_id: id.to_string(),
            display_name: id.to_string(),
            avatar_emoji: "🙂".to_string(),
            avatar_bg: "000000".to_string(),
            status_message: String::new(),
            app_version: "1.0".to_string(),
            last_seen_at,
            source,
            address: None,
            port: None,
        }
    }

    #[test]
    fn merged_view_hides_forgotten_peers() {
        let mut dir = PeerDirectory::new();
        dir.set_cache(peer("bob", PeerSource::Cache, 0));
        dir.forget("bob", 0);
        assert!(dir.merged_view().is_empty());
    }

    #[test]
    fn forgotten_peer_reappears_after_offline_tick_and_reconnect() {
        let mut dir = PeerDirectory::new();
        dir.set_live(peer("bob", PeerSource::Relay, 0));
        dir.forget("bob", 0);
        assert!(dir.is_forgotten_and_waiting("bob"));

        // Peer goes offline: relay drops it from `live`.
        dir.remove_live("bob");
        dir.tick_forgotten(1);
        assert!(!dir.is_forgotten_and_waiting("bob"));
        assert!(!dir.is_hidden("bob"));

        // Peer reappears: no longer waiting, so it resurfaces.
        dir.set_live(peer("bob", PeerSource::Relay, 2));
        assert!(!dir.is_hidden("bob"));
    }

    #[test]
    fn live_overlay_outranks_cache_regardless_of_recency() {
        let mut dir = PeerDirectory::new();
        dir.set_cache(peer("bob", PeerSource::Cache, 1000));
        dir.set_live(peer("bob", PeerSource::Relay, 1));
        let merged = dir.merged_view();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].source, PeerSource::Relay);
    }
}
