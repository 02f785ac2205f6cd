//! Relay endpoint discovery (ambient A4, spec §4.5, §6).
//!
//! The Relay process advertises itself over mDNS the same way the teacher's
//! `mdns.rs` does (`ServiceDaemon::register`); the Client process browses
//! for it and ranks candidates by the ordering rules in §4.5. `.local.` is
//! appended to the service type the spec writes without it, matching the
//! teacher's own normalization convention for the constant.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

const SERVICE_TYPE: &str = "_lanternrelay._tcp.local.";

/// Discovered-endpoint freshness window (§4.5 "pruned after 35s of no refresh").
pub const ENDPOINT_TTL: Duration = Duration::from_secs(35);

pub struct MdnsHandle {
    daemon: mdns_sd::ServiceDaemon,
    fullname: String,
}

impl Drop for MdnsHandle {
    fn drop(&mut self) {
        let _ = self.daemon.unregister(&self.fullname);
        let _ = self.daemon.shutdown();
    }
}

/// Advertise the Relay's WebSocket port over mDNS (server side).
pub fn advertise(port: u16, ws_port: Option<u16>, instance_name: &str) -> Result<MdnsHandle, String> {
    let daemon = mdns_sd::ServiceDaemon::new().map_err(|e| format!("mDNS daemon: {e}"))?;

    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    let host_fqdn = if host.ends_with(".local.") {
        host.clone()
    } else if host.ends_with(".local") {
        format!("{host}.")
    } else {
        format!("{host}.local.")
    };

    let ip = local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string());

    let mut properties = HashMap::new();
    properties.insert("port".to_string(), port.to_string());
    if let Some(ws_port) = ws_port {
        properties.insert("wsPort".to_string(), ws_port.to_string());
    }

    let service_info = mdns_sd::ServiceInfo::new(
        SERVICE_TYPE,
        instance_name,
        &host_fqdn,
        &ip,
        port,
        Some(properties),
    )
    .map_err(|e| format!("mDNS service info: {e}"))?;

    let fullname = service_info.get_fullname().to_string();
    daemon
        .register(service_info)
        .map_err(|e| format!("mDNS register: {e}"))?;

    Ok(MdnsHandle { daemon, fullname })
}

pub fn browser() -> Result<mdns_sd::Receiver<mdns_sd::ServiceEvent>, String> {
    let daemon = mdns_sd::ServiceDaemon::new().map_err(|e| format!("mDNS daemon: {e}"))?;
    daemon
        .browse(SERVICE_TYPE)
        .map_err(|e| format!("mDNS browse: {e}"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub host: String,
    pub port: u16,
    pub handshook_recently: bool,
    last_seen: Instant,
}

/// Rank tier used by [`rank`]: lower sorts first (§4.5 "rank IPv4 private
/// ranges ... over public over `.local` hostnames").
fn rank_tier(host: &str) -> u8 {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let o = v4.octets();
            if o[0] == 192 && o[1] == 168 {
                0
            } else if o[0] == 10 {
                1
            } else if o[0] == 172 && (16..=31).contains(&o[1]) {
                2
            } else {
                3
            }
        }
        Ok(IpAddr::V6(_)) => 3,
        Err(_) => 4, // hostname, e.g. `.local`
    }
}

/// Chooses the best endpoint per §4.5: prefer the last endpoint that
/// handshook within the last 14s, then rank by address tier.
pub fn rank<'a>(candidates: &'a [Candidate]) -> Option<&'a Candidate> {
    candidates
        .iter()
        .filter(|c| c.last_seen.elapsed() < ENDPOINT_TTL)
        .min_by_key(|c| (!c.handshook_recently, rank_tier(&c.host)))
}

pub struct EndpointRegistry {
    candidates: HashMap<String, Candidate>,
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self {
            candidates: HashMap::new(),
        }
    }

    pub fn observe(&mut self, host: String, port: u16) {
        self.candidates
            .entry(format!("{host}:{port}"))
            .and_modify(|c| c.last_seen = Instant::now())
            .or_insert(Candidate {
                host,
                port,
                handshook_recently: false,
                last_seen: Instant::now(),
            });
    }

    pub fn mark_handshook(&mut self, host: &str, port: u16) {
        if let Some(c) = self.candidates.get_mut(&format!("{host}:{port}")) {
            c.handshook_recently = true;
        }
    }

    pub fn prune_stale(&mut self) {
        self.candidates
            .retain(|_, c| c.last_seen.elapsed() < ENDPOINT_TTL);
    }

    pub fn best(&self) -> Option<&Candidate> {
        let list: Vec<Candidate> = self.candidates.values().cloned().collect();
        // `rank` borrows from a temporary; re-implemented inline to avoid
        // returning a reference into a dropped Vec.
        list.iter()
            .filter(|c| c.last_seen.elapsed() < ENDPOINT_TTL)
            .min_by_key(|c| (!c.handshook_recently, rank_tier(&c.host)))
            .and_then(|best| self.candidates.get(&format!("{}:{}", best.host, best.port)))
    }
}

pub const DEFAULT_FALLBACK: &str = "ws://127.0.0.1:43190";

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(host: &str, handshook: bool) -> Candidate {
        Candidate {
            host: host.to_string(),
            port: 43190,
            handshook_recently: handshook,
            last_seen: Instant::now(),
        }
    }

    #[test]
    fn private_ranges_rank_above_public() {
        assert!(rank_tier("192.168.1.5") < rank_tier("10.0.0.5"));
        assert!(rank_tier("10.0.0.5") < rank_tier("172.20.0.5"));
        assert!(rank_tier("172.20.0.5") < rank_tier("8.8.8.8"));
        assert!(rank_tier("8.8.8.8") < rank_tier("myhost.local."));
    }

    #[test]
    fn recently_handshook_endpoint_wins_regardless_of_tier() {
        let candidates = vec![candidate("192.168.1.5", false), candidate("8.8.8.8", true)];
        let best = rank(&candidates).unwrap();
        assert_eq!(best.host, "8.8.8.8");
    }

    #[test]
    fn registry_prunes_stale_entries() {
        let mut registry = EndpointRegistry::new();
        registry.observe("192.168.1.5".to_string(), 43190);
        assert!(registry.best().is_some());
    }
}
