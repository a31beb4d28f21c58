//! This node's identity: UUID, name, reachable addresses and position

use rid_relay_shared::{geo, now_ms, timing, PeerAddress};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

/// A position fix with its horizontal accuracy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: f64,
}

#[derive(Debug, Clone)]
pub struct NodeIdentity {
    uuid: String,
    name: String,
    addrs: Vec<PeerAddress>,
    fix: Option<Fix>,
    fix_at_ms: u64,
}

impl NodeIdentity {
    pub fn new(uuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            addrs: Vec::new(),
            fix: None,
            fix_at_ms: 0,
        }
    }

    /// Stable UUID for a device id; random when the device id is empty
    pub fn derive_uuid(device_id: &str) -> String {
        if device_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            Uuid::new_v5(&Uuid::NAMESPACE_OID, device_id.as_bytes()).to_string()
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn addrs(&self) -> &[PeerAddress] {
        &self.addrs
    }

    /// Replace the address list, tunnel interfaces first
    pub fn set_addrs(&mut self, mut addrs: Vec<PeerAddress>) {
        addrs.sort_by_key(|a| !a.is_tunnel());
        self.addrs = addrs;
    }

    /// Re-read local interfaces, skipping loopback
    pub fn refresh_addrs(&mut self) -> usize {
        match local_ip_address::list_afinet_netifas() {
            Ok(ifas) => {
                let addrs = ifas
                    .into_iter()
                    .filter(|(_, ip)| !ip.is_loopback() && !ip.is_unspecified())
                    .map(|(intf, ip)| PeerAddress::new(ip.to_string(), intf))
                    .collect();
                self.set_addrs(addrs);
                debug!("Local addresses: {}", self.addrs_json());
            }
            Err(e) => warn!("Unable to list network interfaces: {}", e),
        }
        self.addrs.len()
    }

    pub fn has_tunnel_addr(&self) -> bool {
        self.addrs.iter().any(PeerAddress::is_tunnel)
    }

    /// Address list as the JSON string stored on the rendezvous marker
    pub fn addrs_json(&self) -> String {
        serde_json::to_string(&self.addrs).unwrap_or_else(|_| "[]".into())
    }

    /// Human readable address list
    pub fn addrs_text(&self) -> String {
        self.addrs
            .iter()
            .map(|a| format!("{}:{}", a.intf, a.ipaddr))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn fix(&self) -> Option<Fix> {
        self.fix
    }

    /// Take `fix` if it is at least as accurate or the current one is stale
    pub fn update_fix(&mut self, fix: Fix) -> bool {
        self.update_fix_at(fix, now_ms())
    }

    fn update_fix_at(&mut self, fix: Fix, now: u64) -> bool {
        let take = match self.fix {
            None => true,
            Some(current) => {
                fix.accuracy_m <= current.accuracy_m
                    || now.saturating_sub(self.fix_at_ms) >= timing::FIX_MAX_AGE_MS
            }
        };
        if take {
            self.fix = Some(fix);
            self.fix_at_ms = now;
        }
        take
    }

    /// Fix good enough to place the rendezvous marker
    pub fn fix_is_usable(&self) -> bool {
        self.fix
            .is_some_and(|f| f.accuracy_m <= timing::GPS_ACCURACY_LIMIT_M)
    }

    /// Metres from this node to a point, None without a fix
    pub fn distance_to(&self, lat: f64, lng: f64) -> Option<f64> {
        self.fix.map(|f| geo::distance_m(f.lat, f.lng, lat, lng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_is_stable_per_device() {
        let a = NodeIdentity::derive_uuid("scanner-7");
        assert_eq!(a, NodeIdentity::derive_uuid("scanner-7"));
        assert_ne!(a, NodeIdentity::derive_uuid("scanner-8"));
        assert_ne!(NodeIdentity::derive_uuid(""), NodeIdentity::derive_uuid(""));
    }

    #[test]
    fn test_tunnel_addresses_first() {
        let mut id = NodeIdentity::new("u", "n");
        id.set_addrs(vec![
            PeerAddress::new("192.168.1.5", "wlan0"),
            PeerAddress::new("10.8.0.3", "tun0"),
        ]);
        assert_eq!(id.addrs()[0].intf, "tun0");
        assert!(id.has_tunnel_addr());
        assert!(id.addrs_json().starts_with(r#"[{"ipaddr":"10.8.0.3","intf":"tun0"}"#));
    }

    #[test]
    fn test_fix_improves_while_fresh() {
        let mut id = NodeIdentity::new("u", "n");
        assert_eq!(id.distance_to(45.0, -122.0), None);
        assert!(id.update_fix(Fix { lat: 45.0, lng: -122.0, accuracy_m: 50.0 }));
        assert!(!id.fix_is_usable());
        assert!(!id.update_fix(Fix { lat: 46.0, lng: -122.0, accuracy_m: 80.0 }));
        assert!(id.update_fix(Fix { lat: 45.0, lng: -122.0, accuracy_m: 8.0 }));
        assert!(id.fix_is_usable());
        assert!(id.distance_to(45.0, -122.0).unwrap() < 0.001);
    }

    #[test]
    fn test_stale_fix_replaced_by_worse_one() {
        let mut id = NodeIdentity::new("u", "n");
        assert!(id.update_fix_at(Fix { lat: 45.0, lng: -122.0, accuracy_m: 5.0 }, 1_000));

        let moved = Fix { lat: 46.0, lng: -121.0, accuracy_m: 25.0 };
        assert!(!id.update_fix_at(moved, 1_000 + timing::FIX_MAX_AGE_MS - 1));
        assert!(id.update_fix_at(moved, 1_000 + timing::FIX_MAX_AGE_MS));
        assert_eq!(id.fix(), Some(moved));

        // The replacement is fresh again
        let worse = Fix { lat: 47.0, lng: -121.0, accuracy_m: 40.0 };
        assert!(!id.update_fix_at(worse, 2_000 + timing::FIX_MAX_AGE_MS));
    }
}
