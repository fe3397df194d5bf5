use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::codec::MacAddr;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictKind {
    /// A foreign MAC claims a local address.
    Conflict,
    /// A previously reported claim is gone.
    Resolved,
}

/// Notification raised from the passive path. Addresses are kept as strings,
/// the way they are handed to scripts and control clients.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct ConflictEvent {
    pub kind: ConflictKind,
    pub ip: String,
    pub local_mac: String,
    pub foreign_mac: String,
    pub device: String,
}

impl ConflictEvent {
    fn new(kind: ConflictKind, ip: Ipv4Addr, claim: &Claim, foreign_mac: MacAddr) -> Self {
        Self {
            kind,
            ip: ip.to_string(),
            local_mac: claim.local_mac.to_string(),
            foreign_mac: foreign_mac.to_string(),
            device: claim.device.clone(),
        }
    }
}

pub trait ConflictNotifier: Send + Sync {
    fn notify(&self, event: ConflictEvent);
}

/// Notifier that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl ConflictNotifier for LogNotifier {
    fn notify(&self, event: ConflictEvent) {
        match event.kind {
            ConflictKind::Conflict => tracing::warn!(
                "MAC address {} causes IP conflict with address {} set on interface {}",
                event.foreign_mac,
                event.ip,
                event.device
            ),
            ConflictKind::Resolved => tracing::info!(
                "IP conflict on {} ({}) with {} resolved",
                event.ip,
                event.device,
                event.foreign_mac
            ),
        }
    }
}

#[derive(Debug, Clone)]
struct Claim {
    device: String,
    local_mac: MacAddr,
    last_seen: Instant,
    last_defended: Option<Instant>,
}

/// Remembers active conflicts, keyed by (local ip, foreign mac), so each is
/// reported once when it appears and once when it goes away.
#[derive(Debug, Clone, Default)]
pub struct ConflictTracker {
    claims: HashMap<(Ipv4Addr, MacAddr), Claim>,
}

impl ConflictTracker {
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Registers a claim of `ip` by `foreign_mac`. Returns the conflict event
    /// when the claim was not known yet.
    pub fn observe_claim(
        &mut self,
        device: &str,
        ip: Ipv4Addr,
        local_mac: MacAddr,
        foreign_mac: MacAddr,
        now: Instant,
    ) -> Option<ConflictEvent> {
        if let Some(claim) = self.claims.get_mut(&(ip, foreign_mac)) {
            claim.last_seen = now;
            claim.local_mac = local_mac;
            return None;
        }
        let claim = Claim {
            device: device.to_string(),
            local_mac,
            last_seen: now,
            last_defended: None,
        };
        let event = ConflictEvent::new(ConflictKind::Conflict, ip, &claim, foreign_mac);
        self.claims.insert((ip, foreign_mac), claim);
        Some(event)
    }

    /// Whether a defense of `ip` against `foreign_mac` is due. Marks it as
    /// defended at `now` if so.
    pub fn defend_due(
        &mut self,
        ip: Ipv4Addr,
        foreign_mac: MacAddr,
        interval: Duration,
        now: Instant,
    ) -> bool {
        match self.claims.get_mut(&(ip, foreign_mac)) {
            Some(claim) => {
                let due = claim
                    .last_defended
                    .map_or(true, |at| now.saturating_duration_since(at) >= interval);
                if due {
                    claim.last_defended = Some(now);
                }
                due
            }
            None => false,
        }
    }

    /// `mac` was seen using `ip` without it being a conflict: every claim of
    /// that MAC on another address is over.
    pub fn observe_release(&mut self, ip: Ipv4Addr, mac: MacAddr) -> Vec<ConflictEvent> {
        self.resolve_where(|&(claimed_ip, claimed_mac), _| claimed_mac == mac && claimed_ip != ip)
    }

    /// Resolves claims that went quiet for `hold`, and claims on addresses no
    /// local device owns any more. Claims of a device listed in `unreadable`
    /// keep their address, since a failed read says nothing about ownership.
    pub fn expire(
        &mut self,
        now: Instant,
        hold: Duration,
        owned: &[Ipv4Addr],
        unreadable: &[String],
    ) -> Vec<ConflictEvent> {
        self.resolve_where(|(ip, _), claim| {
            let lost = !owned.contains(ip) && !unreadable.contains(&claim.device);
            now.saturating_duration_since(claim.last_seen) >= hold || lost
        })
    }

    fn resolve_where(
        &mut self,
        predicate: impl Fn(&(Ipv4Addr, MacAddr), &Claim) -> bool,
    ) -> Vec<ConflictEvent> {
        let keys: Vec<(Ipv4Addr, MacAddr)> = self
            .claims
            .iter()
            .filter(|(key, claim)| predicate(key, claim))
            .map(|(key, _)| *key)
            .collect();
        keys.into_iter()
            .filter_map(|key| {
                let claim = self.claims.remove(&key)?;
                Some(ConflictEvent::new(ConflictKind::Resolved, key.0, &claim, key.1))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(s: &str) -> MacAddr {
        s.parse().unwrap()
    }

    fn aa() -> MacAddr {
        mac("aa:aa:aa:aa:aa:aa")
    }

    fn bb() -> MacAddr {
        mac("bb:bb:bb:bb:bb:bb")
    }

    const IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);

    #[test]
    fn test_conflict_reported_once() {
        let mut tracker = ConflictTracker::default();
        let now = Instant::now();
        let event = tracker
            .observe_claim("eth0", IP, mac("aa:aa:aa:aa:aa:aa"), mac("bb:bb:bb:bb:bb:bb"), now)
            .unwrap();
        assert_eq!(
            event,
            ConflictEvent {
                kind: ConflictKind::Conflict,
                ip: "192.168.1.10".to_string(),
                local_mac: "aa:aa:aa:aa:aa:aa".to_string(),
                foreign_mac: "bb:bb:bb:bb:bb:bb".to_string(),
                device: "eth0".to_string(),
            }
        );
        assert!(tracker
            .observe_claim("eth0", IP, mac("aa:aa:aa:aa:aa:aa"), mac("bb:bb:bb:bb:bb:bb"), now)
            .is_none());
        assert!(tracker
            .observe_claim("eth0", IP, mac("aa:aa:aa:aa:aa:aa"), mac("cc:cc:cc:cc:cc:cc"), now)
            .is_some());
        let hold = Duration::from_secs(60);
        assert_eq!(tracker.expire(now + hold, hold, &[IP], &[]).len(), 2);
    }

    #[test]
    fn test_expire_after_hold() {
        let mut tracker = ConflictTracker::default();
        let start = Instant::now();
        let hold = Duration::from_secs(60);
        tracker.observe_claim("eth0", IP, aa(), bb(), start);

        assert!(tracker
            .expire(start + Duration::from_secs(30), hold, &[IP], &[])
            .is_empty());
        let resolved = tracker.expire(start + hold, hold, &[IP], &[]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].kind, ConflictKind::Resolved);
        assert_eq!(resolved[0].foreign_mac, "bb:bb:bb:bb:bb:bb");
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_expire_when_address_moves_away() {
        let mut tracker = ConflictTracker::default();
        let now = Instant::now();
        let hold = Duration::from_secs(60);
        tracker.observe_claim("eth0", IP, aa(), bb(), now);
        let resolved = tracker.expire(now, hold, &[Ipv4Addr::new(10, 0, 0, 1)], &[]);
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn test_unreadable_device_keeps_its_claims() {
        let mut tracker = ConflictTracker::default();
        let now = Instant::now();
        let hold = Duration::from_secs(60);
        tracker.observe_claim("eth0", IP, aa(), bb(), now);

        assert!(tracker
            .expire(now, hold, &[], &["eth0".to_string()])
            .is_empty());
        assert!(tracker
            .observe_claim("eth0", IP, aa(), bb(), now)
            .is_none());
        // the hold still applies while the device cannot be read
        let resolved = tracker.expire(now + hold, hold, &[], &["eth0".to_string()]);
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn test_release_on_new_address() {
        let mut tracker = ConflictTracker::default();
        let now = Instant::now();
        tracker.observe_claim("eth0", IP, mac("aa:aa:aa:aa:aa:aa"), mac("bb:bb:bb:bb:bb:bb"), now);

        assert!(tracker.observe_release(IP, mac("bb:bb:bb:bb:bb:bb")).is_empty());
        assert!(tracker
            .observe_release(Ipv4Addr::new(192, 168, 1, 99), mac("cc:cc:cc:cc:cc:cc"))
            .is_empty());
        let resolved = tracker.observe_release(Ipv4Addr::new(192, 168, 1, 99), bb());
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].ip, "192.168.1.10");
    }

    #[test]
    fn test_defend_interval() {
        let mut tracker = ConflictTracker::default();
        let now = Instant::now();
        let interval = Duration::from_secs(10);
        let foreign = mac("bb:bb:bb:bb:bb:bb");
        assert!(!tracker.defend_due(IP, foreign, interval, now));

        tracker.observe_claim("eth0", IP, mac("aa:aa:aa:aa:aa:aa"), foreign, now);
        assert!(tracker.defend_due(IP, foreign, interval, now));
        assert!(!tracker.defend_due(IP, foreign, interval, now + Duration::from_secs(5)));
        assert!(tracker.defend_due(IP, foreign, interval, now + interval));
    }
}
