use std::net::{IpAddr, Ipv4Addr};

use anyhow::{anyhow, Context, Result};
use pnet::datalink::NetworkInterface;
use serde::{Deserialize, Serialize};

use crate::codec::MacAddr;

/// How a device reacts when one of its addresses is claimed by someone else.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DefendMode {
    /// Report only.
    Passive,
    /// Report and broadcast a gratuitous ARP to reclaim the address.
    Active,
}

impl Default for DefendMode {
    fn default() -> Self {
        DefendMode::Passive
    }
}

/// A configured interface.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeviceSpec {
    pub name: String,
    pub mode: DefendMode,
}

impl DeviceSpec {
    pub fn new(name: impl Into<String>, mode: DefendMode) -> Self {
        Self {
            name: name.into(),
            mode,
        }
    }
}

/// A local interface as it is configured right now.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Device {
    pub name: String,
    pub mode: DefendMode,
    pub ip: Option<Ipv4Addr>,
    pub mac: Option<MacAddr>,
}

impl Device {
    pub fn is_resolved(&self) -> bool {
        self.ip.is_some() && self.mac.is_some()
    }
}

pub trait DeviceInfoProvider: Send + Sync {
    /// Current IPv4 address and hardware address of the named interface.
    fn current_address(&self, name: &str) -> Result<(Ipv4Addr, MacAddr)>;

    /// Names of the interfaces usable for watching, in enumeration order.
    fn candidates(&self) -> Vec<String>;
}

/// Reads interface state through `pnet::datalink`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PnetDeviceInfo;

fn first_ipv4(interface: &NetworkInterface) -> Option<Ipv4Addr> {
    interface.ips.iter().find_map(|net| match net.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    })
}

impl DeviceInfoProvider for PnetDeviceInfo {
    fn current_address(&self, name: &str) -> Result<(Ipv4Addr, MacAddr)> {
        let interface = pnet::datalink::interfaces()
            .into_iter()
            .find(|i| i.name == name)
            .ok_or_else(|| anyhow!("interface : {} not found", name))?;
        let ip = first_ipv4(&interface).context(format!("interface {} has no ipv4", name))?;
        let mac = interface
            .mac
            .context(format!("mac {} not found", name))?;
        Ok((ip, mac))
    }

    fn candidates(&self) -> Vec<String> {
        pnet::datalink::interfaces()
            .into_iter()
            .filter(|i| i.is_up() && !i.is_loopback() && i.mac.is_some() && first_ipv4(i).is_some())
            .map(|i| i.name)
            .collect()
    }
}

fn same_slash24(a: Ipv4Addr, b: Ipv4Addr) -> bool {
    a.octets()[..3] == b.octets()[..3]
}

/// The ordered set of interfaces the engine watches. Fixed for the lifetime of
/// the engine; addresses are read from the provider on every use because they
/// can change underneath us.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct DeviceSet {
    specs: Vec<DeviceSpec>,
}

impl DeviceSet {
    pub fn new(specs: Vec<DeviceSpec>) -> Self {
        Self { specs }
    }

    /// Builds the set from every interface the provider considers usable.
    pub fn automatic(provider: &dyn DeviceInfoProvider) -> Self {
        Self::new(
            provider
                .candidates()
                .into_iter()
                .map(|name| DeviceSpec::new(name, DefendMode::Passive))
                .collect(),
        )
    }

    pub fn specs(&self) -> &[DeviceSpec] {
        &self.specs
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    fn refresh(spec: &DeviceSpec, provider: &dyn DeviceInfoProvider) -> Option<Device> {
        match provider.current_address(&spec.name) {
            Ok((ip, mac)) => Some(Device {
                name: spec.name.clone(),
                mode: spec.mode,
                ip: Some(ip),
                mac: Some(mac),
            }),
            Err(e) => {
                tracing::debug!("skip device {} : {}", spec.name, e);
                None
            }
        }
    }

    /// Every configured device paired with its current state, `None` where
    /// the address could not be read.
    pub fn survey(&self, provider: &dyn DeviceInfoProvider) -> Vec<(&DeviceSpec, Option<Device>)> {
        self.specs
            .iter()
            .map(|spec| (spec, Self::refresh(spec, provider)))
            .collect()
    }

    /// Every device whose address could be read right now, in configured order.
    pub fn snapshot(&self, provider: &dyn DeviceInfoProvider) -> Vec<Device> {
        self.survey(provider)
            .into_iter()
            .filter_map(|(_, device)| device)
            .collect()
    }

    /// Picks the device used to probe `target`.
    ///
    /// With a hint, only the configured device of that name (case-insensitive)
    /// is considered. Without one, the first device on the same /24 as
    /// `target` wins, falling back to the last device whose address could be
    /// read.
    pub fn resolve(
        &self,
        provider: &dyn DeviceInfoProvider,
        target: Ipv4Addr,
        hint: &str,
    ) -> Option<Device> {
        if !hint.is_empty() {
            let spec = self
                .specs
                .iter()
                .find(|spec| spec.name.eq_ignore_ascii_case(hint))?;
            return Self::refresh(spec, provider);
        }

        let mut fallback = None;
        for spec in &self.specs {
            let device = match Self::refresh(spec, provider) {
                Some(device) => device,
                None => continue,
            };
            if device.ip.map_or(false, |ip| same_slash24(ip, target)) {
                return Some(device);
            }
            fallback = Some(device);
        }
        fallback
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::memory::StaticDeviceInfo;

    fn set(names: &[&str]) -> DeviceSet {
        DeviceSet::new(
            names
                .iter()
                .map(|n| DeviceSpec::new(*n, DefendMode::Passive))
                .collect(),
        )
    }

    fn provider() -> StaticDeviceInfo {
        let provider = StaticDeviceInfo::default();
        for (name, ip, mac) in [
            ("eth0", "192.168.1.10", "aa:aa:aa:aa:aa:aa"),
            ("eth1", "10.0.0.5", "cc:cc:cc:cc:cc:cc"),
            ("wlan0", "172.16.3.7", "dd:dd:dd:dd:dd:dd"),
        ]
        .iter()
        {
            provider.set(name, ip.parse().unwrap(), mac.parse().unwrap());
        }
        provider
    }

    #[test_case("192.168.1.50", "eth0" ; "first subnet")]
    #[test_case("10.0.0.200", "eth1" ; "second subnet")]
    #[test_case("172.16.3.1", "wlan0" ; "last subnet")]
    #[test_case("8.8.8.8", "wlan0" ; "no subnet falls back to last")]
    fn test_resolve_without_hint(target: &str, expected: &str) {
        let devices = set(&["eth0", "eth1", "wlan0"]);
        let device = devices
            .resolve(&provider(), target.parse().unwrap(), "")
            .unwrap();
        assert_eq!(device.name, expected);
        assert!(device.is_resolved());
    }

    #[test]
    fn test_resolve_fallback_skips_unreadable_devices() {
        // eth9 is configured but absent, so the fallback is eth1.
        let devices = set(&["eth0", "eth1", "eth9"]);
        let device = devices
            .resolve(&provider(), "8.8.8.8".parse().unwrap(), "")
            .unwrap();
        assert_eq!(device.name, "eth1");
    }

    #[test]
    fn test_resolve_nothing_readable() {
        let devices = set(&["eth8", "eth9"]);
        assert!(devices
            .resolve(&provider(), "192.168.1.50".parse().unwrap(), "")
            .is_none());
    }

    #[test_case("eth1", Some("eth1") ; "exact")]
    #[test_case("ETH1", Some("eth1") ; "case insensitive")]
    #[test_case("eth9", None ; "not configured")]
    #[test_case("lo", None ; "configured nowhere")]
    fn test_resolve_with_hint(hint: &str, expected: Option<&str>) {
        let devices = set(&["eth0", "eth1", "eth9"]);
        let device = devices.resolve(&provider(), "192.168.1.50".parse().unwrap(), hint);
        assert_eq!(device.map(|d| d.name), expected.map(ToString::to_string));
    }

    #[test]
    fn test_resolve_reads_live_address() {
        let provider = provider();
        let devices = set(&["eth0", "eth1"]);
        let target = "10.0.0.9".parse().unwrap();
        assert_eq!(devices.resolve(&provider, target, "").unwrap().name, "eth1");

        provider.set(
            "eth0",
            "10.0.0.1".parse().unwrap(),
            "aa:aa:aa:aa:aa:aa".parse().unwrap(),
        );
        assert_eq!(devices.resolve(&provider, target, "").unwrap().name, "eth0");
    }

    #[test]
    fn test_snapshot_survey_and_automatic() {
        let provider = provider();
        let snapshot = set(&["eth0", "eth9", "wlan0"]).snapshot(&provider);
        assert_eq!(
            snapshot.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
            vec!["eth0", "wlan0"]
        );

        let survey_set = set(&["eth0", "eth9"]);
        let survey = survey_set.survey(&provider);
        assert_eq!(survey[0].0.name, "eth0");
        assert!(survey[0].1.is_some());
        assert_eq!(survey[1].0.name, "eth9");
        assert!(survey[1].1.is_none());

        let automatic = DeviceSet::automatic(&provider);
        assert_eq!(automatic.specs().len(), 3);
        assert!(automatic
            .specs()
            .iter()
            .all(|spec| spec.mode == DefendMode::Passive));
    }
}
