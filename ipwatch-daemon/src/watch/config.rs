use std::collections::HashSet;
use std::convert::TryFrom;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Error};
use ipwatch_engine::device::{DeviceInfoProvider, DeviceSet, DeviceSpec};
use ipwatch_engine::engine::EngineConfig;

use crate::raw_config::RawConfig;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Config {
    /// `None` selects every usable interface at start.
    pub interfaces: Option<Vec<DeviceSpec>>,
    pub user_script: Option<PathBuf>,
    pub engine: EngineConfig,
    pub control_path: Option<PathBuf>,
}

impl Config {
    pub fn device_set(&self, provider: &dyn DeviceInfoProvider) -> DeviceSet {
        match &self.interfaces {
            Some(specs) => DeviceSet::new(specs.clone()),
            None => DeviceSet::automatic(provider),
        }
    }
}

impl TryFrom<RawConfig> for Config {
    type Error = Error;

    fn try_from(raw: RawConfig) -> Result<Self, Self::Error> {
        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            poll: raw.poll.unwrap_or(defaults.poll),
            probe: raw.probe.unwrap_or(defaults.probe),
            defend_interval: raw.defend_interval.unwrap_or(defaults.defend_interval),
            conflict_hold: raw.conflict_hold.unwrap_or(defaults.conflict_hold),
        };
        if engine.probe.attempts == 0 {
            return Err(anyhow!("probe attempts must be at least 1"));
        }
        if engine.poll.idle_timeout < engine.poll.probe_timeout {
            return Err(anyhow!(
                "idle timeout {:?} is shorter than probe timeout {:?}",
                engine.poll.idle_timeout,
                engine.poll.probe_timeout
            ));
        }

        let interfaces = match raw.interfaces {
            None => None,
            Some(interfaces) if interfaces.is_empty() => None,
            Some(interfaces) => {
                let mut seen = HashSet::new();
                let mut specs = Vec::with_capacity(interfaces.len());
                for interface in interfaces {
                    let name = interface.name().trim();
                    if name.is_empty() {
                        return Err(anyhow!("empty interface name"));
                    }
                    if !seen.insert(name.to_lowercase()) {
                        return Err(anyhow!("interface {} configured twice", name));
                    }
                    specs.push(DeviceSpec::new(name, interface.mode()));
                }
                Some(specs)
            }
        };

        if let Some(script) = &raw.user_script {
            let metadata = std::fs::metadata(script)
                .context(format!("user script {:?} not readable", script))?;
            if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
                return Err(anyhow!("user script {:?} is not an executable file", script));
            }
        }

        Ok(Config {
            interfaces,
            user_script: raw.user_script,
            engine,
            control_path: raw.control_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::convert::TryInto;
    use std::fs;
    use std::time::Duration;

    use ipwatch_engine::device::DefendMode;
    use ipwatch_engine::engine::ProbeConfig;

    use super::*;
    use crate::raw_config::{RawInterface, RawInterfaceSpec};

    #[test]
    fn test_try_into() {
        let config: Config = RawConfig::default().try_into().unwrap();
        assert_eq!(
            config,
            Config {
                interfaces: None,
                user_script: None,
                engine: EngineConfig::default(),
                control_path: None,
            }
        );

        let config: Config = RawConfig {
            interfaces: Some(vec![
                RawInterface::Name("eth0".to_string()),
                RawInterface::Detailed(RawInterfaceSpec {
                    name: "wlan0".to_string(),
                    mode: Some(DefendMode::Active),
                }),
            ]),
            conflict_hold: Some(Duration::from_secs(5)),
            control_path: Some("/run/ipwatch.sock".into()),
            ..RawConfig::default()
        }
        .try_into()
        .unwrap();
        assert_eq!(
            config.interfaces,
            Some(vec![
                DeviceSpec::new("eth0", DefendMode::Passive),
                DeviceSpec::new("wlan0", DefendMode::Active),
            ])
        );
        assert_eq!(config.engine.conflict_hold, Duration::from_secs(5));
        assert_eq!(config.control_path, Some("/run/ipwatch.sock".into()));
    }

    #[test]
    fn test_empty_interface_list_is_automatic() {
        let config: Config = RawConfig {
            interfaces: Some(vec![]),
            ..RawConfig::default()
        }
        .try_into()
        .unwrap();
        assert_eq!(config.interfaces, None);
    }

    #[test]
    fn test_invalid_configs() {
        let duplicated: Result<Config, _> = RawConfig {
            interfaces: Some(vec![
                RawInterface::Name("eth0".to_string()),
                RawInterface::Name("ETH0".to_string()),
            ]),
            ..RawConfig::default()
        }
        .try_into();
        assert!(duplicated.is_err());

        let no_attempts: Result<Config, _> = RawConfig {
            probe: Some(ProbeConfig {
                attempts: 0,
                ..ProbeConfig::default()
            }),
            ..RawConfig::default()
        }
        .try_into();
        assert!(no_attempts.is_err());

        let missing_script: Result<Config, _> = RawConfig {
            user_script: Some("/nonexistent/ipwatch-script".into()),
            ..RawConfig::default()
        }
        .try_into();
        assert!(missing_script.is_err());
    }

    #[test]
    fn test_user_script_must_be_executable() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("on-conflict.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).unwrap();

        let raw = RawConfig {
            user_script: Some(script.clone()),
            ..RawConfig::default()
        };
        assert!(Config::try_from(raw.clone()).is_err());

        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(Config::try_from(raw).unwrap().user_script, Some(script));
    }
}
