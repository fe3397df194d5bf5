use std::path::PathBuf;
use std::time::Duration;

use ipwatch_engine::device::DefendMode;
use ipwatch_engine::engine::ProbeConfig;
use ipwatch_engine::policy::PollConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Eq, PartialEq, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)] // To prevent typos.
pub struct RawConfig {
    /// Watched interfaces. Absent or empty means every usable interface.
    pub interfaces: Option<Vec<RawInterface>>,
    pub user_script: Option<PathBuf>,
    #[serde(default, with = "humantime_serde")]
    pub defend_interval: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub conflict_hold: Option<Duration>,
    pub poll: Option<PollConfig>,
    pub probe: Option<ProbeConfig>,
    pub control_path: Option<PathBuf>,
}

/// An interface entry, either a bare name or a name with its mode.
#[derive(Debug, Eq, PartialEq, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RawInterface {
    Name(String),
    Detailed(RawInterfaceSpec),
}

#[derive(Debug, Eq, PartialEq, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RawInterfaceSpec {
    pub name: String,
    pub mode: Option<DefendMode>,
}

impl RawInterface {
    pub fn name(&self) -> &str {
        match self {
            RawInterface::Name(name) => name,
            RawInterface::Detailed(spec) => &spec.name,
        }
    }

    pub fn mode(&self) -> DefendMode {
        match self {
            RawInterface::Name(_) => DefendMode::default(),
            RawInterface::Detailed(spec) => spec.mode.unwrap_or_default(),
        }
    }
}
