use std::net::Ipv4Addr;

use crate::codec::MacAddr;
use crate::device::Device;

/// Where the single active probe stands.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ProbeState {
    Idle,
    Probing,
    MatchFound,
    NoMatch,
}

impl Default for ProbeState {
    fn default() -> Self {
        ProbeState::Idle
    }
}

/// State of the one active probe that may be in flight. Lives inside the
/// engine lock, so at most one exists at a time.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct CheckContext {
    state: ProbeState,
    target: Option<Ipv4Addr>,
    hint: String,
    device: Option<Device>,
    conflicting_mac: Option<MacAddr>,
}

impl CheckContext {
    pub fn state(&self) -> ProbeState {
        self.state
    }

    pub fn target(&self) -> Option<Ipv4Addr> {
        self.target
    }

    pub fn hint(&self) -> &str {
        &self.hint
    }

    pub fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    pub fn conflicting_mac(&self) -> Option<MacAddr> {
        self.conflicting_mac
    }

    /// Moves from idle to probing. The device must already be resolved.
    pub fn begin(&mut self, target: Ipv4Addr, hint: &str, device: Device) {
        debug_assert_eq!(self.state, ProbeState::Idle);
        *self = Self {
            state: ProbeState::Probing,
            target: Some(target),
            hint: hint.to_string(),
            device: Some(device),
            conflicting_mac: None,
        };
    }

    /// Records the sender of a reply for the probed address. The first match
    /// wins; later ones are ignored. Returns true if the MAC was recorded.
    pub fn record_reply(&mut self, source_ip: Ipv4Addr, source_mac: MacAddr) -> bool {
        if self.state != ProbeState::Probing || self.target != Some(source_ip) {
            return false;
        }
        self.conflicting_mac = Some(source_mac);
        self.state = ProbeState::MatchFound;
        true
    }

    /// Closes the attempt budget. A probe still waiting for its reply ends
    /// as `NoMatch`.
    pub fn conclude(&mut self) -> ProbeState {
        if self.state == ProbeState::Probing {
            self.state = ProbeState::NoMatch;
        }
        self.state
    }

    /// Ends the probe, returning the recorded MAC and going back to idle.
    pub fn finish(&mut self) -> Option<MacAddr> {
        let mac = self.conflicting_mac.take();
        *self = Self::default();
        mac
    }
}
