//! In-memory capture and interface sources.
//!
//! They stand in for libpcap and the kernel when replaying recorded traffic
//! or driving the engine without privileges.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::capture::CaptureTransport;
use crate::codec::{ArpKind, EthernetArpCodec, LinkLayer, MacAddr, PacketCodec, BROADCAST_MAC};
use crate::device::DeviceInfoProvider;

type Responder = Box<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The shared medium behind a [`MemoryTransport`].
#[derive(Default)]
pub struct Wire {
    pending: Mutex<VecDeque<Vec<u8>>>,
    sent: Mutex<Vec<(String, Vec<u8>)>>,
    timeouts: Mutex<Vec<Duration>>,
    responder: Mutex<Option<Responder>>,
}

impl Wire {
    /// Queues a frame for the next dispatch.
    pub fn push(&self, frame: Vec<u8>) {
        lock(&self.pending).push_back(frame);
    }

    /// Queues an Ethernet ARP reply from `sender_ip`/`sender_mac`.
    pub fn push_reply(&self, sender_ip: Ipv4Addr, sender_mac: MacAddr) {
        self.push(reply_frame(sender_ip, sender_mac));
    }

    /// Every frame sent so far, with the interface it went out on.
    pub fn sent(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.sent).clone()
    }

    /// The timeout each dispatch was called with, in order.
    pub fn timeouts(&self) -> Vec<Duration> {
        lock(&self.timeouts).clone()
    }

    /// Installs a hook run on every sent frame; whatever it returns is queued
    /// as captured traffic.
    pub fn respond_with(&self, responder: impl Fn(&[u8]) -> Option<Vec<u8>> + Send + 'static) {
        *lock(&self.responder) = Some(Box::new(responder));
    }
}

/// An Ethernet frame carrying an ARP reply from `sender_ip`/`sender_mac`.
pub fn reply_frame(sender_ip: Ipv4Addr, sender_mac: MacAddr) -> Vec<u8> {
    EthernetArpCodec.build_arp(
        sender_mac,
        sender_ip,
        BROADCAST_MAC,
        sender_ip,
        ArpKind::Reply,
    )
}

/// Capture over a [`Wire`]. Dispatch never waits; it returns whatever is
/// queued.
pub struct MemoryTransport {
    wire: Arc<Wire>,
}

impl MemoryTransport {
    pub fn new() -> (Self, Arc<Wire>) {
        let wire = Arc::new(Wire::default());
        (Self { wire: wire.clone() }, wire)
    }
}

impl CaptureTransport for MemoryTransport {
    fn link_layer(&self) -> LinkLayer {
        LinkLayer::Ethernet
    }

    fn dispatch(&mut self, timeout: Duration, sink: &mut dyn FnMut(&[u8])) -> Result<usize> {
        lock(&self.wire.timeouts).push(timeout);
        let frames: Vec<Vec<u8>> = lock(&self.wire.pending).drain(..).collect();
        for frame in &frames {
            sink(frame);
        }
        Ok(frames.len())
    }

    fn send(&mut self, device: &str, frame: &[u8]) -> Result<()> {
        lock(&self.wire.sent).push((device.to_string(), frame.to_vec()));
        let answer = lock(&self.wire.responder)
            .as_ref()
            .and_then(|responder| responder(frame));
        if let Some(answer) = answer {
            self.wire.push(answer);
        }
        Ok(())
    }
}

/// Interface addresses from a table that can be changed at runtime.
#[derive(Debug, Default)]
pub struct StaticDeviceInfo {
    table: Mutex<Vec<(String, Ipv4Addr, MacAddr)>>,
}

impl StaticDeviceInfo {
    pub fn new(entries: Vec<(String, Ipv4Addr, MacAddr)>) -> Self {
        Self {
            table: Mutex::new(entries),
        }
    }

    /// Sets or replaces the address of `name`.
    pub fn set(&self, name: &str, ip: Ipv4Addr, mac: MacAddr) {
        let mut table = lock(&self.table);
        match table.iter_mut().find(|entry| entry.0 == name) {
            Some(entry) => {
                entry.1 = ip;
                entry.2 = mac;
            }
            None => table.push((name.to_string(), ip, mac)),
        }
    }

    pub fn remove(&self, name: &str) {
        lock(&self.table).retain(|entry| entry.0 != name);
    }
}

impl DeviceInfoProvider for StaticDeviceInfo {
    fn current_address(&self, name: &str) -> Result<(Ipv4Addr, MacAddr)> {
        lock(&self.table)
            .iter()
            .find(|entry| entry.0 == name)
            .map(|entry| (entry.1, entry.2))
            .ok_or_else(|| anyhow!("interface : {} not found", name))
    }

    fn candidates(&self) -> Vec<String> {
        lock(&self.table).iter().map(|entry| entry.0.clone()).collect()
    }
}
