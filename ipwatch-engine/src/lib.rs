//! Passive and active IPv4 address conflict detection over ARP.
//!
//! [`engine::ConflictEngine`] ties the pieces together: a single capture
//! handle on the "any" pseudo-device feeds ARP observations to the conflict
//! tracker, and on-demand probes share that handle under one lock.

pub mod capture;
pub mod classifier;
pub mod codec;
pub mod context;
pub mod device;
pub mod engine;
pub mod memory;
pub mod notify;
pub mod policy;
