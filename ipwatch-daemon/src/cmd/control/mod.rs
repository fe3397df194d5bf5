//! Control interface of a running daemon: HTTP/1 over a Unix domain socket.

pub mod client;
pub mod handler;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct CheckRequest {
    pub ip: String,
    /// Empty selects the device from the target address.
    #[serde(default)]
    pub device: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct CheckReply {
    /// MAC that answered for the address, empty if none did.
    pub mac: String,
}
