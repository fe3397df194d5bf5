use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::codec::{ArpKind, LinkLayer, MacAddr, PacketCodec};

/// One ARP message seen on the wire.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Observation {
    pub source_ip: Ipv4Addr,
    pub source_mac: MacAddr,
    pub kind: ArpKind,
}

/// Turns raw captured frames into observations. Pure with respect to its
/// input; the capture filter already restricts traffic to ARP, anything else
/// is dropped here.
#[derive(Clone)]
pub struct FrameClassifier {
    codec: Arc<dyn PacketCodec>,
    link: LinkLayer,
}

impl FrameClassifier {
    pub fn new(codec: Arc<dyn PacketCodec>, link: LinkLayer) -> Self {
        Self { codec, link }
    }

    pub fn classify(&self, frame: &[u8]) -> Option<Observation> {
        let fields = self.codec.parse(self.link, frame)?;
        Some(Observation {
            source_ip: fields.sender_ip,
            source_mac: fields.sender_mac,
            kind: fields.kind,
        })
    }
}

impl std::fmt::Debug for FrameClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameClassifier")
            .field("link", &self.link)
            .finish()
    }
}
