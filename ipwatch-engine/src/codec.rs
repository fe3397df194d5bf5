use std::net::Ipv4Addr;

use pnet::packet::arp::{ArpHardwareTypes, ArpOperation, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherType, EtherTypes, EthernetPacket, MutableEthernetPacket};
pub use pnet::util::MacAddr;

const ETHERNET_HEADER_LEN: usize = 14;
const ARP_PACKET_LEN: usize = 28;
/// Linux cooked capture header, used by the "any" pseudo-device.
const SLL_HEADER_LEN: usize = 16;
const SLL_PROTOCOL_OFFSET: usize = 14;

pub const BROADCAST_MAC: MacAddr = MacAddr(0xff, 0xff, 0xff, 0xff, 0xff, 0xff);
pub const ZERO_MAC: MacAddr = MacAddr(0, 0, 0, 0, 0, 0);

/// The link layer a captured frame starts with.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LinkLayer {
    Ethernet,
    LinuxSll,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ArpKind {
    Request,
    Reply,
}

impl ArpKind {
    fn operation(self) -> ArpOperation {
        match self {
            ArpKind::Request => ArpOperations::Request,
            ArpKind::Reply => ArpOperations::Reply,
        }
    }
}

/// Fields of an ARP message the engine cares about.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ArpFields {
    pub sender_ip: Ipv4Addr,
    pub sender_mac: MacAddr,
    pub target_ip: Ipv4Addr,
    pub kind: ArpKind,
}

pub trait PacketCodec: Send + Sync {
    /// Extracts the ARP fields of a captured frame, `None` for anything that is
    /// not an IPv4-over-Ethernet ARP request or reply.
    fn parse(&self, link: LinkLayer, frame: &[u8]) -> Option<ArpFields>;

    /// Builds a complete Ethernet frame carrying one ARP message. The Ethernet
    /// destination is always broadcast.
    fn build_arp(
        &self,
        sender_mac: MacAddr,
        sender_ip: Ipv4Addr,
        target_mac: MacAddr,
        target_ip: Ipv4Addr,
        kind: ArpKind,
    ) -> Vec<u8>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EthernetArpCodec;

impl EthernetArpCodec {
    fn arp_payload(link: LinkLayer, frame: &[u8]) -> Option<&[u8]> {
        match link {
            LinkLayer::Ethernet => {
                let ethernet = EthernetPacket::new(frame)?;
                if ethernet.get_ethertype() != EtherTypes::Arp {
                    return None;
                }
                frame.get(ETHERNET_HEADER_LEN..)
            }
            LinkLayer::LinuxSll => {
                let protocol = frame.get(SLL_PROTOCOL_OFFSET..SLL_HEADER_LEN)?;
                if EtherType(u16::from_be_bytes([protocol[0], protocol[1]])) != EtherTypes::Arp {
                    return None;
                }
                frame.get(SLL_HEADER_LEN..)
            }
        }
    }
}

impl PacketCodec for EthernetArpCodec {
    fn parse(&self, link: LinkLayer, frame: &[u8]) -> Option<ArpFields> {
        let payload = Self::arp_payload(link, frame)?;
        let arp = ArpPacket::new(payload)?;
        if arp.get_hardware_type() != ArpHardwareTypes::Ethernet
            || arp.get_protocol_type() != EtherTypes::Ipv4
        {
            return None;
        }
        let operation = arp.get_operation();
        let kind = if operation == ArpOperations::Request {
            ArpKind::Request
        } else if operation == ArpOperations::Reply {
            ArpKind::Reply
        } else {
            return None;
        };
        Some(ArpFields {
            sender_ip: arp.get_sender_proto_addr(),
            sender_mac: arp.get_sender_hw_addr(),
            target_ip: arp.get_target_proto_addr(),
            kind,
        })
    }

    fn build_arp(
        &self,
        sender_mac: MacAddr,
        sender_ip: Ipv4Addr,
        target_mac: MacAddr,
        target_ip: Ipv4Addr,
        kind: ArpKind,
    ) -> Vec<u8> {
        let mut buffer = vec![0u8; ETHERNET_HEADER_LEN + ARP_PACKET_LEN];

        let mut arp_buffer = [0u8; ARP_PACKET_LEN];
        if let Some(mut arp) = MutableArpPacket::new(&mut arp_buffer) {
            arp.set_hardware_type(ArpHardwareTypes::Ethernet);
            arp.set_protocol_type(EtherTypes::Ipv4);
            arp.set_hw_addr_len(6);
            arp.set_proto_addr_len(4);
            arp.set_operation(kind.operation());
            arp.set_sender_hw_addr(sender_mac);
            arp.set_sender_proto_addr(sender_ip);
            arp.set_target_hw_addr(target_mac);
            arp.set_target_proto_addr(target_ip);
        }

        if let Some(mut ethernet) = MutableEthernetPacket::new(&mut buffer) {
            ethernet.set_destination(BROADCAST_MAC);
            ethernet.set_source(sender_mac);
            ethernet.set_ethertype(EtherTypes::Arp);
            ethernet.set_payload(&arp_buffer);
        }
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sll_wrap(ethernet_frame: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; SLL_HEADER_LEN];
        frame[SLL_PROTOCOL_OFFSET] = 0x08;
        frame[SLL_PROTOCOL_OFFSET + 1] = 0x06;
        frame.extend_from_slice(&ethernet_frame[ETHERNET_HEADER_LEN..]);
        frame
    }

    #[test]
    fn test_probe_frame_layout() {
        let mac: MacAddr = "aa:aa:aa:aa:aa:aa".parse().unwrap();
        let frame = EthernetArpCodec.build_arp(
            mac,
            Ipv4Addr::UNSPECIFIED,
            BROADCAST_MAC,
            Ipv4Addr::new(192, 168, 1, 50),
            ArpKind::Request,
        );
        assert_eq!(frame.len(), ETHERNET_HEADER_LEN + ARP_PACKET_LEN);

        let ethernet = EthernetPacket::new(&frame).unwrap();
        assert_eq!(ethernet.get_destination(), BROADCAST_MAC);
        assert_eq!(ethernet.get_source(), mac);

        let fields = EthernetArpCodec.parse(LinkLayer::Ethernet, &frame).unwrap();
        assert_eq!(fields.sender_ip, Ipv4Addr::UNSPECIFIED);
        assert_eq!(fields.sender_mac, mac);
        assert_eq!(fields.target_ip, Ipv4Addr::new(192, 168, 1, 50));
        assert_eq!(fields.kind, ArpKind::Request);
    }

    #[test]
    fn test_parse_cooked_reply() {
        let mac: MacAddr = "bb:bb:bb:bb:bb:bb".parse().unwrap();
        let frame = EthernetArpCodec.build_arp(
            mac,
            Ipv4Addr::new(192, 168, 1, 10),
            "aa:aa:aa:aa:aa:aa".parse().unwrap(),
            Ipv4Addr::new(192, 168, 1, 1),
            ArpKind::Reply,
        );
        let fields = EthernetArpCodec
            .parse(LinkLayer::LinuxSll, &sll_wrap(&frame))
            .unwrap();
        assert_eq!(fields.sender_ip, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(fields.sender_mac, mac);
        assert_eq!(fields.kind, ArpKind::Reply);
    }

    #[test]
    fn test_parse_rejects_non_arp() {
        let mut frame = EthernetArpCodec.build_arp(
            ZERO_MAC,
            Ipv4Addr::new(10, 0, 0, 1),
            ZERO_MAC,
            Ipv4Addr::new(10, 0, 0, 2),
            ArpKind::Request,
        );
        // rewrite the ethertype to IPv4
        frame[12] = 0x08;
        frame[13] = 0x00;
        assert!(EthernetArpCodec.parse(LinkLayer::Ethernet, &frame).is_none());
        assert!(EthernetArpCodec.parse(LinkLayer::Ethernet, &frame[..10]).is_none());
        assert!(EthernetArpCodec.parse(LinkLayer::LinuxSll, &[0u8; 8]).is_none());
    }
}
