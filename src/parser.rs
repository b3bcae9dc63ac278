// Raw captured frames -> Observations.
// Layers that fail to parse leave the matching Observation fields empty; only
// an untrustworthy length rejects the whole frame.

use std::net::IpAddr;
use std::time::Instant;

use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use tracing::trace;

use crate::error::ExtractError;
use crate::models::domain::{Observation, Transport};

// BSD loopback prepends a 4-byte address family
const NULL_HEADER_LEN: usize = 4;
const SLL_HEADER_LEN: usize = 16;
const SLL_PROTOCOL: std::ops::Range<usize> = 14..16;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    RawIp,
    Null,
    LinuxSll,
    Other(i32),
}

impl From<pcap::Linktype> for LinkType {
    fn from(linktype: pcap::Linktype) -> Self {
        match linktype.0 {
            0 | 108 => LinkType::Null,
            1 => LinkType::Ethernet,
            12 | 14 | 101 | 228 | 229 => LinkType::RawIp,
            113 => LinkType::LinuxSll,
            other => LinkType::Other(other),
        }
    }
}

/// A frame as handed over by the capture source, before any dissection.
#[derive(Debug, Clone)]
pub struct Frame {
    pub timestamp: Instant,
    pub linktype: LinkType,
    pub data: Vec<u8>,
    /// Length on the wire; `data` may be shorter when the snaplen cut it.
    pub wire_len: u32,
}

pub fn observe(frame: &Frame) -> Result<Observation, ExtractError> {
    let captured = u32::try_from(frame.data.len()).unwrap_or(u32::MAX);
    if frame.wire_len == 0 || frame.wire_len < captured {
        return Err(ExtractError::MalformedLength {
            wire: frame.wire_len,
            captured,
        });
    }

    let sliced = match frame.linktype {
        LinkType::Ethernet => SlicedPacket::from_ethernet(&frame.data),
        LinkType::RawIp => SlicedPacket::from_ip(&frame.data),
        LinkType::LinuxSll => {
            let protocol = frame
                .data
                .get(SLL_PROTOCOL)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
                .ok_or(ExtractError::Truncated)?;
            match protocol {
                ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => {
                    SlicedPacket::from_ip(&frame.data[SLL_HEADER_LEN..])
                }
                // not IP: still counted, just unattributed
                _ => return Ok(unattributed(frame)),
            }
        }
        LinkType::Null => {
            let payload = frame
                .data
                .get(NULL_HEADER_LEN..)
                .ok_or(ExtractError::Truncated)?;
            SlicedPacket::from_ip(payload)
        }
        LinkType::Other(n) => return Err(ExtractError::UnsupportedLinkType(n)),
    };

    let (source, destination, transport) = match sliced {
        Ok(packet) => {
            let (source, destination) = addresses(&packet.net);
            (source, destination, transport(&packet.transport))
        }
        Err(e) => {
            trace!("frame of {} bytes not dissected: {:?}", frame.wire_len, e);
            (None, None, None)
        }
    };

    Ok(Observation::new(
        frame.timestamp,
        source,
        destination,
        transport,
        u64::from(frame.wire_len),
    ))
}

fn unattributed(frame: &Frame) -> Observation {
    Observation::new(frame.timestamp, None, None, None, u64::from(frame.wire_len))
}

fn addresses(net: &Option<NetSlice>) -> (Option<IpAddr>, Option<IpAddr>) {
    match net {
        Some(NetSlice::Ipv4(ipv4)) => (
            Some(IpAddr::V4(ipv4.header().source_addr())),
            Some(IpAddr::V4(ipv4.header().destination_addr())),
        ),
        Some(NetSlice::Ipv6(ipv6)) => (
            Some(IpAddr::V6(ipv6.header().source_addr())),
            Some(IpAddr::V6(ipv6.header().destination_addr())),
        ),
        _ => (None, None),
    }
}

fn transport(transport: &Option<TransportSlice>) -> Option<Transport> {
    match transport {
        Some(TransportSlice::Tcp(_)) => Some(Transport::Tcp),
        Some(TransportSlice::Udp(_)) => Some(Transport::Udp),
        Some(TransportSlice::Icmpv4(_)) => Some(Transport::Icmp),
        Some(TransportSlice::Icmpv6(_)) => Some(Transport::Icmpv6),
        _ => None,
    }
}
