//! Locating the innermost TCP segment of a frame
//!
//! Captures routinely wrap the interesting TCP/IP stack in tunnel layers.
//! The walk below starts at the link layer and peels VLAN/QinQ, MPLS, GRE
//! (including ERSPAN and transparent Ethernet bridging), IP-in-IP, VXLAN and
//! GENEVE until it reaches TCP or gives up. Recursion is bounded; anything
//! deeper than [`MAX_TUNNEL_DEPTH`] counts as "no TCP" and the frame passes
//! through untouched.

use etherparse::{
    Ethernet2HeaderSlice, Ipv4Header, Ipv4HeaderSlice, Ipv6Header, Ipv6HeaderSlice, TcpHeader,
    TcpHeaderSlice, UdpHeader, UdpHeaderSlice,
};
use keep_rules::Endpoint;
use std::net::IpAddr;
use thiserror::Error;

/// Bound on nested tunnel layers before the walk gives up
pub const MAX_TUNNEL_DEPTH: usize = 10;

const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88a8;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_MPLS_UNICAST: u16 = 0x8847;
const ETHERTYPE_MPLS_MULTICAST: u16 = 0x8848;
/// Transparent Ethernet bridging, the payload type of NVGRE/VXLAN-style tunnels
const ETHERTYPE_TEB: u16 = 0x6558;
const ETHERTYPE_ERSPAN_II: u16 = 0x88be;
const ETHERTYPE_ERSPAN_III: u16 = 0x22eb;

const IP_PROTO_IPIP: u8 = 4;
const IP_PROTO_TCP: u8 = 6;
const IP_PROTO_UDP: u8 = 17;
const IP_PROTO_IPV6: u8 = 41;
const IP_PROTO_GRE: u8 = 47;

const UDP_PORT_VXLAN: u16 = 4789;
const UDP_PORT_GENEVE: u16 = 6081;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("truncated frame while reading {0}")]
    Truncated(&'static str),
    #[error("malformed {layer}: {message}")]
    Malformed {
        layer: &'static str,
        message: String,
    },
    #[error("fragmented IP packet")]
    Fragmented,
    #[error("declared TCP payload of {declared} bytes exceeds the {captured} captured bytes")]
    PayloadBeyondCapture { declared: usize, captured: usize },
}

/// Link layer of a capture interface
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LinkKind {
    Ethernet,
    /// BSD loopback: 4-byte address-family word, then IP
    Null,
    /// Linux cooked capture, used for the `any` device
    LinuxSll,
    /// Bare IPv4/IPv6 packets
    RawIp,
    Unsupported(i32),
}

impl LinkKind {
    pub fn from_linktype(linktype: i32) -> Self {
        match linktype {
            1 => LinkKind::Ethernet,
            0 => LinkKind::Null,
            113 => LinkKind::LinuxSll,
            12 | 14 | 101 | 228 | 229 => LinkKind::RawIp,
            other => LinkKind::Unsupported(other),
        }
    }
}

/// Copy of the innermost IP header, for checksum computation
#[derive(Clone, Debug)]
pub enum IpHeader {
    V4(Ipv4Header),
    V6(Ipv6Header),
}

/// Checksum of an encapsulating layer that covers the rewritten inner bytes.
///
/// Masking changes bytes inside the tunnel payload, so the tunnel's own
/// transport checksum goes stale as well. Offsets are frame-relative, like
/// the ones in [`TcpGeometry`].
#[derive(Clone, Debug)]
pub enum OuterChecksum {
    /// UDP header of a VXLAN or GENEVE tunnel
    Udp {
        ip: IpHeader,
        udp: UdpHeader,
        udp_offset: usize,
        payload_offset: usize,
        payload_len: usize,
    },
    /// GRE header with the checksum-present flag set
    Gre {
        gre_offset: usize,
        /// End of the GRE packet, bounded by the enclosing IP payload
        end: usize,
    },
}

/// Rewrite the checksum of one encapsulating layer after the inner bytes
/// changed. `frame` is the captured frame the offsets refer to.
pub fn apply_outer_checksum(frame: &mut [u8], fixup: &OuterChecksum) -> Result<(), DecodeError> {
    match fixup {
        OuterChecksum::Udp {
            ip,
            udp,
            udp_offset,
            payload_offset,
            payload_len,
        } => {
            let checksum_at = udp_offset + 6;
            let payload_end = payload_offset + payload_len;
            if checksum_at + 2 > frame.len() || payload_end > frame.len() {
                return Err(DecodeError::Truncated("tunnel udp header"));
            }
            let stored = u16::from_be_bytes([frame[checksum_at], frame[checksum_at + 1]]);
            // Zero means the sender disabled the checksum; keep it disabled
            if stored == 0 {
                return Ok(());
            }
            let payload = &frame[*payload_offset..payload_end];
            let checksum = match ip {
                IpHeader::V4(header) => udp.calc_checksum_ipv4(header, payload),
                IpHeader::V6(header) => udp.calc_checksum_ipv6(header, payload),
            }
            .map_err(|err| DecodeError::Malformed {
                layer: "tunnel udp checksum",
                message: format!("{:?}", err),
            })?;
            frame[checksum_at..checksum_at + 2].copy_from_slice(&checksum.to_be_bytes());
        }
        OuterChecksum::Gre { gre_offset, end } => {
            let end = (*end).min(frame.len());
            let checksum_at = gre_offset + 4;
            if checksum_at + 2 > end {
                return Err(DecodeError::Truncated("gre checksum"));
            }
            frame[checksum_at..checksum_at + 2].copy_from_slice(&[0, 0]);
            let checksum = internet_checksum(&frame[*gre_offset..end]);
            frame[checksum_at..checksum_at + 2].copy_from_slice(&checksum.to_be_bytes());
        }
    }
    Ok(())
}

/// RFC 1071 ones'-complement checksum
fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Everything the rewriter needs to know about a TCP frame.
///
/// Offsets are relative to the start of the captured frame data, so the same
/// numbers address the bytes in the rewritten copy.
#[derive(Clone, Debug)]
pub struct TcpGeometry {
    pub ip: IpHeader,
    pub tcp: TcpHeader,
    pub source: Endpoint,
    pub destination: Endpoint,
    pub sequence_number: u32,
    /// Offset of the TCP header within the frame
    pub tcp_offset: usize,
    pub payload_offset: usize,
    pub payload_len: usize,
    /// Checksums of tunnel layers enclosing the payload, outermost first
    pub outer_checksums: Vec<OuterChecksum>,
}

impl TcpGeometry {
    /// Offset of the 2-byte TCP checksum field within the frame
    pub fn checksum_offset(&self) -> usize {
        self.tcp_offset + 16
    }

    /// Recompute the TCP checksum over the (rewritten) payload
    pub fn compute_checksum(&self, payload: &[u8]) -> Result<u16, DecodeError> {
        let result = match &self.ip {
            IpHeader::V4(header) => self.tcp.calc_checksum_ipv4(header, payload),
            IpHeader::V6(header) => self.tcp.calc_checksum_ipv6(header, payload),
        };
        result.map_err(|err| DecodeError::Malformed {
            layer: "tcp checksum",
            message: format!("{:?}", err),
        })
    }
}

/// What to parse next while walking down the layer stack
#[derive(Copy, Clone, Debug)]
enum Layer {
    Ethernet,
    EtherType(u16),
    /// IP version decided by the first nibble
    IpAuto,
    Ipv4,
    Ipv6,
}

/// Walk the layer stack of one frame and locate the innermost TCP segment.
///
/// `Ok(None)` means the frame has no (reachable) TCP and passes through
/// untouched; `Err` means the bytes were malformed and the frame passes
/// through with a warning.
pub fn locate_tcp(frame: &[u8], link: LinkKind) -> Result<Option<TcpGeometry>, DecodeError> {
    let mut offset = 0usize;
    let mut outer_checksums: Vec<OuterChecksum> = Vec::new();
    let mut layer = match link {
        LinkKind::Ethernet => Layer::Ethernet,
        LinkKind::RawIp => Layer::IpAuto,
        LinkKind::Null => {
            let family = frame.get(0..4).ok_or(DecodeError::Truncated("null header"))?;
            offset = 4;
            // The family word is in host byte order of the capturing machine;
            // 2 is AF_INET everywhere, the BSDs disagree on AF_INET6
            match family {
                [2, 0, 0, 0] | [0, 0, 0, 2] => Layer::Ipv4,
                _ => Layer::IpAuto,
            }
        }
        LinkKind::LinuxSll => {
            if frame.len() < 16 {
                return Err(DecodeError::Truncated("linux cooked header"));
            }
            let ether_type = u16::from_be_bytes([frame[14], frame[15]]);
            offset = 16;
            Layer::EtherType(ether_type)
        }
        LinkKind::Unsupported(_) => return Ok(None),
    };

    for _ in 0..MAX_TUNNEL_DEPTH {
        match layer {
            Layer::Ethernet => {
                let eth = Ethernet2HeaderSlice::from_slice(&frame[offset.min(frame.len())..])
                    .map_err(|err| DecodeError::Malformed {
                        layer: "ethernet",
                        message: format!("{:?}", err),
                    })?;
                layer = Layer::EtherType(eth.ether_type());
                offset += eth.slice().len();
            }
            Layer::EtherType(ether_type) => match ether_type {
                ETHERTYPE_VLAN | ETHERTYPE_QINQ => {
                    let tag = frame
                        .get(offset..offset + 4)
                        .ok_or(DecodeError::Truncated("vlan tag"))?;
                    layer = Layer::EtherType(u16::from_be_bytes([tag[2], tag[3]]));
                    offset += 4;
                }
                ETHERTYPE_MPLS_UNICAST | ETHERTYPE_MPLS_MULTICAST => {
                    // Pop the label stack; the bottom-of-stack bit ends it
                    loop {
                        let label = frame
                            .get(offset..offset + 4)
                            .ok_or(DecodeError::Truncated("mpls label"))?;
                        offset += 4;
                        if label[2] & 0x01 != 0 {
                            break;
                        }
                    }
                    layer = Layer::IpAuto;
                }
                ETHERTYPE_IPV4 => layer = Layer::Ipv4,
                ETHERTYPE_IPV6 => layer = Layer::Ipv6,
                ETHERTYPE_TEB => layer = Layer::Ethernet,
                _ => return Ok(None),
            },
            Layer::IpAuto => {
                let first = *frame.get(offset).ok_or(DecodeError::Truncated("ip header"))?;
                layer = match first >> 4 {
                    4 => Layer::Ipv4,
                    6 => Layer::Ipv6,
                    version => {
                        return Err(DecodeError::Malformed {
                            layer: "ip",
                            message: format!("unknown IP version {}", version),
                        })
                    }
                };
            }
            Layer::Ipv4 => {
                let ipv4 = Ipv4HeaderSlice::from_slice(&frame[offset.min(frame.len())..])
                    .map_err(|err| DecodeError::Malformed {
                        layer: "ipv4",
                        message: format!("{:?}", err),
                    })?;
                if ipv4.more_fragments() || ipv4.fragments_offset() != 0 {
                    return Err(DecodeError::Fragmented);
                }
                let header_len = ipv4.slice().len();
                let total_len = usize::from(ipv4.total_len());

                match ipv4.protocol() {
                    IP_PROTO_TCP => {
                        let source_ip = IpAddr::V4(ipv4.source_addr());
                        let destination_ip = IpAddr::V4(ipv4.destination_addr());
                        let ip_payload_len = total_len.checked_sub(header_len).ok_or_else(|| {
                            DecodeError::Malformed {
                                layer: "ipv4",
                                message: format!(
                                    "total length {} shorter than header {}",
                                    total_len, header_len
                                ),
                            }
                        })?;
                        let ip = IpHeader::V4(ipv4.to_header());
                        return finish_tcp(
                            frame,
                            offset + header_len,
                            ip_payload_len,
                            ip,
                            source_ip,
                            destination_ip,
                            outer_checksums,
                        )
                        .map(Some);
                    }
                    IP_PROTO_GRE => {
                        let gre_end = (offset + total_len).min(frame.len());
                        offset += header_len;
                        layer = parse_gre(frame, &mut offset, gre_end, &mut outer_checksums)?;
                    }
                    IP_PROTO_UDP => {
                        let outer_ip = IpHeader::V4(ipv4.to_header());
                        offset += header_len;
                        match parse_tunnel_udp(frame, &mut offset, outer_ip, &mut outer_checksums)?
                        {
                            Some(next) => layer = next,
                            None => return Ok(None),
                        }
                    }
                    IP_PROTO_IPIP => {
                        offset += header_len;
                        layer = Layer::Ipv4;
                    }
                    IP_PROTO_IPV6 => {
                        offset += header_len;
                        layer = Layer::Ipv6;
                    }
                    _ => return Ok(None),
                }
            }
            Layer::Ipv6 => {
                let ipv6 = Ipv6HeaderSlice::from_slice(&frame[offset.min(frame.len())..])
                    .map_err(|err| DecodeError::Malformed {
                        layer: "ipv6",
                        message: format!("{:?}", err),
                    })?;
                let header_len = ipv6.slice().len();
                let ip_payload_len = usize::from(ipv6.payload_length());

                match ipv6.next_header() {
                    IP_PROTO_TCP => {
                        let source_ip = IpAddr::V6(ipv6.source_addr());
                        let destination_ip = IpAddr::V6(ipv6.destination_addr());
                        let ip = IpHeader::V6(ipv6.to_header());
                        return finish_tcp(
                            frame,
                            offset + header_len,
                            ip_payload_len,
                            ip,
                            source_ip,
                            destination_ip,
                            outer_checksums,
                        )
                        .map(Some);
                    }
                    IP_PROTO_GRE => {
                        let gre_end = (offset + header_len + ip_payload_len).min(frame.len());
                        offset += header_len;
                        layer = parse_gre(frame, &mut offset, gre_end, &mut outer_checksums)?;
                    }
                    IP_PROTO_UDP => {
                        let outer_ip = IpHeader::V6(ipv6.to_header());
                        offset += header_len;
                        match parse_tunnel_udp(frame, &mut offset, outer_ip, &mut outer_checksums)?
                        {
                            Some(next) => layer = next,
                            None => return Ok(None),
                        }
                    }
                    IP_PROTO_IPIP => {
                        offset += header_len;
                        layer = Layer::Ipv4;
                    }
                    IP_PROTO_IPV6 => {
                        offset += header_len;
                        layer = Layer::Ipv6;
                    }
                    // Extension headers are not walked
                    _ => return Ok(None),
                }
            }
        }
    }

    log::debug!("tunnel depth {} exceeded, treating frame as non-TCP", MAX_TUNNEL_DEPTH);
    Ok(None)
}

fn finish_tcp(
    frame: &[u8],
    tcp_offset: usize,
    ip_payload_len: usize,
    ip: IpHeader,
    source_ip: IpAddr,
    destination_ip: IpAddr,
    outer_checksums: Vec<OuterChecksum>,
) -> Result<TcpGeometry, DecodeError> {
    let tcp = TcpHeaderSlice::from_slice(&frame[tcp_offset.min(frame.len())..]).map_err(|err| {
        DecodeError::Malformed {
            layer: "tcp",
            message: format!("{:?}", err),
        }
    })?;
    let tcp_header_len = tcp.slice().len();

    // The IP total length decides the payload size; the frame may carry
    // link-layer padding behind it which must not be treated as payload
    let payload_len = ip_payload_len
        .checked_sub(tcp_header_len)
        .ok_or_else(|| DecodeError::Malformed {
            layer: "tcp",
            message: format!(
                "ip payload of {} bytes shorter than tcp header of {}",
                ip_payload_len, tcp_header_len
            ),
        })?;
    let payload_offset = tcp_offset + tcp_header_len;
    if payload_offset + payload_len > frame.len() {
        return Err(DecodeError::PayloadBeyondCapture {
            declared: payload_len,
            captured: frame.len().saturating_sub(payload_offset),
        });
    }

    let geometry = TcpGeometry {
        source: Endpoint::new(source_ip, tcp.source_port()),
        destination: Endpoint::new(destination_ip, tcp.destination_port()),
        sequence_number: tcp.sequence_number(),
        tcp: tcp.to_header(),
        ip,
        tcp_offset,
        payload_offset,
        payload_len,
        outer_checksums,
    };
    Ok(geometry)
}

/// Advance over a GRE header and decide the next layer.
///
/// `gre_end` bounds the GRE packet (the enclosing IP payload); it is needed
/// when the header carries a checksum, which covers everything up to there.
fn parse_gre(
    frame: &[u8],
    offset: &mut usize,
    gre_end: usize,
    fixups: &mut Vec<OuterChecksum>,
) -> Result<Layer, DecodeError> {
    let gre_offset = *offset;
    let base = frame
        .get(*offset..*offset + 4)
        .ok_or(DecodeError::Truncated("gre header"))?;
    let flags = base[0];
    let version = base[1] & 0x07;
    if version != 0 {
        // PPTP-style GRE carries PPP, nothing the rewriter handles
        return Err(DecodeError::Malformed {
            layer: "gre",
            message: format!("unsupported GRE version {}", version),
        });
    }
    let protocol = u16::from_be_bytes([base[2], base[3]]);

    let mut header_len = 4;
    if flags & 0xc0 != 0 {
        // checksum or routing present
        header_len += 4;
    }
    if flags & 0x20 != 0 {
        // key present
        header_len += 4;
    }
    let has_sequence = flags & 0x10 != 0;
    if has_sequence {
        header_len += 4;
    }
    *offset += header_len;

    if flags & 0x80 != 0 {
        // The GRE checksum covers header and payload and must be rewritten
        // when the inner bytes change
        fixups.push(OuterChecksum::Gre { gre_offset, end: gre_end });
    }

    match protocol {
        ETHERTYPE_ERSPAN_II => {
            // ERSPAN type I omits the 8-byte header and, with it, the GRE
            // sequence number
            if has_sequence {
                *offset += 8;
            }
            Ok(Layer::Ethernet)
        }
        ETHERTYPE_ERSPAN_III => {
            *offset += 12;
            Ok(Layer::Ethernet)
        }
        other => Ok(Layer::EtherType(other)),
    }
}

/// Look through a UDP header for VXLAN or GENEVE; `None` for plain UDP.
///
/// Tunnel hits record the UDP header for a later checksum rewrite, since the
/// UDP checksum covers the encapsulated bytes about to be masked.
fn parse_tunnel_udp(
    frame: &[u8],
    offset: &mut usize,
    outer_ip: IpHeader,
    fixups: &mut Vec<OuterChecksum>,
) -> Result<Option<Layer>, DecodeError> {
    let udp = match UdpHeaderSlice::from_slice(&frame[(*offset).min(frame.len())..]) {
        Ok(udp) => udp,
        // A frame truncated inside UDP is still a valid non-TCP frame
        Err(_) => return Ok(None),
    };
    let udp_len = udp.slice().len();

    let udp_offset = *offset;
    let next = match udp.destination_port() {
        UDP_PORT_VXLAN => {
            // 8-byte VXLAN header, then the inner Ethernet frame
            *offset += udp_len + 8;
            Layer::Ethernet
        }
        UDP_PORT_GENEVE => {
            let header = frame
                .get(udp_offset + udp_len..udp_offset + udp_len + 8)
                .ok_or(DecodeError::Truncated("geneve header"))?;
            let option_len = usize::from(header[0] & 0x3f) * 4;
            let protocol = u16::from_be_bytes([header[2], header[3]]);
            *offset += udp_len + 8 + option_len;
            Layer::EtherType(protocol)
        }
        _ => return Ok(None),
    };

    let udp_header = udp.to_header();
    fixups.push(OuterChecksum::Udp {
        payload_offset: udp_offset + udp_len,
        payload_len: usize::from(udp_header.length).saturating_sub(udp_len),
        udp_offset,
        udp: udp_header,
        ip: outer_ip,
    });
    Ok(Some(next))
}

#[cfg(test)]
mod test {
    use super::*;
    use etherparse::PacketBuilder;
    use pretty_assertions::assert_eq;

    const PAYLOAD: &[u8] = &[0xde, 0xad, 0xbe, 0xef, 0x01];

    fn tcp_frame() -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .tcp(40000, 443, 12345, 1024);
        let mut frame = Vec::with_capacity(builder.size(PAYLOAD.len()));
        builder.write(&mut frame, PAYLOAD).unwrap();
        frame
    }

    #[test]
    fn test_plain_tcp() {
        let frame = tcp_frame();
        let geometry = locate_tcp(&frame, LinkKind::Ethernet).unwrap().unwrap();

        assert_eq!(14 + 20, geometry.tcp_offset);
        assert_eq!(14 + 20 + 20, geometry.payload_offset);
        assert_eq!(PAYLOAD.len(), geometry.payload_len);
        assert_eq!(12345, geometry.sequence_number);
        assert_eq!(40000, geometry.source.port);
        assert_eq!(443, geometry.destination.port);
        assert!(geometry.outer_checksums.is_empty());
        assert_eq!(
            PAYLOAD,
            &frame[geometry.payload_offset..geometry.payload_offset + geometry.payload_len]
        );
    }

    #[test]
    fn test_ethernet_padding_is_not_payload() {
        let mut frame = tcp_frame();
        // Pad the frame to the classic 60-byte minimum
        while frame.len() < 60 {
            frame.push(0xff);
        }
        let geometry = locate_tcp(&frame, LinkKind::Ethernet).unwrap().unwrap();
        assert_eq!(PAYLOAD.len(), geometry.payload_len);
    }

    #[test]
    fn test_vlan_tag_is_unwrapped() {
        let inner = {
            let builder = PacketBuilder::ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
                .tcp(40000, 443, 99, 1024);
            let mut bytes = Vec::with_capacity(builder.size(PAYLOAD.len()));
            builder.write(&mut bytes, PAYLOAD).unwrap();
            bytes
        };

        let mut frame = Vec::new();
        frame.extend_from_slice(&[7, 8, 9, 10, 11, 12]);
        frame.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        frame.extend_from_slice(&0x8100u16.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x2a]); // VLAN 42
        frame.extend_from_slice(&0x0800u16.to_be_bytes());
        frame.extend_from_slice(&inner);

        let geometry = locate_tcp(&frame, LinkKind::Ethernet).unwrap().unwrap();
        assert_eq!(18 + 20 + 20, geometry.payload_offset);
        assert_eq!(99, geometry.sequence_number);
    }

    #[test]
    fn test_udp_is_not_tcp() {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .udp(1000, 53);
        let mut frame = Vec::with_capacity(builder.size(4));
        builder.write(&mut frame, &[1, 2, 3, 4]).unwrap();

        assert!(locate_tcp(&frame, LinkKind::Ethernet).unwrap().is_none());
    }

    #[test]
    fn test_unknown_ether_type_is_not_tcp() {
        let mut frame = vec![0u8; 14];
        frame[12] = 0x88;
        frame[13] = 0xcc; // LLDP
        assert!(locate_tcp(&frame, LinkKind::Ethernet).unwrap().is_none());
    }

    #[test]
    fn test_truncated_frame_is_an_error() {
        let frame = tcp_frame();
        assert!(locate_tcp(&frame[..20], LinkKind::Ethernet).is_err());
    }

    #[test]
    fn test_declared_payload_beyond_capture() {
        let mut frame = tcp_frame();
        // Claim 100 more payload bytes than the frame carries
        let total_len = u16::from_be_bytes([frame[16], frame[17]]) + 100;
        frame[16..18].copy_from_slice(&total_len.to_be_bytes());
        match locate_tcp(&frame, LinkKind::Ethernet) {
            Err(DecodeError::PayloadBeyondCapture { .. }) => {}
            other => panic!("expected PayloadBeyondCapture, got {:?}", other),
        }
    }

    #[test]
    fn test_vxlan_encapsulation() {
        let inner = tcp_frame();

        let mut vxlan_payload = vec![0x08, 0, 0, 0, 0, 0, 0x2a, 0]; // VNI 42
        vxlan_payload.extend_from_slice(&inner);

        let builder = PacketBuilder::ethernet2([0; 6], [1; 6])
            .ipv4([192, 168, 0, 1], [192, 168, 0, 2], 64)
            .udp(51000, UDP_PORT_VXLAN);
        let mut frame = Vec::with_capacity(builder.size(vxlan_payload.len()));
        builder.write(&mut frame, &vxlan_payload).unwrap();

        let geometry = locate_tcp(&frame, LinkKind::Ethernet).unwrap().unwrap();
        assert_eq!(12345, geometry.sequence_number);
        assert_eq!(PAYLOAD.len(), geometry.payload_len);
        // The inner payload offset accounts for both encapsulation layers
        let outer = 14 + 20 + 8 + 8;
        assert_eq!(outer + 14 + 20 + 20, geometry.payload_offset);

        // The tunnel's UDP checksum covers the inner frame and is recorded
        // for rewriting
        assert_eq!(1, geometry.outer_checksums.len());
        match &geometry.outer_checksums[0] {
            OuterChecksum::Udp {
                udp_offset,
                payload_offset,
                payload_len,
                ..
            } => {
                assert_eq!(14 + 20, *udp_offset);
                assert_eq!(14 + 20 + 8, *payload_offset);
                assert_eq!(8 + inner.len(), *payload_len);
            }
            other => panic!("expected a udp fixup, got {:?}", other),
        }
    }

    #[test]
    fn test_vxlan_outer_checksum_rewrite() {
        let inner = tcp_frame();
        let mut vxlan_payload = vec![0x08, 0, 0, 0, 0, 0, 0x2a, 0];
        vxlan_payload.extend_from_slice(&inner);

        let builder = PacketBuilder::ethernet2([0; 6], [1; 6])
            .ipv4([192, 168, 0, 1], [192, 168, 0, 2], 64)
            .udp(51000, UDP_PORT_VXLAN);
        let mut frame = Vec::with_capacity(builder.size(vxlan_payload.len()));
        builder.write(&mut frame, &vxlan_payload).unwrap();

        let geometry = locate_tcp(&frame, LinkKind::Ethernet).unwrap().unwrap();
        let mut rewritten = frame.clone();
        rewritten[geometry.payload_offset] = 0;
        apply_outer_checksum(&mut rewritten, &geometry.outer_checksums[0]).unwrap();

        // Recomputing over the changed inner bytes reproduces the patched
        // value, and the value differs from the one the builder wrote
        let udp_offset = 14 + 20;
        let stored = u16::from_be_bytes([rewritten[udp_offset + 6], rewritten[udp_offset + 7]]);
        let udp = UdpHeaderSlice::from_slice(&rewritten[udp_offset..])
            .unwrap()
            .to_header();
        let outer_ip = Ipv4HeaderSlice::from_slice(&rewritten[14..])
            .unwrap()
            .to_header();
        let expected = udp
            .calc_checksum_ipv4(&outer_ip, &rewritten[udp_offset + 8..])
            .unwrap();
        assert_eq!(expected, stored);
        let original = u16::from_be_bytes([frame[udp_offset + 6], frame[udp_offset + 7]]);
        assert_ne!(original, stored);
    }

    #[test]
    fn test_internet_checksum() {
        // Worked example from RFC 1071 section 3
        let data = [0x00u8, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(!0xddf2, internet_checksum(&data));
        // Odd lengths pad with a zero byte
        assert_eq!(!0x0100u16, internet_checksum(&[0x01]));
    }

    #[test]
    fn test_checksum_roundtrip() {
        let frame = tcp_frame();
        let geometry = locate_tcp(&frame, LinkKind::Ethernet).unwrap().unwrap();
        // PacketBuilder wrote a valid checksum; recomputing over the same
        // payload must reproduce it
        let stored = u16::from_be_bytes([
            frame[geometry.checksum_offset()],
            frame[geometry.checksum_offset() + 1],
        ]);
        assert_eq!(stored, geometry.compute_checksum(PAYLOAD).unwrap());
    }
}
