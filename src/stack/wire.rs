//! Packet classification and the hand-built UDP / ICMP path.
//!
//! TCP is terminated by smoltcp. UDP never enters the interface: datagrams
//! are lifted out of the IP packet here and replies are emitted directly
//! with `smoltcp::wire` representations.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    Icmpv4DstUnreachable, Icmpv4Packet, Icmpv4Repr, Icmpv6DstUnreachable, Icmpv6Packet,
    Icmpv6Repr, IpAddress, IpProtocol, IpVersion, Ipv4Packet, Ipv4Repr, Ipv6Packet, Ipv6Repr,
    TcpPacket, UdpPacket, UdpRepr,
};

use super::{FlowKey, StackError};

const REPLY_HOP_LIMIT: u8 = 64;
const UDP_HEADER_LEN: usize = 8;
const IPV4_HEADER_LEN: usize = 20;

/// What the stack needs to remember about an inbound datagram in order to
/// refuse it with ICMP port unreachable later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramOrigin {
    pub key: FlowKey,
    pub hop_limit: u8,
    /// UDP length field: header plus payload.
    pub udp_len: usize,
    pub udp_header: [u8; UDP_HEADER_LEN],
}

/// Result of looking at one inbound IP packet.
#[derive(Debug)]
pub enum Inbound<'a> {
    /// Connection-opening SYN; the stack needs a listener for it.
    TcpSyn(FlowKey),
    Tcp(FlowKey),
    Udp {
        origin: DatagramOrigin,
        payload: &'a [u8],
    },
    /// IPv4 fragment. UDP never reaches smoltcp and is not reassembled, so
    /// these are dropped. `key` is known only for the first fragment.
    Fragment {
        src: IpAddr,
        dst: IpAddr,
        key: Option<FlowKey>,
        offset: u16,
    },
    /// Anything else is handed to smoltcp unchanged.
    Other,
}

pub fn classify(packet: &[u8]) -> Result<Inbound<'_>, StackError> {
    match IpVersion::of_packet(packet)? {
        IpVersion::Ipv4 => {
            let ip = Ipv4Packet::new_checked(packet)?;
            if ip.more_frags() || ip.frag_offset() != 0 {
                return Ok(fragment(&ip));
            }
            classify_transport(
                ip.next_header(),
                IpAddr::V4(ip.src_addr()),
                IpAddr::V4(ip.dst_addr()),
                ip.hop_limit(),
                ip.payload(),
            )
        }
        IpVersion::Ipv6 => {
            let ip = Ipv6Packet::new_checked(packet)?;
            classify_transport(
                ip.next_header(),
                IpAddr::V6(ip.src_addr()),
                IpAddr::V6(ip.dst_addr()),
                ip.hop_limit(),
                ip.payload(),
            )
        }
        #[allow(unreachable_patterns)]
        _ => Err(StackError::Malformed),
    }
}

fn classify_transport(
    proto: IpProtocol,
    src: IpAddr,
    dst: IpAddr,
    hop_limit: u8,
    payload: &[u8],
) -> Result<Inbound<'_>, StackError> {
    match proto {
        IpProtocol::Tcp => {
            let tcp = TcpPacket::new_checked(payload)?;
            let key = FlowKey::new(
                SocketAddr::new(src, tcp.src_port()),
                SocketAddr::new(dst, tcp.dst_port()),
            );
            if tcp.syn() && !tcp.ack() {
                Ok(Inbound::TcpSyn(key))
            } else {
                Ok(Inbound::Tcp(key))
            }
        }
        IpProtocol::Udp => {
            let udp = UdpPacket::new_checked(payload)?;
            let key = FlowKey::new(
                SocketAddr::new(src, udp.src_port()),
                SocketAddr::new(dst, udp.dst_port()),
            );
            let mut udp_header = [0u8; UDP_HEADER_LEN];
            udp_header.copy_from_slice(&payload[..UDP_HEADER_LEN]);
            Ok(Inbound::Udp {
                origin: DatagramOrigin {
                    key,
                    hop_limit,
                    udp_len: udp.len() as usize,
                    udp_header,
                },
                payload: udp.payload(),
            })
        }
        _ => Ok(Inbound::Other),
    }
}

fn fragment<T: AsRef<[u8]> + ?Sized>(ip: &Ipv4Packet<&T>) -> Inbound<'static> {
    let src = IpAddr::V4(ip.src_addr());
    let dst = IpAddr::V4(ip.dst_addr());
    let payload = ip.payload();
    // 首片携带完整的传输层端口
    let key = match ip.next_header() {
        IpProtocol::Udp | IpProtocol::Tcp if ip.frag_offset() == 0 && payload.len() >= 4 => Some(FlowKey::new(
            SocketAddr::new(src, u16::from_be_bytes([payload[0], payload[1]])),
            SocketAddr::new(dst, u16::from_be_bytes([payload[2], payload[3]])),
        )),
        _ => None,
    };
    Inbound::Fragment {
        src,
        dst,
        key,
        offset: ip.frag_offset(),
    }
}

/// Build the IP packet carrying `payload` from the flow's original
/// destination back to its client.
pub fn udp_reply(key: &FlowKey, payload: &[u8], mtu: usize) -> Result<Vec<u8>, StackError> {
    let udp = UdpRepr {
        src_port: key.dst.port(),
        dst_port: key.src.port(),
    };
    let udp_len = udp.header_len() + payload.len();
    let caps = ChecksumCapabilities::default();

    match (key.dst.ip(), key.src.ip()) {
        (IpAddr::V4(from), IpAddr::V4(to)) => {
            let ip = Ipv4Repr {
                src_addr: from,
                dst_addr: to,
                next_header: IpProtocol::Udp,
                payload_len: udp_len,
                hop_limit: REPLY_HOP_LIMIT,
            };
            let total = ip.buffer_len() + udp_len;
            if total > mtu {
                return Err(StackError::Oversized(total));
            }
            let mut buf = vec![0u8; total];
            let mut pkt = Ipv4Packet::new_unchecked(&mut buf[..]);
            ip.emit(&mut pkt, &caps);
            udp.emit(
                &mut UdpPacket::new_unchecked(pkt.payload_mut()),
                &IpAddress::Ipv4(from),
                &IpAddress::Ipv4(to),
                payload.len(),
                |b| b.copy_from_slice(payload),
                &caps,
            );
            Ok(buf)
        }
        (IpAddr::V6(from), IpAddr::V6(to)) => {
            let ip = Ipv6Repr {
                src_addr: from,
                dst_addr: to,
                next_header: IpProtocol::Udp,
                payload_len: udp_len,
                hop_limit: REPLY_HOP_LIMIT,
            };
            let total = ip.buffer_len() + udp_len;
            if total > mtu {
                return Err(StackError::Oversized(total));
            }
            let mut buf = vec![0u8; total];
            let mut pkt = Ipv6Packet::new_unchecked(&mut buf[..]);
            ip.emit(&mut pkt);
            udp.emit(
                &mut UdpPacket::new_unchecked(pkt.payload_mut()),
                &IpAddress::Ipv6(from),
                &IpAddress::Ipv6(to),
                payload.len(),
                |b| b.copy_from_slice(payload),
                &caps,
            );
            Ok(buf)
        }
        _ => Err(StackError::Malformed),
    }
}

/// Like [`udp_reply`], but an IPv4 reply larger than `mtu` is split into
/// fragments sharing `ident`. IPv6 replies must still fit in one packet.
pub fn udp_reply_fragments(
    key: &FlowKey,
    payload: &[u8],
    mtu: usize,
    ident: u16,
) -> Result<Vec<Vec<u8>>, StackError> {
    match udp_reply(key, payload, mtu) {
        Ok(packet) => Ok(vec![packet]),
        Err(StackError::Oversized(total)) => match (key.dst.ip(), key.src.ip()) {
            (IpAddr::V4(from), IpAddr::V4(to)) => fragment_v4(key, from, to, payload, mtu, ident),
            _ => Err(StackError::Oversized(total)),
        },
        Err(e) => Err(e),
    }
}

fn fragment_v4(
    key: &FlowKey,
    from: Ipv4Addr,
    to: Ipv4Addr,
    payload: &[u8],
    mtu: usize,
    ident: u16,
) -> Result<Vec<Vec<u8>>, StackError> {
    let udp = UdpRepr {
        src_port: key.dst.port(),
        dst_port: key.src.port(),
    };
    let udp_len = udp.header_len() + payload.len();
    if udp_len > usize::from(u16::MAX) {
        return Err(StackError::Oversized(udp_len));
    }
    let caps = ChecksumCapabilities::default();

    // 先生成完整 UDP 报文（校验和覆盖全部载荷），再按 8 字节对齐切片
    let mut datagram = vec![0u8; udp_len];
    udp.emit(
        &mut UdpPacket::new_unchecked(&mut datagram[..]),
        &IpAddress::Ipv4(from),
        &IpAddress::Ipv4(to),
        payload.len(),
        |b| b.copy_from_slice(payload),
        &caps,
    );

    let chunk = mtu.saturating_sub(IPV4_HEADER_LEN) / 8 * 8;
    if chunk == 0 {
        return Err(StackError::Oversized(IPV4_HEADER_LEN + udp_len));
    }

    let mut packets = Vec::with_capacity(udp_len.div_ceil(chunk));
    let mut offset = 0;
    while offset < udp_len {
        let end = (offset + chunk).min(udp_len);
        let ip = Ipv4Repr {
            src_addr: from,
            dst_addr: to,
            next_header: IpProtocol::Udp,
            payload_len: end - offset,
            hop_limit: REPLY_HOP_LIMIT,
        };
        let mut buf = vec![0u8; ip.buffer_len() + end - offset];
        let mut pkt = Ipv4Packet::new_unchecked(&mut buf[..]);
        ip.emit(&mut pkt, &caps);
        pkt.set_ident(ident);
        pkt.set_dont_frag(false);
        pkt.set_more_frags(end < udp_len);
        pkt.set_frag_offset(offset as u16);
        pkt.fill_checksum();
        pkt.payload_mut().copy_from_slice(&datagram[offset..end]);
        packets.push(buf);
        offset = end;
    }
    Ok(packets)
}

/// ICMP / ICMPv6 port unreachable for the datagram described by `origin`,
/// quoting its IP header and the first 8 bytes of the UDP header.
pub fn port_unreachable(origin: &DatagramOrigin) -> Result<Vec<u8>, StackError> {
    let key = &origin.key;
    let caps = ChecksumCapabilities::default();

    match (key.src.ip(), key.dst.ip()) {
        (IpAddr::V4(client), IpAddr::V4(target)) => {
            let quoted = Ipv4Repr {
                src_addr: client,
                dst_addr: target,
                next_header: IpProtocol::Udp,
                payload_len: origin.udp_len,
                hop_limit: origin.hop_limit,
            };
            let icmp = Icmpv4Repr::DstUnreachable {
                reason: Icmpv4DstUnreachable::PortUnreachable,
                header: quoted,
                data: &origin.udp_header,
            };
            let ip = Ipv4Repr {
                src_addr: target,
                dst_addr: client,
                next_header: IpProtocol::Icmp,
                payload_len: icmp.buffer_len(),
                hop_limit: REPLY_HOP_LIMIT,
            };
            let mut buf = vec![0u8; ip.buffer_len() + icmp.buffer_len()];
            let mut pkt = Ipv4Packet::new_unchecked(&mut buf[..]);
            ip.emit(&mut pkt, &caps);
            icmp.emit(&mut Icmpv4Packet::new_unchecked(pkt.payload_mut()), &caps);
            Ok(buf)
        }
        (IpAddr::V6(client), IpAddr::V6(target)) => {
            let quoted = Ipv6Repr {
                src_addr: client,
                dst_addr: target,
                next_header: IpProtocol::Udp,
                payload_len: origin.udp_len,
                hop_limit: origin.hop_limit,
            };
            let icmp = Icmpv6Repr::DstUnreachable {
                reason: Icmpv6DstUnreachable::PortUnreachable,
                header: quoted,
                data: &origin.udp_header,
            };
            let ip = Ipv6Repr {
                src_addr: target,
                dst_addr: client,
                next_header: IpProtocol::Icmpv6,
                payload_len: icmp.buffer_len(),
                hop_limit: REPLY_HOP_LIMIT,
            };
            let mut buf = vec![0u8; ip.buffer_len() + icmp.buffer_len()];
            let mut pkt = Ipv6Packet::new_unchecked(&mut buf[..]);
            ip.emit(&mut pkt);
            icmp.emit(
                &target,
                &client,
                &mut Icmpv6Packet::new_unchecked(pkt.payload_mut()),
                &caps,
            );
            Ok(buf)
        }
        _ => Err(StackError::Malformed),
    }
}
