//! Factory module for making all kinds of packets.

use crate::{IpPacket, IpPacketBuf};
use anyhow::{Context as _, Result, bail};
use etherparse::{
    Icmpv6Header, Ipv4Header, Ipv6Header, PacketBuilder, TcpOptionElement, icmpv4, icmpv6,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Helper macro to turn a [`PacketBuilder`] into an [`IpPacket`].
#[macro_export]
macro_rules! build {
    ($packet:expr, $payload:ident) => {{
        use ::anyhow::Context as _;

        let size = $packet.size($payload.len());
        let mut ip = $crate::IpPacketBuf::new();

        $packet
            .write(&mut std::io::Cursor::new(ip.buf()), &$payload)
            .with_context(|| format!("Payload is too big; len={size}"))?;

        let packet = $crate::IpPacket::new(ip, size).context("Failed to create IP packet")?;

        ::anyhow::Ok(packet)
    }};
}

/// The L4 portion of a TCP segment we synthesize towards the TUN device.
#[derive(Debug, Default, Clone)]
pub struct TcpSegment {
    pub seq: u32,
    /// Setting this also sets the ACK flag.
    pub ack: Option<u32>,
    pub window: u16,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
    pub options: Vec<TcpOptionElement>,
}

pub fn tcp_packet(
    src: SocketAddr,
    dst: SocketAddr,
    segment: TcpSegment,
    payload: &[u8],
) -> Result<IpPacket> {
    let TcpSegment {
        seq,
        ack,
        window,
        syn,
        fin,
        rst,
        psh,
        options,
    } = segment;

    macro_rules! flags {
        ($builder:expr) => {{
            let mut builder = $builder;

            if syn {
                builder = builder.syn();
            }
            if fin {
                builder = builder.fin();
            }
            if rst {
                builder = builder.rst();
            }
            if psh {
                builder = builder.psh();
            }
            if let Some(ack) = ack {
                builder = builder.ack(ack);
            }

            builder
                .options(&options)
                .context("Failed to write TCP options")?
        }};
    }

    match (src.ip(), dst.ip()) {
        (IpAddr::V4(saddr), IpAddr::V4(daddr)) => {
            let builder = flags!(
                PacketBuilder::ipv4(saddr.octets(), daddr.octets(), 64).tcp(
                    src.port(),
                    dst.port(),
                    seq,
                    window,
                )
            );

            build!(builder, payload)
        }
        (IpAddr::V6(saddr), IpAddr::V6(daddr)) => {
            let builder = flags!(
                PacketBuilder::ipv6(saddr.octets(), daddr.octets(), 64).tcp(
                    src.port(),
                    dst.port(),
                    seq,
                    window,
                )
            );

            build!(builder, payload)
        }
        (IpAddr::V4(_), IpAddr::V6(_)) | (IpAddr::V6(_), IpAddr::V4(_)) => {
            bail!(IpVersionMismatch)
        }
    }
}

pub fn udp_packet(src: SocketAddr, dst: SocketAddr, payload: Vec<u8>) -> Result<IpPacket> {
    match (src.ip(), dst.ip()) {
        (IpAddr::V4(saddr), IpAddr::V4(daddr)) => {
            let packet = PacketBuilder::ipv4(saddr.octets(), daddr.octets(), 64)
                .udp(src.port(), dst.port());

            build!(packet, payload)
        }
        (IpAddr::V6(saddr), IpAddr::V6(daddr)) => {
            let packet = PacketBuilder::ipv6(saddr.octets(), daddr.octets(), 64)
                .udp(src.port(), dst.port());

            build!(packet, payload)
        }
        (IpAddr::V4(_), IpAddr::V6(_)) | (IpAddr::V6(_), IpAddr::V4(_)) => {
            bail!(IpVersionMismatch)
        }
    }
}

/// Reassembles an IPv4 packet from the header of its first fragment and the coalesced payload.
pub fn ipv4_from_header(mut header: Ipv4Header, payload: &[u8]) -> Result<IpPacket> {
    header.more_fragments = false;
    header.fragment_offset = etherparse::IpFragOffset::ZERO;
    header
        .set_payload_len(payload.len())
        .context("Reassembled payload too large")?;
    header.header_checksum = header.calc_header_checksum();

    let mut ip = IpPacketBuf::new();
    let total_len = header.header_len() + payload.len();
    anyhow::ensure!(total_len <= ip.buf().len(), "Reassembled packet too large");

    let mut cursor = std::io::Cursor::new(ip.buf());
    header
        .write(&mut cursor)
        .context("Failed to write IPv4 header")?;
    let header_len = cursor.position() as usize;
    cursor.get_mut()[header_len..total_len].copy_from_slice(payload);

    IpPacket::new(ip, total_len).context("Failed to parse reassembled packet")
}

pub fn icmp_host_unreachable(original_packet: &IpPacket) -> Result<IpPacket> {
    icmp_dest_unreachable(
        original_packet,
        icmpv4::DestUnreachableHeader::Host,
        icmpv6::DestUnreachableCode::Address,
    )
}

pub fn icmp_port_unreachable(original_packet: &IpPacket) -> Result<IpPacket> {
    icmp_dest_unreachable(
        original_packet,
        icmpv4::DestUnreachableHeader::Port,
        icmpv6::DestUnreachableCode::Port,
    )
}

pub fn icmp_protocol_unreachable(original_packet: &IpPacket) -> Result<IpPacket> {
    let src = original_packet.source();
    let dst = original_packet.destination();

    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => icmpv4_error(
            dst,
            src,
            original_packet,
            etherparse::Icmpv4Type::DestinationUnreachable(
                icmpv4::DestUnreachableHeader::Protocol,
            ),
        ),
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            // The `pointer` is the offset of the `Next Header` field within the IPv6 header.
            icmpv6_error(
                dst,
                src,
                original_packet,
                etherparse::Icmpv6Type::ParameterProblem(icmpv6::ParameterProblemHeader {
                    code: icmpv6::ParameterProblemCode::UnrecognizedNextHeader,
                    pointer: 6,
                }),
            )
        }
        (IpAddr::V4(_), IpAddr::V6(_)) | (IpAddr::V6(_), IpAddr::V4(_)) => {
            bail!(IpVersionMismatch)
        }
    }
}

/// ICMP "fragmentation needed" (v4) / "packet too big" (v6), announcing `mtu`.
pub fn icmp_fragmentation_needed(original_packet: &IpPacket, mtu: u16) -> Result<IpPacket> {
    let src = original_packet.source();
    let dst = original_packet.destination();

    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => icmpv4_error(
            dst,
            src,
            original_packet,
            etherparse::Icmpv4Type::DestinationUnreachable(
                icmpv4::DestUnreachableHeader::FragmentationNeeded { next_hop_mtu: mtu },
            ),
        ),
        (IpAddr::V6(src), IpAddr::V6(dst)) => icmpv6_error(
            dst,
            src,
            original_packet,
            etherparse::Icmpv6Type::PacketTooBig { mtu: mtu as u32 },
        ),
        (IpAddr::V4(_), IpAddr::V6(_)) | (IpAddr::V6(_), IpAddr::V4(_)) => {
            bail!(IpVersionMismatch)
        }
    }
}

fn icmp_dest_unreachable(
    original_packet: &IpPacket,
    icmpv4: icmpv4::DestUnreachableHeader,
    icmpv6: icmpv6::DestUnreachableCode,
) -> Result<IpPacket> {
    let src = original_packet.source();
    let dst = original_packet.destination();

    let icmp_error = match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => icmpv4_error(
            dst,
            src,
            original_packet,
            etherparse::Icmpv4Type::DestinationUnreachable(icmpv4),
        )?,
        (IpAddr::V6(src), IpAddr::V6(dst)) => icmpv6_error(
            dst,
            src,
            original_packet,
            etherparse::Icmpv6Type::DestinationUnreachable(icmpv6),
        )?,
        (IpAddr::V4(_), IpAddr::V6(_)) | (IpAddr::V6(_), IpAddr::V4(_)) => {
            bail!("Invalid IP packet: Inconsistent IP address versions")
        }
    };

    Ok(icmp_error)
}

fn icmpv4_error(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    original_packet: &IpPacket,
    icmp_type: etherparse::Icmpv4Type,
) -> Result<IpPacket> {
    let builder = PacketBuilder::ipv4(src.octets(), dst.octets(), 20).icmpv4(icmp_type);
    let payload = original_packet.packet();

    let header_len = original_packet
        .ipv4_header()
        .context("Not an IPv4 packet")?
        .header_len();
    let icmp_error_payload_len = header_len + 8;

    let actual_payload_len = std::cmp::min(payload.len(), icmp_error_payload_len);
    let error_payload = &payload[..actual_payload_len];

    let ip_packet = crate::build!(builder, error_payload)?;

    Ok(ip_packet)
}

fn icmpv6_error(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    original_packet: &IpPacket,
    icmp_type: etherparse::Icmpv6Type,
) -> Result<IpPacket> {
    // RFC 4443: the invoking packet is included up to the minimum IPv6 MTU.
    const MAX_ICMP_ERROR_PAYLOAD_LEN: usize = 1280 - Ipv6Header::LEN - Icmpv6Header::MAX_LEN;

    let builder = PacketBuilder::ipv6(src.octets(), dst.octets(), 20).icmpv6(icmp_type);
    let payload = original_packet.packet();

    let actual_payload_len = std::cmp::min(payload.len(), MAX_ICMP_ERROR_PAYLOAD_LEN);
    let error_payload = &payload[..actual_payload_len];

    let ip_packet = crate::build!(builder, error_payload)?;

    Ok(ip_packet)
}

#[derive(thiserror::Error, Debug)]
#[error("IPs must be of the same version")]
pub struct IpVersionMismatch;

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::{Icmpv4Type, Ipv4HeaderSlice};

    #[test]
    fn icmp_unreachable_swaps_source_and_destination() {
        let original = udp_packet(
            "10.0.0.1:1000".parse().unwrap(),
            "10.0.0.2:2000".parse().unwrap(),
            vec![0u8; 100],
        )
        .unwrap();

        let icmp_error = icmp_port_unreachable(&original).unwrap();

        assert_eq!(icmp_error.source(), original.destination());
        assert_eq!(icmp_error.destination(), original.source());
    }

    #[test]
    fn icmp_error_embeds_offending_header() {
        let original = udp_packet(
            "10.0.0.1:1000".parse().unwrap(),
            "10.0.0.2:2000".parse().unwrap(),
            vec![0u8; 100],
        )
        .unwrap();

        let icmp_error = icmp_host_unreachable(&original).unwrap();

        let embedded = icmp_error.icmp_error_payload().unwrap();
        let embedded_header = Ipv4HeaderSlice::from_slice(embedded).unwrap();

        assert_eq!(embedded_header.source_addr(), original.source());
        assert_eq!(embedded_header.destination_addr(), original.destination());
    }

    #[test]
    fn fragmentation_needed_announces_mtu() {
        let original = udp_packet(
            "10.0.0.1:1000".parse().unwrap(),
            "10.0.0.2:2000".parse().unwrap(),
            vec![0u8; 3000],
        )
        .unwrap();

        let icmp_error = icmp_fragmentation_needed(&original, 1500).unwrap();

        let icmp = icmp_error.as_icmpv4().unwrap();
        let Icmpv4Type::DestinationUnreachable(icmpv4::DestUnreachableHeader::FragmentationNeeded {
            next_hop_mtu,
        }) = icmp.icmp_type()
        else {
            panic!("expected fragmentation-needed");
        };

        assert_eq!(next_hop_mtu, 1500);
    }

    #[test]
    fn reassembled_packet_parses_as_udp() {
        let full = udp_packet(
            "10.0.0.1:1000".parse().unwrap(),
            "10.0.0.2:2000".parse().unwrap(),
            vec![0xab; 64],
        )
        .unwrap();

        let header = full.ipv4_header().unwrap();
        let reassembled = ipv4_from_header(header, full.payload()).unwrap();

        assert_eq!(reassembled.as_udp().unwrap().payload(), &[0xab; 64][..]);
    }
}
