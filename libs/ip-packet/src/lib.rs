#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod make;

pub use etherparse::*;

use anyhow::{Context as _, Result};
use bufferpool::{Buffer, BufferPool};
use std::net::IpAddr;
use std::sync::LazyLock;

static BUFFER_POOL: LazyLock<BufferPool<Vec<u8>>> =
    LazyLock::new(|| BufferPool::new(MAX_DATAGRAM_SIZE));

/// The maximum size of an IP datagram we can handle.
///
/// Reads from the TUN device may exceed the device MTU (e.g. when GSO is in
/// play or the MTU was lowered after the device was opened). We still need to
/// parse such packets in order to answer them with an ICMP error.
pub const MAX_DATAGRAM_SIZE: usize = u16::MAX as usize;

/// A buffer for reading a new [`IpPacket`] off the wire.
pub struct IpPacketBuf {
    inner: Buffer<Vec<u8>>,
}

impl Default for IpPacketBuf {
    fn default() -> Self {
        Self {
            inner: BUFFER_POOL.pull(),
        }
    }
}

impl IpPacketBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buf(&mut self) -> &mut [u8] {
        &mut self.inner
    }
}

/// An owned, parse-validated IP packet.
///
/// The packet is backed by a pooled buffer so cloning and dropping are cheap.
#[derive(PartialEq, Clone)]
pub struct IpPacket {
    buf: Buffer<Vec<u8>>,
    ip_header_length: usize,
    len: usize,

    version: IpVersion,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum IpVersion {
    V4,
    V6,
}

/// Fragmentation fields of an IPv4 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub ident: u16,
    /// Offset of this fragment's payload within the original datagram, in bytes.
    pub offset: usize,
    pub more_fragments: bool,
}

impl std::fmt::Debug for IpPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("Packet");

        dbg.field("src", &self.source())
            .field("dst", &self.destination())
            .field(
                "protocol",
                &self.next_header().keyword_str().unwrap_or("unknown"),
            );

        if let Some(fragment) = self.fragment_header() {
            dbg.field("fragment", &fragment);
        }

        if let Some(tcp) = self.as_tcp() {
            dbg.field("src_port", &tcp.source_port())
                .field("dst_port", &tcp.destination_port())
                .field("seq", &tcp.sequence_number())
                .field("len", &tcp.payload().len());

            if tcp.syn() {
                dbg.field("syn", &true);
            }

            if tcp.rst() {
                dbg.field("rst", &true);
            }

            if tcp.fin() {
                dbg.field("fin", &true);
            }
        }

        if let Some(udp) = self.as_udp() {
            dbg.field("src_port", &udp.source_port())
                .field("dst_port", &udp.destination_port())
                .field("len", &udp.payload().len());
        }

        dbg.finish()
    }
}

impl IpPacket {
    pub fn new(buf: IpPacketBuf, len: usize) -> Result<Self> {
        anyhow::ensure!(len <= MAX_DATAGRAM_SIZE, "Packet too large (len: {len})");
        anyhow::ensure!(len <= buf.inner.len(), "Length exceeds buffer size");

        let ip = IpSlice::from_slice(&buf.inner[..len]).context("Failed to parse IP packet")?;

        let src_ip = ip.source_addr();
        let dst_ip = ip.destination_addr();

        // Fragments don't carry a complete L4 header, validation happens after reassembly.
        if !ip.is_fragmenting_payload() {
            match ip.payload_ip_number() {
                IpNumber::UDP => {
                    UdpSlice::from_slice(ip.payload().payload).with_context(|| {
                        format!("Failed to parse UDP packet; src IP = {src_ip}, dst IP = {dst_ip}")
                    })?;
                }
                IpNumber::TCP => {
                    TcpSlice::from_slice(ip.payload().payload).with_context(|| {
                        format!("Failed to parse TCP packet; src IP = {src_ip}, dst IP = {dst_ip}")
                    })?;
                }
                IpNumber::ICMP => {
                    anyhow::ensure!(
                        matches!(ip, IpSlice::Ipv4(_)),
                        "ICMPv4 is only allowed in IPv4 packets"
                    );

                    Icmpv4Slice::from_slice(ip.payload().payload).with_context(|| {
                        format!(
                            "Failed to parse ICMPv4 packet; src IP = {src_ip}, dst IP = {dst_ip}"
                        )
                    })?;
                }
                IpNumber::IPV6_ICMP => {
                    anyhow::ensure!(
                        matches!(ip, IpSlice::Ipv6(_)),
                        "ICMPv6 is only allowed in IPv6 packets"
                    );

                    Icmpv6Slice::from_slice(ip.payload().payload).with_context(|| {
                        format!(
                            "Failed to parse ICMPv6 packet; src IP = {src_ip}, dst IP = {dst_ip}"
                        )
                    })?;
                }
                _ => {}
            };
        }

        let version = match ip {
            IpSlice::Ipv4(_) => IpVersion::V4,
            IpSlice::Ipv6(_) => IpVersion::V6,
        };
        let ip_header_length = match ip {
            IpSlice::Ipv4(ipv4) => {
                ipv4.header().ihl() as usize * 4
                    + ipv4.extensions().auth.map_or(0, |ext| ext.slice().len())
            }
            IpSlice::Ipv6(ipv6) => ipv6.header().header_len() + ipv6.extensions().slice().len(),
        };

        Ok(Self {
            buf: buf.inner,
            len,
            version,
            ip_header_length,
        })
    }

    /// Copies `slice` into a pooled buffer and parses it.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let mut buf = IpPacketBuf::new();
        anyhow::ensure!(slice.len() <= buf.buf().len(), "Packet too large");

        buf.buf()[..slice.len()].copy_from_slice(slice);

        Self::new(buf, slice.len())
    }

    pub fn version(&self) -> IpVersion {
        self.version
    }

    pub fn source(&self) -> IpAddr {
        match self.version {
            IpVersion::V4 => self.as_ipv4_unchecked().header().source_addr().into(),
            IpVersion::V6 => self.as_ipv6_unchecked().header().source_addr().into(),
        }
    }

    pub fn destination(&self) -> IpAddr {
        match self.version {
            IpVersion::V4 => self.as_ipv4_unchecked().header().destination_addr().into(),
            IpVersion::V6 => self.as_ipv6_unchecked().header().destination_addr().into(),
        }
    }

    pub fn next_header(&self) -> IpNumber {
        IpSlice::from_slice(self.packet())
            .expect("validated in ctor")
            .payload_ip_number()
    }

    /// The full packet, headers included.
    pub fn packet(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The L3 payload, i.e. everything after the IP header (and extensions).
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.ip_header_length..self.len]
    }

    pub fn ip_header_length(&self) -> usize {
        self.ip_header_length
    }

    /// The IPv4 fragmentation fields, if this packet is a fragment.
    pub fn fragment_header(&self) -> Option<FragmentHeader> {
        if self.version != IpVersion::V4 {
            return None;
        }

        let header = self.as_ipv4_unchecked().header().to_header();

        if !header.is_fragmenting_payload() {
            return None;
        }

        Some(FragmentHeader {
            ident: header.identification,
            offset: header.fragment_offset.value() as usize * 8,
            more_fragments: header.more_fragments,
        })
    }

    pub fn ipv4_header(&self) -> Option<Ipv4Header> {
        match self.version {
            IpVersion::V4 => Some(self.as_ipv4_unchecked().header().to_header()),
            IpVersion::V6 => None,
        }
    }

    pub fn as_tcp(&self) -> Option<TcpSlice<'_>> {
        if self.next_header() != IpNumber::TCP || self.fragment_header().is_some() {
            return None;
        }

        TcpSlice::from_slice(self.payload()).ok()
    }

    pub fn as_udp(&self) -> Option<UdpSlice<'_>> {
        if self.next_header() != IpNumber::UDP || self.fragment_header().is_some() {
            return None;
        }

        UdpSlice::from_slice(self.payload()).ok()
    }

    pub fn as_icmpv4(&self) -> Option<Icmpv4Slice<'_>> {
        if self.next_header() != IpNumber::ICMP {
            return None;
        }

        Icmpv4Slice::from_slice(self.payload()).ok()
    }

    pub fn as_icmpv6(&self) -> Option<Icmpv6Slice<'_>> {
        if self.next_header() != IpNumber::IPV6_ICMP {
            return None;
        }

        Icmpv6Slice::from_slice(self.payload()).ok()
    }

    /// For ICMP destination-unreachable errors, the embedded portion of the offending packet.
    pub fn icmp_error_payload(&self) -> Option<&[u8]> {
        if let Some(icmp) = self.as_icmpv4() {
            return match icmp.icmp_type() {
                Icmpv4Type::DestinationUnreachable(_) => Some(icmp.payload()),
                Icmpv4Type::Unknown { .. }
                | Icmpv4Type::EchoReply(_)
                | Icmpv4Type::Redirect(_)
                | Icmpv4Type::EchoRequest(_)
                | Icmpv4Type::TimeExceeded(_)
                | Icmpv4Type::ParameterProblem(_)
                | Icmpv4Type::TimestampRequest(_)
                | Icmpv4Type::TimestampReply(_) => None,
            };
        }

        if let Some(icmp) = self.as_icmpv6() {
            return match icmp.icmp_type() {
                Icmpv6Type::DestinationUnreachable(_)
                | Icmpv6Type::PacketTooBig { .. }
                | Icmpv6Type::ParameterProblem(_) => Some(icmp.payload()),
                Icmpv6Type::Unknown { .. }
                | Icmpv6Type::TimeExceeded(_)
                | Icmpv6Type::EchoRequest(_)
                | Icmpv6Type::EchoReply(_)
                | Icmpv6Type::RouterSolicitation
                | Icmpv6Type::RouterAdvertisement(_)
                | Icmpv6Type::NeighborSolicitation
                | Icmpv6Type::NeighborAdvertisement(_)
                | Icmpv6Type::Redirect => None,
            };
        }

        None
    }

    fn as_ipv4_unchecked(&self) -> Ipv4Slice<'_> {
        debug_assert_eq!(self.version, IpVersion::V4);

        Ipv4Slice::from_slice(self.packet()).expect("validated in ctor")
    }

    fn as_ipv6_unchecked(&self) -> Ipv6Slice<'_> {
        debug_assert_eq!(self.version, IpVersion::V6);

        Ipv6Slice::from_slice(self.packet()).expect("validated in ctor")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn parses_udp_packet() {
        let packet = make::udp_packet(
            "10.0.0.1:1000".parse().unwrap(),
            "10.0.0.2:2000".parse().unwrap(),
            b"hello".to_vec(),
        )
        .unwrap();

        assert_eq!(packet.source(), "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(packet.destination(), "10.0.0.2".parse::<IpAddr>().unwrap());

        let udp = packet.as_udp().unwrap();
        assert_eq!(udp.source_port(), 1000);
        assert_eq!(udp.destination_port(), 2000);
        assert_eq!(udp.payload(), b"hello");
    }

    #[test]
    fn round_trips_through_from_slice() {
        let packet = make::udp_packet(
            "10.0.0.1:1000".parse().unwrap(),
            "10.0.0.2:2000".parse().unwrap(),
            b"hello".to_vec(),
        )
        .unwrap();

        let reparsed = IpPacket::from_slice(packet.packet()).unwrap();

        assert_eq!(reparsed.packet(), packet.packet());
    }

    #[test]
    fn fragment_header_is_none_for_unfragmented() {
        let packet = make::udp_packet(
            "10.0.0.1:1000".parse().unwrap(),
            "10.0.0.2:2000".parse().unwrap(),
            b"hello".to_vec(),
        )
        .unwrap();

        assert_eq!(packet.fragment_header(), None);
    }

    #[test]
    fn parses_fragments_without_l4_validation() {
        // A middle fragment carrying 16 bytes of payload at offset 8.
        let mut header =
            Ipv4Header::new(16, 42, IpNumber::UDP, [10, 0, 0, 1], [10, 0, 0, 2]).unwrap();
        header.identification = 99;
        header.more_fragments = true;
        header.fragment_offset = IpFragOffset::try_new(1).unwrap();
        header.header_checksum = header.calc_header_checksum();

        let mut bytes = Vec::new();
        header.write(&mut bytes).unwrap();
        bytes.extend_from_slice(&[0u8; 16]);

        let packet = IpPacket::from_slice(&bytes).unwrap();

        assert_eq!(
            packet.fragment_header(),
            Some(FragmentHeader {
                ident: 99,
                offset: 8,
                more_fragments: true,
            })
        );
        assert!(packet.as_udp().is_none());
        assert_eq!(packet.source(), IpAddr::from(Ipv4Addr::new(10, 0, 0, 1)));
    }
}
