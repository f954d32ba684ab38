use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// The L4 protocol of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn wire(self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
        }
    }

    fn from_wire(byte: u8) -> Result<Self, ConnIdError> {
        match byte {
            6 => Ok(Protocol::Tcp),
            17 => Ok(Protocol::Udp),
            other => Err(ConnIdError::UnknownProtocol(other)),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// The immutable 5-tuple identifying an L4 flow.
///
/// Serves both as the in-process map key and as the wire identifier on the
/// tunnel. Source and destination must be of the same address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId {
    proto: Protocol,
    src: SocketAddr,
    dst: SocketAddr,
}

/// Encoded length of an IPv4 [`ConnId`].
const V4_LEN: usize = 2 + 4 + 4 + 2 + 2;
/// Encoded length of an IPv6 [`ConnId`].
const V6_LEN: usize = 2 + 16 + 16 + 2 + 2;

impl ConnId {
    pub fn new(proto: Protocol, src: SocketAddr, dst: SocketAddr) -> Result<Self, ConnIdError> {
        if src.is_ipv4() != dst.is_ipv4() {
            return Err(ConnIdError::MixedAddressFamilies);
        }

        Ok(Self { proto, src, dst })
    }

    pub fn proto(&self) -> Protocol {
        self.proto
    }

    pub fn src(&self) -> SocketAddr {
        self.src
    }

    pub fn dst(&self) -> SocketAddr {
        self.dst
    }

    pub fn is_ipv4(&self) -> bool {
        self.src.is_ipv4()
    }

    /// The ConnID of traffic flowing in the opposite direction.
    pub fn reply(&self) -> Self {
        Self {
            proto: self.proto,
            src: self.dst,
            dst: self.src,
        }
    }

    /// Serializes to the fixed-width byte key; 14 bytes for IPv4, 38 for IPv6.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(if self.is_ipv4() { V4_LEN } else { V6_LEN });

        match (self.src.ip(), self.dst.ip()) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                buf.push(4);
                buf.push(self.proto.wire());
                buf.extend_from_slice(&src.octets());
                buf.extend_from_slice(&dst.octets());
            }
            (IpAddr::V6(src), IpAddr::V6(dst)) => {
                buf.push(6);
                buf.push(self.proto.wire());
                buf.extend_from_slice(&src.octets());
                buf.extend_from_slice(&dst.octets());
            }
            (IpAddr::V4(_), IpAddr::V6(_)) | (IpAddr::V6(_), IpAddr::V4(_)) => {
                unreachable!("checked in ctor")
            }
        }

        buf.extend_from_slice(&self.src.port().to_be_bytes());
        buf.extend_from_slice(&self.dst.port().to_be_bytes());

        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ConnIdError> {
        let (family, rest) = bytes.split_first().ok_or(ConnIdError::Truncated)?;
        let (proto, rest) = rest.split_first().ok_or(ConnIdError::Truncated)?;

        let proto = Protocol::from_wire(*proto)?;

        let (src_ip, dst_ip, rest): (IpAddr, IpAddr, &[u8]) = match family {
            4 => {
                if rest.len() != V4_LEN - 2 {
                    return Err(ConnIdError::Truncated);
                }

                let src: [u8; 4] = rest[..4].try_into().expect("length checked");
                let dst: [u8; 4] = rest[4..8].try_into().expect("length checked");

                (src.into(), dst.into(), &rest[8..])
            }
            6 => {
                if rest.len() != V6_LEN - 2 {
                    return Err(ConnIdError::Truncated);
                }

                let src: [u8; 16] = rest[..16].try_into().expect("length checked");
                let dst: [u8; 16] = rest[16..32].try_into().expect("length checked");

                (src.into(), dst.into(), &rest[32..])
            }
            other => return Err(ConnIdError::UnknownFamily(*other)),
        };

        let src_port = u16::from_be_bytes(rest[..2].try_into().expect("length checked"));
        let dst_port = u16::from_be_bytes(rest[2..4].try_into().expect("length checked"));

        Ok(Self {
            proto,
            src: SocketAddr::new(src_ip, src_port),
            dst: SocketAddr::new(dst_ip, dst_port),
        })
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.proto, self.src, self.dst)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConnIdError {
    #[error("Source and destination must be of the same address family")]
    MixedAddressFamilies,
    #[error("Truncated ConnID")]
    Truncated,
    #[error("Unknown address family: {0}")]
    UnknownFamily(u8),
    #[error("Unknown protocol: {0}")]
    UnknownProtocol(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips_v4() {
        let id = ConnId::new(
            Protocol::Tcp,
            "10.0.0.1:40000".parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
        )
        .unwrap();

        assert_eq!(ConnId::decode(&id.encode()).unwrap(), id);
    }

    #[test]
    fn encode_decode_round_trips_v6() {
        let id = ConnId::new(
            Protocol::Udp,
            "[fd00::1]:1234".parse().unwrap(),
            "[fd00::2]:53".parse().unwrap(),
        )
        .unwrap();

        assert_eq!(ConnId::decode(&id.encode()).unwrap(), id);
    }

    #[test]
    fn encoding_is_fixed_width() {
        let v4 = ConnId::new(
            Protocol::Tcp,
            "10.0.0.1:40000".parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
        )
        .unwrap();
        let v6 = ConnId::new(
            Protocol::Tcp,
            "[fd00::1]:1234".parse().unwrap(),
            "[fd00::2]:80".parse().unwrap(),
        )
        .unwrap();

        assert_eq!(v4.encode().len(), 14);
        assert_eq!(v6.encode().len(), 38);
    }

    #[test]
    fn rejects_mixed_families() {
        let err = ConnId::new(
            Protocol::Tcp,
            "10.0.0.1:40000".parse().unwrap(),
            "[fd00::2]:80".parse().unwrap(),
        )
        .unwrap_err();

        assert_eq!(err, ConnIdError::MixedAddressFamilies);
    }

    #[test]
    fn reply_swaps_endpoints() {
        let id = ConnId::new(
            Protocol::Udp,
            "10.0.0.1:1234".parse().unwrap(),
            "10.0.0.2:53".parse().unwrap(),
        )
        .unwrap();

        let reply = id.reply();

        assert_eq!(reply.src(), id.dst());
        assert_eq!(reply.dst(), id.src());
        assert_eq!(reply.reply(), id);
    }
}
