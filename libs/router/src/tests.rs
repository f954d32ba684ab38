//! End-to-end scenarios against an in-memory TUN device and tunnel stream.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt as _, StreamExt as _};
use ip_packet::make::TcpSegment;
use ip_packet::{IpPacket, TcpOptionElement};
use parking_lot::Mutex;
use rand::SeedableRng as _;
use rand::rngs::StdRng;
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tunnel_proto::{ConnId, Frame, FrameCodec, Protocol};
use uuid::Uuid;

use crate::RouterConfig;
use crate::dispatch::{Dispatcher, NetState};
use crate::mux::Tunnel;
use crate::pool::ConnPool;

const APP: &str = "10.0.0.9";
const SERVICE: &str = "10.0.0.1";

/// In-memory stand-in for the TUN device.
#[derive(Default)]
struct TestTun {
    inbound: Mutex<VecDeque<Vec<u8>>>,
    read_waker: Mutex<Option<Waker>>,
    written: Mutex<VecDeque<IpPacket>>,
}

impl TestTun {
    fn inject(&self, packet: IpPacket) {
        self.inbound.lock().push_back(packet.packet().to_vec());

        if let Some(waker) = self.read_waker.lock().take() {
            waker.wake();
        }
    }

    async fn next_written(&self) -> IpPacket {
        loop {
            if let Some(packet) = self.written.lock().pop_front() {
                return packet;
            }

            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn next_written_matching(&self, pred: impl Fn(&IpPacket) -> bool) -> IpPacket {
        loop {
            let packet = self.next_written().await;

            if pred(&packet) {
                return packet;
            }
        }
    }
}

impl tun::Tun for TestTun {
    fn poll_read(&self, buf: &mut [u8], cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        if let Some(packet) = self.inbound.lock().pop_front() {
            buf[..packet.len()].copy_from_slice(&packet);

            return Poll::Ready(Ok(packet.len()));
        }

        *self.read_waker.lock() = Some(cx.waker().clone());

        Poll::Pending
    }

    fn write(&self, packet: &[u8]) -> io::Result<usize> {
        let parsed = IpPacket::from_slice(packet)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        self.written.lock().push_back(parsed);

        Ok(packet.len())
    }

    fn name(&self) -> &str {
        "tun-test"
    }

    fn index(&self) -> u32 {
        0
    }
}

struct Harness {
    tun: Arc<TestTun>,
    pool: Arc<ConnPool>,
    remote: Framed<DuplexStream, FrameCodec>,
    _cancel: CancellationToken,
}

async fn harness(cfg: RouterConfig) -> Harness {
    let (local, remote) = tokio::io::duplex(1 << 18);

    let pool = ConnPool::new();
    let cancel = CancellationToken::new();

    let tunnel = Tunnel::spawn(
        local,
        Uuid::new_v4(),
        pool.clone(),
        Duration::from_millis(500),
        cancel.child_token(),
    );

    let tun = Arc::new(TestTun::default());

    Dispatcher::spawn(
        cfg,
        tun.clone(),
        pool.clone(),
        tunnel,
        "127.0.0.1:5353".parse().unwrap(),
        Arc::new(NetState::default()),
        StdRng::seed_from_u64(7),
        cancel.child_token(),
    );

    let mut remote = Framed::new(remote, FrameCodec::default());

    // The write task announces itself before anything else.
    let first = within(remote.next()).await.unwrap().unwrap();
    assert!(matches!(first, Frame::SessionInfo(_)));

    Harness {
        tun,
        pool,
        remote,
        _cancel: cancel,
    }
}

async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

fn app_addr() -> SocketAddr {
    format!("{APP}:40000").parse().unwrap()
}

fn service_addr() -> SocketAddr {
    format!("{SERVICE}:80").parse().unwrap()
}

fn tcp_to_service(segment: TcpSegment, payload: &[u8]) -> IpPacket {
    ip_packet::make::tcp_packet(app_addr(), service_addr(), segment, payload).unwrap()
}

#[tokio::test]
async fn tcp_echo_over_tunnel() {
    let mut h = harness(RouterConfig::default()).await;

    let conn_id = ConnId::new(Protocol::Tcp, app_addr(), service_addr()).unwrap();

    // SYN.
    h.tun.inject(tcp_to_service(
        TcpSegment {
            seq: 1000,
            window: 65535,
            syn: true,
            options: vec![TcpOptionElement::MaximumSegmentSize(1460)],
            ..Default::default()
        },
        &[],
    ));

    // SYN-ACK with our ISN and an MSS option.
    let syn_ack = within(h.tun.next_written()).await;
    let tcp = syn_ack.as_tcp().unwrap();
    assert!(tcp.syn() && tcp.ack());
    assert_eq!(tcp.acknowledgment_number(), 1001);
    assert!(
        tcp.options_iterator()
            .flatten()
            .any(|opt| matches!(opt, TcpOptionElement::MaximumSegmentSize(_)))
    );
    let isn = tcp.sequence_number();

    // ACK completes the handshake; exactly one Open goes out.
    h.tun.inject(tcp_to_service(
        TcpSegment {
            seq: 1001,
            ack: Some(isn.wrapping_add(1)),
            window: 65535,
            ..Default::default()
        },
        &[],
    ));

    let open = within(h.remote.next()).await.unwrap().unwrap();
    assert_eq!(open, Frame::Open(conn_id));

    // 1400 bytes of payload split across two segments arrive as two Payload
    // frames whose bytes concatenate to the original.
    let data = (0..1400u32).map(|i| i as u8).collect::<Vec<_>>();

    h.tun.inject(tcp_to_service(
        TcpSegment {
            seq: 1001,
            ack: Some(isn.wrapping_add(1)),
            window: 65535,
            psh: true,
            ..Default::default()
        },
        &data[..700],
    ));
    h.tun.inject(tcp_to_service(
        TcpSegment {
            seq: 1701,
            ack: Some(isn.wrapping_add(1)),
            window: 65535,
            psh: true,
            ..Default::default()
        },
        &data[700..],
    ));

    let mut received = Vec::new();
    while received.len() < 1400 {
        let frame = within(h.remote.next()).await.unwrap().unwrap();

        let Frame::Payload { id, payload } = frame else {
            panic!("expected payload frame, got {frame:?}");
        };

        assert_eq!(id, conn_id);
        received.extend_from_slice(&payload);
    }
    assert_eq!(received, data);

    // Payload from the tunnel comes back as a TCP segment with a proper ACK.
    h.remote
        .send(Frame::Payload {
            id: conn_id,
            payload: Bytes::from_static(b"pong"),
        })
        .await
        .unwrap();

    let pong = within(
        h.tun
            .next_written_matching(|p| p.as_tcp().is_some_and(|t| !t.payload().is_empty())),
    )
    .await;
    let tcp = pong.as_tcp().unwrap();
    assert_eq!(tcp.payload(), b"pong");
    assert_eq!(tcp.sequence_number(), isn.wrapping_add(1));
    assert_eq!(tcp.acknowledgment_number(), 2401);

    // FIN: expect a FIN-ACK, then our ACK-of-FIN finishes the flow.
    h.tun.inject(tcp_to_service(
        TcpSegment {
            seq: 2401,
            ack: Some(isn.wrapping_add(5)),
            window: 65535,
            fin: true,
            ..Default::default()
        },
        &[],
    ));

    let fin_ack = within(h.tun.next_written_matching(|p| {
        p.as_tcp().is_some_and(|t| t.fin())
    }))
    .await;
    let tcp = fin_ack.as_tcp().unwrap();
    assert!(tcp.ack());
    assert_eq!(tcp.acknowledgment_number(), 2402);
    let fin_seq = tcp.sequence_number();

    h.tun.inject(tcp_to_service(
        TcpSegment {
            seq: 2402,
            ack: Some(fin_seq.wrapping_add(1)),
            window: 65535,
            ..Default::default()
        },
        &[],
    ));

    // Exactly one Close frame, and the pool forgets the flow within ~2s.
    let close = within(h.remote.next()).await.unwrap().unwrap();
    assert!(matches!(close, Frame::Close { id, .. } if id == conn_id));

    within(async {
        while h.pool.get(&conn_id).is_some() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
}

#[tokio::test]
async fn fragmented_datagram_yields_one_payload_frame() {
    let mut h = harness(RouterConfig {
        mtu: 1600,
        ..Default::default()
    })
    .await;

    // A 3000-byte UDP datagram, fragmented.
    let full = ip_packet::make::udp_packet(
        format!("{APP}:5000").parse().unwrap(),
        format!("{SERVICE}:6000").parse().unwrap(),
        vec![0x42; 2992],
    )
    .unwrap();

    let header = full.ipv4_header().unwrap();
    let l3_payload = full.payload();
    assert_eq!(l3_payload.len(), 3000);

    let mut offset = 0;
    while offset < l3_payload.len() {
        let end = usize::min(offset + 1504, l3_payload.len());

        let mut fragment_header = header.clone();
        fragment_header.identification = 4242;
        fragment_header.more_fragments = end < l3_payload.len();
        fragment_header.fragment_offset =
            ip_packet::IpFragOffset::try_new((offset / 8) as u16).unwrap();
        fragment_header.set_payload_len(end - offset).unwrap();
        fragment_header.header_checksum = fragment_header.calc_header_checksum();

        let mut bytes = Vec::new();
        fragment_header.write(&mut bytes).unwrap();
        bytes.extend_from_slice(&l3_payload[offset..end]);

        h.tun.inject(IpPacket::from_slice(&bytes).unwrap());

        offset = end;
    }

    let frame = within(h.remote.next()).await.unwrap().unwrap();

    let Frame::Payload { payload, .. } = frame else {
        panic!("expected payload frame, got {frame:?}");
    };

    assert_eq!(payload.len(), 2992);
}

#[tokio::test]
async fn oversized_datagram_is_bounced_with_icmp() {
    let mut h = harness(RouterConfig::default()).await;

    let oversized = ip_packet::make::udp_packet(
        format!("{APP}:5000").parse().unwrap(),
        format!("{SERVICE}:6000").parse().unwrap(),
        vec![0u8; 8972],
    )
    .unwrap();
    assert!(oversized.len() >= 9000);

    h.tun.inject(oversized.clone());

    let reply = within(h.tun.next_written()).await;

    assert_eq!(reply.destination(), oversized.source());

    let icmp = reply.as_icmpv4().unwrap();
    let ip_packet::Icmpv4Type::DestinationUnreachable(
        ip_packet::icmpv4::DestUnreachableHeader::FragmentationNeeded { next_hop_mtu },
    ) = icmp.icmp_type()
    else {
        panic!("expected fragmentation-needed, got {:?}", icmp.icmp_type());
    };
    assert_eq!(next_hop_mtu, 1500);

    // And nothing crossed the tunnel.
    let nothing = tokio::time::timeout(Duration::from_millis(300), h.remote.next()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn tunnel_drop_resets_live_flows() {
    let mut h = harness(RouterConfig::default()).await;

    let conn_id = ConnId::new(Protocol::Tcp, app_addr(), service_addr()).unwrap();

    h.tun.inject(tcp_to_service(
        TcpSegment {
            seq: 1000,
            window: 65535,
            syn: true,
            ..Default::default()
        },
        &[],
    ));

    let syn_ack = within(h.tun.next_written()).await;
    let isn = syn_ack.as_tcp().unwrap().sequence_number();

    h.tun.inject(tcp_to_service(
        TcpSegment {
            seq: 1001,
            ack: Some(isn.wrapping_add(1)),
            window: 65535,
            ..Default::default()
        },
        &[],
    ));

    let open = within(h.remote.next()).await.unwrap().unwrap();
    assert_eq!(open, Frame::Open(conn_id));

    // Sever the tunnel.
    drop(h.remote);

    // Every live handler closes within the grace period and the flow sees a RST.
    let rst = within(
        h.tun
            .next_written_matching(|p| p.as_tcp().is_some_and(|t| t.rst())),
    )
    .await;
    assert_eq!(rst.source(), service_addr().ip());
    assert_eq!(rst.destination(), app_addr().ip());

    within(async {
        while !h.pool.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
}

#[tokio::test]
async fn udp_datagram_round_trips_through_tunnel() {
    let mut h = harness(RouterConfig::default()).await;

    let src: SocketAddr = format!("{APP}:5000").parse().unwrap();
    let dst: SocketAddr = format!("{SERVICE}:53000").parse().unwrap();
    let conn_id = ConnId::new(Protocol::Udp, src, dst).unwrap();

    h.tun.inject(
        ip_packet::make::udp_packet(src, dst, b"ping".to_vec()).unwrap(),
    );

    let frame = within(h.remote.next()).await.unwrap().unwrap();
    assert!(
        matches!(&frame, Frame::Payload { id, payload } if *id == conn_id && payload.as_ref() == b"ping")
    );

    h.remote
        .send(Frame::Payload {
            id: conn_id,
            payload: Bytes::from_static(b"pong"),
        })
        .await
        .unwrap();

    let reply = within(h.tun.next_written()).await;
    let udp = reply.as_udp().unwrap();

    // Tuple is swapped on the way back.
    assert_eq!(reply.source(), dst.ip());
    assert_eq!(reply.destination(), src.ip());
    assert_eq!(udp.source_port(), dst.port());
    assert_eq!(udp.destination_port(), src.port());
    assert_eq!(udp.payload(), b"pong");
}
