//! The packet dispatcher.
//!
//! Owns the read side of the TUN device: one task reads MTU-sized buffers
//! into a small bounded queue, a second task parses, reassembles fragments,
//! classifies by 5-tuple and hands off to the per-flow handlers.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use ip_network::IpNetwork;
use ip_packet::make::TcpSegment;
use ip_packet::{IpNumber, IpPacket, IpPacketBuf};
use parking_lot::{Mutex, RwLock};
use rand::RngCore as _;
use rand::rngs::StdRng;
use tokio_util::sync::CancellationToken;
use tunnel_proto::{ConnId, Protocol};

use crate::RouterConfig;
use crate::fragment::FragmentTable;
use crate::mux::Tunnel;
use crate::pool::{ConnPool, HandlerEvent};
use crate::{tcp, udp};

/// Decouples the TUN read loop from handler work; burst tolerance without
/// unbounded memory growth.
const DISPATCH_QUEUE: usize = 100;

/// NetBIOS chatter is never worth a round-trip to the cluster.
const NETBIOS_PORTS: [u16; 3] = [137, 138, 139];

/// Cluster-state the dispatcher consults per packet; updated by the
/// cluster-info watcher.
#[derive(Default)]
pub(crate) struct NetState {
    pub(crate) remote_dns_ip: RwLock<Option<IpAddr>>,
    pub(crate) pod_subnets: RwLock<Vec<IpNetwork>>,
}

pub(crate) struct Dispatcher {
    cfg: RouterConfig,
    tun: Arc<dyn tun::Tun>,
    pool: Arc<ConnPool>,
    tunnel: Tunnel,
    dns_server: SocketAddr,
    net_state: Arc<NetState>,
    isn_rng: Mutex<StdRng>,
    fragments: FragmentTable,
    /// Malformed or unroutable units dropped so far.
    violations: AtomicU64,
}

impl Dispatcher {
    pub(crate) fn spawn(
        cfg: RouterConfig,
        tun: Arc<dyn tun::Tun>,
        pool: Arc<ConnPool>,
        tunnel: Tunnel,
        dns_server: SocketAddr,
        net_state: Arc<NetState>,
        isn_rng: StdRng,
        cancel: CancellationToken,
    ) {
        let dispatcher = Dispatcher {
            cfg,
            tun: tun.clone(),
            pool,
            tunnel,
            dns_server,
            net_state,
            isn_rng: Mutex::new(isn_rng),
            fragments: FragmentTable::new(),
            violations: AtomicU64::new(0),
        };

        let (packets_tx, packets_rx) = tokio::sync::mpsc::channel(DISPATCH_QUEUE);

        tokio::spawn(read_loop(tun, packets_tx, cancel.clone()));
        tokio::spawn(dispatcher.run(packets_rx, cancel));
    }

    async fn run(
        mut self,
        mut packets: tokio::sync::mpsc::Receiver<IpPacket>,
        cancel: CancellationToken,
    ) {
        loop {
            let packet = tokio::select! {
                packet = packets.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
                () = cancel.cancelled() => break,
            };

            self.dispatch(packet).await;
        }

        tracing::debug!(
            violations = self.violations.load(Ordering::Relaxed),
            "Dispatcher stopped"
        );
    }

    async fn dispatch(&mut self, packet: IpPacket) {
        // Oversized datagrams are bounced before any reassembly; fragments
        // themselves are at most MTU-sized.
        if packet.len() > usize::from(self.cfg.mtu) {
            tracing::trace!(?packet, "Packet exceeds MTU");

            match ip_packet::make::icmp_fragmentation_needed(&packet, self.cfg.mtu) {
                Ok(reply) => self.write_tun(&reply),
                Err(e) => tracing::warn!("Failed to build ICMP too-big reply: {e:#}"),
            }

            return;
        }

        let packet = if packet.fragment_header().is_some() {
            match self.fragments.add(&packet, Instant::now()) {
                Ok(Some(reassembled)) => reassembled,
                Ok(None) => return,
                Err(e) => {
                    self.violation(format_args!("Dropping bad fragment: {e:#}"));
                    return;
                }
            }
        } else {
            packet
        };

        match packet.next_header() {
            IpNumber::TCP => self.dispatch_tcp(packet).await,
            IpNumber::UDP => self.dispatch_udp(packet).await,
            IpNumber::ICMP | IpNumber::IPV6_ICMP => {
                tracing::trace!(?packet, "Dropping ICMP packet");
            }
            other => {
                tracing::debug!(protocol = ?other, "Unhandled L4 protocol");

                match ip_packet::make::icmp_protocol_unreachable(&packet) {
                    Ok(reply) => self.write_tun(&reply),
                    Err(e) => {
                        tracing::warn!("Failed to build ICMP protocol-unreachable reply: {e:#}");
                    }
                }
            }
        }
    }

    async fn dispatch_tcp(&self, packet: IpPacket) {
        let Some((id, syn_only)) = tcp_conn_id(&packet) else {
            self.violation(format_args!("Dropping TCP packet without valid 5-tuple"));
            return;
        };

        if let Some(handler) = self.pool.get(&id) {
            if handler.send(HandlerEvent::Packet(packet)).await.is_err() {
                tracing::debug!(%id, "Handler gone; dropping packet");
            }

            return;
        }

        // A TCP handler only ever starts from a SYN.
        if !syn_only {
            self.send_tcp_rst(&packet);
            return;
        }

        let isn = self.isn_rng.lock().next_u32();

        let created = self.pool.get_or_create_tcp(id, &packet, |first_packet, remover| {
            let tcp = first_packet
                .as_tcp()
                .ok_or_else(|| anyhow::anyhow!("Not a TCP packet"))?;
            anyhow::ensure!(
                tcp.syn() && !tcp.ack(),
                "TCP flows start with SYN and nothing else"
            );

            Ok(tcp::spawn(
                id,
                &self.cfg,
                self.tun.clone(),
                self.tunnel.clone(),
                isn,
                remover,
            ))
        });

        match created {
            Ok(handler) => {
                if handler.send(HandlerEvent::Packet(packet)).await.is_err() {
                    tracing::debug!(%id, "Fresh handler gone; dropping packet");
                }
            }
            Err(e) => {
                self.violation(format_args!("Refusing TCP flow {id}: {e:#}"));
            }
        }
    }

    async fn dispatch_udp(&self, packet: IpPacket) {
        let Some(udp) = packet.as_udp() else {
            self.violation(format_args!("Dropping UDP packet without valid header"));
            return;
        };

        let src_port = udp.source_port();
        let dst_port = udp.destination_port();
        let dst = packet.destination();

        if !is_global_unicast(dst) {
            tracing::trace!(%dst, "Dropping UDP datagram to non-global-unicast destination");
            return;
        }

        if is_subnet_anycast(dst) {
            self.send_icmp(&packet, ip_packet::make::icmp_host_unreachable);
            return;
        }

        if NETBIOS_PORTS.contains(&src_port) || NETBIOS_PORTS.contains(&dst_port) {
            self.send_icmp(&packet, ip_packet::make::icmp_port_unreachable);
            return;
        }

        if self.cfg.refuse_recursive_dns
            && src_port == 53
            && self.is_pod_ip(packet.source())
        {
            // A local cluster looping its recursive resolution back through
            // the host; answering would create a DNS loop.
            tracing::debug!(src = %packet.source(), "Refusing recursive DNS dispatch");
            return;
        }

        let Ok(id) = ConnId::new(
            Protocol::Udp,
            SocketAddr::new(packet.source(), src_port),
            SocketAddr::new(dst, dst_port),
        ) else {
            self.violation(format_args!("Dropping UDP packet with mixed families"));
            return;
        };

        let intercept_dns =
            dst_port == 53 && *self.net_state.remote_dns_ip.read() == Some(dst);

        let created = self.pool.get_or_create(id, |remover| {
            if intercept_dns {
                Ok(udp::spawn_dns_interceptor(
                    id,
                    &self.cfg,
                    self.tun.clone(),
                    self.dns_server,
                    remover,
                ))
            } else {
                Ok(udp::spawn(
                    id,
                    &self.cfg,
                    self.tun.clone(),
                    self.tunnel.clone(),
                    remover,
                ))
            }
        });

        match created {
            Ok(handler) => {
                if handler.send(HandlerEvent::Packet(packet)).await.is_err() {
                    tracing::debug!(%id, "UDP handler gone; dropping datagram");
                }
            }
            Err(e) => {
                self.violation(format_args!("Refusing UDP flow {id}: {e:#}"));
            }
        }
    }

    fn is_pod_ip(&self, ip: IpAddr) -> bool {
        self.net_state
            .pod_subnets
            .read()
            .iter()
            .any(|subnet| contains(*subnet, ip))
    }

    /// Replies to a stray mid-flow packet for which no handler exists.
    fn send_tcp_rst(&self, packet: &IpPacket) {
        let Some(tcp) = packet.as_tcp() else {
            return;
        };

        if tcp.rst() {
            return;
        }

        let segment = TcpSegment {
            seq: if tcp.ack() { tcp.acknowledgment_number() } else { 0 },
            ack: Some(
                tcp.sequence_number()
                    .wrapping_add(tcp.payload().len() as u32)
                    .wrapping_add(u32::from(tcp.syn()))
                    .wrapping_add(u32::from(tcp.fin())),
            ),
            rst: true,
            ..Default::default()
        };

        let reply = ip_packet::make::tcp_packet(
            SocketAddr::new(packet.destination(), tcp.destination_port()),
            SocketAddr::new(packet.source(), tcp.source_port()),
            segment,
            &[],
        );

        match reply {
            Ok(reply) => self.write_tun(&reply),
            Err(e) => tracing::warn!("Failed to build RST reply: {e:#}"),
        }
    }

    fn send_icmp(
        &self,
        packet: &IpPacket,
        make: impl Fn(&IpPacket) -> anyhow::Result<IpPacket>,
    ) {
        match make(packet) {
            Ok(reply) => self.write_tun(&reply),
            Err(e) => tracing::warn!("Failed to build ICMP reply: {e:#}"),
        }
    }

    fn write_tun(&self, packet: &IpPacket) {
        if let Err(e) = self.tun.write(packet.packet()) {
            tracing::debug!("Failed to write packet to TUN: {e}");
        }
    }

    fn violation(&self, message: std::fmt::Arguments<'_>) {
        self.violations.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("{message}");
    }
}

async fn read_loop(
    tun: Arc<dyn tun::Tun>,
    packets: tokio::sync::mpsc::Sender<IpPacket>,
    cancel: CancellationToken,
) {
    loop {
        let mut buf = IpPacketBuf::new();

        let len = tokio::select! {
            read = tun::read_packet(&*tun, buf.buf()) => match read {
                Ok(0) => {
                    tracing::info!("TUN device closed");
                    break;
                }
                Ok(len) => len,
                Err(e) => {
                    tracing::warn!("Failed to read from TUN device: {e}");
                    break;
                }
            },
            () = cancel.cancelled() => break,
        };

        let packet = match IpPacket::new(buf, len) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!("Dropping malformed packet: {e:#}");
                continue;
            }
        };

        if packets.send(packet).await.is_err() {
            break;
        }
    }
}

/// The flow id of a TCP packet plus whether it could start a new flow.
fn tcp_conn_id(packet: &IpPacket) -> Option<(ConnId, bool)> {
    let tcp = packet.as_tcp()?;

    let id = ConnId::new(
        Protocol::Tcp,
        SocketAddr::new(packet.source(), tcp.source_port()),
        SocketAddr::new(packet.destination(), tcp.destination_port()),
    )
    .ok()?;

    Some((id, tcp.syn() && !tcp.ack()))
}

fn is_global_unicast(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !v4.is_multicast() && !v4.is_broadcast() && !v4.is_loopback() && !v4.is_unspecified()
        }
        IpAddr::V6(v6) => !v6.is_multicast() && !v6.is_loopback() && !v6.is_unspecified(),
    }
}

/// Destinations whose lower two address bytes are zero are subnet anycast
/// addresses, not hosts.
fn is_subnet_anycast(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();

            octets[2] == 0 && octets[3] == 0
        }
        IpAddr::V6(_) => false,
    }
}

pub(crate) fn contains(net: IpNetwork, ip: IpAddr) -> bool {
    match (net, ip) {
        (IpNetwork::V4(net), IpAddr::V4(ip)) => net.contains(ip),
        (IpNetwork::V6(net), IpAddr::V6(ip)) => net.contains(ip),
        (IpNetwork::V4(_), IpAddr::V6(_)) | (IpNetwork::V6(_), IpAddr::V4(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("10.1.0.0", true; "lower two bytes zero")]
    #[test_case("10.1.0.1", false; "host address")]
    #[test_case("10.1.1.0", false; "only last byte zero")]
    fn subnet_anycast_detection(ip: &str, expected: bool) {
        assert_eq!(is_subnet_anycast(ip.parse().unwrap()), expected);
    }

    #[test_case("10.0.0.1", true; "plain host")]
    #[test_case("224.0.0.1", false; "multicast")]
    #[test_case("255.255.255.255", false; "broadcast")]
    #[test_case("127.0.0.1", false; "loopback")]
    fn global_unicast_detection(ip: &str, expected: bool) {
        assert_eq!(is_global_unicast(ip.parse().unwrap()), expected);
    }
}
