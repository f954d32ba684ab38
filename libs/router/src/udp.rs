//! UDP flow handlers.
//!
//! The default handler relays datagrams 1:1 between the TUN device and the
//! tunnel and dies after an idle timeout. The DNS interceptor variant
//! terminates the datagram locally against our DNS server instead of
//! crossing the tunnel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tunnel_proto::{CloseReason, ConnId, Frame};

use crate::RouterConfig;
use crate::mux::Tunnel;
use crate::pool::{HANDLER_QUEUE, Handler, HandlerEvent, Remover};

pub(crate) fn spawn(
    id: ConnId,
    cfg: &RouterConfig,
    tun: Arc<dyn tun::Tun>,
    tunnel: Tunnel,
    remover: Remover,
) -> Arc<Handler> {
    let (events_tx, events_rx) = tokio::sync::mpsc::channel(HANDLER_QUEUE);
    let cancel = CancellationToken::new();

    let handler = Arc::new(Handler::new(id, events_tx, cancel.clone()));

    tokio::spawn(run(
        id,
        cfg.udp_idle_timeout,
        tun,
        tunnel,
        events_rx,
        remover,
        cancel,
    ));

    handler
}

async fn run(
    id: ConnId,
    idle_timeout: Duration,
    tun: Arc<dyn tun::Tun>,
    tunnel: Tunnel,
    mut events: tokio::sync::mpsc::Receiver<HandlerEvent>,
    remover: Remover,
    cancel: CancellationToken,
) {
    let mut notify_remote = true;
    let mut last_activity = Instant::now();

    loop {
        let idle_deadline = last_activity + idle_timeout;

        let event = tokio::select! {
            biased;

            () = cancel.cancelled() => break,
            () = tokio::time::sleep_until(tokio::time::Instant::from_std(idle_deadline)) => {
                tracing::debug!(%id, "UDP flow idle; removing handler");
                break;
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        last_activity = Instant::now();

        match event {
            HandlerEvent::Packet(packet) => {
                let Some(udp) = packet.as_udp() else {
                    tracing::warn!(%id, "Dropping non-UDP packet in UDP handler");
                    continue;
                };

                let payload = Bytes::copy_from_slice(udp.payload());

                if tunnel.send(Frame::Payload { id, payload }).await.is_err() {
                    notify_remote = false;
                    break;
                }
            }
            HandlerEvent::TunnelPayload(payload) => {
                // Reply towards the original source, tuple swapped.
                write_datagram(&*tun, &id, &payload);
            }
            HandlerEvent::TunnelClose(_) => {
                notify_remote = false;
                break;
            }
            HandlerEvent::Shutdown(_) => {
                // UDP flows are dropped silently on teardown.
                notify_remote = false;
                break;
            }
        }
    }

    remover.remove();

    if notify_remote {
        let _ = tunnel
            .send(Frame::Close {
                id,
                reason: CloseReason::Normal,
            })
            .await;
    }
}

fn write_datagram(tun: &dyn tun::Tun, id: &ConnId, payload: &[u8]) {
    let packet = match ip_packet::make::udp_packet(id.dst(), id.src(), payload.to_vec()) {
        Ok(packet) => packet,
        Err(e) => {
            tracing::warn!(%id, "Failed to build UDP packet: {e:#}");
            return;
        }
    };

    if let Err(e) = tun.write(packet.packet()) {
        tracing::debug!(%id, "Failed to write UDP packet to TUN: {e}");
    }
}

/// Spawns the DNS interceptor variant.
///
/// Queries towards the cluster DNS IP are forwarded to the local DNS server's
/// UDP socket and the reply is written back over TUN. The handler only lives
/// for a short TTL so one-shot lookups don't accumulate state.
pub(crate) fn spawn_dns_interceptor(
    id: ConnId,
    cfg: &RouterConfig,
    tun: Arc<dyn tun::Tun>,
    dns_server: SocketAddr,
    remover: Remover,
) -> Arc<Handler> {
    let (events_tx, events_rx) = tokio::sync::mpsc::channel(HANDLER_QUEUE);
    let cancel = CancellationToken::new();

    let handler = Arc::new(Handler::new(id, events_tx, cancel.clone()));

    tokio::spawn(run_dns_interceptor(
        id,
        cfg.dns_interceptor_ttl,
        tun,
        dns_server,
        events_rx,
        remover,
        cancel,
    ));

    handler
}

async fn run_dns_interceptor(
    id: ConnId,
    ttl: Duration,
    tun: Arc<dyn tun::Tun>,
    dns_server: SocketAddr,
    mut events: tokio::sync::mpsc::Receiver<HandlerEvent>,
    remover: Remover,
    cancel: CancellationToken,
) {
    let deadline = tokio::time::Instant::now() + ttl;

    let socket = match local_dns_socket(dns_server).await {
        Ok(socket) => socket,
        Err(e) => {
            tracing::warn!(%id, "Failed to reach local DNS server: {e:#}");
            remover.remove();
            return;
        }
    };

    let mut buf = [0u8; 4096];

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,
            () = tokio::time::sleep_until(deadline) => break,
            event = events.recv() => match event {
                Some(HandlerEvent::Packet(packet)) => {
                    let Some(udp) = packet.as_udp() else {
                        continue;
                    };

                    if let Err(e) = socket.send(udp.payload()).await {
                        tracing::debug!(%id, "Failed to forward DNS query: {e}");
                    }
                }
                Some(HandlerEvent::TunnelPayload(_) | HandlerEvent::TunnelClose(_)) => {}
                Some(HandlerEvent::Shutdown(_)) | None => break,
            },
            received = socket.recv(&mut buf) => match received {
                Ok(len) => write_datagram(&*tun, &id, &buf[..len]),
                Err(e) => {
                    tracing::debug!(%id, "Failed to read DNS reply: {e}");
                    break;
                }
            },
        }
    }

    remover.remove();
}

async fn local_dns_socket(dns_server: SocketAddr) -> anyhow::Result<tokio::net::UdpSocket> {
    let bind_addr: SocketAddr = if dns_server.is_ipv4() {
        "127.0.0.1:0".parse().expect("valid address")
    } else {
        "[::1]:0".parse().expect("valid address")
    };

    let socket = tokio::net::UdpSocket::bind(bind_addr).await?;
    socket.connect(dns_server).await?;

    Ok(socket)
}
