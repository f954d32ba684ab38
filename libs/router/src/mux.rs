use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tunnel_proto::{CloseReason, Frame, FrameCodec, SessionInfo};
use uuid::Uuid;

use crate::pool::{ConnPool, HandlerEvent};

/// Outbound frames from all handlers funnel through one bounded queue.
///
/// When it is full, `Tunnel::send` awaits; that is the flow control which
/// eventually pauses individual TCP handlers.
const OUTBOUND_QUEUE: usize = 512;

/// An idle write side sends a keepalive this often.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Handle to the multiplexed stream carrying all flows.
///
/// Cheap to clone. The stream itself lives in two tasks: a write task
/// draining the outbound queue and a read task demultiplexing inbound frames
/// into per-handler queues. After a permanent stream failure a replacement
/// stream can be attached; existing flows are gone but new ones use it.
#[derive(Clone)]
pub struct Tunnel {
    outbound: Arc<parking_lot::RwLock<mpsc::Sender<Frame>>>,
}

#[derive(Debug, thiserror::Error)]
#[error("Tunnel is closed")]
pub struct TunnelClosed;

impl Tunnel {
    /// Takes ownership of the stream and spawns the read/write tasks.
    ///
    /// On permanent stream failure every pooled handler is shut down with
    /// [`CloseReason::TunnelBroken`] and `broken` is cancelled; flows are not
    /// resumed on a later tunnel.
    pub fn spawn<S>(
        stream: S,
        session_id: Uuid,
        pool: Arc<ConnPool>,
        shutdown_grace: Duration,
        broken: CancellationToken,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);

        let tunnel = Self {
            outbound: Arc::new(parking_lot::RwLock::new(outbound_tx)),
        };

        spawn_io(stream, outbound_rx, session_id, pool, shutdown_grace, broken);

        tunnel
    }

    /// Swaps in a replacement stream after the previous one broke.
    pub fn attach<S>(
        &self,
        stream: S,
        session_id: Uuid,
        pool: Arc<ConnPool>,
        shutdown_grace: Duration,
        broken: CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);

        spawn_io(stream, outbound_rx, session_id, pool, shutdown_grace, broken);

        *self.outbound.write() = outbound_tx;
    }

    /// Queues a frame, awaiting capacity.
    pub async fn send(&self, frame: Frame) -> Result<(), TunnelClosed> {
        let outbound = self.outbound.read().clone();

        outbound.send(frame).await.map_err(|_| TunnelClosed)
    }
}

fn spawn_io<S>(
    stream: S,
    outbound_rx: mpsc::Receiver<Frame>,
    session_id: Uuid,
    pool: Arc<ConnPool>,
    shutdown_grace: Duration,
    broken: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let framed = Framed::new(stream, FrameCodec::default());
    let (sink, stream) = framed.split();

    tokio::spawn(write_loop(sink, outbound_rx, session_id, broken.clone()));
    tokio::spawn(read_loop(stream, pool, shutdown_grace, broken));
}

async fn write_loop<S>(
    mut sink: futures::stream::SplitSink<Framed<S, FrameCodec>, Frame>,
    mut outbound: mpsc::Receiver<Frame>,
    session_id: Uuid,
    broken: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if let Err(e) = sink.send(Frame::SessionInfo(SessionInfo { session_id })).await {
        tracing::warn!("Failed to send session info: {e}");
        broken.cancel();

        return;
    }

    loop {
        let frame = tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break, // Session dropped its handle.
            },
            () = tokio::time::sleep(KEEPALIVE_INTERVAL) => Frame::Keepalive,
            () = broken.cancelled() => break,
        };

        if let Err(e) = sink.send(frame).await {
            tracing::debug!("Tunnel write failed: {e}");
            broken.cancel();

            break;
        }
    }
}

async fn read_loop<S>(
    mut stream: futures::stream::SplitStream<Framed<S, FrameCodec>>,
    pool: Arc<ConnPool>,
    shutdown_grace: Duration,
    broken: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            () = broken.cancelled() => break,
        };

        match frame {
            Some(Ok(Frame::Payload { id, payload })) => {
                let Some(handler) = pool.get(&id) else {
                    tracing::debug!(%id, "Payload for unknown flow");
                    continue;
                };

                // Awaiting here is deliberate: frames for one flow stay
                // ordered and a full handler queue backpressures the stream.
                if handler
                    .send(HandlerEvent::TunnelPayload(payload))
                    .await
                    .is_err()
                {
                    tracing::debug!(%id, "Handler gone; dropping payload");
                }
            }
            Some(Ok(Frame::Close { id, reason })) => {
                let Some(handler) = pool.get(&id) else {
                    continue;
                };

                if handler.send(HandlerEvent::TunnelClose(reason)).await.is_err() {
                    tracing::debug!(%id, "Handler gone; dropping close");
                }
            }
            Some(Ok(Frame::Keepalive)) => {}
            Some(Ok(frame @ (Frame::SessionInfo(_) | Frame::Open(_)))) => {
                tracing::warn!(?frame, "Unexpected frame from remote endpoint");
            }
            Some(Err(e)) => {
                tracing::warn!("Tunnel read failed: {e}");
                break;
            }
            None => {
                tracing::info!("Tunnel stream ended");
                break;
            }
        }
    }

    broken.cancel();

    // Existing ConnIDs are not resumed on a later tunnel; TCP flows see a
    // synthetic RST, UDP flows are silently dropped.
    pool.close_all(CloseReason::TunnelBroken, shutdown_grace).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnel_proto::{ConnId, Protocol};

    #[tokio::test]
    async fn first_frame_is_session_info() {
        let (local, remote) = tokio::io::duplex(4096);

        let session_id = Uuid::new_v4();
        let _tunnel = Tunnel::spawn(
            local,
            session_id,
            ConnPool::new(),
            Duration::from_millis(100),
            CancellationToken::new(),
        );

        let mut framed = Framed::new(remote, FrameCodec::default());
        let frame = framed.next().await.unwrap().unwrap();

        assert_eq!(frame, Frame::SessionInfo(SessionInfo { session_id }));
    }

    #[tokio::test]
    async fn frames_are_forwarded_in_order() {
        let (local, remote) = tokio::io::duplex(4096);

        let tunnel = Tunnel::spawn(
            local,
            Uuid::new_v4(),
            ConnPool::new(),
            Duration::from_millis(100),
            CancellationToken::new(),
        );

        let id = ConnId::new(
            Protocol::Tcp,
            "10.0.0.1:1111".parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
        )
        .unwrap();

        tunnel.send(Frame::Open(id)).await.unwrap();
        tunnel
            .send(Frame::Payload {
                id,
                payload: bytes::Bytes::from_static(b"one"),
            })
            .await
            .unwrap();

        let mut framed = Framed::new(remote, FrameCodec::default());

        assert!(matches!(
            framed.next().await.unwrap().unwrap(),
            Frame::SessionInfo(_)
        ));
        assert_eq!(framed.next().await.unwrap().unwrap(), Frame::Open(id));
        assert!(matches!(
            framed.next().await.unwrap().unwrap(),
            Frame::Payload { payload, .. } if payload.as_ref() == b"one"
        ));
    }
}
