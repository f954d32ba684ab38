//! The control-plane protocol towards the in-cluster endpoint.
//!
//! Messages are length-delimited JSON over one reliable byte stream. Requests
//! carry an id; replies echo it. `WatchClusterInfo` is server-streaming: the
//! endpoint keeps sending `ClusterInfo` messages with the same id until the
//! stream ends.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use futures::{SinkExt as _, StreamExt as _};
use ip_network::IpNetwork;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use uuid::Uuid;

/// What the cluster looks like from the inside.
///
/// Delivered by `WatchClusterInfo` whenever the cluster's view changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub cluster_domain: String,
    pub kube_dns_ip: IpAddr,
    pub pod_subnets: Vec<IpNetwork>,
    #[serde(default)]
    pub service_subnet: Option<IpNetwork>,
    #[serde(default)]
    pub manager_pod_ip: Option<IpAddr>,
}

impl ClusterInfo {
    /// All subnets the cluster advertises as reachable.
    pub fn subnets(&self) -> impl Iterator<Item = IpNetwork> + '_ {
        self.pod_subnets.iter().copied().chain(self.service_subnet)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub executable: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Upgrade this stream to the tunnel frame protocol.
    Tunnel { session: Uuid },
    WatchClusterInfo { session: Uuid },
    LookupHost { session: Uuid, host: String },
    Version,
    Quit,
    Disconnect { session: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlReply {
    ClusterInfo(ClusterInfo),
    HostIps { ips: Vec<IpAddr> },
    Version(VersionInfo),
    Ok,
    Error { message: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    id: u64,
    #[serde(flatten)]
    msg: T,
}

/// Serializes one request the way the stream tasks do.
///
/// Used to speak the first message of a protocol upgrade (e.g. `Tunnel`)
/// without a full [`ControlClient`].
pub fn encode_request(id: u64, msg: &ControlRequest) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&Envelope { id, msg })
}

enum Pending {
    Once(oneshot::Sender<ControlReply>),
    Stream(mpsc::Sender<ControlReply>),
}

/// Client half of the control plane.
///
/// Cheap to clone; all clones share one underlying stream. Requests are
/// correlated with replies by id; the read task routes replies to whoever
/// asked.
#[derive(Clone)]
pub struct ControlClient {
    outbound: mpsc::Sender<Envelope<ControlRequest>>,
    pending: Arc<Mutex<HashMap<u64, Pending>>>,
    next_id: Arc<std::sync::atomic::AtomicU64>,
}

impl ControlClient {
    /// Takes ownership of `stream` and spawns the read/write tasks.
    pub fn connect<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope<ControlRequest>>(16);
        let pending: Arc<Mutex<HashMap<u64, Pending>>> = Arc::default();

        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

        tokio::spawn({
            let pending = pending.clone();

            async move {
                loop {
                    tokio::select! {
                        Some(envelope) = outbound_rx.recv() => {
                            let bytes = match serde_json::to_vec(&envelope) {
                                Ok(bytes) => bytes,
                                Err(e) => {
                                    tracing::warn!("Failed to serialize control request: {e}");
                                    continue;
                                }
                            };

                            if let Err(e) = framed.send(bytes.into()).await {
                                tracing::debug!("Control stream write failed: {e}");
                                break;
                            }
                        }
                        inbound = framed.next() => {
                            let bytes = match inbound {
                                Some(Ok(bytes)) => bytes,
                                Some(Err(e)) => {
                                    tracing::debug!("Control stream read failed: {e}");
                                    break;
                                }
                                None => {
                                    tracing::debug!("Control stream ended");
                                    break;
                                }
                            };

                            let envelope =
                                match serde_json::from_slice::<Envelope<ControlReply>>(&bytes) {
                                    Ok(envelope) => envelope,
                                    Err(e) => {
                                        tracing::warn!("Malformed control reply: {e}");
                                        continue;
                                    }
                                };

                            dispatch_reply(&pending, envelope).await;
                        }
                        else => break,
                    }
                }

                // Anybody still waiting will see their channel close.
                pending.lock().clear();
            }
        });

        Self {
            outbound: outbound_tx,
            pending,
            next_id: Arc::new(std::sync::atomic::AtomicU64::new(1)),
        }
    }

    /// Server-streaming watch of cluster info.
    ///
    /// The returned channel closes when the control stream goes away.
    pub async fn watch_cluster_info(&self, session: Uuid) -> Result<mpsc::Receiver<ClusterInfo>> {
        let (tx, rx) = mpsc::channel(4);
        let id = self.register(Pending::Stream(tx));

        self.send(id, ControlRequest::WatchClusterInfo { session })
            .await?;

        let (info_tx, info_rx) = mpsc::channel(4);
        let pending = self.pending.clone();

        tokio::spawn(async move {
            let mut rx = rx;

            while let Some(reply) = rx.recv().await {
                match reply {
                    ControlReply::ClusterInfo(info) => {
                        if info_tx.send(info).await.is_err() {
                            break;
                        }
                    }
                    ControlReply::Error { message } => {
                        tracing::warn!("Cluster info watch failed: {message}");
                        break;
                    }
                    ControlReply::HostIps { .. } | ControlReply::Version(_) | ControlReply::Ok => {
                        tracing::warn!("Unexpected reply on cluster info watch");
                    }
                }
            }

            pending.lock().remove(&id);
        });

        Ok(info_rx)
    }

    pub async fn lookup_host(&self, session: Uuid, host: String) -> Result<Vec<IpAddr>> {
        match self
            .request(ControlRequest::LookupHost { session, host })
            .await?
        {
            ControlReply::HostIps { ips } => Ok(ips),
            ControlReply::Error { message } => anyhow::bail!("Lookup failed: {message}"),
            ControlReply::ClusterInfo(_) | ControlReply::Version(_) | ControlReply::Ok => {
                anyhow::bail!("Unexpected reply to LookupHost")
            }
        }
    }

    pub async fn version(&self) -> Result<VersionInfo> {
        match self.request(ControlRequest::Version).await? {
            ControlReply::Version(info) => Ok(info),
            ControlReply::Error { message } => anyhow::bail!("Version failed: {message}"),
            ControlReply::ClusterInfo(_) | ControlReply::HostIps { .. } | ControlReply::Ok => {
                anyhow::bail!("Unexpected reply to Version")
            }
        }
    }

    pub async fn disconnect(&self, session: Uuid) -> Result<()> {
        self.request(ControlRequest::Disconnect { session })
            .await
            .map(|_| ())
    }

    pub async fn quit(&self) -> Result<()> {
        self.request(ControlRequest::Quit).await.map(|_| ())
    }

    async fn request(&self, msg: ControlRequest) -> Result<ControlReply> {
        let (tx, rx) = oneshot::channel();
        let id = self.register(Pending::Once(tx));

        self.send(id, msg).await?;

        let reply = rx.await.context("Control stream closed")?;

        Ok(reply)
    }

    fn register(&self, pending: Pending) -> u64 {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.pending.lock().insert(id, pending);

        id
    }

    async fn send(&self, id: u64, msg: ControlRequest) -> Result<()> {
        self.outbound
            .send(Envelope { id, msg })
            .await
            .context("Control stream closed")?;

        Ok(())
    }
}

async fn dispatch_reply(
    pending: &Mutex<HashMap<u64, Pending>>,
    envelope: Envelope<ControlReply>,
) {
    let entry = pending.lock().remove(&envelope.id);

    match entry {
        Some(Pending::Once(tx)) => {
            let _ = tx.send(envelope.msg);
        }
        Some(Pending::Stream(tx)) => {
            // Streams stay registered until the subscriber goes away.
            if tx.send(envelope.msg).await.is_ok() {
                pending
                    .lock()
                    .insert(envelope.id, Pending::Stream(tx));
            }
        }
        None => {
            tracing::debug!(id = envelope.id, "Reply for unknown request");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_request_serializes_with_type_tag() {
        let json = serde_json::to_value(Envelope {
            id: 7,
            msg: ControlRequest::LookupHost {
                session: Uuid::nil(),
                host: "echo.default".to_owned(),
            },
        })
        .unwrap();

        assert_eq!(json["id"], 7);
        assert_eq!(json["type"], "lookup_host");
        assert_eq!(json["host"], "echo.default");
    }

    #[tokio::test]
    async fn lookup_host_round_trips_over_stream() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let client = ControlClient::connect(client_io);

        tokio::spawn(async move {
            let mut framed = Framed::new(server_io, LengthDelimitedCodec::new());

            let request = framed.next().await.unwrap().unwrap();
            let envelope = serde_json::from_slice::<Envelope<ControlRequest>>(&request).unwrap();

            let reply = serde_json::to_vec(&Envelope {
                id: envelope.id,
                msg: ControlReply::HostIps {
                    ips: vec!["10.96.0.10".parse().unwrap()],
                },
            })
            .unwrap();

            framed.send(reply.into()).await.unwrap();
        });

        let ips = client
            .lookup_host(Uuid::nil(), "echo.default".to_owned())
            .await
            .unwrap();

        assert_eq!(ips, vec!["10.96.0.10".parse::<IpAddr>().unwrap()]);
    }
}
