//! The local control socket towards the user daemon.
//!
//! Length-delimited JSON over a Unix domain socket. The user daemon is the
//! only intended client; the socket lives in a root-owned directory.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use futures::{SinkExt as _, StreamExt as _};
use ip_network::IpNetwork;
use serde::{Deserialize, Serialize};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::{
    bytes::BytesMut,
    codec::{FramedRead, FramedWrite, LengthDelimitedCodec},
};
use tokio_util::sync::CancellationToken;

use crate::service::Service;

pub(crate) type ServerRead = FramedRead<ReadHalf<UnixStream>, Decoder<IpcRequest>>;
pub(crate) type ServerWrite = FramedWrite<WriteHalf<UnixStream>, Encoder<IpcResponse>>;

/// Parameters the user daemon supplies on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundInfo {
    /// `host:port` of the in-cluster endpoint.
    pub control_addr: String,
    #[serde(default)]
    pub also_proxy: Vec<IpNetwork>,
    #[serde(default)]
    pub never_proxy: Vec<IpNetwork>,
    #[serde(default)]
    pub include_suffixes: Vec<String>,
    #[serde(default)]
    pub exclude_suffixes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    Status,
    Connect(OutboundInfo),
    Disconnect,
    Quit,
    SetDnsSearchPath {
        paths: Vec<String>,
        namespaces: Vec<String>,
    },
    GetNetworkConfig,
    SetLogLevel {
        level: String,
        #[serde(default)]
        duration_secs: Option<u64>,
    },
    WaitForNetwork,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    Ok,
    Status(StatusInfo),
    NetworkConfig(NetworkConfig),
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusInfo {
    pub connected: bool,
    #[serde(default)]
    pub session_id: Option<uuid::Uuid>,
    #[serde(default)]
    pub remote_version: Option<String>,
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub tun_name: String,
    pub subnets: Vec<IpNetwork>,
    pub static_routes: Vec<IpNetwork>,
    pub unhealthy_subnets: Vec<IpNetwork>,
    #[serde(default)]
    pub cluster_domain: Option<String>,
    #[serde(default)]
    pub remote_dns_ip: Option<IpAddr>,
    #[serde(default)]
    pub dns_server: Option<SocketAddr>,
    pub search_paths: Vec<String>,
}

pub struct Decoder<D> {
    inner: LengthDelimitedCodec,
    _decode_type: std::marker::PhantomData<D>,
}

pub struct Encoder<E> {
    inner: LengthDelimitedCodec,
    _encode_type: std::marker::PhantomData<E>,
}

impl<D> Default for Decoder<D> {
    fn default() -> Self {
        Self {
            inner: LengthDelimitedCodec::new(),
            _decode_type: Default::default(),
        }
    }
}

impl<E> Default for Encoder<E> {
    fn default() -> Self {
        Self {
            inner: LengthDelimitedCodec::new(),
            _encode_type: Default::default(),
        }
    }
}

impl<D: serde::de::DeserializeOwned> tokio_util::codec::Decoder for Decoder<D> {
    type Error = anyhow::Error;
    type Item = D;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<D>> {
        let Some(msg) = self.inner.decode(buf)? else {
            return Ok(None);
        };
        let msg = serde_json::from_slice(&msg)
            .with_context(|| format!("Error while deserializing {}", std::any::type_name::<D>()))?;
        Ok(Some(msg))
    }
}

impl<E: serde::Serialize> tokio_util::codec::Encoder<E> for Encoder<E> {
    type Error = anyhow::Error;

    fn encode(&mut self, msg: E, buf: &mut BytesMut) -> Result<()> {
        let msg = serde_json::to_vec(&msg)?;
        self.inner.encode(msg.into(), buf)?;
        Ok(())
    }
}

/// Binds the socket and serves requests until `cancel` fires.
pub(crate) async fn serve(
    socket_path: &Path,
    service: Arc<Service>,
    cancel: CancellationToken,
) -> Result<()> {
    // A previous unclean shutdown may have left the socket file behind.
    let _ = std::fs::remove_file(socket_path);

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind control socket {}", socket_path.display()))?;

    tracing::info!(path = %socket_path.display(), "Control socket listening");

    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    tracing::warn!("Failed to accept control connection: {e}");
                    continue;
                }
            },
            () = cancel.cancelled() => break,
        };

        tokio::spawn(handle_client(stream, service.clone(), cancel.clone()));
    }

    let _ = std::fs::remove_file(socket_path);

    Ok(())
}

async fn handle_client(stream: UnixStream, service: Arc<Service>, cancel: CancellationToken) {
    let (read, write) = tokio::io::split(stream);

    let mut requests: ServerRead = FramedRead::new(read, Decoder::default());
    let mut responses: ServerWrite = FramedWrite::new(write, Encoder::default());

    loop {
        let request = tokio::select! {
            request = requests.next() => match request {
                Some(Ok(request)) => request,
                Some(Err(e)) => {
                    tracing::warn!("Malformed IPC request: {e:#}");
                    break;
                }
                None => break,
            },
            () = cancel.cancelled() => break,
        };

        tracing::debug!(?request, "IPC request");

        let response = service.handle(request).await;

        if let Err(e) = responses.send(response).await {
            tracing::debug!("Failed to send IPC response: {e:#}");
            break;
        }
    }
}
