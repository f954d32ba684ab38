use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use dns_types::{Query, Response, ResponseBuilder, ResponseCode};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::{Resolution, Resolver};

/// DNS responses larger than this get truncated; clients retry over TCP with
/// their real resolver.
const MAX_RESPONSE_SIZE: usize = 1232;

/// The local UDP DNS server.
///
/// Answers queries that reach us through the platform resolver surface or
/// through the in-flow DNS interceptor.
pub struct DnsServer {
    local_addr: SocketAddr,
}

impl DnsServer {
    /// Binds `bind_addr` and spawns the serve loop.
    pub async fn spawn(
        resolver: Arc<Resolver>,
        bind_addr: SocketAddr,
        fallback: Option<Fallback>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .context("Failed to bind DNS server socket")?;
        let local_addr = socket
            .local_addr()
            .context("Failed to read DNS server address")?;

        tracing::info!(%local_addr, "DNS server listening");

        tokio::spawn(serve(Arc::new(socket), resolver, fallback, cancel));

        Ok(Self { local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn serve(
    socket: Arc<UdpSocket>,
    resolver: Arc<Resolver>,
    fallback: Option<Fallback>,
    cancel: CancellationToken,
) {
    let fallback = fallback.map(Arc::new);
    let mut buf = [0u8; 4096];

    loop {
        let (len, from) = tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!("DNS server socket error: {e}");
                    continue;
                }
            },
            () = cancel.cancelled() => break,
        };

        let query = match Query::parse(&buf[..len]) {
            Ok(query) => query,
            Err(e) => {
                tracing::debug!(%from, "Dropping malformed DNS query: {e}");
                continue;
            }
        };

        // Queries resolve concurrently; a slow cluster lookup must not hold up
        // unrelated names.
        tokio::spawn(handle_query(
            socket.clone(),
            resolver.clone(),
            fallback.clone(),
            query,
            buf[..len].to_vec(),
            from,
        ));
    }
}

async fn handle_query(
    socket: Arc<UdpSocket>,
    resolver: Arc<Resolver>,
    fallback: Option<Arc<Fallback>>,
    query: Query,
    raw_query: Vec<u8>,
    from: SocketAddr,
) {
    let name = query.domain().to_string();
    let qtype = query.qtype();

    let response = match resolver.resolve(&name, qtype).await {
        Resolution::Records(records) => ResponseBuilder::for_query(&query, ResponseCode::NOERROR)
            .with_answers(records)
            .build(),
        Resolution::NxDomain => Response::nxdomain(&query),
        Resolution::NotHandled => match &fallback {
            Some(fallback) => match fallback.forward(&raw_query).await {
                Ok(reply) => {
                    if let Err(e) = socket.send_to(&reply, from).await {
                        tracing::debug!(%from, "Failed to send DNS response: {e}");
                    }

                    return;
                }
                Err(e) => {
                    tracing::debug!(%name, "Fallback resolution failed: {e:#}");

                    Response::servfail(&query)
                }
            },
            None => Response::servfail(&query),
        },
    };

    if let Err(e) = socket
        .send_to(&response.into_bytes(MAX_RESPONSE_SIZE), from)
        .await
    {
        tracing::debug!(%from, "Failed to send DNS response: {e}");
    }
}

/// Forwards queries we don't handle to the host's real resolvers.
pub struct Fallback {
    upstreams: Vec<SocketAddr>,
    timeout: Duration,
}

impl Fallback {
    pub fn new(upstreams: Vec<SocketAddr>, timeout: Duration) -> Self {
        Self { upstreams, timeout }
    }

    pub async fn forward(&self, query: &[u8]) -> Result<Vec<u8>> {
        anyhow::ensure!(!self.upstreams.is_empty(), "No fallback resolvers");

        let mut last_error = None;

        for upstream in &self.upstreams {
            match self.forward_to(query, *upstream).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    tracing::debug!(%upstream, "Fallback upstream failed: {e:#}");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.expect("at least one upstream was tried"))
    }

    async fn forward_to(&self, query: &[u8], upstream: SocketAddr) -> Result<Vec<u8>> {
        let bind_addr: SocketAddr = if upstream.is_ipv4() {
            "0.0.0.0:0".parse().expect("valid address")
        } else {
            "[::]:0".parse().expect("valid address")
        };

        let socket = UdpSocket::bind(bind_addr)
            .await
            .context("Failed to bind forwarding socket")?;

        socket
            .send_to(query, upstream)
            .await
            .context("Failed to forward query")?;

        let mut buf = vec![0u8; 4096];

        let (len, _) = tokio::time::timeout(self.timeout, socket.recv_from(&mut buf))
            .await
            .context("Upstream timed out")?
            .context("Failed to receive upstream reply")?;

        buf.truncate(len);

        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClusterResolver, DnsConfig};
    use dns_types::{DomainName, RecordType};
    use std::net::IpAddr;

    struct StaticCluster;

    #[async_trait::async_trait]
    impl ClusterResolver for StaticCluster {
        async fn lookup_host(&self, name: &str) -> Result<Vec<IpAddr>> {
            if name == "echo.default.svc.cluster.local" {
                return Ok(vec!["10.96.0.7".parse().expect("valid IP")]);
            }

            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn answers_cluster_query_over_udp() {
        let resolver = Arc::new(Resolver::new(DnsConfig::default(), Arc::new(StaticCluster)));
        let server = DnsServer::spawn(
            resolver,
            "127.0.0.1:0".parse().unwrap(),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let query = Query::new(
            DomainName::vec_from_str("echo.default.svc.cluster.local").unwrap(),
            RecordType::A,
        );

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(query.as_bytes(), server.local_addr())
            .await
            .unwrap();

        let mut buf = [0u8; 512];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();

        let response = Response::parse(&buf[..len]).unwrap();

        assert_eq!(response.response_code(), ResponseCode::NOERROR);
        assert_eq!(response.answer_count(), 1);
        assert_eq!(response.id(), query.id());
    }

    #[tokio::test]
    async fn unknown_cluster_name_yields_nxdomain() {
        let resolver = Arc::new(Resolver::new(DnsConfig::default(), Arc::new(StaticCluster)));
        let server = DnsServer::spawn(
            resolver,
            "127.0.0.1:0".parse().unwrap(),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let query = Query::new(
            DomainName::vec_from_str("missing.default.svc.cluster.local").unwrap(),
            RecordType::A,
        );

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(query.as_bytes(), server.local_addr())
            .await
            .unwrap();

        let mut buf = [0u8; 512];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();

        let response = Response::parse(&buf[..len]).unwrap();

        assert_eq!(response.response_code(), ResponseCode::NXDOMAIN);
    }
}
