//! One connected lifetime of the daemon.
//!
//! A [`Session`] owns exactly one tunnel, one TUN device and one connection
//! pool. Connect creates it; Disconnect or Quit drops it. Shutdown cancels
//! the session token, which propagates cooperatively to every task.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use ip_network::IpNetwork;
use parking_lot::RwLock;
use rand::SeedableRng as _;
use rand::rngs::StdRng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tunnel_proto::CloseReason;
use tunnel_proto::control::{ClusterInfo, ControlClient};
use uuid::Uuid;

use crate::RouterConfig;
use crate::dispatch::{Dispatcher, NetState};
use crate::mux::Tunnel;
use crate::pool::ConnPool;
use crate::reconcile::Reconciler;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub router: RouterConfig,
    pub dns: dns_server::DnsConfig,
    /// Where the local DNS server binds; port 0 picks one.
    pub dns_bind: SocketAddr,
    pub also_proxy: Vec<IpNetwork>,
    pub never_proxy: Vec<IpNetwork>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            dns: dns_server::DnsConfig::default(),
            dns_bind: "127.0.0.1:0".parse().expect("valid address"),
            also_proxy: Vec::new(),
            never_proxy: Vec::new(),
        }
    }
}

/// What the session has configured on the host; surfaced via the local
/// control socket.
#[derive(Debug, Clone, Default)]
pub struct NetworkConfig {
    pub tun_name: String,
    pub subnets: Vec<IpNetwork>,
    pub static_routes: Vec<IpNetwork>,
    pub unhealthy_subnets: Vec<IpNetwork>,
    pub cluster_domain: Option<String>,
    pub remote_dns_ip: Option<IpAddr>,
    pub dns_server: Option<SocketAddr>,
    pub search_paths: Vec<String>,
}

pub struct Session {
    id: Uuid,
    cancel: CancellationToken,
    tunnel_broken: CancellationToken,
    pool: Arc<ConnPool>,
    tunnel: Tunnel,
    control: ControlClient,
    resolver: Arc<dns_server::Resolver>,
    netmgr: Arc<dyn tun::NetMgr>,
    config: SessionConfig,
    network: Arc<RwLock<NetworkConfig>>,
    ready: tokio::sync::watch::Receiver<bool>,
}

impl Session {
    /// Brings up a session over an established control stream and tunnel stream.
    ///
    /// The caller allocates `id`; it has usually announced it to the remote
    /// endpoint already when requesting the tunnel stream.
    pub async fn connect<S>(
        id: Uuid,
        config: SessionConfig,
        tun: Arc<dyn tun::Tun>,
        netmgr: Arc<dyn tun::NetMgr>,
        control: ControlClient,
        tunnel_stream: S,
        fallback: Option<dns_server::Fallback>,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let pool = ConnPool::new();

        let resolver = Arc::new(dns_server::Resolver::new(
            config.dns.clone(),
            Arc::new(ControlClusterResolver {
                control: control.clone(),
                session: id,
            }),
        ));

        let dns_server = dns_server::DnsServer::spawn(
            resolver.clone(),
            config.dns_bind,
            fallback,
            cancel.child_token(),
        )
        .await
        .context("Failed to start DNS server")?;

        let tunnel_broken = CancellationToken::new();
        let tunnel = Tunnel::spawn(
            tunnel_stream,
            id,
            pool.clone(),
            config.router.shutdown_grace,
            tunnel_broken.clone(),
        );

        let net_state = Arc::new(NetState::default());

        Dispatcher::spawn(
            config.router.clone(),
            tun.clone(),
            pool.clone(),
            tunnel.clone(),
            dns_server.local_addr(),
            net_state.clone(),
            StdRng::from_entropy(),
            cancel.child_token(),
        );

        let network = Arc::new(RwLock::new(NetworkConfig {
            tun_name: tun.name().to_owned(),
            dns_server: Some(dns_server.local_addr()),
            ..Default::default()
        }));

        let (ready_tx, ready_rx) = tokio::sync::watch::channel(false);

        let watch = control
            .watch_cluster_info(id)
            .await
            .context("Failed to watch cluster info")?;

        tokio::spawn(cluster_info_loop(
            watch,
            Reconciler::new(
                netmgr.clone(),
                config.also_proxy.clone(),
                config.never_proxy.clone(),
            ),
            netmgr.clone(),
            resolver.clone(),
            net_state,
            network.clone(),
            ready_tx,
            cancel.child_token(),
        ));

        Ok(Self {
            id,
            cancel,
            tunnel_broken,
            pool,
            tunnel,
            control,
            resolver,
            netmgr,
            config,
            network,
            ready: ready_rx,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pool(&self) -> &Arc<ConnPool> {
        &self.pool
    }

    pub fn network_config(&self) -> NetworkConfig {
        self.network.read().clone()
    }

    /// Resolves once the TUN device is configured and the first cluster info
    /// has been applied.
    pub async fn wait_for_network(&self) {
        let mut ready = self.ready_watch();

        while !*ready.borrow() {
            if ready.changed().await.is_err() {
                return;
            }
        }
    }

    /// Watch half of the network-ready signal; `true` once the first cluster
    /// info has been applied.
    pub fn ready_watch(&self) -> tokio::sync::watch::Receiver<bool> {
        self.ready.clone()
    }

    /// Fires when the tunnel stream has permanently failed.
    ///
    /// Existing flows are gone at that point; attach a fresh stream with
    /// [`Session::attach_tunnel`] to serve new ones.
    pub fn tunnel_broken(&self) -> CancellationToken {
        self.tunnel_broken.clone()
    }

    pub fn attach_tunnel<S>(&mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.tunnel_broken = CancellationToken::new();
        self.tunnel.attach(
            stream,
            self.id,
            self.pool.clone(),
            self.config.router.shutdown_grace,
            self.tunnel_broken.clone(),
        );
    }

    /// Applies a search-path update from the user daemon.
    pub async fn set_dns_search_paths(&self, paths: Vec<String>, namespaces: Vec<String>) {
        self.resolver
            .set_search_paths(paths.clone(), namespaces);

        let (cluster_domain, remote_dns_ip) = {
            let network = self.network.read();

            (network.cluster_domain.clone(), network.remote_dns_ip)
        };

        self.network.write().search_paths = paths.clone();

        if let (Some(domain), Some(dns_ip)) = (cluster_domain, remote_dns_ip)
            && let Err(e) = self.netmgr.set_dns(&domain, dns_ip, &paths).await
        {
            tracing::warn!("Failed to apply DNS search paths: {e:#}");
        }
    }

    /// Tears the session down: cancels every task and destroys all handlers
    /// after the grace period.
    pub async fn disconnect(self) {
        self.cancel.cancel();

        self.pool
            .close_all(CloseReason::Aborted, self.config.router.shutdown_grace)
            .await;

        if let Err(e) = self.control.disconnect(self.id).await {
            tracing::debug!("Failed to send disconnect: {e:#}");
        }

        tracing::info!(session = %self.id, "Session closed");
    }
}

struct ControlClusterResolver {
    control: ControlClient,
    session: Uuid,
}

#[async_trait::async_trait]
impl dns_server::ClusterResolver for ControlClusterResolver {
    async fn lookup_host(&self, name: &str) -> Result<Vec<IpAddr>> {
        self.control.lookup_host(self.session, name.to_owned()).await
    }
}

async fn cluster_info_loop(
    mut watch: tokio::sync::mpsc::Receiver<ClusterInfo>,
    mut reconciler: Reconciler,
    netmgr: Arc<dyn tun::NetMgr>,
    resolver: Arc<dns_server::Resolver>,
    net_state: Arc<NetState>,
    network: Arc<RwLock<NetworkConfig>>,
    ready: tokio::sync::watch::Sender<bool>,
    cancel: CancellationToken,
) {
    loop {
        let info = tokio::select! {
            info = watch.recv() => match info {
                Some(info) => info,
                None => {
                    tracing::debug!("Cluster info watch ended");
                    break;
                }
            },
            () = cancel.cancelled() => break,
        };

        tracing::info!(
            cluster_domain = %info.cluster_domain,
            kube_dns_ip = %info.kube_dns_ip,
            subnets = ?info.pod_subnets,
            "Cluster info update"
        );

        reconciler.apply(info.subnets()).await;

        *net_state.remote_dns_ip.write() = Some(info.kube_dns_ip);
        *net_state.pod_subnets.write() = info.pod_subnets.clone();

        let mut dns_config = resolver.config();
        dns_config.cluster_domain = info.cluster_domain.clone();
        dns_config.remote_ip = Some(info.kube_dns_ip);
        resolver.set_config(dns_config);

        let search_paths = {
            let mut network = network.write();

            network.subnets = reconciler.subnets();
            network.static_routes = reconciler.static_routes();
            network.unhealthy_subnets = reconciler.unhealthy();
            network.cluster_domain = Some(info.cluster_domain.clone());
            network.remote_dns_ip = Some(info.kube_dns_ip);

            network.search_paths.clone()
        };

        if let Err(e) = netmgr
            .set_dns(&info.cluster_domain, info.kube_dns_ip, &search_paths)
            .await
        {
            tracing::warn!("Failed to configure platform DNS: {e:#}");
        }

        let _ = ready.send(true);
    }

    // Session teardown: the device keeps nothing we installed.
    reconciler.clear().await;
}
