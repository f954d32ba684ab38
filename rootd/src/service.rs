//! Session lifecycle behind the control socket.
//!
//! There is at most one active session, owned by a mutex on the service.
//! Connect creates it; Disconnect or Quit drops it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use backoff::ExponentialBackoffBuilder;
use teleroute_router::{RouterConfig, Session, SessionConfig};
use tokio::io::AsyncWriteExt as _;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tunnel_proto::control::{ControlClient, ControlRequest};
use uuid::Uuid;

use crate::dns_control::DnsControlMethod;
#[cfg(target_os = "linux")]
use crate::dns_control::DnsController;
use crate::ipc::{IpcRequest, IpcResponse, NetworkConfig, OutboundInfo, StatusInfo};
use crate::logging::LogHandle;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// User daemons give up long before this; don't hold their call forever.
const WAIT_FOR_NETWORK_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) struct Config {
    pub mtu: u16,
    pub dns_control: DnsControlMethod,
    pub connect_timeout: Duration,
    pub refuse_recursive_dns: bool,
    pub tun_ipv4: std::net::Ipv4Addr,
    pub tun_ipv6: std::net::Ipv6Addr,
}

struct ActiveSession {
    session: Session,
    netmgr: Arc<crate::netmgr::OsNetMgr>,
    remote_version: Option<String>,
}

pub(crate) struct Service {
    config: Config,
    tun: Arc<dyn tun::Tun>,
    session: tokio::sync::Mutex<Option<ActiveSession>>,
    log_handle: LogHandle,
    quit: CancellationToken,
}

impl Service {
    pub(crate) fn new(
        config: Config,
        tun: Arc<dyn tun::Tun>,
        log_handle: LogHandle,
        quit: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            tun,
            session: tokio::sync::Mutex::new(None),
            log_handle,
            quit,
        })
    }

    pub(crate) async fn handle(self: &Arc<Self>, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Status => self.status().await,
            IpcRequest::Connect(info) => match self.connect(info).await {
                Ok(()) => IpcResponse::Ok,
                Err(e) => IpcResponse::Error {
                    message: format!("{e:#}"),
                },
            },
            IpcRequest::Disconnect => match self.disconnect().await {
                Ok(()) => IpcResponse::Ok,
                Err(e) => IpcResponse::Error {
                    message: format!("{e:#}"),
                },
            },
            IpcRequest::Quit => {
                let _ = self.disconnect().await;
                self.quit.cancel();

                IpcResponse::Ok
            }
            IpcRequest::SetDnsSearchPath { paths, namespaces } => {
                let session = self.session.lock().await;

                match session.as_ref() {
                    Some(active) => {
                        active.session.set_dns_search_paths(paths, namespaces).await;

                        IpcResponse::Ok
                    }
                    None => IpcResponse::Error {
                        message: "Not connected".to_owned(),
                    },
                }
            }
            IpcRequest::GetNetworkConfig => {
                let session = self.session.lock().await;

                match session.as_ref() {
                    Some(active) => {
                        let network = active.session.network_config();

                        IpcResponse::NetworkConfig(NetworkConfig {
                            tun_name: network.tun_name,
                            subnets: network.subnets,
                            static_routes: network.static_routes,
                            unhealthy_subnets: network.unhealthy_subnets,
                            cluster_domain: network.cluster_domain,
                            remote_dns_ip: network.remote_dns_ip,
                            dns_server: network.dns_server,
                            search_paths: network.search_paths,
                        })
                    }
                    None => IpcResponse::Error {
                        message: "Not connected".to_owned(),
                    },
                }
            }
            IpcRequest::SetLogLevel {
                level,
                duration_secs,
            } => match self
                .log_handle
                .set_level(&level, duration_secs.map(Duration::from_secs))
            {
                Ok(()) => IpcResponse::Ok,
                Err(e) => IpcResponse::Error {
                    message: format!("{e:#}"),
                },
            },
            IpcRequest::WaitForNetwork => {
                let wait = {
                    let session = self.session.lock().await;

                    session
                        .as_ref()
                        .map(|active| active.session.ready_watch())
                };

                let Some(mut ready) = wait else {
                    return IpcResponse::Error {
                        message: "Not connected".to_owned(),
                    };
                };

                let outcome = tokio::time::timeout(WAIT_FOR_NETWORK_TIMEOUT, async {
                    while !*ready.borrow() {
                        if ready.changed().await.is_err() {
                            break;
                        }
                    }
                })
                .await;

                match outcome {
                    Ok(()) => IpcResponse::Ok,
                    Err(_) => IpcResponse::Error {
                        message: "Timed out waiting for network".to_owned(),
                    },
                }
            }
        }
    }

    async fn status(&self) -> IpcResponse {
        let session = self.session.lock().await;

        IpcResponse::Status(StatusInfo {
            connected: session.is_some(),
            session_id: session.as_ref().map(|active| active.session.id()),
            remote_version: session
                .as_ref()
                .and_then(|active| active.remote_version.clone()),
            version: VERSION.to_owned(),
        })
    }

    async fn connect(self: &Arc<Self>, info: OutboundInfo) -> Result<()> {
        let mut slot = self.session.lock().await;

        anyhow::ensure!(slot.is_none(), "Already connected");

        let control_stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(&info.control_addr),
        )
        .await
        .context("Timed out connecting to the traffic manager")?
        .with_context(|| format!("Failed to connect to {}", info.control_addr))?;

        let control = ControlClient::connect(control_stream);

        let remote_version = match control.version().await {
            Ok(version) => {
                tracing::info!(version = %version.version, executable = %version.executable, "Connected to traffic manager");

                Some(version.version)
            }
            Err(e) => {
                tracing::warn!("Failed to fetch remote version: {e:#}");

                None
            }
        };

        let session_id = Uuid::new_v4();

        let tunnel_stream = open_tunnel_stream(
            &info.control_addr,
            session_id,
            self.config.connect_timeout,
        )
        .await?;

        // The DNS server binds this before the session is up; picking the
        // port up front lets us hand it to the platform DNS controller too.
        let local_dns = pick_local_dns_addr().await?;

        let netmgr = self.build_netmgr(local_dns).await?;

        let fallback = if self.config.dns_control.expands_search_paths() {
            let upstreams = crate::dns_control::system_resolvers()
                .unwrap_or_default()
                .into_iter()
                .map(|ip| SocketAddr::new(ip, 53))
                .collect::<Vec<_>>();

            Some(dns_server::Fallback::new(upstreams, Duration::from_secs(2)))
        } else {
            None
        };

        let session_config = SessionConfig {
            router: RouterConfig {
                mtu: self.config.mtu,
                refuse_recursive_dns: self.config.refuse_recursive_dns,
                ..Default::default()
            },
            dns: dns_server::DnsConfig {
                include_suffixes: info.include_suffixes.clone(),
                exclude_suffixes: info.exclude_suffixes.clone(),
                expand_search_paths: self.config.dns_control.expands_search_paths(),
                ..Default::default()
            },
            dns_bind: local_dns,
            also_proxy: info.also_proxy.clone(),
            never_proxy: info.never_proxy.clone(),
        };

        let session = Session::connect(
            session_id,
            session_config,
            self.tun.clone(),
            netmgr.clone(),
            control,
            tunnel_stream,
            fallback,
        )
        .await?;

        tokio::spawn(tunnel_reconnect_loop(
            self.clone(),
            session.tunnel_broken(),
            info.control_addr.clone(),
            session_id,
        ));

        tracing::info!(session = %session_id, "Session established");

        *slot = Some(ActiveSession {
            session,
            netmgr,
            remote_version,
        });

        Ok(())
    }

    #[cfg(target_os = "linux")]
    async fn build_netmgr(&self, local_dns: SocketAddr) -> Result<Arc<crate::netmgr::OsNetMgr>> {
        let manager = tun::TunDeviceManager::new(self.tun.index(), usize::from(self.config.mtu))
            .context("Failed to create TUN device manager")?;

        manager
            .set_ips(self.config.tun_ipv4, self.config.tun_ipv6)
            .await
            .context("Failed to assign addresses to the TUN device")?;

        let dns = DnsController::new(self.config.dns_control, self.tun.name().to_owned());

        Ok(Arc::new(crate::netmgr::OsNetMgr::new(
            manager, dns, local_dns,
        )))
    }

    #[cfg(not(target_os = "linux"))]
    async fn build_netmgr(&self, _: SocketAddr) -> Result<Arc<crate::netmgr::OsNetMgr>> {
        anyhow::bail!("Route programming is not supported on this platform build")
    }

    pub(crate) async fn disconnect(&self) -> Result<()> {
        let Some(active) = self.session.lock().await.take() else {
            return Ok(());
        };

        active.session.disconnect().await;
        active.netmgr.deactivate_dns().await;

        Ok(())
    }
}

/// Re-dials the tunnel stream whenever it permanently fails.
///
/// Existing flows were dropped with the old tunnel; the replacement serves
/// new connections only.
async fn tunnel_reconnect_loop(
    service: Arc<Service>,
    mut broken: CancellationToken,
    control_addr: String,
    session_id: Uuid,
) {
    loop {
        broken.cancelled().await;

        // The session may already be gone.
        if service.session.lock().await.is_none() {
            return;
        }

        tracing::warn!("Tunnel stream failed; reconnecting");

        let backoff = ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(Duration::from_secs(300)))
            .build();

        let stream = backoff::future::retry(backoff, || async {
            open_tunnel_stream(&control_addr, session_id, Duration::from_secs(10))
                .await
                .map_err(backoff::Error::transient)
        })
        .await;

        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("Giving up on tunnel reconnect: {e:#}");
                return;
            }
        };

        let mut slot = service.session.lock().await;

        let Some(active) = slot.as_mut() else {
            return;
        };

        if active.session.id() != session_id {
            return;
        }

        active.session.attach_tunnel(stream);
        broken = active.session.tunnel_broken();

        tracing::info!("Tunnel re-established");
    }
}

/// Dials a fresh stream and upgrades it to the tunnel frame protocol.
async fn open_tunnel_stream(
    control_addr: &str,
    session_id: Uuid,
    timeout: Duration,
) -> Result<TcpStream> {
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(control_addr))
        .await
        .context("Timed out connecting tunnel stream")?
        .with_context(|| format!("Failed to connect to {control_addr}"))?;

    // One length-delimited JSON request; after it, the stream speaks frames.
    let request = tunnel_proto::control::encode_request(
        0,
        &ControlRequest::Tunnel {
            session: session_id,
        },
    )?;

    stream.write_u32(request.len() as u32).await?;
    stream.write_all(&request).await?;

    Ok(stream)
}

async fn pick_local_dns_addr() -> Result<SocketAddr> {
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0")
        .await
        .context("Failed to pick a local DNS port")?;

    Ok(socket.local_addr()?)
}
