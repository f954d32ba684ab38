//! Host network programming for a session: routes via the TUN device manager,
//! resolver wiring via the platform DNS controller.

use std::net::{IpAddr, SocketAddr};

use ip_network::IpNetwork;

use crate::dns_control::{DnsController, DnsWiring};

pub(crate) struct OsNetMgr {
    #[cfg(target_os = "linux")]
    manager: tun::TunDeviceManager,
    dns: tokio::sync::Mutex<DnsController>,
    local_dns: SocketAddr,
}

impl OsNetMgr {
    #[cfg(target_os = "linux")]
    pub(crate) fn new(
        manager: tun::TunDeviceManager,
        dns: DnsController,
        local_dns: SocketAddr,
    ) -> Self {
        Self {
            manager,
            dns: tokio::sync::Mutex::new(dns),
            local_dns,
        }
    }

    pub(crate) async fn deactivate_dns(&self) {
        if let Err(e) = self.dns.lock().await.deactivate().await {
            tracing::warn!("Failed to revert DNS control: {e:#}");
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn unsupported<T>() -> anyhow::Result<T> {
        anyhow::bail!("Route programming is not supported on this platform build")
    }
}

#[async_trait::async_trait]
impl tun::NetMgr for OsNetMgr {
    async fn add_subnet(&self, subnet: IpNetwork) -> anyhow::Result<()> {
        #[cfg(target_os = "linux")]
        return self.manager.add_route(subnet).await;

        #[cfg(not(target_os = "linux"))]
        {
            let _ = subnet;

            Self::unsupported()
        }
    }

    async fn remove_subnet(&self, subnet: IpNetwork) -> anyhow::Result<()> {
        #[cfg(target_os = "linux")]
        return self.manager.remove_route(subnet).await;

        #[cfg(not(target_os = "linux"))]
        {
            let _ = subnet;

            Self::unsupported()
        }
    }

    async fn add_static_route(&self, route: IpNetwork) -> anyhow::Result<()> {
        #[cfg(target_os = "linux")]
        return self.manager.add_static_route(route).await;

        #[cfg(not(target_os = "linux"))]
        {
            let _ = route;

            Self::unsupported()
        }
    }

    async fn remove_static_route(&self, route: IpNetwork) -> anyhow::Result<()> {
        #[cfg(target_os = "linux")]
        return self.manager.remove_static_route(route).await;

        #[cfg(not(target_os = "linux"))]
        {
            let _ = route;

            Self::unsupported()
        }
    }

    async fn set_dns(
        &self,
        cluster_domain: &str,
        dns_ip: IpAddr,
        search_list: &[String],
    ) -> anyhow::Result<()> {
        self.dns
            .lock()
            .await
            .set_dns(&DnsWiring {
                cluster_domain: cluster_domain.to_owned(),
                remote_ip: dns_ip,
                local_server: self.local_dns,
                search_list: search_list.to_vec(),
            })
            .await
    }
}
