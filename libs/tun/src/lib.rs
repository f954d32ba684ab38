//! The virtual network interface and the host network programming around it.
//!
//! [`Tun`] is raw packet I/O on the device. [`NetMgr`] is everything else the
//! router needs from the host: installing subnets and static routes and
//! pointing the resolver at us. Both are traits so the router can be driven
//! against in-memory fakes in tests.

use std::io;
use std::net::IpAddr;
use std::task::{Context, Poll};

use ip_network::IpNetwork;

#[cfg(target_os = "linux")]
mod ioctl;
#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::{TunDevice, TunDeviceManager};

/// Raw packet I/O on the TUN device.
///
/// The device is single-reader, multi-writer: reads happen from one task,
/// writes are non-blocking and may come from any handler.
pub trait Tun: Send + Sync + 'static {
    fn poll_read(&self, buf: &mut [u8], cx: &mut Context<'_>) -> Poll<io::Result<usize>>;

    /// Writes one IP packet to the device.
    fn write(&self, packet: &[u8]) -> io::Result<usize>;

    fn name(&self) -> &str;

    fn index(&self) -> u32;
}

/// Reads one packet off the device.
pub async fn read_packet(tun: &dyn Tun, buf: &mut [u8]) -> io::Result<usize> {
    std::future::poll_fn(|cx| tun.poll_read(buf, cx)).await
}

/// Host network programming for the session: subnets captured by the TUN
/// device, static escape routes and the platform resolver surface.
#[async_trait::async_trait]
pub trait NetMgr: Send + Sync + 'static {
    async fn add_subnet(&self, subnet: IpNetwork) -> anyhow::Result<()>;
    async fn remove_subnet(&self, subnet: IpNetwork) -> anyhow::Result<()>;

    /// Installs a host route via the real interface, excluding `route` from capture.
    async fn add_static_route(&self, route: IpNetwork) -> anyhow::Result<()>;
    async fn remove_static_route(&self, route: IpNetwork) -> anyhow::Result<()>;

    /// Points the platform resolver surface at our DNS server.
    async fn set_dns(
        &self,
        cluster_domain: &str,
        dns_ip: IpAddr,
        search_list: &[String],
    ) -> anyhow::Result<()>;
}
