//! Virtual network interface on Linux.

use anyhow::{Context as _, Result};
use futures::TryStreamExt as _;
use ip_network::IpNetwork;
use libc::{EEXIST, ENOENT, ESRCH, F_GETFL, F_SETFL, O_NONBLOCK, O_RDWR, S_IFCHR};
use netlink_packet_route::route::{RouteAttribute, RouteMessage, RouteProtocol, RouteScope};
use rtnetlink::{Error::NetlinkError, Handle, LinkUnspec, RouteMessageBuilder, new_connection};
use std::ffi::CString;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::task::{Context, Poll, ready};
use std::{fs, os::unix::fs::PermissionsExt};
use tokio::io::unix::AsyncFd;

use crate::ioctl;

// Kernel ABI: the TUNSETIFF request and the misc char device /dev/net/tun
// lives at major 10, minor 200 on every Linux.
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const TUN_DEV: &str = "/dev/net/tun";
const TUN_DEV_MAJOR: u32 = 10;
const TUN_DEV_MINOR: u32 = 200;

/// An open `/dev/net/tun` queue.
pub struct TunDevice {
    fd: AsyncFd<RawFd>,
    name: String,
    index: u32,
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd.as_raw_fd()) };
    }
}

impl TunDevice {
    pub fn open(name: &str) -> Result<Self> {
        ensure_device_node().context("No usable /dev/net/tun")?;

        let fd = open_queue(name).with_context(|| format!("Failed to attach queue to `{name}`"))?;

        let index = iface_index(name).context("Failed to resolve interface index")?;

        Ok(Self {
            fd: AsyncFd::new(fd).context("Failed to register TUN fd with the runtime")?,
            name: name.to_owned(),
            index,
        })
    }

    pub fn mtu(&self) -> Result<usize> {
        let socket = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, libc::IPPROTO_IP) };
        if socket == -1 {
            return Err(io::Error::last_os_error()).context("Failed to open ioctl socket");
        }

        let mut request =
            ioctl::Request::<ioctl::GetInterfaceMtuPayload>::new(&self.name)
                .context("Invalid interface name")?;

        // Safety: The socket is open.
        let result = unsafe { ioctl::exec(socket, libc::SIOCGIFMTU, &mut request) };
        unsafe { libc::close(socket) };

        result.context("SIOCGIFMTU failed")?;

        Ok(request.mtu())
    }
}

impl crate::Tun for TunDevice {
    fn poll_read(&self, buf: &mut [u8], cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;

            match guard.try_io(|fd| {
                // Safety: The fd stays open for the lifetime of the device.
                let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };

                if n < 0 {
                    return Err(io::Error::last_os_error());
                }

                Ok(n as usize)
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn write(&self, packet: &[u8]) -> io::Result<usize> {
        // Safety: The fd stays open for the lifetime of the device.
        let n = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                packet.as_ptr().cast(),
                packet.len(),
            )
        };

        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(n as usize)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn index(&self) -> u32 {
        self.index
    }
}

/// Opens one non-blocking queue on the named interface, creating it if needed.
fn open_queue(name: &str) -> io::Result<RawFd> {
    let dev = CString::new(TUN_DEV).expect("no interior NUL");

    // Safety: `dev` is a valid C string; flags are constants.
    let fd = unsafe { libc::open(dev.as_ptr(), O_RDWR) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    // Safety: We just opened the file descriptor; close it again on any failure.
    let attached = unsafe {
        ioctl::exec(
            fd,
            TUNSETIFF,
            &mut ioctl::Request::<ioctl::SetTunFlagsPayload>::new(name),
        )
    }
    .and_then(|()| {
        // Safety: fd is open.
        let flags = unsafe { libc::fcntl(fd, F_GETFL) };
        if flags < 0 || unsafe { libc::fcntl(fd, F_SETFL, flags | O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    });

    if let Err(e) = attached {
        // Safety: fd is open and not otherwise shared yet.
        unsafe { libc::close(fd) };

        return Err(e);
    }

    Ok(fd)
}

fn iface_index(name: &str) -> io::Result<u32> {
    let name = CString::new(name).map_err(|_| io::ErrorKind::InvalidInput)?;

    // Safety: `name` is a valid C string.
    match unsafe { libc::if_nametoindex(name.as_ptr()) } {
        0 => Err(io::Error::last_os_error()),
        index => Ok(index),
    }
}

/// Makes sure the misc char device exists; containers often lack it.
fn ensure_device_node() -> io::Result<()> {
    let node = Path::new(TUN_DEV);

    if node.exists() {
        return Ok(());
    }

    let dir = node.parent().expect("device node has a parent");
    fs::create_dir_all(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o751))?;

    let node = CString::new(TUN_DEV).expect("no interior NUL");

    // Safety: `node` is a valid C string; major/minor are the fixed TUN numbers.
    let created = unsafe {
        libc::mknod(
            node.as_ptr(),
            S_IFCHR,
            libc::makedev(TUN_DEV_MAJOR, TUN_DEV_MINOR),
        )
    };

    if created != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Programs addresses and routes for the TUN device via netlink.
pub struct TunDeviceManager {
    mtu: u32,
    iface_index: u32,
    handle: Handle,
    connection_task: tokio::task::JoinHandle<()>,
}

impl Drop for TunDeviceManager {
    fn drop(&mut self) {
        self.connection_task.abort();
    }
}

impl TunDeviceManager {
    /// Creates a new manager for an already-open device.
    ///
    /// Panics if called without a Tokio runtime.
    pub fn new(iface_index: u32, mtu: usize) -> Result<Self> {
        let (cxn, handle, _) = new_connection().context("Failed to create netlink connection")?;

        Ok(Self {
            mtu: mtu as u32,
            iface_index,
            handle,
            connection_task: tokio::spawn(cxn),
        })
    }

    pub async fn set_ips(&self, ipv4: Ipv4Addr, ipv6: Ipv6Addr) -> Result<()> {
        let handle = &self.handle;
        let index = self.iface_index;

        let ips = handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();

        ips.try_for_each(|ip| handle.address().del(ip).execute())
            .await
            .context("Failed to delete existing addresses")?;

        handle
            .link()
            .set(LinkUnspec::new_with_index(index).mtu(self.mtu).build())
            .execute()
            .await
            .context("Failed to set MTU")?;

        handle
            .address()
            .add(index, ipv4.into(), 32)
            .execute()
            .await
            .context("Failed to set IPv4 address")?;

        if let Err(e) = handle.address().add(index, ipv6.into(), 128).execute().await {
            tracing::debug!("Failed to set IPv6 address on TUN device: {e}");
        }

        handle
            .link()
            .set(LinkUnspec::new_with_index(index).up().build())
            .execute()
            .await
            .context("Failed to bring up interface")?;

        Ok(())
    }

    pub async fn add_route(&self, route: IpNetwork) -> Result<()> {
        let message = self.route_message(route, None);

        match self.handle.route().add(message).execute().await {
            Ok(()) => {
                tracing::debug!(%route, "Created new route");

                Ok(())
            }
            // We expect this to be called often with an already existing route.
            Err(NetlinkError(err)) if err.raw_code() == -EEXIST => Ok(()),
            // On systems without support for a certain IP version, adding a route returns EOPNOTSUPP.
            Err(NetlinkError(err)) if err.raw_code() == -libc::EOPNOTSUPP => Ok(()),
            Err(err) => Err(err).context(format!("Failed to add route {route}")),
        }
    }

    pub async fn remove_route(&self, route: IpNetwork) -> Result<()> {
        let message = self.route_message(route, None);

        match self.handle.route().del(message).execute().await {
            Ok(()) => {
                tracing::debug!(%route, "Removed route");

                Ok(())
            }
            Err(NetlinkError(err))
                if matches!(-err.raw_code(), ESRCH | ENOENT) =>
            {
                Ok(())
            }
            Err(err) => Err(err).context(format!("Failed to remove route {route}")),
        }
    }

    /// Installs a route for `route` via the current default gateway, bypassing the TUN device.
    pub async fn add_static_route(&self, route: IpNetwork) -> Result<()> {
        let gateway = self
            .default_gateway(route.is_ipv4())
            .await?
            .context("No default gateway")?;

        let message = match route {
            IpNetwork::V4(net) => {
                let IpAddr::V4(gw) = gateway else {
                    anyhow::bail!("Default gateway family mismatch");
                };

                RouteMessageBuilder::<Ipv4Addr>::new()
                    .protocol(RouteProtocol::Static)
                    .scope(RouteScope::Universe)
                    .destination_prefix(net.network_address(), net.netmask())
                    .gateway(gw)
                    .build()
            }
            IpNetwork::V6(net) => {
                let IpAddr::V6(gw) = gateway else {
                    anyhow::bail!("Default gateway family mismatch");
                };

                RouteMessageBuilder::<Ipv6Addr>::new()
                    .protocol(RouteProtocol::Static)
                    .scope(RouteScope::Universe)
                    .destination_prefix(net.network_address(), net.netmask())
                    .gateway(gw)
                    .build()
            }
        };

        match self.handle.route().add(message).execute().await {
            Ok(()) => Ok(()),
            Err(NetlinkError(err)) if err.raw_code() == -EEXIST => Ok(()),
            Err(err) => Err(err).context(format!("Failed to add static route {route}")),
        }
    }

    pub async fn remove_static_route(&self, route: IpNetwork) -> Result<()> {
        let Some(gateway) = self.default_gateway(route.is_ipv4()).await? else {
            return Ok(());
        };

        let message = match route {
            IpNetwork::V4(net) => {
                let IpAddr::V4(gw) = gateway else {
                    return Ok(());
                };

                RouteMessageBuilder::<Ipv4Addr>::new()
                    .protocol(RouteProtocol::Static)
                    .scope(RouteScope::Universe)
                    .destination_prefix(net.network_address(), net.netmask())
                    .gateway(gw)
                    .build()
            }
            IpNetwork::V6(net) => {
                let IpAddr::V6(gw) = gateway else {
                    return Ok(());
                };

                RouteMessageBuilder::<Ipv6Addr>::new()
                    .protocol(RouteProtocol::Static)
                    .scope(RouteScope::Universe)
                    .destination_prefix(net.network_address(), net.netmask())
                    .gateway(gw)
                    .build()
            }
        };

        match self.handle.route().del(message).execute().await {
            Ok(()) => Ok(()),
            Err(NetlinkError(err))
                if matches!(-err.raw_code(), ESRCH | ENOENT) =>
            {
                Ok(())
            }
            Err(err) => Err(err).context(format!("Failed to remove static route {route}")),
        }
    }

    fn route_message(&self, route: IpNetwork, gateway: Option<IpAddr>) -> RouteMessage {
        match route {
            IpNetwork::V4(net) => {
                let mut builder = RouteMessageBuilder::<Ipv4Addr>::new()
                    .output_interface(self.iface_index)
                    .protocol(RouteProtocol::Static)
                    .scope(RouteScope::Universe)
                    .destination_prefix(net.network_address(), net.netmask());

                if let Some(IpAddr::V4(gw)) = gateway {
                    builder = builder.gateway(gw);
                }

                builder.build()
            }
            IpNetwork::V6(net) => {
                let mut builder = RouteMessageBuilder::<Ipv6Addr>::new()
                    .output_interface(self.iface_index)
                    .protocol(RouteProtocol::Static)
                    .scope(RouteScope::Universe)
                    .destination_prefix(net.network_address(), net.netmask());

                if let Some(IpAddr::V6(gw)) = gateway {
                    builder = builder.gateway(gw);
                }

                builder.build()
            }
        }
    }

    #[allow(clippy::wildcard_enum_match_arm)]
    async fn default_gateway(&self, v4: bool) -> Result<Option<IpAddr>> {
        let message = if v4 {
            RouteMessageBuilder::<Ipv4Addr>::new().build()
        } else {
            RouteMessageBuilder::<Ipv6Addr>::new().build()
        };

        let mut routes = self.handle.route().get(message).execute();

        while let Some(route) = routes
            .try_next()
            .await
            .context("Failed to list routes")?
        {
            if route.header.destination_prefix_length != 0 {
                continue;
            }

            for attr in &route.attributes {
                let RouteAttribute::Gateway(addr) = attr else {
                    continue;
                };

                let ip = match addr {
                    netlink_packet_route::route::RouteAddress::Inet(ip) => IpAddr::V4(*ip),
                    netlink_packet_route::route::RouteAddress::Inet6(ip) => IpAddr::V6(*ip),
                    _ => continue,
                };

                return Ok(Some(ip));
            }
        }

        Ok(None)
    }
}
