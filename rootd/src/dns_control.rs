//! Platform resolver integration.
//!
//! Each platform has exactly one strategy (plus an opt-out):
//! - Linux: attach per-interface DNS and search domains to the TUN device via
//!   systemd-resolved, or, as a fallback, redirect port-53 traffic for the
//!   cluster DNS IP to our local server with nftables/iptables rules.
//! - macOS: scoped resolver files under `/etc/resolver`.

#[cfg(target_os = "linux")]
#[path = "dns_control/linux.rs"]
mod platform;

#[cfg(target_os = "macos")]
#[path = "dns_control/darwin.rs"]
mod platform;

pub(crate) use platform::{DnsControlMethod, DnsController, system_resolvers};

use std::net::IpAddr;

/// What the controller needs to know to (re)wire the resolver surface.
#[derive(Debug, Clone)]
pub(crate) struct DnsWiring {
    pub cluster_domain: String,
    /// The cluster's DNS IP; reachable through the TUN device.
    pub remote_ip: IpAddr,
    /// Our local DNS server; used by strategies that bypass the TUN capture.
    pub local_server: std::net::SocketAddr,
    pub search_list: Vec<String>,
}
