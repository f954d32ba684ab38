//! The userspace L3 router at the heart of the daemon.
//!
//! [`Session`] owns a TUN device, a connection pool and one tunnel to the
//! in-cluster endpoint. The packet dispatcher reads IP datagrams off the TUN
//! device, reassembles IPv4 fragments, classifies flows by their 5-tuple and
//! hands them to per-flow TCP/UDP handlers, which exchange payload with the
//! remote endpoint through the multiplexed tunnel stream.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::print_stdout))]
#![cfg_attr(test, allow(clippy::print_stderr))]

mod dispatch;
mod fragment;
mod mux;
mod pool;
mod reconcile;
mod session;
mod tcp;
#[cfg(test)]
mod tests;
mod udp;

pub use mux::{Tunnel, TunnelClosed};
pub use pool::{ConnPool, Handler};
pub use reconcile::Reconciler;
pub use session::{NetworkConfig, Session, SessionConfig};

use std::time::Duration;

/// Tunables of the router; the defaults match production behaviour.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub mtu: u16,
    /// How long a one-shot DNS interceptor handler lives.
    pub dns_interceptor_ttl: Duration,
    pub udp_idle_timeout: Duration,
    pub tcp_time_wait: Duration,
    /// How long handlers get to flush on session shutdown before being hard-closed.
    pub shutdown_grace: Duration,
    /// Refuse UDP port-53 flows whose source is port 53 inside a pod subnet.
    ///
    /// Guards against local clusters looping their recursive DNS resolution
    /// back through the host.
    pub refuse_recursive_dns: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            mtu: 1500,
            dns_interceptor_ttl: Duration::from_secs(5),
            udp_idle_timeout: Duration::from_secs(60),
            tcp_time_wait: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(1),
            refuse_recursive_dns: false,
        }
    }
}
