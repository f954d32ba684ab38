//! Reconciles the TUN device's installed subnets against the desired state.
//!
//! Desired = unique(cluster pod subnets ∪ cluster service subnet ∪
//! also-proxy). Never-proxy subnets are materialized as host static routes,
//! but only while a current subnet overlaps them.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use ip_network::IpNetwork;

use crate::dispatch::contains;

pub struct Reconciler {
    netmgr: Arc<dyn tun::NetMgr>,

    also_proxy: Vec<IpNetwork>,
    never_proxy: Vec<IpNetwork>,

    /// What is installed on the device; the canonical reconciliation target.
    current: BTreeSet<IpNetwork>,
    static_routes: BTreeSet<IpNetwork>,
    /// Subnets whose installation failed; the session continues without them.
    unhealthy: BTreeSet<IpNetwork>,
}

impl Reconciler {
    pub fn new(
        netmgr: Arc<dyn tun::NetMgr>,
        also_proxy: Vec<IpNetwork>,
        never_proxy: Vec<IpNetwork>,
    ) -> Self {
        Self {
            netmgr,
            also_proxy,
            never_proxy,
            current: BTreeSet::new(),
            static_routes: BTreeSet::new(),
            unhealthy: BTreeSet::new(),
        }
    }

    pub fn subnets(&self) -> Vec<IpNetwork> {
        self.current.iter().copied().collect()
    }

    pub fn static_routes(&self) -> Vec<IpNetwork> {
        self.static_routes.iter().copied().collect()
    }

    pub fn unhealthy(&self) -> Vec<IpNetwork> {
        self.unhealthy.iter().copied().collect()
    }

    /// Brings the device to the subnet set implied by `cluster_subnets`.
    ///
    /// Applying the same input twice is a no-op that issues zero platform
    /// calls.
    pub async fn apply(&mut self, cluster_subnets: impl IntoIterator<Item = IpNetwork>) {
        let desired = cluster_subnets
            .into_iter()
            .chain(self.also_proxy.iter().copied())
            .collect::<BTreeSet<_>>();

        for removed in self.current.difference(&desired) {
            if let Err(e) = self.netmgr.remove_subnet(*removed).await {
                tracing::warn!(subnet = %removed, "Failed to remove subnet: {e:#}");
            }

            self.unhealthy.remove(removed);
        }

        for added in desired.difference(&self.current) {
            if let Err(e) = self.netmgr.add_subnet(*added).await {
                // The session continues; the subnet is just not captured.
                tracing::warn!(subnet = %added, "Failed to install subnet: {e:#}");
                self.unhealthy.insert(*added);
            }
        }

        self.current = desired;

        self.sync_static_routes().await;
    }

    /// Removes everything we installed; used during session teardown.
    pub async fn clear(&mut self) {
        self.apply(std::iter::empty()).await;
    }

    async fn sync_static_routes(&mut self) {
        // A never-proxy route exists iff a current subnet contains its network IP.
        let wanted = self
            .never_proxy
            .iter()
            .filter(|route| {
                self.current
                    .iter()
                    .any(|subnet| contains(*subnet, network_ip(route)))
            })
            .copied()
            .collect::<BTreeSet<_>>();

        for removed in self.static_routes.difference(&wanted) {
            if let Err(e) = self.netmgr.remove_static_route(*removed).await {
                tracing::warn!(route = %removed, "Failed to remove static route: {e:#}");
            }
        }

        for added in wanted.difference(&self.static_routes) {
            if let Err(e) = self.netmgr.add_static_route(*added).await {
                tracing::warn!(route = %added, "Failed to install static route: {e:#}");
            }
        }

        self.static_routes = wanted;
    }
}

fn network_ip(net: &IpNetwork) -> IpAddr {
    match net {
        IpNetwork::V4(net) => net.network_address().into(),
        IpNetwork::V6(net) => net.network_address().into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        AddSubnet(IpNetwork),
        RemoveSubnet(IpNetwork),
        AddRoute(IpNetwork),
        RemoveRoute(IpNetwork),
    }

    #[derive(Default)]
    struct RecordingNetMgr {
        calls: Mutex<Vec<Call>>,
    }

    impl RecordingNetMgr {
        fn take(&self) -> Vec<Call> {
            std::mem::take(&mut *self.calls.lock())
        }
    }

    #[async_trait::async_trait]
    impl tun::NetMgr for RecordingNetMgr {
        async fn add_subnet(&self, subnet: IpNetwork) -> anyhow::Result<()> {
            self.calls.lock().push(Call::AddSubnet(subnet));
            Ok(())
        }

        async fn remove_subnet(&self, subnet: IpNetwork) -> anyhow::Result<()> {
            self.calls.lock().push(Call::RemoveSubnet(subnet));
            Ok(())
        }

        async fn add_static_route(&self, route: IpNetwork) -> anyhow::Result<()> {
            self.calls.lock().push(Call::AddRoute(route));
            Ok(())
        }

        async fn remove_static_route(&self, route: IpNetwork) -> anyhow::Result<()> {
            self.calls.lock().push(Call::RemoveRoute(route));
            Ok(())
        }

        async fn set_dns(
            &self,
            _: &str,
            _: IpAddr,
            _: &[String],
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn adds_and_removes_subnets_incrementally() {
        let netmgr = Arc::new(RecordingNetMgr::default());
        let mut reconciler = Reconciler::new(netmgr.clone(), Vec::new(), Vec::new());

        reconciler.apply([net("10.0.0.0/16")]).await;
        assert_eq!(netmgr.take(), vec![Call::AddSubnet(net("10.0.0.0/16"))]);

        reconciler
            .apply([net("10.0.0.0/16"), net("10.1.0.0/16")])
            .await;
        assert_eq!(netmgr.take(), vec![Call::AddSubnet(net("10.1.0.0/16"))]);

        reconciler.apply([net("10.1.0.0/16")]).await;
        assert_eq!(netmgr.take(), vec![Call::RemoveSubnet(net("10.0.0.0/16"))]);
    }

    #[tokio::test]
    async fn applying_same_input_twice_is_a_noop() {
        let netmgr = Arc::new(RecordingNetMgr::default());
        let mut reconciler = Reconciler::new(netmgr.clone(), Vec::new(), Vec::new());

        reconciler.apply([net("10.0.0.0/16")]).await;
        netmgr.take();

        reconciler.apply([net("10.0.0.0/16")]).await;

        assert_eq!(netmgr.take(), Vec::new());
        assert_eq!(reconciler.subnets(), vec![net("10.0.0.0/16")]);
    }

    #[tokio::test]
    async fn also_proxy_subnets_are_part_of_the_desired_set() {
        let netmgr = Arc::new(RecordingNetMgr::default());
        let mut reconciler =
            Reconciler::new(netmgr.clone(), vec![net("192.168.7.0/24")], Vec::new());

        reconciler.apply([net("10.0.0.0/16")]).await;

        let calls = netmgr.take();
        assert!(calls.contains(&Call::AddSubnet(net("10.0.0.0/16"))));
        assert!(calls.contains(&Call::AddSubnet(net("192.168.7.0/24"))));
    }

    #[tokio::test]
    async fn never_proxy_route_follows_subnet_overlap() {
        let netmgr = Arc::new(RecordingNetMgr::default());
        let mut reconciler =
            Reconciler::new(netmgr.clone(), Vec::new(), vec![net("10.0.5.0/24")]);

        // Overlapping subnet appears: the static route goes in.
        reconciler.apply([net("10.0.0.0/16")]).await;
        assert!(netmgr.take().contains(&Call::AddRoute(net("10.0.5.0/24"))));

        // Overlap disappears: the static route goes away.
        reconciler.apply([net("172.16.0.0/12")]).await;
        let calls = netmgr.take();
        assert!(calls.contains(&Call::RemoveRoute(net("10.0.5.0/24"))));
        assert_eq!(reconciler.static_routes(), Vec::<IpNetwork>::new());
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let netmgr = Arc::new(RecordingNetMgr::default());
        let mut reconciler = Reconciler::new(netmgr.clone(), Vec::new(), Vec::new());

        reconciler
            .apply([net("10.0.0.0/16"), net("10.96.0.0/12")])
            .await;
        netmgr.take();

        reconciler.clear().await;

        let calls = netmgr.take();
        assert!(calls.contains(&Call::RemoveSubnet(net("10.0.0.0/16"))));
        assert!(calls.contains(&Call::RemoveSubnet(net("10.96.0.0/12"))));
        assert!(reconciler.subnets().is_empty());
    }
}
