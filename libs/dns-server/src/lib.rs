//! Cluster-aware DNS resolution.
//!
//! The resolver splits queries between in-cluster lookup and the local
//! fallback: names that belong to the cluster (route domains, include
//! suffixes, the cluster domain itself) are resolved through the control
//! stream, everything else is declared [`Resolution::NotHandled`] and left to
//! the platform's fallback resolver.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod cache;
mod server;

pub use server::{DnsServer, Fallback};

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use dns_types::{DomainName, OwnedRecord, RecordType};
use parking_lot::{Mutex, RwLock};

use cache::{Cache, CachedAnswer};

/// The synthetic suffix used as an escape hatch from environments that bypass
/// the host's search path (notably containers).
pub const TEL2_SEARCH_DOMAIN: &str = "tel2-search.";

/// How the resolver answered (or declined) a query.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// We own this name; here are the records (possibly none for this qtype).
    Records(Vec<OwnedRecord>),
    /// We own this name and it does not exist.
    NxDomain,
    /// Not ours; the platform integration routes it to the fallback resolver.
    NotHandled,
}

/// Resolves names inside the cluster, via the control stream.
#[async_trait::async_trait]
pub trait ClusterResolver: Send + Sync + 'static {
    async fn lookup_host(&self, name: &str) -> Result<Vec<IpAddr>>;
}

#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// E.g. `cluster.local.`
    pub cluster_domain: String,
    /// The cluster's DNS service IP; queries towards it are intercepted.
    pub remote_ip: Option<IpAddr>,
    pub include_suffixes: Vec<String>,
    pub exclude_suffixes: Vec<String>,
    /// Namespace-derived domains that resolve in-cluster, e.g. `default.`
    pub route_domains: Vec<String>,
    pub search_paths: Vec<String>,
    pub lookup_timeout: Duration,
    /// TTL for cached answers; the control stream doesn't carry per-record TTLs.
    pub cache_ttl: Duration,
    /// Whether we iterate the search list ourselves.
    ///
    /// Only set for resolver surfaces where the OS stub doesn't apply search
    /// paths before queries reach us.
    pub expand_search_paths: bool,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            cluster_domain: "cluster.local.".to_owned(),
            remote_ip: None,
            include_suffixes: Vec::new(),
            exclude_suffixes: Vec::new(),
            route_domains: Vec::new(),
            search_paths: Vec::new(),
            lookup_timeout: Duration::from_secs(4),
            cache_ttl: Duration::from_secs(4),
            expand_search_paths: false,
        }
    }
}

pub struct Resolver {
    config: RwLock<DnsConfig>,
    cache: Mutex<Cache>,
    cluster: Arc<dyn ClusterResolver>,
}

impl Resolver {
    pub fn new(config: DnsConfig, cluster: Arc<dyn ClusterResolver>) -> Self {
        Self {
            config: RwLock::new(config),
            cache: Mutex::new(Cache::default()),
            cluster,
        }
    }

    pub fn config(&self) -> DnsConfig {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: DnsConfig) {
        *self.config.write() = config;
        self.cache.lock().clear();
    }

    /// Applies a search-path update from the user daemon.
    pub fn set_search_paths(&self, paths: Vec<String>, namespaces: Vec<String>) {
        let mut config = self.config.write();

        config.search_paths = paths.into_iter().map(|p| normalize(&p)).collect();
        config.route_domains = namespaces.into_iter().map(|ns| normalize(&ns)).collect();

        drop(config);

        self.cache.lock().clear();
    }

    pub async fn resolve(&self, name: &str, qtype: RecordType) -> Resolution {
        let name = normalize(name);

        // The synthetic suffix is stripped and the residue resolved as-is.
        let stripped = match name.strip_suffix(TEL2_SEARCH_DOMAIN) {
            Some(residue) if !residue.is_empty() => {
                Some(normalize(residue.trim_end_matches('.')))
            }
            Some(_) | None => None,
        };
        let name = stripped.unwrap_or(name);

        if name == "localhost." {
            return Resolution::Records(loopback_records(&name, qtype));
        }

        let config = self.config();

        if self.is_handled(&config, &name) {
            return self.resolve_in_cluster(&config, &name, qtype).await;
        }

        if config.expand_search_paths && is_unqualified(&name) {
            for suffix in &config.search_paths {
                let candidate = format!("{}{suffix}", name);

                if !self.is_handled(&config, &candidate) {
                    continue;
                }

                match self.resolve_in_cluster(&config, &candidate, qtype).await {
                    Resolution::Records(records) if !records.is_empty() => {
                        return Resolution::Records(records);
                    }
                    Resolution::Records(_) | Resolution::NxDomain | Resolution::NotHandled => {}
                }
            }
        }

        Resolution::NotHandled
    }

    fn is_handled(&self, config: &DnsConfig, name: &str) -> bool {
        if matches_suffix(name, &config.exclude_suffixes)
            && !matches_suffix(name, &config.include_suffixes)
        {
            // Excluded names never consult the cluster; the fallback resolver owns them.
            return false;
        }

        matches_suffix(name, &config.include_suffixes)
            || config
                .route_domains
                .iter()
                .any(|domain| name == domain || has_domain_suffix(name, domain))
            || has_domain_suffix(name, &config.cluster_domain)
    }

    async fn resolve_in_cluster(
        &self,
        config: &DnsConfig,
        name: &str,
        qtype: RecordType,
    ) -> Resolution {
        let now = Instant::now();

        if let Some(answer) = self.cache.lock().get(name, qtype, now) {
            return answer.to_resolution(name, config.cache_ttl);
        }

        let host = name.trim_end_matches('.');

        let answer = match tokio::time::timeout(
            config.lookup_timeout,
            self.cluster.lookup_host(host),
        )
        .await
        {
            Ok(Ok(ips)) if !ips.is_empty() => {
                CachedAnswer::Ips(filter_ips(ips, qtype))
            }
            Ok(Ok(_)) => CachedAnswer::NxDomain,
            Ok(Err(e)) => {
                tracing::debug!(%name, "Cluster lookup failed: {e:#}");

                CachedAnswer::NxDomain
            }
            Err(_) => {
                tracing::debug!(%name, timeout = ?config.lookup_timeout, "Cluster lookup timed out");

                CachedAnswer::NxDomain
            }
        };

        self.cache
            .lock()
            .insert(name, qtype, answer.clone(), now + config.cache_ttl);

        answer.to_resolution(name, config.cache_ttl)
    }
}

fn filter_ips(ips: Vec<IpAddr>, qtype: RecordType) -> Vec<IpAddr> {
    ips.into_iter()
        .filter(|ip| match qtype {
            RecordType::A => ip.is_ipv4(),
            RecordType::AAAA => ip.is_ipv6(),
            _ => false,
        })
        .collect()
}

fn loopback_records(name: &str, qtype: RecordType) -> Vec<OwnedRecord> {
    let ip = match qtype {
        RecordType::A => IpAddr::from(std::net::Ipv4Addr::LOCALHOST),
        RecordType::AAAA => IpAddr::from(std::net::Ipv6Addr::LOCALHOST),
        _ => return Vec::new(),
    };

    ip_records(name, std::iter::once(ip), Duration::from_secs(86400))
}

pub(crate) fn ip_records(
    name: &str,
    ips: impl IntoIterator<Item = IpAddr>,
    ttl: Duration,
) -> Vec<OwnedRecord> {
    let Ok(domain) = DomainName::vec_from_str(name.trim_end_matches('.')) else {
        return Vec::new();
    };

    ips.into_iter()
        .map(|ip| (domain.clone(), ttl.as_secs() as u32, dns_types::rdata::ip(ip)).into())
        .collect()
}

/// Lower-cases and ensures a trailing dot.
fn normalize(name: &str) -> String {
    let lower = name.to_ascii_lowercase();

    if lower.ends_with('.') {
        lower
    } else {
        format!("{lower}.")
    }
}

/// `true` for single-label names, which are subject to search-path expansion.
fn is_unqualified(name: &str) -> bool {
    name.trim_end_matches('.').split('.').count() == 1
}

fn matches_suffix(name: &str, suffixes: &[String]) -> bool {
    suffixes.iter().any(|suffix| {
        let suffix = normalize(suffix.trim_start_matches('.'));

        has_domain_suffix(name, &suffix)
    })
}

/// Label-aligned suffix match: `echo.svc.` has the domain suffix `svc.` but `websvc.` does not.
fn has_domain_suffix(name: &str, suffix: &str) -> bool {
    let suffix = normalize(suffix);

    if name == suffix {
        return true;
    }

    name.ends_with(&format!(".{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingCluster {
        calls: Mutex<Vec<String>>,
        answers: Mutex<std::collections::HashMap<String, Vec<IpAddr>>>,
        lookups: AtomicUsize,
    }

    impl RecordingCluster {
        fn answer(&self, name: &str, ips: Vec<IpAddr>) {
            self.answers.lock().insert(name.to_owned(), ips);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl ClusterResolver for RecordingCluster {
        async fn lookup_host(&self, name: &str) -> Result<Vec<IpAddr>> {
            self.calls.lock().push(name.to_owned());
            self.lookups.fetch_add(1, Ordering::SeqCst);

            Ok(self.answers.lock().get(name).cloned().unwrap_or_default())
        }
    }

    fn resolver(config: DnsConfig) -> (Resolver, Arc<RecordingCluster>) {
        let cluster = Arc::new(RecordingCluster::default());

        (Resolver::new(config, cluster.clone()), cluster)
    }

    fn split_horizon_config() -> DnsConfig {
        DnsConfig {
            include_suffixes: vec![".svc".to_owned()],
            exclude_suffixes: vec![".com".to_owned()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn included_name_consults_cluster() {
        let (resolver, cluster) = resolver(split_horizon_config());
        cluster.answer("foo.svc", vec!["10.96.0.1".parse().unwrap()]);

        let resolution = resolver.resolve("foo.svc", RecordType::A).await;

        assert_eq!(cluster.calls(), vec!["foo.svc".to_owned()]);

        let Resolution::Records(records) = resolution else {
            panic!("expected records, got {resolution:?}");
        };
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn excluded_name_is_not_handled_and_does_not_consult_cluster() {
        let (resolver, cluster) = resolver(split_horizon_config());

        let resolution = resolver.resolve("example.com", RecordType::A).await;

        assert_eq!(resolution, Resolution::NotHandled);
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn localhost_short_circuits() {
        let (resolver, cluster) = resolver(split_horizon_config());

        let Resolution::Records(records) = resolver.resolve("localhost.", RecordType::A).await
        else {
            panic!("expected records");
        };

        assert!(cluster.calls().is_empty());
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn cluster_domain_is_handled() {
        let (resolver, cluster) = resolver(DnsConfig::default());
        cluster.answer(
            "echo.default.svc.cluster.local",
            vec!["10.96.0.7".parse().unwrap()],
        );

        let resolution = resolver
            .resolve("echo.default.svc.cluster.local.", RecordType::A)
            .await;

        assert!(matches!(resolution, Resolution::Records(records) if records.len() == 1));
    }

    #[tokio::test]
    async fn tel2_search_suffix_is_stripped() {
        let (resolver, cluster) = resolver(split_horizon_config());
        cluster.answer("foo.svc", vec!["10.96.0.1".parse().unwrap()]);

        let resolution = resolver.resolve("foo.svc.tel2-search.", RecordType::A).await;

        assert_eq!(cluster.calls(), vec!["foo.svc".to_owned()]);
        assert!(matches!(resolution, Resolution::Records(_)));
    }

    #[tokio::test]
    async fn second_resolve_is_served_from_cache() {
        let (resolver, cluster) = resolver(split_horizon_config());
        cluster.answer("foo.svc", vec!["10.96.0.1".parse().unwrap()]);

        let _ = resolver.resolve("foo.svc", RecordType::A).await;
        let _ = resolver.resolve("foo.svc", RecordType::A).await;

        assert_eq!(cluster.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn negative_answer_is_cached() {
        let (resolver, cluster) = resolver(split_horizon_config());

        assert_eq!(
            resolver.resolve("missing.svc", RecordType::A).await,
            Resolution::NxDomain
        );
        assert_eq!(
            resolver.resolve("missing.svc", RecordType::A).await,
            Resolution::NxDomain
        );

        assert_eq!(cluster.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn search_paths_are_expanded_when_enabled() {
        let (resolver, cluster) = resolver(DnsConfig {
            expand_search_paths: true,
            search_paths: vec!["default.svc.cluster.local".to_owned()],
            ..Default::default()
        });
        cluster.answer(
            "echo.default.svc.cluster.local",
            vec!["10.96.0.7".parse().unwrap()],
        );

        let resolution = resolver.resolve("echo", RecordType::A).await;

        assert_eq!(
            cluster.calls(),
            vec!["echo.default.svc.cluster.local".to_owned()]
        );
        assert!(matches!(resolution, Resolution::Records(records) if records.len() == 1));
    }

    #[tokio::test]
    async fn search_paths_are_not_expanded_by_default() {
        let (resolver, cluster) = resolver(DnsConfig {
            search_paths: vec!["default.svc.cluster.local".to_owned()],
            ..Default::default()
        });

        let resolution = resolver.resolve("echo", RecordType::A).await;

        assert_eq!(resolution, Resolution::NotHandled);
        assert!(cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn aaaa_for_v4_only_host_yields_no_records() {
        let (resolver, cluster) = resolver(split_horizon_config());
        cluster.answer("foo.svc", vec!["10.96.0.1".parse().unwrap()]);

        let resolution = resolver.resolve("foo.svc", RecordType::AAAA).await;

        assert_eq!(resolution, Resolution::Records(Vec::new()));
    }

    #[test]
    fn domain_suffix_matching_is_label_aligned() {
        assert!(has_domain_suffix("echo.svc.", "svc"));
        assert!(!has_domain_suffix("websvc.", "svc"));
        assert!(has_domain_suffix("svc.", "svc"));
    }
}
