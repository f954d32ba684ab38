use anyhow::{Context as _, Result, bail};

use super::DnsWiring;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum DnsControlMethod {
    /// Attach per-interface DNS and search domains via `systemd-resolved`.
    ///
    /// Suitable for most current distributions. The OS stub resolver applies
    /// search paths before queries reach us.
    SystemdResolved,
    /// Redirect resolver traffic for the cluster DNS IP to our local port
    /// with iptables rules.
    ///
    /// For systems without systemd-resolved. Search paths are expanded by our
    /// own server in this mode.
    Iptables,
    /// Leave the system resolver alone.
    None,
}

impl DnsControlMethod {
    /// Whether our DNS server has to iterate search paths itself.
    pub(crate) fn expands_search_paths(self) -> bool {
        matches!(self, DnsControlMethod::Iptables)
    }
}

pub(crate) struct DnsController {
    method: DnsControlMethod,
    iface: String,
    /// iptables rule arguments we installed, for teardown.
    installed_rules: Vec<Vec<String>>,
    configured: bool,
}

impl DnsController {
    pub(crate) fn new(method: DnsControlMethod, iface: String) -> Self {
        tracing::info!(?method, "DNS control");

        Self {
            method,
            iface,
            installed_rules: Vec::new(),
            configured: false,
        }
    }

    pub(crate) async fn set_dns(&mut self, wiring: &DnsWiring) -> Result<()> {
        match self.method {
            DnsControlMethod::SystemdResolved => self.configure_systemd_resolved(wiring).await?,
            DnsControlMethod::Iptables => self.configure_iptables(wiring).await?,
            DnsControlMethod::None => {}
        }

        self.configured = true;

        Ok(())
    }

    pub(crate) async fn deactivate(&mut self) -> Result<()> {
        if !self.configured {
            return Ok(());
        }

        match self.method {
            DnsControlMethod::SystemdResolved => {
                run("resolvectl", &["revert".to_owned(), self.iface.clone()]).await?;
            }
            DnsControlMethod::Iptables => {
                for rule in std::mem::take(&mut self.installed_rules) {
                    let mut args = vec!["-t".to_owned(), "nat".to_owned(), "-D".to_owned()];
                    args.extend(rule);

                    if let Err(e) = run("iptables", &args).await {
                        tracing::warn!("Failed to remove iptables rule: {e:#}");
                    }
                }
            }
            DnsControlMethod::None => {}
        }

        self.configured = false;

        Ok(())
    }

    async fn configure_systemd_resolved(&self, wiring: &DnsWiring) -> Result<()> {
        run(
            "resolvectl",
            &[
                "dns".to_owned(),
                self.iface.clone(),
                wiring.remote_ip.to_string(),
            ],
        )
        .await
        .context("`resolvectl dns` failed")?;

        let mut domain_args = vec!["domain".to_owned(), self.iface.clone()];
        domain_args.push(format!("~{}", wiring.cluster_domain.trim_end_matches('.')));
        domain_args.extend(
            wiring
                .search_list
                .iter()
                .map(|domain| format!("~{}", domain.trim_end_matches('.'))),
        );

        run("resolvectl", &domain_args)
            .await
            .context("`resolvectl domain` failed")?;

        tracing::info!(
            remote_ip = %wiring.remote_ip,
            domains = ?wiring.search_list,
            "Configured DNS via systemd-resolved"
        );

        Ok(())
    }

    async fn configure_iptables(&mut self, wiring: &DnsWiring) -> Result<()> {
        // Re-wiring replaces any earlier rules.
        self.remove_rules().await;

        for proto in ["udp", "tcp"] {
            let rule = vec![
                "OUTPUT".to_owned(),
                "-p".to_owned(),
                proto.to_owned(),
                "-d".to_owned(),
                wiring.remote_ip.to_string(),
                "--dport".to_owned(),
                "53".to_owned(),
                "-j".to_owned(),
                "DNAT".to_owned(),
                "--to-destination".to_owned(),
                wiring.local_server.to_string(),
            ];

            let mut args = vec!["-t".to_owned(), "nat".to_owned(), "-A".to_owned()];
            args.extend(rule.clone());

            run("iptables", &args)
                .await
                .context("Failed to install iptables redirect")?;

            self.installed_rules.push(rule);
        }

        tracing::info!(
            remote_ip = %wiring.remote_ip,
            local = %wiring.local_server,
            "Redirecting cluster DNS traffic to the local server"
        );

        Ok(())
    }

    async fn remove_rules(&mut self) {
        for rule in std::mem::take(&mut self.installed_rules) {
            let mut args = vec!["-t".to_owned(), "nat".to_owned(), "-D".to_owned()];
            args.extend(rule);

            if let Err(e) = run("iptables", &args).await {
                tracing::debug!("Failed to remove iptables rule: {e:#}");
            }
        }
    }
}

impl Drop for DnsController {
    fn drop(&mut self) {
        if self.configured {
            tracing::warn!("DNS control dropped without deactivation; resolver may be stale");
        }
    }
}

async fn run(program: &str, args: &[String]) -> Result<()> {
    let status = tokio::process::Command::new(program)
        .args(args)
        .status()
        .await
        .with_context(|| format!("`{program}` didn't run"))?;

    if !status.success() {
        bail!("`{program}` returned non-zero");
    }

    Ok(())
}

/// Returns the host's resolvers from `/etc/resolv.conf`, for the fallback path.
pub(crate) fn system_resolvers() -> Result<Vec<std::net::IpAddr>> {
    let contents = std::fs::read_to_string("/etc/resolv.conf")
        .context("`resolv.conf` should be readable")?;
    let parsed =
        resolv_conf_nameservers(&contents).context("`resolv.conf` should be parsable")?;

    Ok(parsed)
}

fn resolv_conf_nameservers(contents: &str) -> Result<Vec<std::net::IpAddr>> {
    let config = resolv_conf::Config::parse(contents)?;

    Ok(config
        .nameservers
        .into_iter()
        .map(|addr| addr.into())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resolv_conf_nameservers() {
        let nameservers = resolv_conf_nameservers(
            "# generated\nnameserver 192.168.1.1\nnameserver 8.8.8.8\nsearch lan\n",
        )
        .unwrap();

        assert_eq!(
            nameservers,
            vec![
                "192.168.1.1".parse::<std::net::IpAddr>().unwrap(),
                "8.8.8.8".parse().unwrap()
            ]
        );
    }
}
