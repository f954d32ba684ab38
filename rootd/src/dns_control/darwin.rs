use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};

use super::DnsWiring;

const RESOLVER_DIR: &str = "/etc/resolver";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum DnsControlMethod {
    /// One file per domain under `/etc/resolver`; mDNSResponder picks them up.
    ///
    /// The OS applies search paths before queries reach us.
    ResolverFiles,
    /// Leave the system resolver alone.
    None,
}

impl DnsControlMethod {
    pub(crate) fn expands_search_paths(self) -> bool {
        false
    }
}

pub(crate) struct DnsController {
    method: DnsControlMethod,
    #[allow(dead_code)]
    iface: String,
    written_files: Vec<PathBuf>,
    configured: bool,
}

impl DnsController {
    pub(crate) fn new(method: DnsControlMethod, iface: String) -> Self {
        tracing::info!(?method, "DNS control");

        Self {
            method,
            iface,
            written_files: Vec::new(),
            configured: false,
        }
    }

    pub(crate) async fn set_dns(&mut self, wiring: &DnsWiring) -> Result<()> {
        match self.method {
            DnsControlMethod::ResolverFiles => self.write_resolver_files(wiring).await?,
            DnsControlMethod::None => {}
        }

        self.configured = true;

        Ok(())
    }

    pub(crate) async fn deactivate(&mut self) -> Result<()> {
        if !self.configured {
            return Ok(());
        }

        for file in std::mem::take(&mut self.written_files) {
            if let Err(e) = tokio::fs::remove_file(&file).await {
                tracing::warn!(file = %file.display(), "Failed to remove resolver file: {e}");
            }
        }

        flush_resolver_cache().await;

        self.configured = false;

        Ok(())
    }

    async fn write_resolver_files(&mut self, wiring: &DnsWiring) -> Result<()> {
        tokio::fs::create_dir_all(RESOLVER_DIR)
            .await
            .context("Failed to create /etc/resolver")?;

        // Stale files from an earlier wiring are replaced wholesale.
        for file in std::mem::take(&mut self.written_files) {
            let _ = tokio::fs::remove_file(&file).await;
        }

        let mut domains = vec![wiring.cluster_domain.clone()];
        domains.extend(wiring.search_list.iter().cloned());

        for domain in domains {
            let domain = domain.trim_end_matches('.').to_owned();
            if domain.is_empty() {
                continue;
            }

            let path = PathBuf::from(RESOLVER_DIR).join(format!("teleroute.{domain}"));

            let mut contents = format!(
                "domain {domain}\nnameserver {}\nport {}\n",
                wiring.local_server.ip(),
                wiring.local_server.port()
            );

            if !wiring.search_list.is_empty() {
                contents.push_str(&format!("search {}\n", wiring.search_list.join(" ")));
            }

            tokio::fs::write(&path, contents)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;

            self.written_files.push(path);
        }

        flush_resolver_cache().await;

        tracing::info!(files = self.written_files.len(), "Wrote resolver files");

        Ok(())
    }
}

impl Drop for DnsController {
    fn drop(&mut self) {
        if self.configured {
            // Async teardown is gone at this point; best effort, synchronously.
            for file in std::mem::take(&mut self.written_files) {
                let _ = std::fs::remove_file(&file);
            }
        }
    }
}

async fn flush_resolver_cache() {
    if let Err(e) = run("dscacheutil", &["-flushcache"]).await {
        tracing::debug!("Failed to flush resolver cache: {e:#}");
    }

    if let Err(e) = run("killall", &["-HUP", "mDNSResponder"]).await {
        tracing::debug!("Failed to poke mDNSResponder: {e:#}");
    }
}

async fn run(program: &str, args: &[&str]) -> Result<()> {
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

/// macOS keeps the real resolvers in scutil; parsing `/etc/resolv.conf` is
/// good enough for the fallback path.
pub(crate) fn system_resolvers() -> Result<Vec<std::net::IpAddr>> {
    let contents = std::fs::read_to_string("/etc/resolv.conf")
        .context("`resolv.conf` should be readable")?;

    Ok(contents
        .lines()
        .filter_map(|line| line.strip_prefix("nameserver "))
        .filter_map(|addr| addr.trim().parse().ok())
        .collect())
}
