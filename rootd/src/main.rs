//! The root daemon.
//!
//! Runs with elevated privileges, owns the TUN device and answers the user
//! daemon over a local control socket.

mod dns_control;
mod ipc;
mod logging;
mod netmgr;
mod service;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use crate::dns_control::DnsControlMethod;
use crate::service::Service;

/// Configuration was unusable.
const EXIT_CONFIG: u8 = 64;
/// The TUN device could not be opened.
const EXIT_TUN: u8 = 66;
/// We weren't running with the privileges this daemon needs.
const EXIT_NOPERM: u8 = 77;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path of the local control socket the user daemon talks to.
    #[arg(long, env = "TELEROUTE_SOCKET", default_value = "/var/run/teleroute-rootd.sock")]
    socket_path: PathBuf,

    /// Name of the TUN device.
    #[arg(long, env = "TELEROUTE_TUN_NAME", default_value = "tun-teleroute")]
    tun_name: String,

    /// MTU of the TUN device.
    #[arg(long, env = "TELEROUTE_MTU", default_value_t = 1500)]
    mtu: u16,

    /// Address assigned to the TUN device.
    #[arg(long, env = "TELEROUTE_TUN_IPV4", default_value = "100.64.77.1")]
    tun_ipv4: std::net::Ipv4Addr,

    /// IPv6 address assigned to the TUN device.
    #[arg(long, env = "TELEROUTE_TUN_IPV6", default_value = "fd00:7e1e:7e1e::1")]
    tun_ipv6: std::net::Ipv6Addr,

    #[cfg(target_os = "linux")]
    #[arg(long, env = "TELEROUTE_DNS_CONTROL", value_enum, default_value = "systemd-resolved")]
    dns_control: DnsControlMethod,

    #[cfg(target_os = "macos")]
    #[arg(long, env = "TELEROUTE_DNS_CONTROL", value_enum, default_value = "resolver-files")]
    dns_control: DnsControlMethod,

    /// How long to wait for the traffic manager when connecting.
    #[arg(long, env = "TELEROUTE_CONNECT_TIMEOUT", default_value = "10s")]
    connect_timeout: humantime::Duration,

    /// Refuse UDP DNS flows that look like a local cluster's recursive
    /// resolution looping back through this host.
    #[arg(long, env = "TELEROUTE_REFUSE_RECURSIVE_DNS", default_value_t = false)]
    refuse_recursive_dns: bool,

    /// Log filter, e.g. `info` or `teleroute_router=debug,info`.
    #[arg(long, env = "TELEROUTE_LOG", default_value = "info")]
    log_filter: String,

    /// Validate the configuration and exit without touching the system.
    #[arg(long, hide = true)]
    check: bool,
}

#[expect(
    clippy::print_stderr,
    reason = "No logger is active when we are printing this error."
)]
fn main() -> ExitCode {
    match try_main() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Print chain of errors manually to avoid it looking like a crash with stacktrace.
            eprintln!("{:#}", e.error);

            ExitCode::from(e.code)
        }
    }
}

/// A startup failure with a distinguishable exit code, so the user daemon can
/// relay the cause.
struct Fatal {
    code: u8,
    error: anyhow::Error,
}

trait FatalExt<T> {
    fn or_exit(self, code: u8) -> Result<T, Fatal>;
}

impl<T> FatalExt<T> for Result<T> {
    fn or_exit(self, code: u8) -> Result<T, Fatal> {
        self.map_err(|error| Fatal { code, error })
    }
}

fn try_main() -> Result<(), Fatal> {
    let cli = Cli::parse();

    if cli.check {
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")
        .or_exit(EXIT_CONFIG)?;

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<(), Fatal> {
    let log_handle = logging::init(&cli.log_filter).or_exit(EXIT_CONFIG)?;

    ensure_privileges().or_exit(EXIT_NOPERM)?;

    let tun = open_device(&cli.tun_name).or_exit(EXIT_TUN)?;

    tracing::info!(name = %tun.name(), index = tun.index(), "TUN device ready");

    let quit = CancellationToken::new();

    let service = Service::new(
        service::Config {
            mtu: cli.mtu,
            dns_control: cli.dns_control,
            connect_timeout: cli.connect_timeout.into(),
            refuse_recursive_dns: cli.refuse_recursive_dns,
            tun_ipv4: cli.tun_ipv4,
            tun_ipv6: cli.tun_ipv6,
        },
        tun,
        log_handle,
        quit.clone(),
    );

    notify_ready();

    let serve = ipc::serve(&cli.socket_path, service.clone(), quit.clone());
    tokio::pin!(serve);

    let outcome = tokio::select! {
        served = &mut serve => served,
        () = quit.cancelled() => Ok(()),
        signal = shutdown_signal() => {
            tracing::info!(%signal, "Shutting down");
            Ok(())
        }
    };

    // Orderly teardown: drop the session, revert DNS, remove the socket.
    let _ = service.disconnect().await;
    quit.cancel();

    outcome.or_exit(EXIT_CONFIG)?;

    Ok(())
}

#[cfg(target_os = "linux")]
fn ensure_privileges() -> Result<()> {
    // Safety: geteuid is always safe to call.
    let euid = unsafe { libc::geteuid() };

    anyhow::ensure!(
        euid == 0,
        "This daemon configures network devices and must run as root"
    );

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn ensure_privileges() -> Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn open_device(name: &str) -> Result<Arc<dyn tun::Tun>> {
    let device = tun::TunDevice::open(name)
        .with_context(|| format!("Failed to open TUN device `{name}`"))?;

    Ok(Arc::new(device))
}

#[cfg(not(target_os = "linux"))]
fn open_device(_: &str) -> Result<Arc<dyn tun::Tun>> {
    anyhow::bail!("The TUN device layer is not supported on this platform build")
}

#[cfg(target_os = "linux")]
fn notify_ready() {
    if let Err(e) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        tracing::debug!("Failed to notify systemd: {e}");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_ready() {}

async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;

        "ctrl-c"
    }
}
