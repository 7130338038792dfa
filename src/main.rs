mod dialer;
mod error;
mod fingerprint;
mod identify;
mod models;
mod probe;
mod reporter;
mod scanner;
mod store;
mod subdomain;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{ArgAction, Parser, Subcommand};
use hickory_resolver::TokioAsyncResolver;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::dialer::{is_host_alive, TcpDialer};
use crate::fingerprint::RuleSet;
use crate::identify::ServiceIdentifier;
use crate::reporter::StdoutSink;
use crate::scanner::{Scanner, ScannerConfig};
use crate::store::{JsonFileStore, Store};

#[derive(Parser)]
#[command(
    name = "asmscan",
    version,
    about = "Attack-surface reconnaissance: full-range port sweeps, banner grabbing and subdomain discovery"
)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Findings file
    #[arg(long, global = true, default_value = "asmscan.json")]
    store: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sweep every TCP port of a host and identify what answers
    Scan {
        /// Target IP address or hostname
        host: String,

        /// Connects per second across the sweep; 0 means unlimited
        #[arg(long, default_value_t = 0)]
        rate: u32,

        /// Connect timeout in seconds
        #[arg(long, default_value_t = 2.0)]
        timeout_connect: f64,

        /// Worker count for the full-range pass; defaults scale with CPUs
        #[arg(long)]
        workers: Option<usize>,

        /// Scan even when the liveness check says the host is down
        #[arg(long)]
        skip_alive_check: bool,
    },

    /// Enumerate subdomains from certificate-transparency logs
    Domain {
        /// Apex domain to enumerate
        domain: String,

        /// Also sweep every address the subdomains resolve to
        #[arg(long)]
        scan: bool,

        /// crt.sh request timeout in seconds
        #[arg(long, default_value_t = 30.0)]
        timeout: f64,
    },
}

fn setup_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .format_module_path(true)
        .format_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let store = JsonFileStore::new(&cli.store);
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, winding down");
            interrupt.cancel();
        }
    });

    match cli.command {
        Command::Scan {
            host,
            rate,
            timeout_connect,
            workers,
            skip_alive_check,
        } => {
            let ip = resolve_host(&host).await?;
            if !skip_alive_check && !is_host_alive(&ip, Duration::from_secs(2)).await {
                bail!("{} does not appear to be up; use --skip-alive-check to scan anyway", ip);
            }

            let scanner = build_scanner(rate, timeout_connect, workers);
            let open = scanner.scan_with_cancel(&ip, cancel).await;
            store.save_scan(&ip, &open).await?;
            info!("results written to {}", cli.store.display());
        }

        Command::Domain { domain, scan, timeout } => {
            let mut subdomains =
                subdomain::collect_crtsh(&domain, Duration::from_secs_f64(timeout)).await?;
            subdomain::resolve_addresses(&mut subdomains).await?;

            println!("Subdomains of {}:", domain);
            for sub in &subdomains {
                let addresses = if sub.addresses.is_empty() {
                    "-".to_string()
                } else {
                    sub.addresses.join(", ")
                };
                println!("  {:<40} {}", sub.name, addresses);
            }
            store.save_domain(&domain, &subdomains, "crt.sh").await?;
            info!("results written to {}", cli.store.display());

            if scan {
                let mut addresses: Vec<String> = subdomains
                    .iter()
                    .flat_map(|s| s.addresses.iter().cloned())
                    .collect();
                addresses.sort();
                addresses.dedup();

                let scanner = build_scanner(0, 2.0, None);
                for ip in addresses {
                    if cancel.is_cancelled() {
                        break;
                    }
                    info!("sweeping {}", ip);
                    let open = scanner.scan_with_cancel(&ip, cancel.clone()).await;
                    store.save_scan(&ip, &open).await?;
                }
            }
        }
    }

    Ok(())
}

fn build_scanner(rate: u32, timeout_connect: f64, workers: Option<usize>) -> Scanner {
    let mut config = ScannerConfig {
        dial_timeout: Duration::from_secs_f64(timeout_connect),
        max_rate: rate,
        ..ScannerConfig::default()
    };
    if let Some(workers) = workers {
        config.phase2_workers = workers.max(1);
    }
    Scanner::new(
        Arc::new(TcpDialer),
        Arc::new(ServiceIdentifier::new(Arc::new(RuleSet::new()))),
        Arc::new(StdoutSink),
        config,
    )
}

/// Accept either an IP literal or a hostname; hostnames go through the
/// system resolver and the first A record wins.
async fn resolve_host(host: &str) -> anyhow::Result<String> {
    if host.parse::<IpAddr>().is_ok() {
        return Ok(host.to_string());
    }
    let resolver =
        TokioAsyncResolver::tokio_from_system_conf().context("loading system resolver config")?;
    let lookup = resolver
        .ipv4_lookup(host.to_string())
        .await
        .with_context(|| format!("resolving {}", host))?;
    match lookup.iter().next() {
        Some(a) => {
            info!("{} resolved to {}", host, a.0);
            Ok(a.0.to_string())
        }
        None => bail!("{} has no A records", host),
    }
}
