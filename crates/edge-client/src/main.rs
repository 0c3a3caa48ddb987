//! `edge-tunnel` command-line entry point.
//!
//! Loads the configuration, wires the Connector to a secure transport, and
//! runs one of the sub-commands:
//!
//! ```text
//! edge-tunnel bookmarks                         list bookmarked devices
//! edge-tunnel probe                             connect to every bookmark at once
//! edge-tunnel services --bookmark 0             list one device's services
//! edge-tunnel tunnel --bookmark 0 --service ssh:2222 --service http
//! ```
//!
//! Ctrl-C cancels whatever is in flight through a shared cancellation token;
//! open tunnels and connections are closed before the process exits.
//!
//! # Secure transport
//!
//! The `SimulatedTransport` used here answers for every bookmark from an
//! in-process device description and forwards tunnels to local demo
//! services.  In production it is replaced by the vendor transport binding
//! implementing `SecureTransport`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use edge_client::application::connect_device::Connector;
use edge_client::application::fleet_probe::{DeviceStatus, FleetProber, FleetView, ProbeOutcome};
use edge_client::application::service_catalog::ServiceCatalog;
use edge_client::infrastructure::iam::IamAuthorizer;
use edge_client::infrastructure::simulated::{SimulatedDevice, SimulatedTransport};
use edge_client::infrastructure::storage::config::{
    config_file_path, load_config_from, AppConfig, BookmarkEntry,
};
use edge_core::{Fingerprint, PairingInfo, ServiceDescriptor, User};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Secure TCP tunnels to paired edge devices.
#[derive(Debug, Parser)]
#[command(name = "edge-tunnel", version)]
struct Cli {
    /// Path to the TOML configuration file.
    ///
    /// Defaults to `config.toml` in the platform config directory.
    #[arg(long, global = true, env = "EDGE_TUNNEL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the bookmarked devices.
    Bookmarks,
    /// Connect to every bookmarked device concurrently and report each result.
    Probe,
    /// Connect to one device and list the services it exposes.
    Services {
        /// Index of the bookmark, as shown by `bookmarks`.
        #[arg(long, short)]
        bookmark: usize,
    },
    /// Connect to one device and forward local ports until Ctrl-C.
    Tunnel {
        #[arg(long, short)]
        bookmark: usize,
        /// `name` or `name:port`; repeat for several tunnels.
        #[arg(long = "service", short = 's', required = true)]
        services: Vec<String>,
    },
}

impl Cli {
    fn config_path(&self) -> anyhow::Result<PathBuf> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => config_file_path().context("locating the configuration file"),
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config_path()?;
    let config = load_config_from(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    // RUST_LOG wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.client.log_level)),
        )
        .init();

    info!(config = %config_path.display(), bookmarks = config.bookmarks.len(), "edge-tunnel starting");

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl-C; shutting down");
                signal_cancel.cancel();
            }
            Err(e) => error!("failed to listen for Ctrl-C: {e}"),
        }
    });

    match cli.command {
        Command::Bookmarks => list_bookmarks(&config),
        Command::Probe => probe(&config, &cancel).await?,
        Command::Services { bookmark } => services(&config, bookmark, &cancel).await?,
        Command::Tunnel { bookmark, services } => {
            tunnel(&config, bookmark, &services, &cancel).await?
        }
    }

    info!("edge-tunnel stopped");
    Ok(())
}

// ── Sub-commands ──────────────────────────────────────────────────────────────

fn list_bookmarks(config: &AppConfig) {
    if config.bookmarks.is_empty() {
        println!("no bookmarks configured");
        return;
    }
    for (index, entry) in config.bookmarks.iter().enumerate() {
        let device = entry.to_device_record();
        let direct = entry.direct_candidate.as_deref().unwrap_or("-");
        let pinned = if entry.fingerprint.is_some() { "pinned" } else { "unpinned" };
        println!(
            "{index:>3}  {:<24} {}  direct={direct}  {pinned}",
            device.display_name(),
            device.key()
        );
    }
}

async fn probe(config: &AppConfig, cancel: &CancellationToken) -> anyhow::Result<()> {
    let identity = config.client.identity()?;
    let prober = FleetProber::new(
        build_connector(config),
        identity,
        config.client.max_in_flight_probes,
    );
    let devices = config.devices();
    let mut view = FleetView::new();

    let mut round = prober.start_round(devices.clone(), cancel);
    view.begin_round(round.generation(), &devices).await;
    println!("probing {} device(s)", round.expected());
    while let Some(result) = round.next().await {
        match &result.outcome {
            ProbeOutcome::Online { summary, .. } => println!(
                "{:<28} online   {} (as {})",
                result.device.to_string(),
                summary.friendly_name,
                summary.user
            ),
            ProbeOutcome::Failed(e) => {
                println!("{:<28} failed   {e}", result.device.to_string())
            }
        }
        view.apply(result).await;
    }

    let failed = view
        .entries()
        .filter(|(_, entry)| matches!(entry.status, DeviceStatus::Failed { .. }))
        .count();
    println!(
        "{} online, {failed} failed, {} not reported",
        view.online(),
        view.pending()
    );
    view.shutdown().await;
    Ok(())
}

async fn services(
    config: &AppConfig,
    bookmark: usize,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let entry = select_bookmark(config, bookmark)?;
    let connector = build_connector(config);
    let handle = connector
        .connect(&entry.to_device_record(), &config.client.identity()?, cancel)
        .await
        .with_context(|| format!("connecting to bookmark {bookmark}"))?;

    let listed = ServiceCatalog::new().list(&handle).await;
    handle.close().await;
    let listed = listed.context("listing services")?;

    if listed.is_empty() {
        println!("device exposes no services");
    }
    for service in listed {
        println!("{service}");
    }
    Ok(())
}

async fn tunnel(
    config: &AppConfig,
    bookmark: usize,
    specs: &[String],
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let entry = select_bookmark(config, bookmark)?;
    let connector = build_connector(config);
    let handle = connector
        .connect(&entry.to_device_record(), &config.client.identity()?, cancel)
        .await
        .with_context(|| format!("connecting to bookmark {bookmark}"))?;

    for spec in specs {
        match handle.tunnels().open_spec(spec).await {
            Ok(session) => println!(
                "tunnel {} listening on 127.0.0.1:{}",
                session.service, session.bound_local_port
            ),
            Err(e) => {
                handle.close().await;
                return Err(e).with_context(|| format!("opening tunnel {spec:?}"));
            }
        }
    }

    println!("press Ctrl-C to close the tunnels");
    cancel.cancelled().await;

    let report = handle.close().await;
    for (port, e) in &report.failed {
        warn!(port, "tunnel did not close cleanly: {e}");
    }
    println!("closed {} tunnel(s)", report.closed.len() + report.failed.len());
    Ok(())
}

// ── Wiring ────────────────────────────────────────────────────────────────────

fn select_bookmark(config: &AppConfig, index: usize) -> anyhow::Result<&BookmarkEntry> {
    match config.bookmarks.get(index) {
        Some(entry) => Ok(entry),
        None => bail!(
            "no bookmark {index}; {} bookmark(s) configured",
            config.bookmarks.len()
        ),
    }
}

fn build_connector(config: &AppConfig) -> Arc<Connector> {
    // In production: replace SimulatedTransport with the vendor secure
    // transport binding.
    let transport = Arc::new(simulated_fleet(config));
    Arc::new(Connector::new(
        transport,
        Arc::new(IamAuthorizer::new()),
        config.client.connector_config(),
    ))
}

/// One simulated device per bookmark, paired with the configured client key
/// and exposing demo services on the local host.
fn simulated_fleet(config: &AppConfig) -> SimulatedTransport {
    let devices = config.bookmarks.iter().map(|entry| {
        let fingerprint = entry
            .fingerprint
            .clone()
            .unwrap_or_else(|| Fingerprint::from_bytes([0u8; 32]));
        SimulatedDevice::new(&entry.product_id, &entry.device_id, fingerprint)
            .requiring_token(&entry.server_connect_token)
            .with_user(&config.client.private_key, User::named("owner"))
            .with_pairing_info(PairingInfo {
                product_id: entry.product_id.clone(),
                device_id: entry.device_id.clone(),
                friendly_name: entry.friendly_name.clone(),
                app_name: Some("edge-tunnel-sim".to_string()),
                app_version: Some(env!("CARGO_PKG_VERSION").to_string()),
                nabto_version: "simulated".to_string(),
                pairing_modes: Vec::new(),
            })
            .with_service(ServiceDescriptor::new("ssh", "ssh", "127.0.0.1", 22))
            .with_service(ServiceDescriptor::new("http", "http", "127.0.0.1", 80))
    });
    SimulatedTransport::new(devices)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_repeated_services() {
        let cli = Cli::parse_from([
            "edge-tunnel", "tunnel", "--bookmark", "1", "-s", "ssh:2222", "-s", "http",
        ]);
        match cli.command {
            Command::Tunnel { bookmark, services } => {
                assert_eq!(bookmark, 1);
                assert_eq!(services, vec!["ssh:2222", "http"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_config_flag_is_global() {
        let cli = Cli::parse_from(["edge-tunnel", "probe", "--config", "/tmp/edge.toml"]);
        assert_eq!(cli.config_path().unwrap(), PathBuf::from("/tmp/edge.toml"));
    }

    #[test]
    fn test_tunnel_requires_a_service() {
        assert!(Cli::try_parse_from(["edge-tunnel", "tunnel", "--bookmark", "0"]).is_err());
    }

    #[test]
    fn test_select_bookmark_out_of_range_is_error() {
        let config = AppConfig::default();
        assert!(select_bookmark(&config, 0).is_err());
    }

    #[test]
    fn test_simulated_fleet_mirrors_bookmarks() {
        let mut config = AppConfig::default();
        config.bookmarks.push(BookmarkEntry {
            product_id: "pr-1".to_string(),
            device_id: "de-1".to_string(),
            friendly_name: String::new(),
            direct_candidate: None,
            fingerprint: None,
            server_connect_token: "sct".to_string(),
        });
        assert_eq!(simulated_fleet(&config).len(), 1);
    }
}
