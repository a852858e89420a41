//! Trellis Proxy - session-scoped forwarding into remote clusters

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, info};

use trellis_api::{
    start_server, AppState, CredentialIssuer, Forwarder, LocalSigner, ServerConfig,
    StaticSessions,
};
use trellis_cell::SiteMap;
use trellis_common::telemetry::{init_telemetry, TelemetryConfig};

use crate::config::ProxyConfig;

/// Trellis - forwards console sessions into Kubernetes clusters
#[derive(Parser, Debug)]
#[command(name = "trellis-proxy", version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, env = "TRELLIS_CONFIG")]
    config: PathBuf,

    /// Listen address, overriding the configuration file
    #[arg(long, env = "TRELLIS_LISTEN")]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Every rustls config in the process uses aws-lc-rs
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    init_telemetry(TelemetryConfig::default())?;

    let cli = Cli::parse();
    let config = ProxyConfig::load(&cli.config)?;
    let addr = cli.listen.unwrap_or(config.listen);

    let sites = SiteMap::new();
    let mut signer = LocalSigner::new();
    for cluster in &config.clusters {
        let ca = cluster.authority()?;
        sites.register(Arc::new(cluster.site()));
        signer = signer.with_cluster(cluster.name.clone(), ca);
    }
    info!(clusters = ?sites.list_clusters(), "Clusters registered");

    let sessions = Arc::new(StaticSessions::new(config.sessions.clone()));
    info!(sessions = sessions.len(), "Sessions loaded");

    let issuer = CredentialIssuer::new(Arc::new(signer), sessions.clone())?;
    let forwarder = Arc::new(Forwarder::new(
        config.forwarder.clone(),
        Arc::new(sites),
        issuer,
    )?);

    tokio::spawn(purge_expired_pipelines(
        forwarder.clone(),
        config.purge_interval,
    ));

    let tls = config.tls.as_ref().map(|files| files.load()).transpose()?;
    let server = ServerConfig { addr, tls };
    let state = AppState {
        forwarder,
        sessions,
    };

    start_server(server, state).await?;
    Ok(())
}

/// Drop pipelines whose TTL has elapsed so their credentials are released
async fn purge_expired_pipelines(forwarder: Arc<Forwarder>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let purged = forwarder.cache().purge_expired().await;
        if purged > 0 {
            let remaining = forwarder.cache().len().await;
            debug!(purged, remaining, "Purged expired pipelines");
        }
    }
}
