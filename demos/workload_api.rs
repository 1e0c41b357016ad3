//! Keep an SVID fresh from a SPIRE agent and serve mTLS with it
//!
//! Run next to an agent: `cargo run --example workload_api -- --trust-domain example.org`

use anyhow::Result;
use clap::Parser;
use spiffe_tls::{
    ManagedClientConfig, ManagedCredentialClient, TrustDomain, VerificationPolicy,
    WorkloadApiClient, WorkloadApiConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Workload API socket; defaults to SPIFFE_ENDPOINT_SOCKET
    #[arg(long)]
    socket: Option<String>,

    /// Trust domain to accept peers from
    #[arg(long, default_value = "example.org")]
    trust_domain: String,

    /// Port for the mTLS listener
    #[arg(short, long, default_value = "8443")]
    port: u16,

    /// Print the snapshot this often
    #[arg(long, default_value = "30")]
    report_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("info,spiffe_tls=debug"))
        .init();

    let args = Args::parse();
    let trust_domain = TrustDomain::new(&args.trust_domain)?;

    let mut api_config = WorkloadApiConfig::from_env();
    if let Some(socket) = &args.socket {
        api_config = api_config.with_socket_path(socket.trim_start_matches("unix://"));
    }
    let workload_api = WorkloadApiClient::connect(api_config).await?;
    workload_api.health_check().await?;
    info!(socket = %workload_api.socket_path().display(), "Connected to Workload API");

    let config = ManagedClientConfig::new(
        trust_domain.clone(),
        VerificationPolicy::AcceptMemberOf(trust_domain),
    );
    let client = ManagedCredentialClient::new(Arc::new(workload_api), config)?;
    client.start().await?;

    let acceptor = client.server_channel_config(None, true)?.acceptor()?;
    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    info!("mTLS server listening on {}", listener.local_addr()?);

    let mut report = tokio::time::interval(Duration::from_secs(args.report_secs));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => {
                let snapshot = client.current()?;
                info!(
                    spiffe_id = %snapshot.svid().spiffe_id(),
                    serial = %snapshot.svid().serial_number(),
                    expiry = %snapshot.svid().expiry(),
                    stale = snapshot.is_stale(),
                    state = ?client.state(),
                    "Current credential"
                );
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = accepted?;
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(_) => info!(%peer_addr, "Handshake complete"),
                        Err(e) => warn!(%peer_addr, "Handshake failed: {}", e),
                    }
                });
            }
        }
    }

    client.shutdown().await?;
    Ok(())
}
