//! Mutual TLS between two workloads of one trust domain, over loopback
//!
//! Generates a throwaway CA and two SVIDs, then runs an echo exchange where each side
//! verifies the other's SPIFFE ID.

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, SanType,
};
use spiffe_tls::{
    build_client_config, build_server_config, extract_spiffe_id, server_name, TrustBundle,
    TrustDomain, VerificationPolicy, X509Svid,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
        .init();

    let trust_domain = TrustDomain::new("example.org")?;
    let ca = generate_ca()?;

    let bundle = TrustBundle::load_from_pem(trust_domain.clone(), ca.serialize_pem()?.as_bytes())?;
    let server_svid = issue_svid(&ca, "spiffe://example.org/service/api")?;
    let client_svid = issue_svid(&ca, "spiffe://example.org/service/frontend")?;
    info!(
        server = %server_svid.spiffe_id(),
        client = %client_svid.spiffe_id(),
        expiry = %server_svid.expiry(),
        "Issued SVIDs"
    );

    let policy = VerificationPolicy::AcceptMemberOf(trust_domain.clone());
    let server = build_server_config(&server_svid, Some(Arc::new(bundle.clone())), policy.clone())?;
    let client = build_client_config(Arc::new(bundle), policy, Some(&client_svid))?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let acceptor = server.acceptor()?;
    info!("mTLS server listening on {}", addr);

    let server_task = tokio::spawn(async move {
        let (stream, peer_addr) = listener.accept().await?;
        let tls = acceptor.accept(stream).await.context("server handshake failed")?;

        let peer = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .context("client presented no certificate")?;
        info!(%peer_addr, spiffe_id = %extract_spiffe_id(peer)?, "Accepted client");

        let (reader, mut writer) = tokio::io::split(tls);
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            writer.write_all(format!("echo: {}\n", line).as_bytes()).await?;
            writer.flush().await?;
        }
        anyhow::Ok(())
    });

    let stream = TcpStream::connect(addr).await?;
    let tls = client
        .connector()?
        .connect(server_name(&trust_domain)?, stream)
        .await
        .context("client handshake failed")?;

    let peer = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .context("server presented no certificate")?;
    info!(spiffe_id = %extract_spiffe_id(peer)?, "Connected to server");

    let (reader, mut writer) = tokio::io::split(tls);
    writer.write_all(b"hello from frontend\n").await?;
    writer.flush().await?;
    let mut lines = BufReader::new(reader).lines();
    if let Some(reply) = lines.next_line().await? {
        info!("Received: {}", reply);
    }
    writer.shutdown().await?;

    server_task.await??;
    Ok(())
}

fn generate_ca() -> Result<Certificate> {
    let mut params = CertificateParams::new(Vec::<String>::new());
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, "example.org demo CA");
    Ok(Certificate::from_params(params)?)
}

fn issue_svid(ca: &Certificate, id: &str) -> Result<X509Svid> {
    let mut params = CertificateParams::new(Vec::<String>::new());
    params.subject_alt_names = vec![SanType::URI(id.to_string())];
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, "workload");
    params.not_before = rcgen::date_time_ymd(2024, 1, 1);
    params.not_after = rcgen::date_time_ymd(Utc::now().year() + 1, 1, 1);

    let cert = Certificate::from_params(params)?;
    let chain_pem = cert.serialize_pem_with_signer(ca)?;
    let key_pem = cert.serialize_private_key_pem();

    Ok(X509Svid::from_pem(chain_pem.as_bytes(), key_pem.as_bytes())?)
}
