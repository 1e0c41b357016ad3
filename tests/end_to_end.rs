//! Loopback handshakes through the channel builder and the managed client

mod common;

use common::{init_tracing, self_signed_svid, td, Authority};
use rustls::pki_types::CertificateDer;
use spiffe_tls::{
    build_client_config, build_server_config, extract_spiffe_id, handshake_rejection,
    server_name, BackoffConfig, BundleSource, ChannelConfig, Error, InMemorySource,
    ManagedClientConfig, ManagedCredentialClient, SpiffeId, TrustBundleStore,
    VerificationPolicy,
};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

type Peers = Option<Vec<CertificateDer<'static>>>;

struct Outcome {
    server: io::Result<Peers>,
    client: io::Result<Peers>,
}

/// Run one handshake plus a four byte echo over loopback
async fn exchange(server: &ChannelConfig, client: &ChannelConfig) -> Outcome {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = server.acceptor().unwrap();
    let connector = client.connector().unwrap();

    let server_side = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        let mut tls = acceptor.accept(stream).await?;
        let peers = tls.get_ref().1.peer_certificates().map(|c| c.to_vec());
        let mut buf = [0u8; 4];
        tls.read_exact(&mut buf).await?;
        tls.write_all(&buf).await?;
        tls.flush().await?;
        Ok::<_, io::Error>(peers)
    });

    let client_side = async {
        let stream = TcpStream::connect(addr).await?;
        let mut tls = connector
            .connect(server_name(&td("example.org")).unwrap(), stream)
            .await?;
        let peers = tls.get_ref().1.peer_certificates().map(|c| c.to_vec());
        tls.write_all(b"ping").await?;
        let mut buf = [0u8; 4];
        tls.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"ping");
        Ok::<_, io::Error>(peers)
    };

    let client = tokio::time::timeout(Duration::from_secs(10), client_side)
        .await
        .expect("client timed out");
    let server = tokio::time::timeout(Duration::from_secs(10), server_side)
        .await
        .expect("server timed out")
        .unwrap();

    Outcome { server, client }
}

fn member_of(name: &str) -> VerificationPolicy {
    VerificationPolicy::AcceptMemberOf(td(name))
}

fn peer_id(peers: &Peers) -> SpiffeId {
    extract_spiffe_id(&peers.as_ref().unwrap()[0]).unwrap()
}

#[tokio::test]
async fn test_mutual_tls_within_trust_domain() {
    init_tracing();
    let ca = Authority::new("example.org");
    let bundles: Arc<dyn BundleSource> = Arc::new(ca.bundle());

    let server_svid = ca.svid("spiffe://example.org/server", 1);
    let client_svid = ca.svid("spiffe://example.org/client", 2);

    let server =
        build_server_config(&server_svid, Some(bundles.clone()), member_of("example.org")).unwrap();
    let client =
        build_client_config(bundles, member_of("example.org"), Some(&client_svid)).unwrap();

    let outcome = exchange(&server, &client).await;
    let seen_by_server = outcome.server.unwrap();
    let seen_by_client = outcome.client.unwrap();

    assert_eq!(peer_id(&seen_by_server).to_string(), "spiffe://example.org/client");
    assert_eq!(peer_id(&seen_by_client).to_string(), "spiffe://example.org/server");
}

#[tokio::test]
async fn test_one_way_tls() {
    let ca = Authority::new("example.org");
    let server_svid = ca.svid("spiffe://example.org/server", 1);

    let server = build_server_config(&server_svid, None, member_of("example.org")).unwrap();
    let client =
        build_client_config(Arc::new(ca.bundle()), member_of("example.org"), None).unwrap();

    let outcome = exchange(&server, &client).await;
    assert!(outcome.server.unwrap().is_none());
    assert_eq!(
        peer_id(&outcome.client.unwrap()).to_string(),
        "spiffe://example.org/server"
    );
}

#[tokio::test]
async fn test_client_rejects_server_from_other_domain() {
    init_tracing();
    let ours = Authority::new("example.org");
    let theirs = Authority::new("other.org");

    let store = TrustBundleStore::new();
    store.set_bundle(ours.bundle()).unwrap();
    store.set_bundle(theirs.bundle()).unwrap();

    let server_svid = theirs.svid("spiffe://other.org/server", 1);
    let server = build_server_config(&server_svid, None, member_of("other.org")).unwrap();
    let client = build_client_config(Arc::new(store), member_of("example.org"), None).unwrap();

    let outcome = exchange(&server, &client).await;
    let err = outcome.client.unwrap_err();
    assert!(matches!(
        handshake_rejection(&err),
        Some(Error::PolicyRejected(_))
    ));
}

#[tokio::test]
async fn test_mtls_client_rejects_server_from_other_domain() {
    init_tracing();
    let ours = Authority::new("example.org");
    let theirs = Authority::new("other.org");

    let store = TrustBundleStore::new();
    store.set_bundle(ours.bundle()).unwrap();
    store.set_bundle(theirs.bundle()).unwrap();
    let bundles: Arc<dyn BundleSource> = Arc::new(store);

    let server_svid = theirs.svid("spiffe://other.org/server", 1);
    let client_svid = ours.svid("spiffe://example.org/client", 2);
    let server =
        build_server_config(&server_svid, Some(bundles.clone()), VerificationPolicy::AcceptAny)
            .unwrap();
    let client =
        build_client_config(bundles, member_of("example.org"), Some(&client_svid)).unwrap();

    let outcome = exchange(&server, &client).await;
    let err = outcome.client.unwrap_err();
    assert!(matches!(
        handshake_rejection(&err),
        Some(Error::PolicyRejected(_))
    ));
    assert!(outcome.server.is_err());
}

#[tokio::test]
async fn test_server_rejects_self_signed_client() {
    init_tracing();
    let ca = Authority::new("example.org");
    let bundles: Arc<dyn BundleSource> = Arc::new(ca.bundle());

    let server_svid = ca.svid("spiffe://example.org/server", 1);
    let rogue = self_signed_svid("spiffe://example.org/rogue");

    let server =
        build_server_config(&server_svid, Some(bundles.clone()), member_of("example.org")).unwrap();
    let client = build_client_config(bundles, member_of("example.org"), Some(&rogue)).unwrap();

    let outcome = exchange(&server, &client).await;
    let err = outcome.server.unwrap_err();
    assert!(matches!(
        handshake_rejection(&err),
        Some(Error::ChainVerificationFailed(_))
    ));
    assert!(outcome.client.is_err());
}

#[tokio::test]
async fn test_server_exact_policy() {
    let ca = Authority::new("example.org");
    let bundles: Arc<dyn BundleSource> = Arc::new(ca.bundle());
    let server_svid = ca.svid("spiffe://example.org/server", 1);
    let allowed = SpiffeId::parse("spiffe://example.org/billing").unwrap();

    let server = build_server_config(
        &server_svid,
        Some(bundles.clone()),
        VerificationPolicy::AcceptExact(allowed),
    )
    .unwrap();

    let billing = ca.svid("spiffe://example.org/billing", 2);
    let client =
        build_client_config(bundles.clone(), member_of("example.org"), Some(&billing)).unwrap();
    assert!(exchange(&server, &client).await.server.is_ok());

    let web = ca.svid("spiffe://example.org/web", 3);
    let client = build_client_config(bundles, member_of("example.org"), Some(&web)).unwrap();
    let err = exchange(&server, &client).await.server.unwrap_err();
    assert!(matches!(
        handshake_rejection(&err),
        Some(Error::PolicyRejected(_))
    ));
}

#[tokio::test]
async fn test_managed_server_follows_rotation() {
    init_tracing();
    let ca = Authority::new("example.org");
    let source = Arc::new(
        InMemorySource::with_credential(ca.svid("spiffe://example.org/server", 1), ca.bundle())
            .unwrap(),
    );

    let config = ManagedClientConfig::new(td("example.org"), member_of("example.org"))
        .with_backoff(BackoffConfig {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(100),
            multiplier: 2.0,
        })
        .with_rotation_margin(spiffe_tls::RotationMargin::Absolute(Duration::from_secs(60)));
    let managed = ManagedCredentialClient::new(source.clone(), config).unwrap();
    managed.start().await.unwrap();

    // both configs are built once and reused across the rotation; each connection runs a
    // full handshake, so the client sees the rotated certificate
    let server = managed.server_channel_config(None, true).unwrap();
    let client_svid = ca.svid("spiffe://example.org/client", 10);
    let client = build_client_config(
        Arc::new(ca.bundle()),
        member_of("example.org"),
        Some(&client_svid),
    )
    .unwrap();

    let before = exchange(&server, &client).await.client.unwrap().unwrap();
    assert_eq!(before[0], *managed.current().unwrap().svid().leaf_cert());

    source.set_credential(ca.svid("spiffe://example.org/server", 2));
    managed.rotate_now().await.unwrap();

    let after = exchange(&server, &client).await.client.unwrap().unwrap();
    assert_ne!(before[0], after[0]);
    assert_eq!(after[0], *managed.current().unwrap().svid().leaf_cert());

    managed.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_managed_client_side_mtls() {
    let ca = Authority::new("example.org");
    let source = Arc::new(
        InMemorySource::with_credential(ca.svid("spiffe://example.org/client", 1), ca.bundle())
            .unwrap(),
    );
    let managed = ManagedCredentialClient::new(
        source,
        ManagedClientConfig::new(td("example.org"), member_of("example.org")),
    )
    .unwrap();
    managed.start().await.unwrap();

    let server_svid = ca.svid("spiffe://example.org/server", 2);
    let server =
        build_server_config(&server_svid, Some(managed.bundle_source()), member_of("example.org"))
            .unwrap();
    let client = managed.client_channel_config(None, true).unwrap();

    let outcome = exchange(&server, &client).await;
    assert_eq!(
        peer_id(&outcome.server.unwrap()).to_string(),
        "spiffe://example.org/client"
    );

    managed.shutdown().await.unwrap();
}

async fn started(ca: &Authority, id: &str, serial: u128) -> ManagedCredentialClient {
    let source = InMemorySource::with_credential(ca.svid(id, serial), ca.bundle()).unwrap();
    let managed = ManagedCredentialClient::new(
        Arc::new(source),
        ManagedClientConfig::new(td("example.org"), member_of("example.org")),
    )
    .unwrap();
    managed.start().await.unwrap();
    managed
}

#[tokio::test]
async fn test_snapshot_configs_handshake() {
    init_tracing();
    let ca = Authority::new("example.org");
    let server_side = started(&ca, "spiffe://example.org/server", 1).await;
    let client_side = started(&ca, "spiffe://example.org/client", 2).await;
    let server_snapshot = server_side.current().unwrap();
    let client_snapshot = client_side.current().unwrap();

    let server = server_snapshot
        .server_config(member_of("example.org"), true)
        .unwrap();
    let client = client_snapshot
        .client_config(member_of("example.org"), true)
        .unwrap();
    assert!(server.is_mutual() && client.is_mutual());

    let outcome = exchange(&server, &client).await;
    assert_eq!(
        peer_id(&outcome.server.unwrap()).to_string(),
        "spiffe://example.org/client"
    );
    assert_eq!(
        peer_id(&outcome.client.unwrap()).to_string(),
        "spiffe://example.org/server"
    );

    let server = server_snapshot
        .server_config(member_of("example.org"), false)
        .unwrap();
    let client = client_snapshot
        .client_config(member_of("example.org"), false)
        .unwrap();

    let outcome = exchange(&server, &client).await;
    assert!(outcome.server.unwrap().is_none());
    assert_eq!(
        peer_id(&outcome.client.unwrap()).to_string(),
        "spiffe://example.org/server"
    );

    server_side.shutdown().await.unwrap();
    client_side.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_snapshot_client_rejected_by_exact_policy() {
    let ca = Authority::new("example.org");
    let server_side = started(&ca, "spiffe://example.org/server", 1).await;
    let client_side = started(&ca, "spiffe://example.org/web", 2).await;
    let billing = SpiffeId::parse("spiffe://example.org/billing").unwrap();

    let server = server_side
        .current()
        .unwrap()
        .server_config(VerificationPolicy::AcceptExact(billing), true)
        .unwrap();
    let client = client_side
        .current()
        .unwrap()
        .client_config(member_of("example.org"), true)
        .unwrap();

    let err = exchange(&server, &client).await.server.unwrap_err();
    assert!(matches!(
        handshake_rejection(&err),
        Some(Error::PolicyRejected(_))
    ));
}
