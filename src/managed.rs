//! Managed credential client with background rotation
//!
//! Keeps an X.509 SVID and the trust bundles it is checked against fresh, and hands out
//! immutable snapshots to any number of concurrent readers.

use crate::config::ManagedClientConfig;
use crate::error::{Error, Result};
use crate::mtls::{
    build_client_config, build_client_config_with_resolver, build_server_config,
    build_server_config_with_resolver, ChannelConfig,
};
use crate::policy::VerificationPolicy;
use crate::source::CredentialSource;
use crate::spiffe_id::TrustDomain;
use crate::svid::X509Svid;
use crate::trust_bundle::{BundleSource, TrustBundle, TrustBundleStore};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use parking_lot::RwLock;
use rustls::client::ResolvesClientCert;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::SignatureScheme;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a [`ManagedCredentialClient`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    /// Not started; no snapshot yet
    Uninitialized,
    /// Snapshot installed and fresh
    Ready,
    /// A rotation attempt is in flight
    Rotating,
    /// The credential expired and could not be replaced; the snapshot is stale
    Degraded,
    /// Shut down; the last snapshot stays readable
    Closed,
}

struct SnapshotData {
    svid: Arc<X509Svid>,
    certified_key: Arc<CertifiedKey>,
    trust_domain: TrustDomain,
    bundles: TrustBundleStore,
    fetched_at: DateTime<Utc>,
}

/// A consistent view of the credential and bundles as of one rotation
///
/// The certificate chain and key always come from the same credential.
#[derive(Clone)]
pub struct Snapshot {
    data: Arc<SnapshotData>,
    stale: bool,
}

impl Snapshot {
    /// The credential
    pub fn svid(&self) -> &X509Svid {
        &self.data.svid
    }

    /// The credential as a rustls certified key
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        self.data.certified_key.clone()
    }

    /// Bundle of the configured trust domain
    pub fn bundle(&self) -> Option<TrustBundle> {
        self.data.bundles.get_bundle(&self.data.trust_domain)
    }

    /// Bundle of any fetched trust domain
    pub fn bundle_for(&self, trust_domain: &TrustDomain) -> Option<TrustBundle> {
        self.data.bundles.get_bundle(trust_domain)
    }

    /// Every trust domain with a bundle in this snapshot
    pub fn trust_domains(&self) -> Vec<TrustDomain> {
        self.data.bundles.domains()
    }

    /// When the snapshot was installed
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.data.fetched_at
    }

    /// Whether the credential is expired or the client is degraded
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Fail closed on a stale snapshot
    pub fn ensure_fresh(&self) -> Result<&Self> {
        if self.stale {
            return Err(Error::StaleCredential(*self.data.svid.expiry()));
        }
        Ok(self)
    }

    /// Client configuration fixed to this snapshot
    pub fn client_config(&self, policy: VerificationPolicy, mutual: bool) -> Result<ChannelConfig> {
        let svid = mutual.then(|| self.svid());
        build_client_config(Arc::new(self.data.bundles.clone()), policy, svid)
    }

    /// Server configuration fixed to this snapshot
    pub fn server_config(
        &self,
        policy: VerificationPolicy,
        require_client_cert: bool,
    ) -> Result<ChannelConfig> {
        let client_bundles = require_client_cert
            .then(|| Arc::new(self.data.bundles.clone()) as Arc<dyn BundleSource>);
        build_server_config(self.svid(), client_bundles, policy)
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("svid", &self.data.svid)
            .field("trust_domains", &self.data.bundles.domains())
            .field("fetched_at", &self.data.fetched_at)
            .field("stale", &self.stale)
            .finish()
    }
}

struct Status {
    state: ClientState,
    snapshot: Option<Arc<SnapshotData>>,
    last_failure: Option<String>,
}

struct Shared {
    /// Released on shutdown
    source: RwLock<Option<Arc<dyn CredentialSource>>>,
    config: ManagedClientConfig,
    status: Arc<RwLock<Status>>,
    /// Serializes rotation attempts
    rotation: Mutex<()>,
    shutdown: CancellationToken,
}

impl Shared {
    fn set_state(&self, state: ClientState) {
        let mut status = self.status.write();
        if status.state != state && status.state != ClientState::Closed {
            debug!(from = ?status.state, to = ?state, "State transition");
            status.state = state;
        }
    }

    fn snapshot(&self) -> Option<Arc<SnapshotData>> {
        self.status.read().snapshot.clone()
    }

    /// One rotation attempt; the current snapshot survives any failure
    async fn rotate(&self, force: bool) -> Result<()> {
        let _guard = self.rotation.lock().await;

        let previous = self.snapshot();
        if previous.is_some() {
            self.set_state(ClientState::Rotating);
        }

        match self.fetch_snapshot(previous.as_deref(), force).await {
            Ok(data) => {
                info!(
                    spiffe_id = %data.svid.spiffe_id(),
                    serial = %data.svid.serial_number(),
                    expiry = %data.svid.expiry(),
                    bundles = data.bundles.domains().len(),
                    "Installed credential snapshot"
                );
                let mut status = self.status.write();
                status.snapshot = Some(Arc::new(data));
                status.last_failure = None;
                if status.state != ClientState::Closed {
                    status.state = ClientState::Ready;
                }
                Ok(())
            }
            Err(e) => {
                let mut status = self.status.write();
                status.last_failure = Some(e.to_string());
                let next = match &previous {
                    None => ClientState::Uninitialized,
                    Some(prev) if prev.svid.is_expired() => {
                        error!(
                            spiffe_id = %prev.svid.spiffe_id(),
                            expiry = %prev.svid.expiry(),
                            "Credential expired and rotation failed: {}", e
                        );
                        ClientState::Degraded
                    }
                    Some(_) => {
                        warn!("Rotation failed, keeping current credential: {}", e);
                        ClientState::Ready
                    }
                };
                if status.state != ClientState::Closed {
                    status.state = next;
                }
                Err(e)
            }
        }
    }

    async fn fetch_snapshot(
        &self,
        previous: Option<&SnapshotData>,
        force: bool,
    ) -> Result<SnapshotData> {
        let source = self.source.read().clone().ok_or(Error::Closed)?;
        let config = &self.config;
        let timeout = config.fetch_timeout;

        let (svid, certified_key) = match previous {
            Some(prev) if !force && !prev.svid.needs_rotation(&config.rotation_margin) => {
                (prev.svid.clone(), prev.certified_key.clone())
            }
            _ => {
                let svid = bounded(
                    timeout,
                    "fetch_credential",
                    source.fetch_credential(config.identity_hint.as_ref()),
                )
                .await?;
                svid.validate()?;
                if let Some(hint) = &config.identity_hint {
                    if hint != svid.spiffe_id() {
                        return Err(Error::X509Error(format!(
                            "credential source returned {} but {} was requested",
                            svid.spiffe_id(),
                            hint
                        )));
                    }
                }
                let certified_key = svid.certified_key()?;
                (Arc::new(svid), certified_key)
            }
        };

        let fetches = config.bundle_domains().map(|td| {
            bounded(timeout, "fetch_trust_bundle", source.fetch_trust_bundle(td))
        });
        let fetched = try_join_all(fetches).await?;

        let bundles = TrustBundleStore::new();
        for (requested, bundle) in config.bundle_domains().zip(fetched) {
            if bundle.trust_domain() != requested {
                return Err(Error::MalformedBundle(format!(
                    "asked for the bundle of {} but got {}",
                    requested,
                    bundle.trust_domain()
                )));
            }
            bundles.set_bundle(bundle)?;
        }

        Ok(SnapshotData {
            svid,
            certified_key,
            trust_domain: config.trust_domain.clone(),
            bundles,
            fetched_at: Utc::now(),
        })
    }

    /// How long to sleep before the next scheduled attempt
    fn next_wait(&self) -> Duration {
        let floor = self.config.rotation_retry_backoff.initial;
        let until_rotation = self
            .snapshot()
            .map(|s| s.svid.time_until_rotation(&self.config.rotation_margin, Utc::now()))
            .unwrap_or(floor);
        until_rotation.min(self.config.refresh_interval).max(floor)
    }
}

async fn bounded<T>(
    timeout: Duration,
    what: &str,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, call).await.map_err(|_| {
        Error::collaborator_unavailable(format!("{} timed out after {:?}", what, timeout))
    })?
}

async fn rotation_loop(shared: Arc<Shared>) {
    let backoff = shared.config.rotation_retry_backoff.clone();
    let mut retry_delay: Option<Duration> = None;

    loop {
        let wait = retry_delay.unwrap_or_else(|| shared.next_wait());
        debug!(?wait, "Next rotation check scheduled");

        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        let outcome = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            outcome = shared.rotate(false) => outcome,
        };

        retry_delay = match outcome {
            Ok(()) => None,
            Err(_) => Some(backoff.next_delay(retry_delay)),
        };
    }

    debug!("Rotation loop stopped");
}

/// Reads the current snapshot on every handshake
///
/// Holds only the snapshot cell, so configurations built from it do not keep the credential
/// source alive.
#[derive(Clone)]
struct LiveView {
    status: Arc<RwLock<Status>>,
    trust_domain: TrustDomain,
}

impl LiveView {
    fn snapshot(&self) -> Option<Arc<SnapshotData>> {
        self.status.read().snapshot.clone()
    }

    fn certified_key(&self) -> Option<Arc<CertifiedKey>> {
        self.snapshot().map(|s| s.certified_key.clone())
    }
}

impl fmt::Debug for LiveView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveView")
            .field("trust_domain", &self.trust_domain)
            .finish()
    }
}

impl ResolvesClientCert for LiveView {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.certified_key()
    }

    fn has_certs(&self) -> bool {
        true
    }
}

impl ResolvesServerCert for LiveView {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.certified_key()
    }
}

impl BundleSource for LiveView {
    fn bundle_for(&self, trust_domain: &TrustDomain) -> Option<TrustBundle> {
        self.snapshot()
            .and_then(|s| s.bundles.get_bundle(trust_domain))
    }
}

/// Keeps a credential and its trust bundles fresh in the background
///
/// Each instance owns one rotation task; any number can coexist in a process.
///
/// # Examples
/// ```no_run
/// use spiffe_tls::{
///     ManagedClientConfig, ManagedCredentialClient, TrustDomain, VerificationPolicy,
///     WorkloadApiClient, WorkloadApiConfig,
/// };
/// use std::sync::Arc;
///
/// # async fn run() -> spiffe_tls::Result<()> {
/// let td = TrustDomain::new("example.org")?;
/// let source = WorkloadApiClient::connect(WorkloadApiConfig::from_env()).await?;
/// let config = ManagedClientConfig::new(td.clone(), VerificationPolicy::AcceptMemberOf(td));
///
/// let client = ManagedCredentialClient::new(Arc::new(source), config)?;
/// client.start().await?;
/// let connector = client.client_channel_config(None, true)?.connector()?;
/// # drop(connector);
/// client.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct ManagedCredentialClient {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ManagedCredentialClient {
    /// Create a client; the configuration is validated here
    pub fn new(source: Arc<dyn CredentialSource>, config: ManagedClientConfig) -> Result<Self> {
        config.validate()?;

        Ok(ManagedCredentialClient {
            shared: Arc::new(Shared {
                source: RwLock::new(Some(source)),
                config,
                status: Arc::new(RwLock::new(Status {
                    state: ClientState::Uninitialized,
                    snapshot: None,
                    last_failure: None,
                })),
                rotation: Mutex::new(()),
                shutdown: CancellationToken::new(),
            }),
            task: Mutex::new(None),
        })
    }

    /// Fetch the first snapshot and start the rotation task
    ///
    /// Calling it again once started does nothing. Fails with the fetch error if the first
    /// snapshot cannot be obtained, leaving the client `Uninitialized`.
    pub async fn start(&self) -> Result<()> {
        if self.state() == ClientState::Closed {
            return Err(Error::Closed);
        }

        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }

        info!(
            trust_domain = %self.shared.config.trust_domain,
            policy = %self.shared.config.default_policy,
            "Starting managed credential client"
        );

        tokio::select! {
            _ = self.shared.shutdown.cancelled() => return Err(Error::Closed),
            outcome = self.shared.rotate(true) => outcome?,
        }

        *task = Some(tokio::spawn(rotation_loop(self.shared.clone())));
        Ok(())
    }

    /// The most recent snapshot; never waits on the credential source
    pub fn current(&self) -> Result<Snapshot> {
        let status = self.shared.status.read();
        let data = status.snapshot.clone().ok_or(match status.state {
            ClientState::Closed => Error::Closed,
            _ => Error::NotReady,
        })?;
        let stale = status.state == ClientState::Degraded || data.svid.is_expired();
        Ok(Snapshot { data, stale })
    }

    /// Current lifecycle state
    pub fn state(&self) -> ClientState {
        self.shared.status.read().state
    }

    /// Error of the last rotation attempt, cleared by the next success
    pub fn last_failure(&self) -> Option<String> {
        self.shared.status.read().last_failure.clone()
    }

    /// The configuration in use
    pub fn config(&self) -> &ManagedClientConfig {
        &self.shared.config
    }

    /// Run one rotation attempt now, even if the credential is not due
    pub async fn rotate_now(&self) -> Result<()> {
        match self.state() {
            ClientState::Closed => return Err(Error::Closed),
            ClientState::Uninitialized => return Err(Error::NotReady),
            _ => {}
        }

        tokio::select! {
            _ = self.shared.shutdown.cancelled() => Err(Error::Closed),
            outcome = self.shared.rotate(true) => {
                outcome.map_err(|e| Error::RotationFailed(e.to_string()))
            }
        }
    }

    /// Bundles of the current snapshot, read at lookup time
    pub fn bundle_source(&self) -> Arc<dyn BundleSource> {
        Arc::new(self.live_view())
    }

    /// Client configuration that follows rotations
    ///
    /// `policy` defaults to the configured one. With `mutual` the current credential is
    /// presented as the client certificate.
    pub fn client_channel_config(
        &self,
        policy: Option<VerificationPolicy>,
        mutual: bool,
    ) -> Result<ChannelConfig> {
        self.current()?;
        let policy = policy.unwrap_or_else(|| self.shared.config.default_policy.clone());
        let view = self.live_view();
        let resolver = mutual.then(|| Arc::new(view.clone()) as Arc<dyn ResolvesClientCert>);
        build_client_config_with_resolver(Arc::new(view), policy, resolver)
    }

    /// Server configuration that follows rotations
    ///
    /// `policy` defaults to the configured one and applies only with `require_client_cert`.
    pub fn server_channel_config(
        &self,
        policy: Option<VerificationPolicy>,
        require_client_cert: bool,
    ) -> Result<ChannelConfig> {
        self.current()?;
        let policy = policy.unwrap_or_else(|| self.shared.config.default_policy.clone());
        let view = self.live_view();
        let client_bundles =
            require_client_cert.then(|| Arc::new(view.clone()) as Arc<dyn BundleSource>);
        build_server_config_with_resolver(Arc::new(view), client_bundles, policy)
    }

    /// Stop the rotation task and release the credential source
    ///
    /// Configurations handed out earlier keep serving the last snapshot. Idempotent. Returns
    /// [`Error::RotationFailed`] when the last rotation attempt failed and nothing has
    /// succeeded since.
    pub async fn shutdown(&self) -> Result<()> {
        self.shared.shutdown.cancel();

        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Rotation task ended abnormally: {}", e);
            }
            info!(
                trust_domain = %self.shared.config.trust_domain,
                "Managed credential client shut down"
            );
        }
        self.shared.source.write().take();

        let mut status = self.shared.status.write();
        status.state = ClientState::Closed;
        match &status.last_failure {
            Some(failure) => Err(Error::RotationFailed(failure.clone())),
            None => Ok(()),
        }
    }

    fn live_view(&self) -> LiveView {
        LiveView {
            status: self.shared.status.clone(),
            trust_domain: self.shared.config.trust_domain.clone(),
        }
    }
}

impl fmt::Debug for ManagedCredentialClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedCredentialClient")
            .field("trust_domain", &self.shared.config.trust_domain)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for ManagedCredentialClient {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}
