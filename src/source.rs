//! Credential sources the managed client fetches from

use crate::error::{Error, Result};
use crate::spiffe_id::{SpiffeId, TrustDomain};
use crate::svid::X509Svid;
use crate::trust_bundle::{TrustBundle, TrustBundleStore};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Issues credentials and trust bundles (the attestation collaborator)
///
/// Transport failures are reported as [`Error::CollaboratorUnavailable`], kept apart from
/// validation errors on the returned material.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Fetch the current credential, preferring `hint` when several are available
    async fn fetch_credential(&self, hint: Option<&SpiffeId>) -> Result<X509Svid>;

    /// Fetch the trust bundle for `trust_domain`
    async fn fetch_trust_bundle(&self, trust_domain: &TrustDomain) -> Result<TrustBundle>;
}

/// Credential source backed by values held in memory
///
/// Used to bootstrap from files and in tests. Values can be swapped at any time and the
/// source can be marked unavailable to simulate an outage.
#[derive(Debug)]
pub struct InMemorySource {
    credential: RwLock<Option<X509Svid>>,
    bundles: TrustBundleStore,
    available: AtomicBool,
}

impl Default for InMemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySource {
    /// Create an empty, available source
    pub fn new() -> Self {
        InMemorySource {
            credential: RwLock::new(None),
            bundles: TrustBundleStore::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Create a source holding one credential and one bundle
    pub fn with_credential(credential: X509Svid, bundle: TrustBundle) -> Result<Self> {
        let source = Self::new();
        source.set_credential(credential);
        source.set_bundle(bundle)?;
        Ok(source)
    }

    /// Replace the credential handed out
    pub fn set_credential(&self, credential: X509Svid) {
        debug!(
            spiffe_id = %credential.spiffe_id(),
            serial = %credential.serial_number(),
            "Credential replaced"
        );
        *self.credential.write() = Some(credential);
    }

    /// Add or replace the bundle for its trust domain
    pub fn set_bundle(&self, bundle: TrustBundle) -> Result<()> {
        self.bundles.set_bundle(bundle)
    }

    /// Mark the source reachable or unreachable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::collaborator_unavailable("in-memory source marked unavailable"))
        }
    }
}

#[async_trait]
impl CredentialSource for InMemorySource {
    async fn fetch_credential(&self, hint: Option<&SpiffeId>) -> Result<X509Svid> {
        self.ensure_available()?;

        let credential = self
            .credential
            .read()
            .clone()
            .ok_or_else(|| Error::collaborator_unavailable("no credential loaded"))?;

        match hint {
            Some(hint) if hint != credential.spiffe_id() => Err(Error::collaborator_unavailable(
                format!("no credential for {}", hint),
            )),
            _ => Ok(credential),
        }
    }

    async fn fetch_trust_bundle(&self, trust_domain: &TrustDomain) -> Result<TrustBundle> {
        self.ensure_available()?;

        // detached so later set_bundle calls do not leak into snapshots already handed out
        self.bundles
            .get_bundle(trust_domain)
            .map(|bundle| bundle.detached())
            .ok_or_else(|| {
                Error::collaborator_unavailable(format!(
                    "no bundle for trust domain {}",
                    trust_domain
                ))
            })
    }
}
