//! Trust bundle management for SPIFFE

use crate::error::{Error, Result};
use crate::spiffe_id::TrustDomain;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use x509_parser::prelude::{parse_x509_certificate, FromDer, X509Certificate};

/// Read access to trust bundles keyed by trust domain
///
/// Peer verifiers consult this on every handshake, so implementations must hand out a
/// consistent view of each bundle.
pub trait BundleSource: fmt::Debug + Send + Sync {
    /// Get the bundle for a trust domain, if one is known
    fn bundle_for(&self, trust_domain: &TrustDomain) -> Option<TrustBundle>;
}

#[derive(Clone)]
struct BundleState {
    authorities: Arc<[CertificateDer<'static>]>,
    sequence_number: u64,
    updated_at: DateTime<Utc>,
}

/// Trust bundle containing the root certificates for a trust domain
///
/// Clones share the same underlying set, so an authority added through one handle is seen
/// by every other. Readers always get a point-in-time view from [`TrustBundle::authorities`].
#[derive(Clone)]
pub struct TrustBundle {
    /// Trust domain this bundle belongs to
    trust_domain: TrustDomain,
    /// Copy-on-write authority set
    state: Arc<RwLock<BundleState>>,
}

impl TrustBundle {
    /// Create an empty trust bundle
    pub fn new(trust_domain: TrustDomain) -> Self {
        TrustBundle {
            trust_domain,
            state: Arc::new(RwLock::new(BundleState {
                authorities: Arc::from(Vec::new()),
                sequence_number: 0,
                updated_at: Utc::now(),
            })),
        }
    }

    /// Create a trust bundle from DER authorities, each of which must parse as X.509
    pub fn from_authorities(
        trust_domain: TrustDomain,
        authorities: impl IntoIterator<Item = CertificateDer<'static>>,
    ) -> Result<Self> {
        let bundle = Self::new(trust_domain);
        for cert in authorities {
            bundle.add_authority(cert)?;
        }
        Ok(bundle)
    }

    /// Load a trust bundle from concatenated PEM blocks
    ///
    /// Non-certificate blocks and certificates that fail to parse are skipped. Fails only
    /// when no valid certificate remains.
    pub fn load_from_pem(trust_domain: TrustDomain, pem_data: &[u8]) -> Result<Self> {
        // invalid bytes only spoil the block they sit in, which then fails to parse
        let text = String::from_utf8_lossy(pem_data);

        let mut authorities = Vec::new();
        for (index, block) in pem_blocks(&text).enumerate() {
            let parsed = match pem::parse(block) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(%trust_domain, block = index, "Skipping malformed PEM block: {}", e);
                    continue;
                }
            };

            if parsed.tag() != "CERTIFICATE" {
                debug!(
                    %trust_domain,
                    block = index,
                    tag = parsed.tag(),
                    "Skipping non-certificate PEM block"
                );
                continue;
            }

            if let Err(e) = X509Certificate::from_der(parsed.contents()) {
                warn!(%trust_domain, block = index, "Skipping unparsable certificate: {}", e);
                continue;
            }

            authorities.push(CertificateDer::from(parsed.contents().to_vec()));
        }

        if authorities.is_empty() {
            return Err(Error::MalformedBundle(format!(
                "no valid certificates found for trust domain {}",
                trust_domain
            )));
        }

        let bundle = Self::new(trust_domain);
        {
            let mut state = bundle.state.write();
            state.authorities = dedup(authorities).into();
            state.sequence_number = 1;
        }

        info!(
            trust_domain = %bundle.trust_domain,
            authorities = bundle.len(),
            "Loaded trust bundle from PEM"
        );
        Ok(bundle)
    }

    /// Load a trust bundle from concatenated DER certificates (the Workload API encoding)
    pub fn from_der_concatenated(trust_domain: TrustDomain, der_data: &[u8]) -> Result<Self> {
        let authorities = split_der_certificates(der_data).map_err(|e| match e {
            Error::X509Error(msg) => Error::MalformedBundle(msg),
            other => other,
        })?;

        if authorities.is_empty() {
            return Err(Error::MalformedBundle(format!(
                "no certificates in bundle for trust domain {}",
                trust_domain
            )));
        }

        let bundle = Self::new(trust_domain);
        {
            let mut state = bundle.state.write();
            state.authorities = dedup(authorities).into();
            state.sequence_number = 1;
        }
        Ok(bundle)
    }

    /// Get the trust domain
    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// Point-in-time view of the root certificates
    pub fn authorities(&self) -> Arc<[CertificateDer<'static>]> {
        self.state.read().authorities.clone()
    }

    /// Number of authorities in the bundle
    pub fn len(&self) -> usize {
        self.state.read().authorities.len()
    }

    /// Whether the bundle has no authorities
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the sequence number
    pub fn sequence_number(&self) -> u64 {
        self.state.read().sequence_number
    }

    /// Get the last update time
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.state.read().updated_at
    }

    /// Check if this bundle is newer than another
    pub fn is_newer_than(&self, other: &TrustBundle) -> bool {
        self.sequence_number() > other.sequence_number()
    }

    /// Add an authority certificate to the bundle
    ///
    /// Returns `false` if the certificate was already present. Safe to call while other
    /// threads verify against the bundle: they keep the set they already read.
    pub fn add_authority(&self, cert: CertificateDer<'static>) -> Result<bool> {
        X509Certificate::from_der(cert.as_ref())
            .map_err(|e| Error::X509Error(format!("Cannot add unparsable authority: {}", e)))?;

        let mut state = self.state.write();
        if state.authorities.iter().any(|existing| existing == &cert) {
            return Ok(false);
        }

        let mut authorities = state.authorities.to_vec();
        authorities.push(cert);
        state.authorities = authorities.into();
        state.sequence_number += 1;
        state.updated_at = Utc::now();

        debug!(
            "Added certificate to trust bundle for {}, now {} certificates",
            self.trust_domain,
            state.authorities.len()
        );

        Ok(true)
    }

    /// An independent copy that does not observe later additions to this bundle
    pub fn detached(&self) -> TrustBundle {
        TrustBundle {
            trust_domain: self.trust_domain.clone(),
            state: Arc::new(RwLock::new(self.state.read().clone())),
        }
    }

    /// Build a rustls root store from the current authorities
    pub fn root_store(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(self.authorities().iter().cloned());
        if ignored > 0 {
            warn!(
                trust_domain = %self.trust_domain,
                added, ignored, "Some authorities could not be used as trust anchors"
            );
        }
        roots
    }
}

impl fmt::Debug for TrustBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("TrustBundle")
            .field("trust_domain", &self.trust_domain)
            .field("authorities", &state.authorities.len())
            .field("sequence_number", &state.sequence_number)
            .finish()
    }
}

impl BundleSource for TrustBundle {
    fn bundle_for(&self, trust_domain: &TrustDomain) -> Option<TrustBundle> {
        (&self.trust_domain == trust_domain).then(|| self.clone())
    }
}

/// Trust bundle store for managing multiple trust domains
#[derive(Clone, Debug, Default)]
pub struct TrustBundleStore {
    /// Trust bundles by domain
    bundles: Arc<RwLock<HashMap<TrustDomain, TrustBundle>>>,
}

impl TrustBundleStore {
    /// Create a new trust bundle store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a trust bundle
    pub fn set_bundle(&self, bundle: TrustBundle) -> Result<()> {
        if bundle.is_empty() {
            return Err(Error::MalformedBundle(format!(
                "trust bundle for {} has no authorities",
                bundle.trust_domain()
            )));
        }

        let trust_domain = bundle.trust_domain().clone();
        let seq = bundle.sequence_number();
        self.bundles.write().insert(trust_domain.clone(), bundle);

        info!(
            "Set trust bundle for domain {} with sequence {}",
            trust_domain, seq
        );

        Ok(())
    }

    /// Get a trust bundle for a domain
    pub fn get_bundle(&self, trust_domain: &TrustDomain) -> Option<TrustBundle> {
        self.bundles.read().get(trust_domain).cloned()
    }

    /// Remove a trust bundle
    pub fn remove_bundle(&self, trust_domain: &TrustDomain) -> Option<TrustBundle> {
        let removed = self.bundles.write().remove(trust_domain);

        if removed.is_some() {
            info!("Removed trust bundle for domain {}", trust_domain);
        }

        removed
    }

    /// Get all trust domains
    pub fn domains(&self) -> Vec<TrustDomain> {
        self.bundles.read().keys().cloned().collect()
    }

    /// Get all trust bundles
    pub fn all_bundles(&self) -> Vec<TrustBundle> {
        self.bundles.read().values().cloned().collect()
    }

    /// Update bundle if newer; returns whether the store changed
    pub fn update_if_newer(&self, bundle: TrustBundle) -> Result<bool> {
        if bundle.is_empty() {
            return Err(Error::MalformedBundle(format!(
                "trust bundle for {} has no authorities",
                bundle.trust_domain()
            )));
        }

        let trust_domain = bundle.trust_domain().clone();
        let mut bundles = self.bundles.write();

        let updated = match bundles.get(&trust_domain) {
            Some(existing) if !bundle.is_newer_than(existing) => false,
            _ => {
                bundles.insert(trust_domain.clone(), bundle);
                true
            }
        };

        if updated {
            info!("Updated trust bundle for domain {}", trust_domain);
        }

        Ok(updated)
    }
}

impl BundleSource for TrustBundleStore {
    fn bundle_for(&self, trust_domain: &TrustDomain) -> Option<TrustBundle> {
        self.get_bundle(trust_domain)
    }
}

/// Split concatenated DER certificates into individual certificates
pub(crate) fn split_der_certificates(data: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut certs = Vec::new();
    let mut rest = data;

    while !rest.is_empty() {
        let (remaining, _) = parse_x509_certificate(rest).map_err(|e| {
            Error::X509Error(format!(
                "Failed to parse certificate {} in DER sequence: {}",
                certs.len(),
                e
            ))
        })?;
        let consumed = rest.len() - remaining.len();
        certs.push(CertificateDer::from(rest[..consumed].to_vec()));
        rest = remaining;
    }

    Ok(certs)
}

/// Slice PEM text into one chunk per `-----BEGIN` marker
fn pem_blocks(text: &str) -> impl Iterator<Item = &str> {
    const MARKER: &str = "-----BEGIN ";
    let starts: Vec<usize> = text.match_indices(MARKER).map(|(i, _)| i).collect();
    let ends: Vec<usize> = starts.iter().skip(1).copied().chain([text.len()]).collect();
    starts
        .into_iter()
        .zip(ends)
        .map(move |(start, end)| &text[start..end])
}

fn dedup(certs: Vec<CertificateDer<'static>>) -> Vec<CertificateDer<'static>> {
    let mut unique: Vec<CertificateDer<'static>> = Vec::with_capacity(certs.len());
    for cert in certs {
        if !unique.contains(&cert) {
            unique.push(cert);
        }
    }
    unique
}
