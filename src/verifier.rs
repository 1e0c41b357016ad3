//! SPIFFE peer certificate verification
//!
//! Replaces hostname-based verification with URI SAN identity checks, a verification policy and
//! chain validation against the peer's own trust domain bundle.

use crate::error::{Error, Result};
use crate::mtls::crypto_provider;
use crate::policy::VerificationPolicy;
use crate::spiffe_id::SpiffeId;
use crate::trust_bundle::BundleSource;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ParsedCertificate, WebPkiClientVerifier};
use rustls::{
    CertificateError, DigitallySignedStruct, DistinguishedName, OtherError, SignatureScheme,
};
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};
use x509_parser::prelude::*;

/// Which side of the handshake presented the certificate being verified
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerRole {
    /// The peer is a server; checked for serverAuth usage
    Server,
    /// The peer is a client; checked for clientAuth usage
    Client,
}

/// Extract the SPIFFE ID from a DER certificate
///
/// Returns the first URI SAN that parses as a SPIFFE ID.
pub fn extract_spiffe_id(cert_der: &CertificateDer<'_>) -> Result<SpiffeId> {
    let (_, cert) = X509Certificate::from_der(cert_der.as_ref())
        .map_err(|e| Error::MalformedPeerCertificate(e.to_string()))?;
    spiffe_id_from_cert(&cert)
}

pub(crate) fn spiffe_id_from_cert(cert: &X509Certificate<'_>) -> Result<SpiffeId> {
    let san = cert.subject_alternative_name().map_err(|e| {
        Error::MalformedPeerCertificate(format!("invalid subject alternative name: {}", e))
    })?;

    let uris: Vec<&str> = san
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::URI(uri) => Some(*uri),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    if uris.is_empty() {
        return Err(Error::MissingIdentitySan);
    }

    uris.iter()
        .find_map(|uri| SpiffeId::parse(uri).ok())
        .ok_or(Error::NoValidIdentityInCertificate)
}

/// Verify a peer certificate chain (leaf first)
///
/// Checks run in order: a certificate is present, the leaf parses, it carries URI SANs, one of
/// them is a SPIFFE ID, the policy accepts that ID, and the chain leads to an authority in the
/// bundle for the ID's trust domain. The first failure is returned.
pub fn verify_peer_chain(
    chain: &[CertificateDer<'_>],
    bundles: &dyn BundleSource,
    policy: &VerificationPolicy,
    role: PeerRole,
    now: UnixTime,
) -> Result<SpiffeId> {
    verify_with_provider(chain, bundles, policy, role, now, &crypto_provider())
}

fn verify_with_provider(
    chain: &[CertificateDer<'_>],
    bundles: &dyn BundleSource,
    policy: &VerificationPolicy,
    role: PeerRole,
    now: UnixTime,
    provider: &Arc<CryptoProvider>,
) -> Result<SpiffeId> {
    let (leaf, intermediates) = chain.split_first().ok_or(Error::NoPeerCertificate)?;

    let spiffe_id = extract_spiffe_id(leaf)?;
    policy.verify(&spiffe_id)?;

    let bundle = bundles.bundle_for(spiffe_id.trust_domain()).ok_or_else(|| {
        Error::ChainVerificationFailed(format!(
            "no trust bundle for trust domain {}",
            spiffe_id.trust_domain()
        ))
    })?;
    let roots = Arc::new(bundle.root_store());
    if roots.is_empty() {
        return Err(Error::ChainVerificationFailed(format!(
            "trust bundle for {} has no usable authorities",
            spiffe_id.trust_domain()
        )));
    }

    match role {
        PeerRole::Server => {
            let parsed = ParsedCertificate::try_from(leaf)
                .map_err(|e| Error::MalformedPeerCertificate(e.to_string()))?;
            rustls::client::verify_server_cert_signed_by_trust_anchor(
                &parsed,
                &roots,
                intermediates,
                now,
                provider.signature_verification_algorithms.all,
            )
            .map_err(|e| Error::ChainVerificationFailed(e.to_string()))?;
        }
        PeerRole::Client => {
            let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider.clone())
                .build()
                .map_err(|e| Error::ChainVerificationFailed(e.to_string()))?;
            verifier
                .verify_client_cert(leaf, intermediates, now)
                .map_err(|e| Error::ChainVerificationFailed(e.to_string()))?;
        }
    }

    Ok(spiffe_id)
}

/// Recover the typed rejection from a failed TLS handshake, if the local verifier raised one
pub fn handshake_rejection(err: &io::Error) -> Option<&Error> {
    let tls = err.get_ref()?.downcast_ref::<rustls::Error>()?;
    match tls {
        rustls::Error::InvalidCertificate(CertificateError::Other(other)) => {
            other.0.downcast_ref::<Error>()
        }
        _ => None,
    }
}

fn into_tls_error(err: Error) -> rustls::Error {
    rustls::Error::InvalidCertificate(CertificateError::Other(OtherError(Arc::new(err))))
}

#[derive(Debug)]
struct PeerVerifier {
    bundles: Arc<dyn BundleSource>,
    policy: VerificationPolicy,
    provider: Arc<CryptoProvider>,
}

impl PeerVerifier {
    fn verify(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        role: PeerRole,
        now: UnixTime,
    ) -> std::result::Result<(), rustls::Error> {
        let chain: Vec<CertificateDer<'_>> = std::iter::once(end_entity.clone())
            .chain(intermediates.iter().cloned())
            .collect();

        let outcome = verify_with_provider(
            &chain,
            self.bundles.as_ref(),
            &self.policy,
            role,
            now,
            &self.provider,
        );
        match outcome {
            Ok(spiffe_id) => {
                debug!(spiffe_id = %spiffe_id, ?role, policy = %self.policy, "Accepted peer");
                Ok(())
            }
            Err(e) => {
                warn!(?role, policy = %self.policy, "Rejected peer: {}", e);
                Err(into_tls_error(e))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Server certificate verifier used by SPIFFE clients
///
/// The server name is never consulted.
#[derive(Debug)]
pub struct SpiffeServerCertVerifier {
    inner: PeerVerifier,
}

impl SpiffeServerCertVerifier {
    /// Create a verifier checking servers against `bundles` and `policy`
    pub fn new(bundles: Arc<dyn BundleSource>, policy: VerificationPolicy) -> Self {
        SpiffeServerCertVerifier {
            inner: PeerVerifier {
                bundles,
                policy,
                provider: crypto_provider(),
            },
        }
    }
}

impl ServerCertVerifier for SpiffeServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        self.inner
            .verify(end_entity, intermediates, PeerRole::Server, now)
            .map(|_| ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Client certificate verifier used by SPIFFE servers; client certificates are mandatory
#[derive(Debug)]
pub struct SpiffeClientCertVerifier {
    inner: PeerVerifier,
}

impl SpiffeClientCertVerifier {
    /// Create a verifier checking clients against `bundles` and `policy`
    pub fn new(bundles: Arc<dyn BundleSource>, policy: VerificationPolicy) -> Self {
        SpiffeClientCertVerifier {
            inner: PeerVerifier {
                bundles,
                policy,
                provider: crypto_provider(),
            },
        }
    }
}

impl ClientCertVerifier for SpiffeClientCertVerifier {
    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        self.inner
            .verify(end_entity, intermediates, PeerRole::Client, now)
            .map(|_| ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spiffe_id::TrustDomain;
    use crate::testutil::{self_signed, TestCa};
    use crate::trust_bundle::{TrustBundle, TrustBundleStore};

    fn member_of(td: &str) -> VerificationPolicy {
        VerificationPolicy::AcceptMemberOf(TrustDomain::new(td).unwrap())
    }

    fn bundle_for(ca: &TestCa, td: &str) -> TrustBundle {
        TrustBundle::from_authorities(TrustDomain::new(td).unwrap(), [ca.cert_der()]).unwrap()
    }

    fn check(
        chain: &[CertificateDer<'_>],
        bundles: &dyn BundleSource,
        policy: &VerificationPolicy,
    ) -> Result<SpiffeId> {
        verify_peer_chain(chain, bundles, policy, PeerRole::Server, UnixTime::now())
    }

    #[test]
    fn test_zero_certificates() {
        let ca = TestCa::new("example.org");
        let bundle = bundle_for(&ca, "example.org");
        let result = check(&[], &bundle, &member_of("example.org"));
        assert!(matches!(result, Err(Error::NoPeerCertificate)));
    }

    #[test]
    fn test_malformed_leaf() {
        let ca = TestCa::new("example.org");
        let bundle = bundle_for(&ca, "example.org");
        let junk = CertificateDer::from(vec![0x30, 0x03, 0x02, 0x01, 0x00]);
        let result = check(&[junk], &bundle, &member_of("example.org"));
        assert!(matches!(result, Err(Error::MalformedPeerCertificate(_))));
    }

    #[test]
    fn test_no_uri_sans() {
        let ca = TestCa::new("example.org");
        let bundle = bundle_for(&ca, "example.org");
        let leaf = ca.issue(&[]);
        let result = check(&[leaf.cert], &bundle, &member_of("example.org"));
        assert!(matches!(result, Err(Error::MissingIdentitySan)));
    }

    #[test]
    fn test_uri_san_with_other_scheme() {
        let ca = TestCa::new("example.org");
        let bundle = bundle_for(&ca, "example.org");
        let leaf = ca.issue(&["https://example.org"]);
        let result = check(&[leaf.cert], &bundle, &member_of("example.org"));
        assert!(matches!(result, Err(Error::NoValidIdentityInCertificate)));
    }

    #[test]
    fn test_first_valid_uri_wins() {
        let leaf = self_signed(&[
            "https://example.org",
            "spiffe://example.org/workload",
            "spiffe://example.org/second",
        ]);
        let id = extract_spiffe_id(&leaf.cert).unwrap();
        assert_eq!(id.to_string(), "spiffe://example.org/workload");
    }

    #[test]
    fn test_policy_accept_and_reject() {
        let ca = TestCa::new("example.org");
        let bundle = bundle_for(&ca, "example.org");
        let leaf = ca.issue(&["spiffe://example.org/workload"]);

        let id = check(&[leaf.cert.clone()], &bundle, &member_of("example.org")).unwrap();
        assert_eq!(id.path(), "/workload");

        let result = check(&[leaf.cert], &bundle, &member_of("other.org"));
        assert!(matches!(result, Err(Error::PolicyRejected(_))));
    }

    #[test]
    fn test_self_signed_with_valid_id_rejected() {
        let ca = TestCa::new("example.org");
        let bundle = bundle_for(&ca, "example.org");
        let leaf = self_signed(&["spiffe://example.org/impostor"]);

        let result = check(&[leaf.cert], &bundle, &VerificationPolicy::AcceptAny);
        assert!(matches!(result, Err(Error::ChainVerificationFailed(_))));
    }

    #[test]
    fn test_chain_checked_against_peer_domain_bundle() {
        let ours = TestCa::new("example.org");
        let theirs = TestCa::new("other.org");
        let store = TrustBundleStore::new();
        store.set_bundle(bundle_for(&ours, "example.org")).unwrap();

        // signed by our CA but claims the other domain, which has no bundle
        let leaf = ours.issue(&["spiffe://other.org/workload"]);
        let result = check(&[leaf.cert], &store, &VerificationPolicy::AcceptAny);
        assert!(matches!(result, Err(Error::ChainVerificationFailed(_))));

        // other domain bundle present, but the leaf was not signed by it
        store.set_bundle(bundle_for(&theirs, "other.org")).unwrap();
        let leaf = ours.issue(&["spiffe://other.org/workload"]);
        let result = check(&[leaf.cert], &store, &VerificationPolicy::AcceptAny);
        assert!(matches!(result, Err(Error::ChainVerificationFailed(_))));

        let leaf = theirs.issue(&["spiffe://other.org/workload"]);
        assert!(check(&[leaf.cert], &store, &VerificationPolicy::AcceptAny).is_ok());
    }

    #[test]
    fn test_client_role_chain_validation() {
        let ca = TestCa::new("example.org");
        let bundle = bundle_for(&ca, "example.org");
        let leaf = ca.issue(&["spiffe://example.org/client"]);

        let id = verify_peer_chain(
            &[leaf.cert],
            &bundle,
            &member_of("example.org"),
            PeerRole::Client,
            UnixTime::now(),
        )
        .unwrap();
        assert_eq!(id.to_string(), "spiffe://example.org/client");
    }

    #[test]
    fn test_handshake_rejection_roundtrip() {
        let tls = into_tls_error(Error::PolicyRejected("no".into()));
        let io_err = io::Error::new(io::ErrorKind::InvalidData, tls);
        assert!(matches!(
            handshake_rejection(&io_err),
            Some(Error::PolicyRejected(_))
        ));

        let plain = io::Error::new(io::ErrorKind::Other, "boom");
        assert!(handshake_rejection(&plain).is_none());
    }
}
