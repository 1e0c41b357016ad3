//! TLS channel configuration for SPIFFE-authenticated connections

use crate::error::{Error, Result};
use crate::policy::VerificationPolicy;
use crate::spiffe_id::TrustDomain;
use crate::svid::X509Svid;
use crate::trust_bundle::BundleSource;
use crate::verifier::{SpiffeClientCertVerifier, SpiffeServerCertVerifier};
use rustls::client::{ResolvesClientCert, Resumption};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use rustls::server::{ClientHello, NoServerSessionStorage, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, ServerConfig, SignatureScheme};
use std::fmt;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

/// The crypto provider every config in this crate is built with
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// A ready-to-use TLS configuration for one side of a connection
#[derive(Clone, Debug)]
pub enum ChannelConfig {
    /// Configuration for dialing
    Client {
        /// rustls client configuration
        config: Arc<ClientConfig>,
        /// Whether a client certificate is presented
        mutual: bool,
    },
    /// Configuration for listening
    Server {
        /// rustls server configuration
        config: Arc<ServerConfig>,
        /// Whether client certificates are required
        mutual: bool,
    },
}

impl ChannelConfig {
    /// Get the client configuration, if this is a client-side config
    pub fn client_config(&self) -> Option<Arc<ClientConfig>> {
        match self {
            ChannelConfig::Client { config, .. } => Some(config.clone()),
            ChannelConfig::Server { .. } => None,
        }
    }

    /// Get the server configuration, if this is a server-side config
    pub fn server_config(&self) -> Option<Arc<ServerConfig>> {
        match self {
            ChannelConfig::Server { config, .. } => Some(config.clone()),
            ChannelConfig::Client { .. } => None,
        }
    }

    /// Whether both sides authenticate
    pub fn is_mutual(&self) -> bool {
        match self {
            ChannelConfig::Client { mutual, .. } | ChannelConfig::Server { mutual, .. } => *mutual,
        }
    }

    /// Create a TLS connector for client connections
    pub fn connector(&self) -> Result<TlsConnector> {
        self.client_config()
            .map(TlsConnector::from)
            .ok_or_else(|| Error::tls_error("Client configuration not available"))
    }

    /// Create a TLS acceptor for server connections
    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        self.server_config()
            .map(TlsAcceptor::from)
            .ok_or_else(|| Error::tls_error("Server configuration not available"))
    }
}

/// Build a client configuration
///
/// Servers are verified against `bundles` and `policy`. With `svid` the client presents it
/// (mTLS), otherwise the connection is one-way TLS.
pub fn build_client_config(
    bundles: Arc<dyn BundleSource>,
    policy: VerificationPolicy,
    svid: Option<&X509Svid>,
) -> Result<ChannelConfig> {
    let builder = client_builder(bundles, policy.clone())?;

    let (config, mutual) = match svid {
        Some(svid) => {
            svid.validate()?;
            info!(spiffe_id = %svid.spiffe_id(), %policy, "Creating mTLS client config");
            let credential = FixedCredential(svid.certified_key()?);
            (builder.with_client_cert_resolver(Arc::new(credential)), true)
        }
        None => {
            info!(%policy, "Creating one-way TLS client config");
            (builder.with_no_client_auth(), false)
        }
    };

    Ok(client_channel(config, mutual))
}

/// Build a server configuration presenting `svid`
///
/// With `client_bundles` clients must present a certificate that passes `policy` (mTLS).
/// Without it the policy is unused and clients are not authenticated.
pub fn build_server_config(
    svid: &X509Svid,
    client_bundles: Option<Arc<dyn BundleSource>>,
    policy: VerificationPolicy,
) -> Result<ChannelConfig> {
    svid.validate()?;

    let mutual = client_bundles.is_some();
    info!(spiffe_id = %svid.spiffe_id(), mutual, %policy, "Creating server config");

    let credential = FixedCredential(svid.certified_key()?);
    let config = server_builder(client_bundles, policy)?.with_cert_resolver(Arc::new(credential));

    Ok(server_channel(config, mutual))
}

/// Client configuration whose presented certificate comes from `resolver` on every handshake
pub(crate) fn build_client_config_with_resolver(
    bundles: Arc<dyn BundleSource>,
    policy: VerificationPolicy,
    resolver: Option<Arc<dyn ResolvesClientCert>>,
) -> Result<ChannelConfig> {
    let builder = client_builder(bundles, policy)?;
    let mutual = resolver.is_some();
    let config = match resolver {
        Some(resolver) => builder.with_client_cert_resolver(resolver),
        None => builder.with_no_client_auth(),
    };

    Ok(client_channel(config, mutual))
}

/// Server configuration whose certificate comes from `resolver` on every handshake
pub(crate) fn build_server_config_with_resolver(
    resolver: Arc<dyn ResolvesServerCert>,
    client_bundles: Option<Arc<dyn BundleSource>>,
    policy: VerificationPolicy,
) -> Result<ChannelConfig> {
    let mutual = client_bundles.is_some();
    let config = server_builder(client_bundles, policy)?.with_cert_resolver(resolver);

    Ok(server_channel(config, mutual))
}

/// Every handshake is a full one; a resumed session would skip the peer verifier
fn client_channel(mut config: ClientConfig, mutual: bool) -> ChannelConfig {
    config.resumption = Resumption::disabled();
    ChannelConfig::Client {
        config: Arc::new(config),
        mutual,
    }
}

fn server_channel(mut config: ServerConfig, mutual: bool) -> ChannelConfig {
    config.session_storage = Arc::new(NoServerSessionStorage {});
    config.send_tls13_tickets = 0;
    ChannelConfig::Server {
        config: Arc::new(config),
        mutual,
    }
}

/// The same credential on every handshake
struct FixedCredential(Arc<CertifiedKey>);

impl fmt::Debug for FixedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedCredential")
            .field("chain_len", &self.0.cert.len())
            .finish()
    }
}

impl ResolvesClientCert for FixedCredential {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }

    fn has_certs(&self) -> bool {
        true
    }
}

impl ResolvesServerCert for FixedCredential {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// TLS server name to dial a workload of `trust_domain` with
///
/// Peers are never matched against it; it only fills the SNI field.
pub fn server_name(trust_domain: &TrustDomain) -> Result<ServerName<'static>> {
    ServerName::try_from(trust_domain.as_str().to_string())
        .map_err(|e| Error::tls_error(format!("Invalid server name {}: {}", trust_domain, e)))
}

fn client_builder(
    bundles: Arc<dyn BundleSource>,
    policy: VerificationPolicy,
) -> Result<rustls::ConfigBuilder<ClientConfig, rustls::client::WantsClientCert>> {
    let builder = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::tls_error(format!("Unsupported protocol versions: {}", e)))?;

    let verifier = SpiffeServerCertVerifier::new(bundles, policy);
    Ok(builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier)))
}

fn server_builder(
    client_bundles: Option<Arc<dyn BundleSource>>,
    policy: VerificationPolicy,
) -> Result<rustls::ConfigBuilder<ServerConfig, rustls::server::WantsServerCert>> {
    let builder = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::tls_error(format!("Unsupported protocol versions: {}", e)))?;

    Ok(match client_bundles {
        Some(bundles) => {
            debug!(%policy, "Requiring client certificates");
            let verifier = SpiffeClientCertVerifier::new(bundles, policy);
            builder.with_client_cert_verifier(Arc::new(verifier))
        }
        None => builder.with_no_client_auth(),
    })
}
