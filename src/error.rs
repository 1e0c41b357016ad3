//! Error types for the SPIFFE TLS layer

use thiserror::Error;

/// Main error type for identity, credential and channel operations
#[derive(Error, Debug)]
pub enum Error {
    /// SPIFFE ID failed one or more grammar rules; every violated rule is listed
    #[error("Invalid SPIFFE ID '{input}': {}", violations.join("; "))]
    InvalidIdentityFormat {
        /// The rejected input
        input: String,
        /// Every rule the input violated
        violations: Vec<String>,
    },

    /// The private key does not belong to the leaf certificate
    #[error("Private key does not match the leaf certificate public key")]
    MismatchedKey,

    /// Trust bundle could not be loaded
    #[error("Malformed trust bundle: {0}")]
    MalformedBundle(String),

    /// Peer presented no certificate at all
    #[error("Peer presented no certificate")]
    NoPeerCertificate,

    /// Peer leaf certificate could not be parsed
    #[error("Malformed peer certificate: {0}")]
    MalformedPeerCertificate(String),

    /// Peer leaf certificate carries no URI subject alternative name
    #[error("Peer certificate has no URI SANs (SPIFFE ID required)")]
    MissingIdentitySan,

    /// None of the peer URI SANs is a valid SPIFFE ID
    #[error("Peer certificate does not contain a valid SPIFFE ID")]
    NoValidIdentityInCertificate,

    /// The verification policy refused the peer identity
    #[error("Peer rejected by policy: {0}")]
    PolicyRejected(String),

    /// Peer chain does not lead to an authority of its trust domain
    #[error("Certificate chain verification failed: {0}")]
    ChainVerificationFailed(String),

    /// The attestation collaborator could not be reached or timed out
    #[error("Credential collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    /// Background rotation failed and nothing has succeeded since
    #[error("Credential rotation failed: {0}")]
    RotationFailed(String),

    /// X.509 credential material error
    #[error("X.509 certificate error: {0}")]
    X509Error(String),

    /// TLS configuration error
    #[error("TLS configuration error: {0}")]
    TlsError(String),

    /// Configuration rejected during validation
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// No snapshot has been fetched yet
    #[error("Managed client has not been started")]
    NotReady,

    /// The managed client has been shut down
    #[error("Managed client is closed")]
    Closed,

    /// Current credential has expired and could not be rotated
    #[error("Current credential is stale (expired at {0})")]
    StaleCredential(chrono::DateTime<chrono::Utc>),

    /// Network or I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Convenience type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a TlsError with detailed message
    pub fn tls_error(msg: impl Into<String>) -> Self {
        Self::TlsError(msg.into())
    }

    /// Create a CollaboratorUnavailable error with detailed message
    pub fn collaborator_unavailable(msg: impl Into<String>) -> Self {
        Self::CollaboratorUnavailable(msg.into())
    }

    /// Create a ConfigError with detailed message
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Whether this error was raised while verifying a peer during a handshake
    pub fn is_handshake_rejection(&self) -> bool {
        matches!(
            self,
            Self::NoPeerCertificate
                | Self::MalformedPeerCertificate(_)
                | Self::MissingIdentitySan
                | Self::NoValidIdentityInCertificate
                | Self::PolicyRejected(_)
                | Self::ChainVerificationFailed(_)
        )
    }
}
