//! SPIFFE trust verification and secure channels for Rust
//!
//! Parses SPIFFE IDs, keeps trust bundles and X.509 SVIDs, verifies peers against a
//! [`VerificationPolicy`] and their trust domain's bundle, and builds rustls configurations
//! for mutually authenticated channels. [`ManagedCredentialClient`] keeps the credential
//! rotated in the background.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod managed;
pub mod mtls;
pub mod policy;
pub mod source;
pub mod spiffe_id;
pub mod svid;
pub mod trust_bundle;
pub mod verifier;
pub mod workload;

#[cfg(test)]
mod testutil;

pub use config::{BackoffConfig, ManagedClientConfig};
pub use error::{Error, Result};
pub use managed::{ClientState, ManagedCredentialClient, Snapshot};
pub use mtls::{build_client_config, build_server_config, server_name, ChannelConfig};
pub use policy::{PolicyDecision, VerificationPolicy};
pub use source::{CredentialSource, InMemorySource};
pub use spiffe_id::{SpiffeId, TrustDomain};
pub use svid::{RotationMargin, SerialNumber, X509Svid};
pub use trust_bundle::{BundleSource, TrustBundle, TrustBundleStore};
pub use verifier::{
    extract_spiffe_id, handshake_rejection, verify_peer_chain, PeerRole, SpiffeClientCertVerifier,
    SpiffeServerCertVerifier,
};
pub use workload::{WorkloadApiClient, WorkloadApiConfig};
