//! SPIFFE Verifiable Identity Documents (SVIDs)

use crate::error::{Error, Result};
use crate::spiffe_id::SpiffeId;
use crate::trust_bundle::split_der_certificates;
use crate::verifier::spiffe_id_from_cert;
use chrono::{DateTime, Utc};
use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, Ed25519KeyPair, KeyPair, RsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING,
    ECDSA_P384_SHA384_ASN1_SIGNING,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer};
use rustls::crypto::ring::sign::any_supported_type;
use rustls::sign::{CertifiedKey, SigningKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use x509_parser::prelude::{FromDer, X509Certificate};
use zeroize::Zeroizing;

/// How early before expiry a credential should be replaced
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationMargin {
    /// Rotate once less than this much validity remains
    Absolute(#[serde(with = "humantime_serde")] Duration),
    /// Rotate once the remaining validity drops below this fraction of the total lifetime
    FractionOfLifetime(f64),
}

impl Default for RotationMargin {
    fn default() -> Self {
        RotationMargin::FractionOfLifetime(0.5)
    }
}

impl RotationMargin {
    /// Check the margin is usable
    pub fn validate(&self) -> Result<()> {
        match self {
            RotationMargin::Absolute(d) if d.is_zero() => Err(Error::config_error(
                "rotation_margin: absolute margin must be greater than zero",
            )),
            RotationMargin::FractionOfLifetime(f) if !(*f > 0.0 && *f < 1.0) => {
                Err(Error::config_error(format!(
                    "rotation_margin: fraction must be within (0, 1), got {}",
                    f
                )))
            }
            _ => Ok(()),
        }
    }

    fn threshold(&self, lifetime: chrono::Duration) -> chrono::Duration {
        match self {
            RotationMargin::Absolute(d) => {
                chrono::Duration::from_std(*d).unwrap_or_else(|_| chrono::Duration::days(36_500))
            }
            RotationMargin::FractionOfLifetime(f) => {
                let millis = lifetime.num_milliseconds().max(0) as f64 * f;
                chrono::Duration::milliseconds(millis as i64)
            }
        }
    }
}

/// Certificate serial number as an unsigned big-endian integer
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct SerialNumber(Vec<u8>);

impl SerialNumber {
    /// Build from raw big-endian bytes; leading zero octets are dropped
    pub fn from_be_bytes(bytes: &[u8]) -> Self {
        let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        SerialNumber(bytes[start..].to_vec())
    }

    /// Big-endian bytes without leading zeros
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The value as `u128`, if it fits
    pub fn to_u128(&self) -> Option<u128> {
        if self.0.len() > 16 {
            return None;
        }
        Some(self.0.iter().fold(0u128, |acc, b| (acc << 8) | u128::from(*b)))
    }
}

impl From<u128> for SerialNumber {
    fn from(value: u128) -> Self {
        SerialNumber::from_be_bytes(&value.to_be_bytes())
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("0");
        }
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SerialNumber({})", self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum KeyFormat {
    Pkcs8,
    Pkcs1,
}

/// X.509 SVID for mTLS authentication
///
/// Immutable once built. The key is zeroed when the last copy is dropped.
#[derive(Clone)]
pub struct X509Svid {
    /// The SPIFFE ID for this SVID
    spiffe_id: SpiffeId,
    /// X.509 certificate chain, leaf first
    cert_chain: Vec<CertificateDer<'static>>,
    /// Private key (DER encoded)
    private_key: Zeroizing<Vec<u8>>,
    key_format: KeyFormat,
    /// Leaf validity start, used for lifetime-relative rotation
    not_before: DateTime<Utc>,
    /// Certificate expiration time
    expiry: DateTime<Utc>,
    /// Certificate serial number
    serial_number: SerialNumber,
}

impl X509Svid {
    /// Create a new X.509 SVID
    ///
    /// Fails with [`Error::MismatchedKey`] when the key does not belong to the leaf, and with
    /// [`Error::X509Error`] when the leaf does not name `spiffe_id`.
    pub fn new(
        spiffe_id: SpiffeId,
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'_>,
        expiry: DateTime<Utc>,
        serial_number: impl Into<SerialNumber>,
    ) -> Result<Self> {
        let leaf = LeafInfo::inspect(cert_chain.first())?;
        if leaf.spiffe_id != spiffe_id {
            return Err(Error::X509Error(format!(
                "Leaf certificate identity {} does not match {}",
                leaf.spiffe_id, spiffe_id
            )));
        }

        let (key_bytes, key_format) = match &private_key {
            PrivateKeyDer::Pkcs8(k) => (k.secret_pkcs8_der(), KeyFormat::Pkcs8),
            PrivateKeyDer::Pkcs1(k) => (k.secret_pkcs1_der(), KeyFormat::Pkcs1),
            _ => {
                return Err(Error::X509Error(
                    "Unsupported private key encoding, expected PKCS#8 or PKCS#1".into(),
                ))
            }
        };
        let private_key = Zeroizing::new(key_bytes.to_vec());

        if derive_public_key(&private_key, key_format)? != leaf.public_key {
            return Err(Error::MismatchedKey);
        }

        let svid = X509Svid {
            spiffe_id,
            cert_chain,
            private_key,
            key_format,
            not_before: leaf.not_before,
            expiry,
            serial_number: serial_number.into(),
        };

        svid.signing_key()
            .map_err(|e| Error::tls_error(format!("Private key not usable for TLS: {}", e)))?;

        Ok(svid)
    }

    /// Load an SVID from a PEM certificate chain and a PEM private key
    ///
    /// Identity, expiry and serial number are read from the leaf certificate.
    pub fn from_pem(chain_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let blocks = pem::parse_many(chain_pem)
            .map_err(|e| Error::X509Error(format!("Failed to parse certificate PEM: {}", e)))?;
        let chain: Vec<CertificateDer<'static>> = blocks
            .into_iter()
            .filter(|p| p.tag() == "CERTIFICATE")
            .map(|p| CertificateDer::from(p.into_contents()))
            .collect();

        let key = pem::parse(key_pem)
            .map_err(|e| Error::X509Error(format!("Failed to parse private key PEM: {}", e)))?;
        let key_format = match key.tag() {
            "PRIVATE KEY" => KeyFormat::Pkcs8,
            "RSA PRIVATE KEY" => KeyFormat::Pkcs1,
            other => {
                return Err(Error::X509Error(format!(
                    "Unsupported private key PEM block '{}'",
                    other
                )))
            }
        };
        let key_der = Zeroizing::new(key.into_contents());
        let private_key = borrow_key(&key_der, key_format);

        Self::from_leaf(chain, private_key)
    }

    /// Load an SVID from concatenated DER certificates and a PKCS#8 DER key
    pub fn from_der(chain_der: &[u8], key_der: &[u8]) -> Result<Self> {
        let chain = split_der_certificates(chain_der)?;
        Self::from_leaf(chain, PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der)))
    }

    fn from_leaf(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'_>) -> Result<Self> {
        let leaf = LeafInfo::inspect(chain.first())?;
        Self::new(leaf.spiffe_id, chain, key, leaf.not_after, leaf.serial)
    }

    /// Get the SPIFFE ID
    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    /// Get the certificate chain
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    /// Get the leaf certificate
    pub fn leaf_cert(&self) -> &CertificateDer<'static> {
        &self.cert_chain[0]
    }

    /// Borrow the private key
    ///
    /// The bytes stay in the SVID's zeroed-on-drop buffer; use
    /// [`PrivateKeyDer::clone_key`] only where an owned copy is unavoidable.
    pub fn private_key(&self) -> PrivateKeyDer<'_> {
        borrow_key(&self.private_key, self.key_format)
    }

    /// Check if the SVID has expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Check if the SVID is expired at `now`; validity ends at `expiry` exclusive
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }

    /// Get the expiration time
    pub fn expiry(&self) -> &DateTime<Utc> {
        &self.expiry
    }

    /// Get the start of the leaf validity period
    pub fn not_before(&self) -> &DateTime<Utc> {
        &self.not_before
    }

    /// Get time until expiration
    pub fn time_until_expiry(&self) -> chrono::Duration {
        self.expiry - Utc::now()
    }

    /// Get the serial number
    pub fn serial_number(&self) -> &SerialNumber {
        &self.serial_number
    }

    /// Validate the SVID is still usable
    pub fn validate(&self) -> Result<()> {
        if self.is_expired() {
            return Err(Error::StaleCredential(self.expiry));
        }
        Ok(())
    }

    /// Re-check that the private key belongs to the leaf certificate
    pub fn check_key_pair(&self) -> Result<()> {
        let leaf = LeafInfo::inspect(self.cert_chain.first())?;
        if derive_public_key(&self.private_key, self.key_format)? != leaf.public_key {
            return Err(Error::MismatchedKey);
        }
        Ok(())
    }

    /// Check if rotation is needed now
    pub fn needs_rotation(&self, margin: &RotationMargin) -> bool {
        self.needs_rotation_at(margin, Utc::now())
    }

    /// Check if rotation is needed at `now`
    pub fn needs_rotation_at(&self, margin: &RotationMargin, now: DateTime<Utc>) -> bool {
        match self.expiry.checked_sub_signed(margin.threshold(self.lifetime())) {
            Some(rotate_at) => now > rotate_at,
            None => true,
        }
    }

    /// How long from `now` until rotation becomes due; zero if it already is
    pub fn time_until_rotation(&self, margin: &RotationMargin, now: DateTime<Utc>) -> Duration {
        self.expiry
            .checked_sub_signed(margin.threshold(self.lifetime()))
            .and_then(|rotate_at| (rotate_at - now).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }

    /// Certificate chain and signing key in the form rustls resolvers hand out
    pub fn certified_key(&self) -> Result<Arc<CertifiedKey>> {
        let key = self
            .signing_key()
            .map_err(|e| Error::tls_error(format!("Failed to load private key: {}", e)))?;
        Ok(Arc::new(CertifiedKey::new(self.cert_chain.clone(), key)))
    }

    /// Parse the key straight from the zeroed buffer, without an intermediate copy
    fn signing_key(&self) -> std::result::Result<Arc<dyn SigningKey>, rustls::Error> {
        any_supported_type(&self.private_key())
    }

    fn lifetime(&self) -> chrono::Duration {
        self.expiry - self.not_before
    }
}

impl fmt::Debug for X509Svid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("X509Svid")
            .field("spiffe_id", &self.spiffe_id)
            .field("chain_len", &self.cert_chain.len())
            .field("private_key", &"<redacted>")
            .field("expiry", &self.expiry)
            .field("serial_number", &self.serial_number)
            .finish()
    }
}

fn borrow_key(der: &[u8], format: KeyFormat) -> PrivateKeyDer<'_> {
    match format {
        KeyFormat::Pkcs8 => PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(der)),
        KeyFormat::Pkcs1 => PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(der)),
    }
}

/// Fields read from a leaf certificate
struct LeafInfo {
    spiffe_id: SpiffeId,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    serial: SerialNumber,
    public_key: Vec<u8>,
}

impl LeafInfo {
    fn inspect(leaf_der: Option<&CertificateDer<'_>>) -> Result<Self> {
        let leaf_der =
            leaf_der.ok_or_else(|| Error::X509Error("Certificate chain cannot be empty".into()))?;
        let (_, leaf) = X509Certificate::from_der(leaf_der.as_ref())
            .map_err(|e| Error::X509Error(format!("Failed to parse leaf certificate: {}", e)))?;

        let spiffe_id = spiffe_id_from_cert(&leaf).map_err(|e| {
            Error::X509Error(format!("Leaf certificate has no usable identity: {}", e))
        })?;

        Ok(LeafInfo {
            spiffe_id,
            not_before: timestamp(leaf.validity().not_before.timestamp())?,
            not_after: timestamp(leaf.validity().not_after.timestamp())?,
            serial: SerialNumber::from_be_bytes(leaf.raw_serial()),
            public_key: leaf.public_key().subject_public_key.data.to_vec(),
        })
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| Error::X509Error(format!("Certificate time out of range: {}", secs)))
}

/// Public key bytes, encoded as in a SubjectPublicKeyInfo bit string
fn derive_public_key(key: &[u8], format: KeyFormat) -> Result<Vec<u8>> {
    match format {
        KeyFormat::Pkcs1 => RsaKeyPair::from_der(key)
            .map(|kp| kp.public_key().as_ref().to_vec())
            .map_err(|e| Error::X509Error(format!("Invalid RSA private key: {}", e))),
        KeyFormat::Pkcs8 => {
            let rng = SystemRandom::new();
            if let Ok(kp) = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, key, &rng) {
                return Ok(kp.public_key().as_ref().to_vec());
            }
            if let Ok(kp) = EcdsaKeyPair::from_pkcs8(&ECDSA_P384_SHA384_ASN1_SIGNING, key, &rng) {
                return Ok(kp.public_key().as_ref().to_vec());
            }
            if let Ok(kp) = Ed25519KeyPair::from_pkcs8_maybe_unchecked(key) {
                return Ok(kp.public_key().as_ref().to_vec());
            }
            RsaKeyPair::from_pkcs8(key)
                .map(|kp| kp.public_key().as_ref().to_vec())
                .map_err(|e| Error::X509Error(format!("Unsupported or invalid private key: {}", e)))
        }
    }
}
