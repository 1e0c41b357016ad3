//! Certificate fixtures shared by the integration tests

#![allow(dead_code)]

use chrono::{Duration, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use spiffe_tls::{SpiffeId, TrustBundle, TrustDomain, X509Svid};

pub fn td(name: &str) -> TrustDomain {
    TrustDomain::new(name).unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("spiffe_tls=debug"))
        .with_test_writer()
        .try_init();
}

/// Signing authority of one trust domain
pub struct Authority {
    trust_domain: TrustDomain,
    cert: Certificate,
    der: CertificateDer<'static>,
}

impl Authority {
    pub fn new(trust_domain: &str) -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new());
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::DigitalSignature];
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, format!("{} root", trust_domain));

        let cert = Certificate::from_params(params).unwrap();
        let der = CertificateDer::from(cert.serialize_der().unwrap());
        Authority {
            trust_domain: td(trust_domain),
            cert,
            der,
        }
    }

    pub fn bundle(&self) -> TrustBundle {
        TrustBundle::from_authorities(self.trust_domain.clone(), [self.der.clone()]).unwrap()
    }

    /// SVID for `id`, valid for the next few hours
    pub fn svid(&self, id: &str, serial: u128) -> X509Svid {
        let cert = leaf(id);
        let der = cert.serialize_der_with_signer(&self.cert).unwrap();
        into_svid(id, &cert, der, serial)
    }
}

/// SVID whose leaf is signed by its own key
pub fn self_signed_svid(id: &str) -> X509Svid {
    let cert = leaf(id);
    let der = cert.serialize_der().unwrap();
    into_svid(id, &cert, der, 1)
}

fn leaf(id: &str) -> Certificate {
    let mut params = CertificateParams::new(Vec::<String>::new());
    params.subject_alt_names = vec![SanType::URI(id.to_string())];
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, "workload");
    params.not_before = rcgen::date_time_ymd(2020, 1, 1);
    Certificate::from_params(params).unwrap()
}

fn into_svid(id: &str, cert: &Certificate, der: Vec<u8>, serial: u128) -> X509Svid {
    X509Svid::new(
        SpiffeId::parse(id).unwrap(),
        vec![CertificateDer::from(der)],
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der())),
        Utc::now() + Duration::hours(4),
        serial,
    )
    .unwrap()
}
