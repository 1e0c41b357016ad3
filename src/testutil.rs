//! Certificate fixtures for unit tests

use crate::spiffe_id::SpiffeId;
use crate::svid::X509Svid;
use chrono::{DateTime, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

/// A generated leaf certificate and its PKCS#8 key
pub(crate) struct Leaf {
    pub cert: CertificateDer<'static>,
    pub key: PrivateKeyDer<'static>,
}

/// A throwaway certificate authority
pub(crate) struct TestCa {
    cert: Certificate,
    der: CertificateDer<'static>,
}

impl TestCa {
    pub(crate) fn new(name: &str) -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new());
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, format!("{name} test CA"));

        let cert = Certificate::from_params(params).expect("generate CA");
        let der = CertificateDer::from(cert.serialize_der().expect("serialize CA"));
        TestCa { cert, der }
    }

    pub(crate) fn cert_der(&self) -> CertificateDer<'static> {
        self.der.clone()
    }

    pub(crate) fn cert_pem(&self) -> String {
        pem::encode(&pem::Pem::new("CERTIFICATE", self.der.to_vec()))
    }

    /// Issue a leaf carrying the given URI SANs
    pub(crate) fn issue(&self, uris: &[&str]) -> Leaf {
        let cert = leaf_certificate(uris);
        let der = cert
            .serialize_der_with_signer(&self.cert)
            .expect("sign leaf");
        Leaf {
            cert: CertificateDer::from(der),
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der())),
        }
    }

    /// Issue an SVID for `id` expiring at `not_after`
    pub(crate) fn issue_svid(&self, id: &str, not_after: DateTime<Utc>, serial: u128) -> X509Svid {
        let leaf = self.issue(&[id]);
        X509Svid::new(
            SpiffeId::parse(id).expect("valid id"),
            vec![leaf.cert],
            leaf.key,
            not_after,
            serial,
        )
        .expect("valid svid")
    }
}

/// A leaf signed by its own key
pub(crate) fn self_signed(uris: &[&str]) -> Leaf {
    let cert = leaf_certificate(uris);
    Leaf {
        cert: CertificateDer::from(cert.serialize_der().expect("self-sign")),
        key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der())),
    }
}

fn leaf_certificate(uris: &[&str]) -> Certificate {
    let mut params = CertificateParams::new(Vec::<String>::new());
    params.subject_alt_names = uris.iter().map(|u| SanType::URI(u.to_string())).collect();
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, "workload");
    params.not_before = rcgen::date_time_ymd(2020, 1, 1);
    Certificate::from_params(params).expect("generate leaf")
}
