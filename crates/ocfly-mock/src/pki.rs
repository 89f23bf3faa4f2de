//! Throwaway certificate authorities for secured mock sessions.
//!
//! Two CAs: an identity CA that issues device and SDK identity
//! certificates, and a manufacturer CA whose certificates devices present
//! during ownership transfer.

use ocfly_api::TlsIdentity;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair,
};
use rustls_pki_types::CertificateDer;
use uuid::Uuid;

/// OCF device identity EKU, `1.3.6.1.4.1.44924.1.6`.
fn ocf_identity_purpose() -> ExtendedKeyUsagePurpose {
    ExtendedKeyUsagePurpose::Other(vec![1, 3, 6, 1, 4, 1, 44924, 1, 6])
}

struct Authority {
    cert: Certificate,
    key: KeyPair,
}

impl Authority {
    fn new(name: &str) -> Result<Self, rcgen::Error> {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key)?;
        Ok(Self { cert, key })
    }

    fn issue(
        &self,
        common_name: &str,
        purposes: Vec<ExtendedKeyUsagePurpose>,
    ) -> Result<(Certificate, KeyPair), rcgen::Error> {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.extended_key_usages = purposes;
        let cert = params.signed_by(&key, &self.cert, &self.key)?;
        Ok((cert, key))
    }
}

pub struct TestPki {
    identity_ca: Authority,
    manufacturer_ca: Authority,
}

impl TestPki {
    pub fn new() -> Result<Self, rcgen::Error> {
        Ok(Self {
            identity_ca: Authority::new("ocfly test identity ca")?,
            manufacturer_ca: Authority::new("ocfly test manufacturer ca")?,
        })
    }

    pub fn identity_ca(&self) -> CertificateDer<'static> {
        self.identity_ca.cert.der().clone()
    }

    pub fn identity_ca_pem(&self) -> String {
        self.identity_ca.cert.pem()
    }

    pub fn manufacturer_ca(&self) -> CertificateDer<'static> {
        self.manufacturer_ca.cert.der().clone()
    }

    /// Identity certificate (PEM) for `device_id`, issued by the identity CA.
    pub fn device_identity_pem(&self, device_id: &str) -> Result<String, rcgen::Error> {
        Ok(self.issue_identity(&format!("uuid:{device_id}"))?.0.pem())
    }

    /// Identity chain for `device_id` as presented on secured sessions.
    pub fn device_identity_chain(
        &self,
        device_id: &str,
    ) -> Result<Vec<CertificateDer<'static>>, rcgen::Error> {
        let (cert, _) = self.issue_identity(&format!("uuid:{device_id}"))?;
        Ok(vec![cert.der().clone()])
    }

    /// Manufacturer chain presented during ownership transfer.
    pub fn manufacturer_chain(
        &self,
        device_id: &str,
    ) -> Result<Vec<CertificateDer<'static>>, rcgen::Error> {
        let (cert, _) = self.manufacturer_ca.issue(
            &format!("uuid:{device_id}"),
            vec![
                ExtendedKeyUsagePurpose::ClientAuth,
                ExtendedKeyUsagePurpose::ServerAuth,
            ],
        )?;
        Ok(vec![cert.der().clone()])
    }

    /// Client identity for an SDK with id `sdk_id`.
    pub fn client_identity(&self, sdk_id: Uuid) -> Result<TlsIdentity, rcgen::Error> {
        let (cert, key) = self.issue_identity(&format!("uuid:{sdk_id}"))?;
        Ok(TlsIdentity::new(vec![cert.der().clone()], key.serialize_der()))
    }

    fn issue_identity(&self, common_name: &str) -> Result<(Certificate, KeyPair), rcgen::Error> {
        self.identity_ca.issue(
            common_name,
            vec![
                ExtendedKeyUsagePurpose::ClientAuth,
                ExtendedKeyUsagePurpose::ServerAuth,
                ocf_identity_purpose(),
            ],
        )
    }
}
