use anyhow::Result;
use x509_cert::Certificate;

use crate::definitions::x509::x5chain::CertificateWithDer;

/// The set of reader-authentication trust anchors configured on the device.
///
/// Anchors are usually self-signed reader CA roots, but deployments may also
/// trust intermediate CAs directly; path validation switches strategy based
/// on which of the two it finds (see [super::validation]).
#[derive(Debug, Clone, Default)]
pub struct TrustAnchorRegistry {
    pub anchors: Vec<CertificateWithDer>,
}

impl TrustAnchorRegistry {
    pub fn from_pem_certificates(certificates: &[&[u8]]) -> Result<Self> {
        let anchors = certificates
            .iter()
            .map(|pem| CertificateWithDer::from_pem(pem))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { anchors })
    }

    pub fn from_certificates(certificates: Vec<CertificateWithDer>) -> Self {
        Self {
            anchors: certificates,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// True when every configured anchor is a self-signed root.
    pub fn roots_only(&self) -> bool {
        self.anchors.iter().all(|anchor| {
            anchor.inner.tbs_certificate.subject == anchor.inner.tbs_certificate.issuer
        })
    }

    /// Anchors whose subject matches the given issuer name.
    pub fn anchors_for_issuer(&self, issuer: &x509_cert::name::Name) -> Vec<&Certificate> {
        self.anchors
            .iter()
            .filter(|anchor| anchor.inner.tbs_certificate.subject == *issuer)
            .map(|anchor| &anchor.inner)
            .collect()
    }
}
