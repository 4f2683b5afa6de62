//! Per-certificate CRL revocation checking.
//!
//! Fetching is delegated to a [CrlFetcher] collaborator so this crate never
//! performs network I/O itself. The unit type implements a disabled fetcher:
//! checks are skipped and recorded as warnings rather than failures.

use const_oid::AssociatedOid;
use der::{Decode, Encode};
use x509_cert::crl::CertificateList;
use x509_cert::ext::pkix::name::{DistributionPointName, GeneralName};
use x509_cert::ext::pkix::CrlDistributionPoints;
use x509_cert::Certificate;

use crate::definitions::x509::validation::signature::issuer_verifies;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to parse CRL distribution points extension: {0}")]
    MalformedDistributionPoints(der::Error),
    #[error("distribution point malformed: {0}")]
    DistributionPointMalformed(&'static str),
    #[error("failed to fetch CRL from '{0}': {1}")]
    Fetch(String, String),
    #[error("unable to parse fetched CRL: {0}")]
    MalformedCrl(der::Error),
    #[error("CRL issuer does not match the certificate issuer")]
    IssuerMismatch,
    #[error("CRL signature could not be verified against the issuer key")]
    SignatureInvalid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevocationStatus {
    /// Not revoked, or the certificate carries no distribution point.
    Valid,
    Revoked,
    /// Checking was skipped because the fetcher is disabled.
    Skipped,
}

/// Retrieves CRL bytes for a distribution point URI.
pub trait CrlFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, String>;

    fn enabled(&self) -> bool {
        true
    }
}

/// Disabled fetcher: revocation checks are skipped.
impl CrlFetcher for () {
    fn fetch(&self, _url: &str) -> Result<Vec<u8>, String> {
        Err("CRL fetching is not configured".to_string())
    }

    fn enabled(&self) -> bool {
        false
    }
}

fn distribution_point_urls(certificate: &Certificate) -> Result<Vec<String>, Error> {
    let Some(ext) = certificate
        .tbs_certificate
        .extensions
        .iter()
        .flatten()
        .find(|ext| ext.extn_id == CrlDistributionPoints::OID)
    else {
        return Ok(vec![]);
    };

    let distribution_points = CrlDistributionPoints::from_der(ext.extn_value.as_bytes())
        .map_err(Error::MalformedDistributionPoints)?;

    let mut urls = vec![];
    for point in distribution_points.0.iter() {
        let name = point
            .distribution_point
            .as_ref()
            .ok_or(Error::DistributionPointMalformed(
                "missing distributionPoint name",
            ))?;
        match name {
            DistributionPointName::FullName(names) => {
                for general_name in names {
                    match general_name {
                        GeneralName::UniformResourceIdentifier(uri) => {
                            urls.push(uri.to_string());
                        }
                        _ => {
                            return Err(Error::DistributionPointMalformed(
                                "distribution point name is not a URI",
                            ))
                        }
                    }
                }
            }
            DistributionPointName::NameRelativeToCRLIssuer(_) => {
                return Err(Error::DistributionPointMalformed(
                    "contained relative-to-issuer name",
                ))
            }
        }
    }
    Ok(urls)
}

/// Fetch and check every CRL the certificate points at, verifying each list
/// against the issuer before consulting it.
pub fn check_certificate_revocation<C: CrlFetcher>(
    fetcher: &C,
    subject: &Certificate,
    issuer: &Certificate,
) -> Result<RevocationStatus, Error> {
    let urls = distribution_point_urls(subject)?;
    if urls.is_empty() {
        return Ok(RevocationStatus::Valid);
    }
    if !fetcher.enabled() {
        return Ok(RevocationStatus::Skipped);
    }

    for url in urls {
        let crl_bytes = fetcher
            .fetch(&url)
            .map_err(|e| Error::Fetch(url.clone(), e))?;
        let crl = CertificateList::from_der(&crl_bytes).map_err(Error::MalformedCrl)?;

        if crl.tbs_cert_list.issuer != issuer.tbs_certificate.subject {
            return Err(Error::IssuerMismatch);
        }

        let tbs = crl
            .tbs_cert_list
            .to_der()
            .map_err(Error::MalformedCrl)?;
        let signature = crl
            .signature
            .as_bytes()
            .ok_or(Error::SignatureInvalid)?;
        if !issuer_verifies(issuer, crl.signature_algorithm.oid, &tbs, signature) {
            return Err(Error::SignatureInvalid);
        }

        let revoked = crl
            .tbs_cert_list
            .revoked_certificates
            .iter()
            .flatten()
            .any(|entry| entry.serial_number == subject.tbs_certificate.serial_number);
        if revoked {
            return Ok(RevocationStatus::Revoked);
        }
    }

    Ok(RevocationStatus::Valid)
}
