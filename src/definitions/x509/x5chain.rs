use anyhow::{anyhow, bail, Context, Error, Result};
use ciborium::Value as CborValue;
use x509_cert::der::{Decode, Encode};
use x509_cert::Certificate;

use crate::definitions::helpers::NonEmptyVec;

/// See: <https://www.iana.org/assignments/cose/cose.xhtml#header-parameters>
pub const X5CHAIN_COSE_HEADER_LABEL: i64 = 0x21;

/// X.509 certificate with the DER representation held in memory for ease of
/// serialization.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CertificateWithDer {
    pub inner: Certificate,
    pub der: Vec<u8>,
}

impl CertificateWithDer {
    pub fn from_pem(bytes: &[u8]) -> Result<Self> {
        let bytes = pem_rfc7468::decode_vec(bytes)
            .map_err(|e| anyhow!("unable to parse certificate from PEM encoding: {e}"))?
            .1;
        CertificateWithDer::from_der(&bytes)
    }

    pub fn from_der(bytes: &[u8]) -> Result<Self> {
        let inner = Certificate::from_der(bytes)
            .context("unable to parse certificate from DER encoding")?;
        Ok(Self {
            inner,
            der: bytes.to_vec(),
        })
    }

    pub fn from_cert(certificate: Certificate) -> Result<Self> {
        let der = certificate.to_der()?;
        Ok(Self {
            inner: certificate,
            der,
        })
    }
}

/// An ordered (leaf first) certificate chain.
#[derive(Debug, Clone)]
pub struct X5Chain(NonEmptyVec<CertificateWithDer>);

impl From<NonEmptyVec<CertificateWithDer>> for X5Chain {
    fn from(v: NonEmptyVec<CertificateWithDer>) -> Self {
        Self(v)
    }
}

impl X5Chain {
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub fn into_cbor(&self) -> CborValue {
        match self.0.as_ref() {
            [cert] => CborValue::Bytes(cert.der.clone()),
            certs => CborValue::Array(
                certs
                    .iter()
                    .map(|x509| x509.der.clone())
                    .map(CborValue::Bytes)
                    .collect::<Vec<CborValue>>(),
            ),
        }
    }

    pub fn from_cbor(cbor: CborValue) -> Result<Self, Error> {
        match cbor {
            CborValue::Bytes(bytes) => Self::builder().with_der_certificate(&bytes)?.build(),
            CborValue::Array(x509s) => x509s
                .iter()
                .try_fold(Self::builder(), |mut builder, x509| match x509 {
                    CborValue::Bytes(bytes) => {
                        builder = builder.with_der_certificate(bytes)?;
                        Ok(builder)
                    }
                    _ => bail!(
                        "expected x509 certificate in the x5chain to be a cbor encoded bytestring, but received: {x509:?}"
                    ),
                })?
                .build(),
            _ => bail!(
                "expected x5chain to be a cbor encoded bytestring or array, but received: {cbor:?}"
            ),
        }
    }

    /// Reconstruct leaf -> root order from an unordered set of certificates.
    ///
    /// The true leaf is the unique certificate whose subject is never another
    /// certificate's issuer; issuer links are then walked upwards. Ambiguous
    /// input (no unique leaf, a cycle, or a broken link) is an error.
    pub fn from_unordered(certificates: Vec<CertificateWithDer>) -> Result<Self, Error> {
        if certificates.is_empty() {
            bail!("cannot build an x5chain from zero certificates");
        }

        let leaves: Vec<usize> = certificates
            .iter()
            .enumerate()
            .filter(|(i, candidate)| {
                !certificates.iter().enumerate().any(|(j, other)| {
                    *i != j
                        && other.inner.tbs_certificate.issuer
                            == candidate.inner.tbs_certificate.subject
                })
            })
            .map(|(i, _)| i)
            .collect();

        let [leaf_index] = leaves.as_slice() else {
            bail!(
                "certificate set does not contain exactly one leaf: found {}",
                leaves.len()
            );
        };

        let mut remaining: Vec<Option<CertificateWithDer>> =
            certificates.into_iter().map(Some).collect();
        let mut ordered = vec![remaining[*leaf_index].take().unwrap()];

        loop {
            let current = ordered.last().unwrap();
            // A self-signed certificate terminates the chain.
            if current.inner.tbs_certificate.issuer == current.inner.tbs_certificate.subject {
                break;
            }
            let next = remaining.iter_mut().find(|slot| {
                slot.as_ref().is_some_and(|candidate| {
                    candidate.inner.tbs_certificate.subject
                        == current.inner.tbs_certificate.issuer
                })
            });
            match next {
                Some(slot) => ordered.push(slot.take().unwrap()),
                None => break,
            }
        }

        if remaining.iter().any(|slot| slot.is_some()) {
            bail!("certificate set contains certificates outside the issuer chain");
        }

        Ok(Self(ordered.try_into().map_err(|_| {
            anyhow!("chain reconstruction produced an empty chain")
        })?))
    }

    /// Retrieve the end-entity certificate.
    pub fn end_entity_certificate(&self) -> &Certificate {
        &self.0[0].inner
    }

    /// Retrieve the root-entity certificate.
    pub fn root_entity_certificate(&self) -> &Certificate {
        &self.0.last().inner
    }

    pub fn len(&self) -> usize {
        self.0.as_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Iterate over the certificates in the chain, leaf first.
    pub fn iter(&self) -> impl Iterator<Item = &CertificateWithDer> {
        self.0.iter()
    }
}

#[derive(Default, Debug, Clone)]
pub struct Builder {
    certs: Vec<CertificateWithDer>,
}

impl Builder {
    pub fn with_certificate(mut self, cert: Certificate) -> Result<Builder> {
        let x509 = CertificateWithDer::from_cert(cert)?;
        self.certs.push(x509);
        Ok(self)
    }

    pub fn with_certificate_and_der(mut self, x509: CertificateWithDer) -> Builder {
        self.certs.push(x509);
        self
    }

    pub fn with_pem_certificate(mut self, data: &[u8]) -> Result<Builder> {
        let x509 = CertificateWithDer::from_pem(data)?;
        self.certs.push(x509);
        Ok(self)
    }

    pub fn with_der_certificate(mut self, data: &[u8]) -> Result<Builder> {
        let x509 = CertificateWithDer::from_der(data)?;
        self.certs.push(x509);
        Ok(self)
    }

    pub fn build(self) -> Result<X5Chain> {
        Ok(X5Chain(self.certs.try_into().map_err(|_| {
            anyhow!("at least one certificate must be given to the builder")
        })?))
    }
}
