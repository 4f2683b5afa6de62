//! COSE_Sign1 construction and verification.
//!
//! Signing is split in two: a [Builder] prepares the `Signature1` payload, the
//! caller signs it with whatever holds the private key (see [crate::keys]),
//! and [PreparedCoseSign1::finalize] assembles the final structure. This keeps
//! raw private key material out of this crate entirely.

use coset::iana::{self, EnumI64};
use coset::{sig_structure_data, CoseError, SignatureContext};
use signature::Verifier;

use crate::cose::MaybeTagged;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no payload provided")]
    MissingPayload,
    #[error("no signature algorithm provided")]
    MissingAlgorithm,
    #[error("signature algorithm is not supported: {0}")]
    UnsupportedAlgorithm(i64),
    #[error("unable to parse public key")]
    InvalidPublicKey,
    #[error("unable to parse signature")]
    InvalidSignature,
    #[error("signature is not valid for this payload and key")]
    VerificationFailed,
    #[error("CBOR error: {0}")]
    Encoding(#[from] CoseError),
}

/// Builder for a COSE_Sign1 to be signed by an external key capability.
#[derive(Debug, Clone, Default)]
pub struct Builder {
    payload: Option<Vec<u8>>,
    algorithm: Option<iana::Algorithm>,
    detached: bool,
}

impl Builder {
    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn signature_algorithm(mut self, algorithm: iana::Algorithm) -> Self {
        self.algorithm = Some(algorithm);
        self
    }

    /// The payload is covered by the signature but omitted from the emitted
    /// structure; both sides must be able to reconstruct it.
    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    pub fn prepare(self) -> Result<PreparedCoseSign1, Error> {
        let payload = self.payload.ok_or(Error::MissingPayload)?;
        let algorithm = self.algorithm.ok_or(Error::MissingAlgorithm)?;
        let protected = coset::ProtectedHeader {
            original_data: None,
            header: coset::HeaderBuilder::new().algorithm(algorithm).build(),
        };
        let signature_payload = sig_structure_data(
            SignatureContext::CoseSign1,
            protected.clone(),
            None,
            &[],
            &payload,
        );
        let cose_sign1 = coset::CoseSign1 {
            protected,
            unprotected: coset::Header::default(),
            payload: Some(payload),
            signature: vec![],
        };
        Ok(PreparedCoseSign1 {
            cose_sign1,
            signature_payload,
            detached: self.detached,
        })
    }
}

/// A COSE_Sign1 with its `Signature1` bytes ready for an external signer.
#[derive(Debug, Clone)]
pub struct PreparedCoseSign1 {
    cose_sign1: coset::CoseSign1,
    signature_payload: Vec<u8>,
    detached: bool,
}

impl PreparedCoseSign1 {
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// The bytes to be signed, i.e. the CBOR-encoded `Signature1` structure
    /// `["Signature1", protected, external_aad, payload]`.
    pub fn signature_payload(&self) -> &[u8] {
        &self.signature_payload
    }

    pub fn finalize(self, signature: Vec<u8>) -> MaybeTagged<coset::CoseSign1> {
        let mut cose_sign1 = self.cose_sign1;
        cose_sign1.signature = signature;
        if self.detached {
            cose_sign1.payload = None;
        }
        MaybeTagged::new(false, cose_sign1)
    }
}

/// Public key material for verification.
#[derive(Debug, Clone)]
pub enum VerificationKey {
    /// A SEC1-encoded elliptic curve point; the curve is implied by the
    /// signature algorithm.
    Sec1(Vec<u8>),
    /// A DER-encoded SubjectPublicKeyInfo (EC or RSA).
    Der(Vec<u8>),
}

/// Verify a COSE_Sign1 signature against the supplied public key.
///
/// For detached signatures the payload must be supplied via
/// `detached_payload`. Never panics or returns an error across this boundary:
/// unparseable structures, unsupported algorithms and key mismatches all map
/// to `false` with a diagnostic log.
pub fn verify(
    cose_sign1: &coset::CoseSign1,
    key: &VerificationKey,
    detached_payload: Option<&[u8]>,
) -> bool {
    match verify_inner(cose_sign1, key, detached_payload) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("COSE_Sign1 verification failed: {e}");
            false
        }
    }
}

fn verify_inner(
    cose_sign1: &coset::CoseSign1,
    key: &VerificationKey,
    detached_payload: Option<&[u8]>,
) -> Result<(), Error> {
    let payload = match (&cose_sign1.payload, detached_payload) {
        (Some(payload), _) => payload.as_slice(),
        (None, Some(payload)) => payload,
        (None, None) => return Err(Error::MissingPayload),
    };

    let signature_payload = sig_structure_data(
        SignatureContext::CoseSign1,
        cose_sign1.protected.clone(),
        None,
        &[],
        payload,
    );

    let algorithm = match &cose_sign1.protected.header.alg {
        Some(coset::RegisteredLabelWithPrivate::Assigned(alg)) => *alg,
        Some(coset::RegisteredLabelWithPrivate::PrivateUse(i)) => {
            return Err(Error::UnsupportedAlgorithm(*i))
        }
        _ => return Err(Error::MissingAlgorithm),
    };

    let signature = cose_sign1.signature.as_slice();

    match algorithm {
        iana::Algorithm::ES256 => verify_es256(key, &signature_payload, signature),
        iana::Algorithm::ES384 => verify_es384(key, &signature_payload, signature),
        iana::Algorithm::ES512 => verify_es512(key, &signature_payload, signature),
        iana::Algorithm::PS256 => {
            verify_rsa_pss::<sha2::Sha256>(key, &signature_payload, signature)
        }
        iana::Algorithm::PS384 => {
            verify_rsa_pss::<sha2::Sha384>(key, &signature_payload, signature)
        }
        iana::Algorithm::PS512 => {
            verify_rsa_pss::<sha2::Sha512>(key, &signature_payload, signature)
        }
        other => Err(Error::UnsupportedAlgorithm(other.to_i64())),
    }
}

fn verify_es256(key: &VerificationKey, payload: &[u8], signature: &[u8]) -> Result<(), Error> {
    let verifying_key = match key {
        VerificationKey::Sec1(bytes) => p256::ecdsa::VerifyingKey::from_sec1_bytes(bytes)
            .map_err(|_| Error::InvalidPublicKey)?,
        VerificationKey::Der(bytes) => {
            use p256::pkcs8::DecodePublicKey;
            let public_key = p256::PublicKey::from_public_key_der(bytes)
                .map_err(|_| Error::InvalidPublicKey)?;
            p256::ecdsa::VerifyingKey::from(&public_key)
        }
    };
    // Normalise raw COSE (r || s) signatures; fall back to DER.
    let signature = p256::ecdsa::Signature::from_slice(signature)
        .or_else(|_| p256::ecdsa::Signature::from_der(signature))
        .map_err(|_| Error::InvalidSignature)?;
    verifying_key
        .verify(payload, &signature)
        .map_err(|_| Error::VerificationFailed)
}

fn verify_es384(key: &VerificationKey, payload: &[u8], signature: &[u8]) -> Result<(), Error> {
    let verifying_key = match key {
        VerificationKey::Sec1(bytes) => p384::ecdsa::VerifyingKey::from_sec1_bytes(bytes)
            .map_err(|_| Error::InvalidPublicKey)?,
        VerificationKey::Der(bytes) => {
            use p384::pkcs8::DecodePublicKey;
            let public_key = p384::PublicKey::from_public_key_der(bytes)
                .map_err(|_| Error::InvalidPublicKey)?;
            p384::ecdsa::VerifyingKey::from(&public_key)
        }
    };
    let signature = p384::ecdsa::Signature::from_slice(signature)
        .or_else(|_| p384::ecdsa::Signature::from_der(signature))
        .map_err(|_| Error::InvalidSignature)?;
    verifying_key
        .verify(payload, &signature)
        .map_err(|_| Error::VerificationFailed)
}

fn verify_es512(key: &VerificationKey, payload: &[u8], signature: &[u8]) -> Result<(), Error> {
    let verifying_key = match key {
        VerificationKey::Sec1(bytes) => p521::ecdsa::VerifyingKey::from_sec1_bytes(bytes)
            .map_err(|_| Error::InvalidPublicKey)?,
        VerificationKey::Der(bytes) => {
            use p521::elliptic_curve::sec1::ToEncodedPoint;
            use p521::pkcs8::DecodePublicKey;
            let public_key = p521::PublicKey::from_public_key_der(bytes)
                .map_err(|_| Error::InvalidPublicKey)?;
            p521::ecdsa::VerifyingKey::from_encoded_point(&public_key.to_encoded_point(false))
                .map_err(|_| Error::InvalidPublicKey)?
        }
    };
    let signature = p521::ecdsa::Signature::from_slice(signature)
        .or_else(|_| p521::ecdsa::Signature::from_der(signature))
        .map_err(|_| Error::InvalidSignature)?;
    verifying_key
        .verify(payload, &signature)
        .map_err(|_| Error::VerificationFailed)
}

fn verify_rsa_pss<D>(key: &VerificationKey, payload: &[u8], signature: &[u8]) -> Result<(), Error>
where
    D: sha2::Digest + sha2::digest::FixedOutputReset,
{
    use rsa::pkcs8::DecodePublicKey;
    let VerificationKey::Der(bytes) = key else {
        return Err(Error::InvalidPublicKey);
    };
    let public_key =
        rsa::RsaPublicKey::from_public_key_der(bytes).map_err(|_| Error::InvalidPublicKey)?;
    let verifying_key = rsa::pss::VerifyingKey::<D>::new(public_key);
    let signature =
        rsa::pss::Signature::try_from(signature).map_err(|_| Error::InvalidSignature)?;
    verifying_key
        .verify(payload, &signature)
        .map_err(|_| Error::VerificationFailed)
}
