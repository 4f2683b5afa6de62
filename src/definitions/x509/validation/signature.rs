use const_oid::ObjectIdentifier;
use der::Encode;
use sha2::{Digest, Sha256, Sha384, Sha512};
use signature::hazmat::PrehashVerifier;
use x509_cert::Certificate;

pub const OID_ECDSA_WITH_SHA256: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
pub const OID_ECDSA_WITH_SHA384: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.3");
pub const OID_ECDSA_WITH_SHA512: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.4");

pub const OID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
pub const OID_EC_CURVE_P256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");
pub const OID_EC_CURVE_P384: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");

/// True if the certificate declares one of the permitted ECDSA signature
/// algorithms (SHA-256/384/512).
pub fn is_permitted_signature_algorithm(certificate: &Certificate) -> bool {
    let oid = certificate.signature_algorithm.oid;
    oid == OID_ECDSA_WITH_SHA256 || oid == OID_ECDSA_WITH_SHA384 || oid == OID_ECDSA_WITH_SHA512
}

/// Check that the issuer certificate signed the subject certificate.
///
/// Dispatches on the subject's declared signature algorithm for the digest
/// and on the issuer's SPKI curve parameters for the key.
pub fn issuer_signed_subject(subject: &Certificate, issuer: &Certificate) -> bool {
    let tbs = match subject.tbs_certificate.to_der() {
        Ok(tbs) => tbs,
        Err(e) => {
            tracing::error!("failed to encode subject tbs: {e:?}");
            return false;
        }
    };

    let Some(signature) = subject.signature.as_bytes() else {
        tracing::error!("subject signature is not octet-aligned");
        return false;
    };

    issuer_verifies(issuer, subject.signature_algorithm.oid, &tbs, signature)
}

/// Verify a signature produced by the issuer's key over arbitrary signed
/// data (a certificate tbs or a CRL tbs).
pub(crate) fn issuer_verifies(
    issuer: &Certificate,
    signature_algorithm: ObjectIdentifier,
    message: &[u8],
    signature: &[u8],
) -> bool {
    let prehash: Vec<u8> = if signature_algorithm == OID_ECDSA_WITH_SHA256 {
        Sha256::digest(message).to_vec()
    } else if signature_algorithm == OID_ECDSA_WITH_SHA384 {
        Sha384::digest(message).to_vec()
    } else if signature_algorithm == OID_ECDSA_WITH_SHA512 {
        Sha512::digest(message).to_vec()
    } else {
        tracing::info!("unsupported signature algorithm: {signature_algorithm}");
        return false;
    };

    verify_prehash_with_spki(issuer, &prehash, signature)
}

fn verify_prehash_with_spki(issuer: &Certificate, prehash: &[u8], signature: &[u8]) -> bool {
    let spki = &issuer.tbs_certificate.subject_public_key_info;
    if spki.algorithm.oid != OID_EC_PUBLIC_KEY {
        tracing::info!("issuer public key is not an EC key: {}", spki.algorithm.oid);
        return false;
    }
    let curve = spki
        .algorithm
        .parameters
        .as_ref()
        .and_then(|params| params.decode_as::<ObjectIdentifier>().ok());
    let Some(point) = spki.subject_public_key.as_bytes() else {
        tracing::error!("issuer public key is not octet-aligned");
        return false;
    };

    if curve == Some(OID_EC_CURVE_P256) {
        let Ok(key) = p256::ecdsa::VerifyingKey::from_sec1_bytes(point) else {
            tracing::error!("failed to decode issuer P-256 public key");
            return false;
        };
        let Ok(sig) = p256::ecdsa::Signature::from_der(signature) else {
            tracing::error!("failed to parse subject signature");
            return false;
        };
        key.verify_prehash(prehash, &sig).is_ok()
    } else if curve == Some(OID_EC_CURVE_P384) {
        let Ok(key) = p384::ecdsa::VerifyingKey::from_sec1_bytes(point) else {
            tracing::error!("failed to decode issuer P-384 public key");
            return false;
        };
        let Ok(sig) = p384::ecdsa::Signature::from_der(signature) else {
            tracing::error!("failed to parse subject signature");
            return false;
        };
        key.verify_prehash(prehash, &sig).is_ok()
    } else {
        tracing::info!("unsupported issuer curve: {curve:?}");
        false
    }
}
