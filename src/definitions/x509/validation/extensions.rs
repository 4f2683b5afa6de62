//! Profile checks for mdoc reader authentication certificates, following the
//! certificate requirements in ISO 18013-5 Annex B. Every certificate in the
//! trust path must pass the whole battery.

use const_oid::{db, AssociatedOid, ObjectIdentifier};
use der::Decode;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::{
    AuthorityKeyIdentifier, ExtendedKeyUsage, IssuerAltName, KeyUsage, KeyUsages,
    SubjectKeyIdentifier,
};
use x509_cert::Certificate;

use super::validity::is_short_lived;

type Error = String;

pub const MDOC_READER_AUTH_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.0.18013.5.1.6");

/// Acceptable serial number entropy, in bits.
const SERIAL_BITS_MIN: u32 = 63;
const SERIAL_BITS_MAX: u32 = 160;

fn find_extension<'a>(
    certificate: &'a Certificate,
    oid: ObjectIdentifier,
) -> Option<&'a x509_cert::ext::Extension> {
    certificate
        .tbs_certificate
        .extensions
        .iter()
        .flatten()
        .find(|ext| ext.extn_id == oid)
}

/// Run the full reader profile battery over one certificate.
pub fn validate_reader_profile(certificate: &Certificate) -> Vec<Error> {
    let mut errors = vec![];
    errors.extend(check_authority_key_identifier(certificate));
    errors.extend(check_subject_key_identifier(certificate));
    errors.extend(check_key_usage(certificate));
    errors.extend(check_extended_key_usage(certificate));
    errors.extend(check_serial_number(certificate));
    errors.extend(check_issuer_alternative_name(certificate));
    if common_name(certificate).is_none() {
        errors.push("subject: common name is missing".to_string());
    }
    errors
}

fn check_authority_key_identifier(certificate: &Certificate) -> Option<Error> {
    let Some(ext) = find_extension(certificate, AuthorityKeyIdentifier::OID) else {
        return Some("AuthorityKeyIdentifier: required extension not found".to_string());
    };
    match AuthorityKeyIdentifier::from_der(ext.extn_value.as_bytes()) {
        Ok(aki) if aki.key_identifier.is_some() => None,
        Ok(_) => Some("AuthorityKeyIdentifier: key identifier is missing".to_string()),
        Err(e) => Some(format!("AuthorityKeyIdentifier: failed to decode: {e}")),
    }
}

fn check_subject_key_identifier(certificate: &Certificate) -> Option<Error> {
    let Some(ext) = find_extension(certificate, SubjectKeyIdentifier::OID) else {
        return Some("SubjectKeyIdentifier: required extension not found".to_string());
    };
    match SubjectKeyIdentifier::from_der(ext.extn_value.as_bytes()) {
        Ok(_) => None,
        Err(e) => Some(format!("SubjectKeyIdentifier: failed to decode: {e}")),
    }
}

fn check_key_usage(certificate: &Certificate) -> Option<Error> {
    let Some(ext) = find_extension(certificate, KeyUsage::OID) else {
        return Some("KeyUsage: required extension not found".to_string());
    };
    if !ext.critical {
        tracing::warn!("expected KeyUsage extension to be critical");
    }
    match KeyUsage::from_der(ext.extn_value.as_bytes()) {
        Ok(ku) if ku.0.is_empty() => Some("KeyUsage: no usages asserted".to_string()),
        Ok(ku) if !ku.0.contains(KeyUsages::DigitalSignature) => {
            Some("KeyUsage: digitalSignature is not asserted".to_string())
        }
        Ok(_) => None,
        Err(e) => Some(format!("KeyUsage: failed to decode: {e}")),
    }
}

/// ExtendedKeyUsage must assert the mdoc reader authentication OID. A
/// certificate without the extension is tolerated only when it is
/// short-lived.
fn check_extended_key_usage(certificate: &Certificate) -> Option<Error> {
    let Some(ext) = find_extension(certificate, ExtendedKeyUsage::OID) else {
        if is_short_lived(certificate) {
            return None;
        }
        return Some(
            "ExtendedKeyUsage: required extension not found and certificate is not short-lived"
                .to_string(),
        );
    };
    match ExtendedKeyUsage::from_der(ext.extn_value.as_bytes()) {
        Ok(eku) if eku.0.contains(&MDOC_READER_AUTH_OID) => None,
        Ok(eku) => Some(format!(
            "ExtendedKeyUsage: expected '{MDOC_READER_AUTH_OID}', found '{:?}'",
            eku.0
        )),
        Err(e) => Some(format!("ExtendedKeyUsage: failed to decode: {e}")),
    }
}

fn check_serial_number(certificate: &Certificate) -> Option<Error> {
    let bytes = certificate.tbs_certificate.serial_number.as_bytes();
    let mut iter = bytes.iter().skip_while(|b| **b == 0);
    let bits = match iter.next() {
        Some(first) => {
            let rest = iter.count() as u32;
            (8 - first.leading_zeros()) + rest * 8
        }
        None => 0,
    };
    if (SERIAL_BITS_MIN..=SERIAL_BITS_MAX).contains(&bits) {
        None
    } else {
        Some(format!(
            "SerialNumber: bit length {bits} outside of [{SERIAL_BITS_MIN}, {SERIAL_BITS_MAX}]"
        ))
    }
}

fn check_issuer_alternative_name(certificate: &Certificate) -> Option<Error> {
    let Some(ext) = find_extension(certificate, IssuerAltName::OID) else {
        return Some("IssuerAlternativeName: required extension not found".to_string());
    };
    let ian = match IssuerAltName::from_der(ext.extn_value.as_bytes()) {
        Ok(ian) => ian,
        Err(e) => return Some(format!("IssuerAlternativeName: failed to decode: {e}")),
    };
    let acceptable = ian.0.iter().any(|name| {
        matches!(
            name,
            GeneralName::Rfc822Name(_)
                | GeneralName::DnsName(_)
                | GeneralName::UniformResourceIdentifier(_)
                | GeneralName::IpAddress(_)
        )
    });
    if acceptable {
        None
    } else {
        Some("IssuerAlternativeName: no acceptable GeneralName entry".to_string())
    }
}

/// Extract the subject common name, if present.
pub fn common_name(certificate: &Certificate) -> Option<String> {
    certificate
        .tbs_certificate
        .subject
        .0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .find(|atv| atv.oid == db::rfc4519::CN)
        .and_then(|atv| {
            atv.value
                .decode_as::<der::asn1::Utf8StringRef>()
                .map(|s| s.to_string())
                .or_else(|_| {
                    atv.value
                        .decode_as::<der::asn1::PrintableStringRef>()
                        .map(|s| s.to_string())
                })
                .ok()
        })
}

pub fn common_name_or_unknown(certificate: &Certificate) -> String {
    common_name(certificate).unwrap_or_else(|| "unknown".to_string())
}
