use time::{Duration, OffsetDateTime};
use x509_cert::Certificate;

/// Maximum validity period for a reader certificate.
pub const MAX_VALIDITY_DAYS: i64 = 1187;

/// A certificate with a lifetime this short is tolerated without a CRL
/// distribution point or extended key usage extension.
pub const SHORT_LIVED_DAYS: i64 = 2;

#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum Error {
    #[error("expired")]
    Expired,
    #[error("not yet valid")]
    NotYetValid,
    #[error("validity period exceeds the permitted maximum")]
    ValidityPeriodTooLong,
}

/// Check certificate validity period against a specific time.
pub fn check_validity_period_at(certificate: &Certificate, at: OffsetDateTime) -> Vec<Error> {
    let validity = certificate.tbs_certificate.validity;
    let mut errors: Vec<Error> = vec![];

    let not_after = OffsetDateTime::from(validity.not_after.to_system_time());
    let not_before = OffsetDateTime::from(validity.not_before.to_system_time());

    if not_after < at {
        errors.push(Error::Expired);
    }
    if not_before > at {
        errors.push(Error::NotYetValid);
    }

    errors
}

pub fn validity_period(certificate: &Certificate) -> Duration {
    let validity = certificate.tbs_certificate.validity;
    let not_after = OffsetDateTime::from(validity.not_after.to_system_time());
    let not_before = OffsetDateTime::from(validity.not_before.to_system_time());
    not_after - not_before
}

pub fn check_max_validity_period(certificate: &Certificate) -> Option<Error> {
    if validity_period(certificate) > Duration::days(MAX_VALIDITY_DAYS) {
        Some(Error::ValidityPeriodTooLong)
    } else {
        None
    }
}

pub fn is_short_lived(certificate: &Certificate) -> bool {
    validity_period(certificate) <= Duration::days(SHORT_LIVED_DAYS)
}
