//! Reader certificate trust-path validation.
//!
//! Two strategies, selected by the shape of the configured anchor set:
//! an ordinary leaf-to-root walk when only self-signed roots are trusted, and
//! a trust-by-chaining fixpoint when intermediate CAs are trusted directly.
//! Independently of path construction, every certificate in the path must
//! pass the reader profile battery, and a separate per-certificate CRL pass
//! runs wherever a distribution point is present.

use serde::Serialize;
use time::OffsetDateTime;
use x509_cert::Certificate;

pub mod extensions;
pub mod signature;
pub mod validity;

use extensions::{common_name, common_name_or_unknown, validate_reader_profile};
use signature::{is_permitted_signature_algorithm, issuer_signed_subject};
use validity::{check_max_validity_period, check_validity_period_at};

use super::crl::{check_certificate_revocation, CrlFetcher, RevocationStatus};
use super::trust_anchor::TrustAnchorRegistry;
use super::x5chain::X5Chain;

/// Options for certificate chain validation.
#[derive(Debug, Clone, Default)]
pub struct ValidationOptions {
    /// The time to use for validity period checks.
    /// If `None`, the current system time is used.
    pub validation_time: Option<OffsetDateTime>,
}

impl ValidationOptions {
    fn validation_time(&self) -> OffsetDateTime {
        self.validation_time.unwrap_or_else(OffsetDateTime::now_utc)
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ValidationOutcome {
    pub errors: Vec<String>,
    /// Warnings from skipped revocation checks. Kept apart from `errors`:
    /// a disabled fetcher is not a security failure, while a revoked
    /// certificate or a failed fetch from a configured fetcher is.
    pub revocation_warnings: Vec<String>,
}

impl ValidationOutcome {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// The §9.1.4 reader authentication result handed to the application layer:
/// whether the reader's signature verified, whether its certificate chain
/// validates to a configured anchor, and who the reader claims to be.
///
/// A failed outcome does not abort the exchange; it is shown to the holder,
/// whose consent remains the gate.
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReaderAuthOutcome {
    #[serde(skip)]
    pub certificate_chain: Option<X5Chain>,
    pub signature_valid: bool,
    pub trust_path_valid: bool,
    pub common_name: Option<String>,
    pub errors: Vec<String>,
}

impl ReaderAuthOutcome {
    pub fn is_success(&self) -> bool {
        self.signature_valid && self.trust_path_valid
    }
}

/// Validate the reader certificate chain against the configured anchors.
pub fn validate_reader_trust_path<C: CrlFetcher>(
    x5chain: &X5Chain,
    trust_anchors: &TrustAnchorRegistry,
    crl_fetcher: &C,
    options: &ValidationOptions,
) -> ValidationOutcome {
    let mut outcome = ValidationOutcome::default();
    let validation_time = options.validation_time();

    if trust_anchors.is_empty() {
        outcome
            .errors
            .push("no trust anchors are configured".to_string());
        return outcome;
    }

    let path: Vec<&Certificate> = x5chain.iter().map(|c| &c.inner).collect();

    if trust_anchors.roots_only() {
        validate_path_to_anchors(&path, trust_anchors, validation_time, &mut outcome);
    } else {
        // Intermediates are directly trusted: run the documented
        // trust-by-chaining walk, then re-validate the ordered path against
        // the grown trusted set.
        match chain_into_trusted_set(&path, trust_anchors) {
            Ok(trusted) => {
                validate_path_to_anchors(&path, &trusted, validation_time, &mut outcome)
            }
            Err(e) => outcome.errors.push(e),
        }
    }

    // Profile battery: all certificates in the path, regardless of how path
    // validation fared.
    for certificate in &path {
        let context = common_name_or_unknown(certificate);
        outcome.errors.extend(
            validate_reader_profile(certificate)
                .into_iter()
                .map(|e| format!("{context}: {e}")),
        );
        if let Some(e) = check_max_validity_period(certificate) {
            outcome.errors.push(format!("{context}: {e}"));
        }
        if !is_permitted_signature_algorithm(certificate) {
            outcome.errors.push(format!(
                "{context}: signature algorithm is not ECDSA with SHA-256/384/512"
            ));
        }
    }

    // Separate revocation pass, certificate by certificate against its
    // issuer in the path (the last certificate checks against the anchor
    // that signed it, when one is found).
    for window in path.windows(2) {
        revocation_pass(crl_fetcher, window[0], window[1], &mut outcome);
    }
    if let Some(last) = path.last() {
        if let Some(anchor) = find_signing_anchor(last, trust_anchors) {
            revocation_pass(crl_fetcher, last, anchor, &mut outcome);
        }
    }

    outcome
}

fn revocation_pass<C: CrlFetcher>(
    crl_fetcher: &C,
    subject: &Certificate,
    issuer: &Certificate,
    outcome: &mut ValidationOutcome,
) {
    let context = common_name_or_unknown(subject);
    match check_certificate_revocation(crl_fetcher, subject, issuer) {
        Ok(RevocationStatus::Valid) => {}
        Ok(RevocationStatus::Revoked) => {
            outcome
                .errors
                .push(format!("{context}: certificate is revoked"));
        }
        Ok(RevocationStatus::Skipped) => {
            outcome
                .revocation_warnings
                .push(format!("{context}: CRL check skipped, fetcher disabled"));
        }
        Err(e) => {
            outcome.errors.push(format!("{context}: CRL check: {e}"));
        }
    }
}

/// Walk the ordered path leaf to root: verify each issuer link, check
/// validity periods, and require the terminal certificate to be - or to be
/// signed by - one of the configured anchors.
fn validate_path_to_anchors(
    path: &[&Certificate],
    trust_anchors: &TrustAnchorRegistry,
    validation_time: OffsetDateTime,
    outcome: &mut ValidationOutcome,
) {
    for certificate in path {
        let context = common_name_or_unknown(certificate);
        outcome.errors.extend(
            check_validity_period_at(certificate, validation_time)
                .into_iter()
                .map(|e| format!("{context}: {e}")),
        );
    }

    for window in path.windows(2) {
        let (subject, issuer) = (window[0], window[1]);
        if !issuer_signed_subject(subject, issuer) {
            outcome.errors.push(format!(
                "certificate '{}' not signed by '{}'",
                common_name_or_unknown(subject),
                common_name_or_unknown(issuer)
            ));
            return;
        }
    }

    let last = path.last().expect("path is never empty");
    let terminal_is_anchor = trust_anchors.anchors.iter().any(|anchor| {
        anchor.inner.tbs_certificate.subject == last.tbs_certificate.subject
            && anchor.inner.tbs_certificate.subject_public_key_info
                == last.tbs_certificate.subject_public_key_info
    });
    if terminal_is_anchor {
        return;
    }

    if find_signing_anchor(last, trust_anchors).is_none() {
        outcome.errors.push(format!(
            "no configured trust anchor for certificate '{}'",
            common_name_or_unknown(last)
        ));
    }
}

fn find_signing_anchor<'a>(
    certificate: &Certificate,
    trust_anchors: &'a TrustAnchorRegistry,
) -> Option<&'a Certificate> {
    trust_anchors
        .anchors_for_issuer(&certificate.tbs_certificate.issuer)
        .into_iter()
        .find(|anchor| issuer_signed_subject(certificate, anchor))
}

/// Trust-by-chaining: repeatedly move any path certificate whose issuer
/// matches an already-trusted subject into the trusted set, in issuance
/// order; fail if a full pass makes no progress while untrusted certificates
/// remain.
///
/// This reproduces the documented heuristic as-is. Its semantics when several
/// intermediates are trusted at once are exactly what the walk produces, no
/// more.
fn chain_into_trusted_set(
    path: &[&Certificate],
    trust_anchors: &TrustAnchorRegistry,
) -> Result<TrustAnchorRegistry, String> {
    let mut trusted = trust_anchors.clone();
    let mut untrusted: Vec<&Certificate> = path
        .iter()
        .copied()
        // Certificates already directly trusted need no chaining.
        .filter(|certificate| {
            !trusted.anchors.iter().any(|anchor| {
                anchor.inner.tbs_certificate.subject == certificate.tbs_certificate.subject
                    && anchor.inner.tbs_certificate.subject_public_key_info
                        == certificate.tbs_certificate.subject_public_key_info
            })
        })
        .collect();

    while !untrusted.is_empty() {
        let position = untrusted.iter().position(|certificate| {
            trusted.anchors.iter().any(|anchor| {
                anchor.inner.tbs_certificate.subject == certificate.tbs_certificate.issuer
                    && issuer_signed_subject(certificate, &anchor.inner)
            })
        });
        match position {
            Some(i) => {
                let certificate = untrusted.remove(i);
                match super::x5chain::CertificateWithDer::from_cert(certificate.clone()) {
                    Ok(with_der) => trusted.anchors.push(with_der),
                    Err(e) => return Err(format!("unable to re-encode chained certificate: {e}")),
                }
            }
            None => {
                return Err(format!(
                    "trust-by-chaining made no progress with {} certificate(s) left untrusted",
                    untrusted.len()
                ))
            }
        }
    }

    Ok(trusted)
}

/// Assemble the full [ReaderAuthOutcome] for one doc-request, combining
/// signature verification (done by the caller) with trust-path validation.
pub fn reader_auth_outcome<C: CrlFetcher>(
    x5chain: Option<X5Chain>,
    signature_valid: bool,
    trust_anchors: &TrustAnchorRegistry,
    crl_fetcher: &C,
    options: &ValidationOptions,
) -> ReaderAuthOutcome {
    let Some(x5chain) = x5chain else {
        return ReaderAuthOutcome {
            certificate_chain: None,
            signature_valid,
            trust_path_valid: false,
            common_name: None,
            errors: vec!["reader did not present a certificate chain".to_string()],
        };
    };

    let validation = validate_reader_trust_path(&x5chain, trust_anchors, crl_fetcher, options);
    let common_name = common_name(x5chain.end_entity_certificate());

    ReaderAuthOutcome {
        signature_valid,
        trust_path_valid: validation.success(),
        common_name,
        errors: validation.errors,
        certificate_chain: Some(x5chain),
    }
}
