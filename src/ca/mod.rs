//! Certificate Authority: the issuance orchestrator (§4.2). Ties the
//! Issuer Registry, Serial Allocator, OCSP Generator, policy interfaces
//! and Orphan Queue together into `IssuePrecertificate` and
//! `IssueCertificateForPrecertificate`.
//!
//! The precertificate/certificate DER is hand-built via [`builder`] and
//! signed through the issuer's [`crate::policy::CertificateSigner`],
//! the same "assemble then `sign_raw`" shape [`crate::ocsp::generator`]
//! and [`crate::crl`] already use.

pub mod builder;
pub mod csr;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};

use crate::asn1;
use crate::audit;
use crate::ca::builder::IssuanceRequest;
use crate::error::{CaError, CaResult};
use crate::issuer::{name_id_from_subject_der, IssuerNameId, IssuerRegistry, KeyAlgorithm};
use crate::metrics::CaMetrics;
use crate::ocsp::generator::{CertStatus, OcspGenerator, OcspRequest};
use crate::orphan::{OrphanQueue, OrphanedArtifact};
use crate::policy::{EcdsaAllowList, KeyPolicy, PolicyAuthority};
use crate::sa::StorageAuthority;
use crate::serial::{Serial, SerialAllocator};

/// A request to begin issuance: a CSR plus the registration it belongs
/// to, and an optional pinned issuer.
pub struct IssuePrecertificateRequest {
    pub csr_der: Vec<u8>,
    pub registration_id: i64,
    pub issuer_name_id: Option<IssuerNameId>,
}

/// A request to turn an already-signed precertificate into a final
/// certificate once its SCTs are available.
pub struct IssueCertificateForPrecertificateRequest {
    pub precert_der: Vec<u8>,
    pub scts: Vec<Vec<u8>>,
    pub registration_id: i64,
    pub order_id: i64,
}

pub struct CertificateAuthority {
    registry: Arc<IssuerRegistry>,
    sa: Arc<dyn StorageAuthority>,
    ocsp_generator: Arc<OcspGenerator>,
    orphan_queue: Arc<OrphanQueue>,
    policy: Arc<dyn PolicyAuthority>,
    key_policy: Arc<dyn KeyPolicy>,
    ecdsa_allow_list: Arc<EcdsaAllowList>,
    serial_allocator: SerialAllocator,
    validity: Duration,
    backdate: Duration,
    max_dns_names: usize,
    metrics: Arc<CaMetrics>,
}

impl CertificateAuthority {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<IssuerRegistry>,
        sa: Arc<dyn StorageAuthority>,
        ocsp_generator: Arc<OcspGenerator>,
        orphan_queue: Arc<OrphanQueue>,
        policy: Arc<dyn PolicyAuthority>,
        key_policy: Arc<dyn KeyPolicy>,
        ecdsa_allow_list: Arc<EcdsaAllowList>,
        serial_prefix: u8,
        validity: StdDuration,
        backdate: StdDuration,
        max_dns_names: usize,
        metrics: Arc<CaMetrics>,
    ) -> CaResult<Self> {
        Ok(Self {
            registry,
            sa,
            ocsp_generator,
            orphan_queue,
            policy,
            key_policy,
            ecdsa_allow_list,
            serial_allocator: SerialAllocator::new(serial_prefix)?,
            validity: Duration::from_std(validity).map_err(|e| CaError::internal(e.to_string()))?,
            backdate: Duration::from_std(backdate).map_err(|e| CaError::internal(e.to_string()))?,
            max_dns_names,
            metrics,
        })
    }

    pub async fn issue_precertificate(&self, request: IssuePrecertificateRequest) -> CaResult<Vec<u8>> {
        if request.registration_id == 0 {
            return Err(CaError::Malformed("registration ID must be nonzero".into()));
        }

        let serial = self.serial_allocator.allocate()?;
        let now = Utc::now();
        let not_before = now - self.backdate;
        let not_after = not_before + self.validity - Duration::seconds(1);

        self.sa.add_serial(&serial, request.registration_id, now).await?;

        let parsed = csr::parse_and_verify(&request.csr_der)?;
        self.key_policy.good_key(&parsed.public_key_bytes, parsed.public_key_algorithm)?;
        let (common_name, dns_names) = normalize_identifiers(&parsed, self.max_dns_names)?;
        self.policy.willing_to_issue(&dns_names)?;

        let issuer = self.select_issuer(request.issuer_name_id, parsed.public_key_algorithm, request.registration_id)?;
        if issuer.not_after < not_after {
            return Err(CaError::PolicyViolation(format!(
                "issuer {} expires before the requested NotAfter",
                issuer.name
            )));
        }

        let ocsp_response = self
            .ocsp_generator
            .generate(OcspRequest {
                serial,
                issuer_name_id: Some(issuer.name_id),
                issuer_id: Some(issuer.id),
                status: CertStatus::Good,
                revocation_reason: 0,
                revoked_at_ns: 0,
            })
            .await?;

        let issuance_request = IssuanceRequest {
            serial,
            spki_der: parsed.spki_der,
            key_algorithm: parsed.public_key_algorithm,
            common_name,
            dns_names,
            not_before,
            not_after,
            include_ct_poison: true,
            must_staple: parsed.must_staple,
            sct_list: Vec::new(),
        };
        let der = sign_issuance(&issuer, &issuance_request, "precert", &self.metrics)?;

        match self
            .sa
            .add_precertificate(&serial, &der, &ocsp_response, issuer.id.0, request.registration_id, now)
            .await
        {
            Ok(()) => Ok(der),
            Err(e) => {
                audit::orphaning_line(
                    true,
                    &serial.to_hex(),
                    &hex::encode(&der),
                    issuer.id.0,
                    request.registration_id,
                    0,
                    &e.to_string(),
                );
                self.orphan_queue
                    .enqueue_orphan(OrphanedArtifact {
                        der,
                        ocsp_response,
                        registration_id: request.registration_id,
                        issuer_id: issuer.id.0,
                        is_precert: true,
                    })
                    .await;
                Err(e)
            }
        }
    }

    pub async fn issue_certificate_for_precertificate(
        &self,
        request: IssueCertificateForPrecertificateRequest,
    ) -> CaResult<Vec<u8>> {
        if request.scts.is_empty() {
            return Err(CaError::Malformed("SCT list must not be empty".into()));
        }

        let precert = parse_precertificate(&request.precert_der)?;

        match self.sa.get_certificate(&precert.serial).await {
            Ok(_) => {
                return Err(CaError::internal(format!(
                    "duplicate final certificate request for serial {}",
                    precert.serial
                )));
            }
            Err(e) if e.kind() == crate::error::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let issuer = self.registry.lookup_by_name_id(precert.issuer_name_id)?;

        let issuance_request = IssuanceRequest {
            serial: precert.serial,
            spki_der: precert.spki_der,
            key_algorithm: precert.key_algorithm,
            common_name: precert.common_name,
            dns_names: precert.dns_names,
            not_before: precert.not_before,
            not_after: precert.not_after,
            include_ct_poison: false,
            must_staple: precert.must_staple,
            sct_list: request.scts,
        };
        let der = sign_issuance(&issuer, &issuance_request, "cert", &self.metrics)?;

        let now = Utc::now();
        match self
            .sa
            .add_certificate(&precert.serial, &der, issuer.id.0, request.registration_id, request.order_id, now)
            .await
        {
            Ok(()) => Ok(der),
            Err(e) => {
                audit::orphaning_line(
                    false,
                    &precert.serial.to_hex(),
                    &hex::encode(&der),
                    issuer.id.0,
                    request.registration_id,
                    request.order_id,
                    &e.to_string(),
                );
                self.orphan_queue
                    .enqueue_orphan(OrphanedArtifact {
                        der,
                        ocsp_response: Vec::new(),
                        registration_id: request.registration_id,
                        issuer_id: issuer.id.0,
                        is_precert: false,
                    })
                    .await;
                Err(e)
            }
        }
    }

    /// Picks the signing issuer: an explicit pin wins outright;
    /// otherwise the CSR's public-key algorithm decides, with an
    /// ECDSA request demoted to the RSA issuer unless the requesting
    /// account is on the ECDSA allow-list.
    fn select_issuer(
        &self,
        pinned: Option<IssuerNameId>,
        algorithm: KeyAlgorithm,
        registration_id: i64,
    ) -> CaResult<Arc<crate::issuer::Issuer>> {
        if let Some(name_id) = pinned {
            return self.registry.lookup_by_name_id(name_id);
        }
        if algorithm == KeyAlgorithm::Ecdsa && !self.ecdsa_allow_list.allows(registration_id) {
            return self.registry.lookup_by_algorithm(KeyAlgorithm::Rsa);
        }
        self.registry.lookup_by_algorithm(algorithm)
    }
}

fn sign_issuance(
    issuer: &crate::issuer::Issuer,
    request: &IssuanceRequest,
    purpose: &'static str,
    metrics: &Arc<CaMetrics>,
) -> CaResult<Vec<u8>> {
    let tbs = builder::build_tbs_certificate(issuer, request)?;
    let signature = issuer.signer.sign_raw(&tbs).map_err(|e| {
        metrics.sign_error_count.with_label_values(&["HSM"]).inc();
        e
    })?;
    metrics.signature_count.with_label_values(&[purpose, &issuer.name]).inc();
    Ok(asn1::sequence(
        &[
            tbs,
            asn1::algorithm_identifier(issuer.signer.signature_algorithm_oid()),
            asn1::bit_string(&signature),
        ]
        .concat(),
    ))
}

/// Lowercases and deduplicates the CSR's DNS names, enforces the
/// configured cap, and promotes the first short DNS name into the
/// common name when the CSR didn't carry one.
fn normalize_identifiers(parsed: &csr::ParsedCsr, max_dns_names: usize) -> CaResult<(Option<String>, Vec<String>)> {
    let mut dns_names: Vec<String> = parsed.dns_names.iter().map(|n| n.to_ascii_lowercase()).collect();
    dns_names.sort();
    dns_names.dedup();
    if dns_names.len() > max_dns_names {
        return Err(CaError::BadCsr(format!(
            "too many DNS SANs: {} exceeds the configured maximum of {}",
            dns_names.len(),
            max_dns_names
        )));
    }

    let mut common_name = parsed
        .common_name
        .as_ref()
        .map(|cn| cn.to_ascii_lowercase())
        .filter(|cn| !cn.is_empty());

    if common_name.is_none() {
        common_name = dns_names.iter().find(|n| n.len() <= 64).cloned();
    }

    if common_name.is_none() && dns_names.is_empty() {
        return Err(CaError::BadCsr("CSR carries neither a common name nor a DNS SAN".into()));
    }
    if let Some(cn) = &common_name {
        if cn.len() > 64 {
            return Err(CaError::BadCsr("common name exceeds 64 characters".into()));
        }
    }

    Ok((common_name, dns_names))
}

/// The subset of a precertificate's TBSCertificate this CA needs to
/// finalize it into a certificate, parsed by hand the same way
/// [`csr::parse_and_verify`] walks a CSR: this CA built the precert
/// itself via [`builder::build_tbs_certificate`], so the shape is known
/// in advance rather than guessed at.
struct ParsedPrecertificate {
    serial: Serial,
    issuer_name_id: IssuerNameId,
    not_before: chrono::DateTime<Utc>,
    not_after: chrono::DateTime<Utc>,
    common_name: Option<String>,
    dns_names: Vec<String>,
    spki_der: Vec<u8>,
    key_algorithm: KeyAlgorithm,
    must_staple: bool,
}

const OID_RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";
const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_SUBJECT_ALT_NAME: &str = "2.5.29.17";
const OID_TLS_FEATURE: &str = "1.3.6.1.5.5.7.1.24";

fn parse_precertificate(der: &[u8]) -> CaResult<ParsedPrecertificate> {
    let (cert_tag, cert_content, _) = asn1::read_tlv(der)?;
    if cert_tag != asn1::TAG_SEQUENCE {
        return Err(CaError::Malformed("not a DER Certificate".into()));
    }
    let (tbs_tag, tbs_content, _) = asn1::read_tlv(cert_content)?;
    if tbs_tag != asn1::TAG_SEQUENCE {
        return Err(CaError::Malformed("missing TBSCertificate".into()));
    }

    let (version_tag, _, rest) = asn1::read_tlv(tbs_content)?;
    if version_tag != 0xA0 {
        return Err(CaError::Malformed("precertificate missing version".into()));
    }
    let (serial_tag, serial_bytes, rest) = asn1::read_tlv(rest)?;
    if serial_tag != asn1::TAG_INTEGER {
        return Err(CaError::Malformed("precertificate missing serialNumber".into()));
    }
    let serial = serial_from_der_integer(serial_bytes)?;

    let (_, _, rest) = asn1::read_tlv(rest)?; // signature AlgorithmIdentifier

    let issuer_start = rest;
    let (issuer_tag, _, rest) = asn1::read_tlv(issuer_start)?;
    if issuer_tag != asn1::TAG_SEQUENCE {
        return Err(CaError::Malformed("precertificate missing issuer".into()));
    }
    let issuer_raw = &issuer_start[..issuer_start.len() - rest.len()];
    let issuer_name_id = name_id_from_subject_der(issuer_raw);

    let (validity_tag, validity_content, rest) = asn1::read_tlv(rest)?;
    if validity_tag != asn1::TAG_SEQUENCE {
        return Err(CaError::Malformed("precertificate missing validity".into()));
    }
    let (not_before, not_after) = parse_validity(validity_content)?;

    let (subject_tag, subject_content, rest) = asn1::read_tlv(rest)?;
    if subject_tag != asn1::TAG_SEQUENCE {
        return Err(CaError::Malformed("precertificate missing subject".into()));
    }
    let common_name = csr::parse_common_name(subject_content)?;

    let spki_start = rest;
    let (spki_tag, spki_content, rest) = asn1::read_tlv(spki_start)?;
    if spki_tag != asn1::TAG_SEQUENCE {
        return Err(CaError::Malformed("precertificate missing subjectPublicKeyInfo".into()));
    }
    let spki_der = spki_start[..spki_start.len() - rest.len()].to_vec();
    let key_algorithm = spki_key_algorithm(spki_content)?;

    let mut dns_names = Vec::new();
    let mut must_staple = false;
    if !rest.is_empty() {
        let (ext_outer_tag, ext_outer_content, _) = asn1::read_tlv(rest)?;
        if ext_outer_tag == 0xA3 {
            let (seq_tag, extensions_content, _) = asn1::read_tlv(ext_outer_content)?;
            if seq_tag != asn1::TAG_SEQUENCE {
                return Err(CaError::Malformed("malformed precertificate extensions".into()));
            }
            let mut extensions = extensions_content;
            while !extensions.is_empty() {
                let (ext_tag, ext_content, ext_rest) = asn1::read_tlv(extensions)?;
                if ext_tag != asn1::TAG_SEQUENCE {
                    return Err(CaError::Malformed("malformed Extension".into()));
                }
                extensions = ext_rest;

                let (oid_tag, oid_bytes, rest) = asn1::read_tlv(ext_content)?;
                if oid_tag != asn1::TAG_OID {
                    return Err(CaError::Malformed("malformed Extension extnID".into()));
                }
                let extn_id = asn1::decode_oid(oid_bytes)?;

                let (next_tag, next_content, rest) = asn1::read_tlv(rest)?;
                let octet_content = if next_tag == asn1::TAG_BOOLEAN {
                    let (tag, content, _) = asn1::read_tlv(rest)?;
                    if tag != asn1::TAG_OCTET_STRING {
                        return Err(CaError::Malformed("malformed Extension extnValue".into()));
                    }
                    content
                } else if next_tag == asn1::TAG_OCTET_STRING {
                    next_content
                } else {
                    return Err(CaError::Malformed("malformed Extension extnValue".into()));
                };

                match extn_id.as_str() {
                    OID_SUBJECT_ALT_NAME => dns_names = csr::parse_subject_alt_names(octet_content)?,
                    OID_TLS_FEATURE => must_staple = tls_feature_requests_must_staple(octet_content)?,
                    _ => {}
                }
            }
        }
    }

    Ok(ParsedPrecertificate {
        serial,
        issuer_name_id,
        not_before,
        not_after,
        common_name,
        dns_names,
        spki_der,
        key_algorithm,
        must_staple,
    })
}

fn serial_from_der_integer(bytes: &[u8]) -> CaResult<Serial> {
    let mut arr = [0u8; crate::serial::SERIAL_LEN];
    let take = bytes.len().min(crate::serial::SERIAL_LEN);
    arr[crate::serial::SERIAL_LEN - take..].copy_from_slice(&bytes[bytes.len() - take..]);
    Ok(Serial(arr))
}

fn parse_validity(content: &[u8]) -> CaResult<(chrono::DateTime<Utc>, chrono::DateTime<Utc>)> {
    let (nb_tag, nb_bytes, rest) = asn1::read_tlv(content)?;
    if nb_tag != asn1::TAG_GENERALIZED_TIME {
        return Err(CaError::Malformed("malformed notBefore".into()));
    }
    let (na_tag, na_bytes, _) = asn1::read_tlv(rest)?;
    if na_tag != asn1::TAG_GENERALIZED_TIME {
        return Err(CaError::Malformed("malformed notAfter".into()));
    }
    Ok((
        asn1::parse_generalized_time(nb_bytes)?,
        asn1::parse_generalized_time(na_bytes)?,
    ))
}

fn spki_key_algorithm(spki_content: &[u8]) -> CaResult<KeyAlgorithm> {
    let (alg_tag, alg_content, _) = asn1::read_tlv(spki_content)?;
    if alg_tag != asn1::TAG_SEQUENCE {
        return Err(CaError::Malformed("malformed subjectPKInfo algorithm".into()));
    }
    let (oid_tag, oid_bytes, _) = asn1::read_tlv(alg_content)?;
    if oid_tag != asn1::TAG_OID {
        return Err(CaError::Malformed("malformed subjectPKInfo algorithm".into()));
    }
    match asn1::decode_oid(oid_bytes)?.as_str() {
        OID_RSA_ENCRYPTION => Ok(KeyAlgorithm::Rsa),
        OID_EC_PUBLIC_KEY => Ok(KeyAlgorithm::Ecdsa),
        other => Err(CaError::Malformed(format!("unsupported precertificate key algorithm {other}"))),
    }
}

fn tls_feature_requests_must_staple(extn_value: &[u8]) -> CaResult<bool> {
    const STATUS_REQUEST_FEATURE: u8 = 5;
    let (seq_tag, seq_content, _) = asn1::read_tlv(extn_value)?;
    if seq_tag != asn1::TAG_SEQUENCE {
        return Err(CaError::Malformed("malformed TLS Feature extension".into()));
    }
    let mut remaining = seq_content;
    while !remaining.is_empty() {
        let (tag, content, rest) = asn1::read_tlv(remaining)?;
        remaining = rest;
        if tag == asn1::TAG_INTEGER && content == [STATUS_REQUEST_FEATURE] {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_identifiers_promotes_short_dns_name_when_cn_missing() {
        let parsed = csr::ParsedCsr {
            common_name: None,
            dns_names: vec!["Example.com".into(), "example.com".into()],
            public_key_algorithm: KeyAlgorithm::Rsa,
            spki_der: Vec::new(),
            public_key_bytes: Vec::new(),
            must_staple: false,
        };
        let (cn, dns_names) = normalize_identifiers(&parsed, 10).unwrap();
        assert_eq!(cn.as_deref(), Some("example.com"));
        assert_eq!(dns_names, vec!["example.com".to_string()]);
    }

    #[test]
    fn normalize_identifiers_rejects_too_many_dns_names() {
        let parsed = csr::ParsedCsr {
            common_name: Some("example.com".into()),
            dns_names: vec!["a.example.com".into(), "b.example.com".into(), "c.example.com".into()],
            public_key_algorithm: KeyAlgorithm::Rsa,
            spki_der: Vec::new(),
            public_key_bytes: Vec::new(),
            must_staple: false,
        };
        assert!(normalize_identifiers(&parsed, 2).is_err());
    }

    #[test]
    fn normalize_identifiers_rejects_when_no_cn_and_no_dns_names() {
        let parsed = csr::ParsedCsr {
            common_name: None,
            dns_names: Vec::new(),
            public_key_algorithm: KeyAlgorithm::Rsa,
            spki_der: Vec::new(),
            public_key_bytes: Vec::new(),
            must_staple: false,
        };
        assert!(normalize_identifiers(&parsed, 10).is_err());
    }

    #[test]
    fn serial_from_der_integer_pads_short_values() {
        let serial = serial_from_der_integer(&[0x01, 0x02]).unwrap();
        assert_eq!(serial.as_bytes()[crate::serial::SERIAL_LEN - 2..], [0x01, 0x02]);
        assert_eq!(serial.as_bytes()[0], 0x00);
    }
}
