//! Hand-rolled TBSCertificate construction for precertificates and
//! final certificates (§4.2).
//!
//! Built the same way [`crate::ocsp::generator`] builds `ResponseData`
//! and [`crate::crl`] builds `TBSCertList`: assemble DER by hand with
//! [`crate::asn1`] and hand the finished TBS bytes to the issuer's
//! [`crate::policy::CertificateSigner::sign_raw`]. The subject's public
//! key is copied verbatim from the CSR's `SubjectPublicKeyInfo` rather
//! than re-derived, since this CA never holds the subscriber's private
//! key.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::asn1;
use crate::error::{CaError, CaResult};
use crate::issuer::{Issuer, KeyAlgorithm};

const OID_COMMON_NAME: &str = "2.5.4.3";
const OID_BASIC_CONSTRAINTS: &str = "2.5.29.19";
const OID_KEY_USAGE: &str = "2.5.29.15";
const OID_EXT_KEY_USAGE: &str = "2.5.29.37";
const OID_SUBJECT_ALT_NAME: &str = "2.5.29.17";
const OID_SUBJECT_KEY_IDENTIFIER: &str = "2.5.29.14";
const OID_AUTHORITY_KEY_IDENTIFIER: &str = "2.5.29.35";
const OID_CT_POISON: &str = "1.3.6.1.4.1.11129.2.4.3";
const OID_SCT_LIST: &str = "1.3.6.1.4.1.11129.2.4.2";
const OID_TLS_FEATURE: &str = "1.3.6.1.5.5.7.1.24";
const OID_SERVER_AUTH: &str = "1.3.6.1.5.5.7.3.1";
const OID_CLIENT_AUTH: &str = "1.3.6.1.5.5.7.3.2";

/// A fully-normalized request to sign one certificate-shaped artifact
/// (precertificate or final certificate). Produced by [`crate::ca`]
/// after CSR validation and normalization; the builder itself performs
/// no policy checks.
pub struct IssuanceRequest {
    pub serial: crate::serial::Serial,
    pub spki_der: Vec<u8>,
    pub key_algorithm: KeyAlgorithm,
    /// Empty only when the CSR carried neither a usable CN nor a DNS
    /// SAN short enough to promote into one; the subject is then an
    /// empty `Name` and identification rests entirely on the SAN
    /// extension.
    pub common_name: Option<String>,
    pub dns_names: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub include_ct_poison: bool,
    pub must_staple: bool,
    /// Non-empty only when finalizing a precertificate into a final
    /// certificate.
    pub sct_list: Vec<Vec<u8>>,
}

/// Builds the TBSCertificate DER for `request` under `issuer`. The
/// caller signs the returned bytes and wraps them in the outer
/// `Certificate` SEQUENCE.
pub fn build_tbs_certificate(issuer: &Issuer, request: &IssuanceRequest) -> CaResult<Vec<u8>> {
    let issuer_name = issuer_subject_raw(issuer)?;
    let issuer_key_id = issuer_key_identifier(issuer)?;

    let version = asn1::context_constructed(0, &asn1::integer(&[2]));
    let serial_number = asn1::integer(request.serial.as_bytes());
    let signature_alg = asn1::algorithm_identifier(issuer.signer.signature_algorithm_oid());
    let validity = asn1::sequence(
        &[
            asn1::generalized_time(request.not_before),
            asn1::generalized_time(request.not_after),
        ]
        .concat(),
    );
    let subject = build_subject_name(request.common_name.as_deref());
    let extensions = asn1::context_constructed(3, &asn1::sequence(&build_extensions(request, &issuer_key_id)?));

    Ok(asn1::sequence(
        &[
            version,
            serial_number,
            signature_alg,
            issuer_name,
            validity,
            subject,
            request.spki_der.clone(),
            extensions,
        ]
        .concat(),
    ))
}

fn build_subject_name(common_name: Option<&str>) -> Vec<u8> {
    match common_name {
        Some(cn) => {
            let atv = asn1::sequence(
                &[
                    asn1::oid(&asn1::encode_oid(OID_COMMON_NAME)),
                    asn1::printable_string(cn),
                ]
                .concat(),
            );
            asn1::sequence(&asn1::set(&atv))
        }
        None => asn1::sequence(&[]),
    }
}

fn build_extensions(request: &IssuanceRequest, issuer_key_id: &[u8]) -> CaResult<Vec<u8>> {
    let mut extensions = Vec::new();

    // BasicConstraints: cA default FALSE, so an end-entity cert's value
    // is simply an empty SEQUENCE.
    extensions.push(asn1::extension(OID_BASIC_CONSTRAINTS, true, &asn1::sequence(&[])));

    extensions.push(asn1::extension(OID_KEY_USAGE, true, &build_key_usage(request.key_algorithm)));

    let eku = asn1::sequence(
        &[
            asn1::oid(&asn1::encode_oid(OID_SERVER_AUTH)),
            asn1::oid(&asn1::encode_oid(OID_CLIENT_AUTH)),
        ]
        .concat(),
    );
    extensions.push(asn1::extension(OID_EXT_KEY_USAGE, false, &eku));

    if !request.dns_names.is_empty() {
        let names: Vec<u8> = request
            .dns_names
            .iter()
            .flat_map(|name| asn1::context_primitive(2, name.as_bytes()))
            .collect();
        extensions.push(asn1::extension(OID_SUBJECT_ALT_NAME, false, &asn1::sequence(&names)));
    }

    let spki_key_id = subject_key_identifier(&request.spki_der)?;
    extensions.push(asn1::extension(
        OID_SUBJECT_KEY_IDENTIFIER,
        false,
        &asn1::octet_string(&spki_key_id),
    ));

    let aki_value = asn1::sequence(&asn1::context_primitive(0, issuer_key_id));
    extensions.push(asn1::extension(OID_AUTHORITY_KEY_IDENTIFIER, false, &aki_value));

    if request.include_ct_poison {
        extensions.push(asn1::extension(OID_CT_POISON, true, &[0x05, 0x00]));
    }

    if !request.sct_list.is_empty() {
        let sct_list_bytes = encode_sct_list(&request.sct_list)?;
        extensions.push(asn1::extension(
            OID_SCT_LIST,
            false,
            &asn1::octet_string(&sct_list_bytes),
        ));
    }

    if request.must_staple {
        extensions.push(asn1::extension(
            OID_TLS_FEATURE,
            false,
            &asn1::sequence(&asn1::integer(&[5])),
        ));
    }

    Ok(extensions.concat())
}

/// `digitalSignature` is always asserted; `keyEncipherment` is added for
/// RSA subject keys only, matching how RSA end-entity certs are used
/// for both signing and key transport while ECDSA certs are not.
fn build_key_usage(algorithm: KeyAlgorithm) -> Vec<u8> {
    match algorithm {
        KeyAlgorithm::Rsa => asn1::bit_string_with_unused(5, &[0xA0]),
        KeyAlgorithm::Ecdsa => asn1::bit_string_with_unused(7, &[0x80]),
    }
}

/// RFC 5280 method 1 computes the SKI from the subject public key bits;
/// this crate uses a SHA-256 digest of those bits rather than SHA-1,
/// since `sha2` is already the house hashing crate and SHA-1 is not.
fn subject_key_identifier(spki_der: &[u8]) -> CaResult<Vec<u8>> {
    let (_, spki_content, _) = asn1::read_tlv(spki_der)?;
    let (_, _, rest) = asn1::read_tlv(spki_content)?;
    let (key_tag, key_bits, _) = asn1::read_tlv(rest)?;
    if key_tag != asn1::TAG_BIT_STRING || key_bits.is_empty() {
        return Err(CaError::internal("malformed subjectPublicKeyInfo"));
    }
    Ok(Sha256::digest(&key_bits[1..]).to_vec())
}

fn issuer_key_identifier(issuer: &Issuer) -> CaResult<Vec<u8>> {
    let (_, parsed) = X509Certificate::from_der(&issuer.cert_der)
        .map_err(|e| CaError::internal(format!("parsing issuer cert: {e}")))?;
    Ok(Sha256::digest(parsed.public_key().subject_public_key.as_ref()).to_vec())
}

fn issuer_subject_raw(issuer: &Issuer) -> CaResult<Vec<u8>> {
    let (_, parsed) = X509Certificate::from_der(&issuer.cert_der)
        .map_err(|e| CaError::internal(format!("parsing issuer cert: {e}")))?;
    Ok(parsed.subject().as_raw().to_vec())
}

/// Encodes an RFC 6962 `SignedCertificateTimestampList`: a 2-byte
/// big-endian total length followed by each SCT prefixed with its own
/// 2-byte length.
fn encode_sct_list(scts: &[Vec<u8>]) -> CaResult<Vec<u8>> {
    let mut list = Vec::new();
    for sct in scts {
        if sct.len() > u16::MAX as usize {
            return Err(CaError::internal("SCT too large to encode"));
        }
        list.extend_from_slice(&(sct.len() as u16).to_be_bytes());
        list.extend_from_slice(sct);
    }
    if list.len() > u16::MAX as usize {
        return Err(CaError::internal("SCT list too large to encode"));
    }
    let mut out = Vec::with_capacity(list.len() + 2);
    out.extend_from_slice(&(list.len() as u16).to_be_bytes());
    out.extend_from_slice(&list);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_usage_rsa_sets_digital_signature_and_key_encipherment() {
        let ku = build_key_usage(KeyAlgorithm::Rsa);
        // tag, length, unused-bits, content byte
        assert_eq!(ku, vec![asn1::TAG_BIT_STRING, 0x02, 0x05, 0xA0]);
    }

    #[test]
    fn key_usage_ecdsa_sets_only_digital_signature() {
        let ku = build_key_usage(KeyAlgorithm::Ecdsa);
        assert_eq!(ku, vec![asn1::TAG_BIT_STRING, 0x02, 0x07, 0x80]);
    }

    #[test]
    fn sct_list_encoding_prefixes_each_entry_and_the_whole_list() {
        let scts = vec![vec![0xAA; 3], vec![0xBB; 2]];
        let encoded = encode_sct_list(&scts).unwrap();
        // total length (2) + (len+sct)*2
        assert_eq!(encoded, vec![0x00, 0x09, 0x00, 0x03, 0xAA, 0xAA, 0xAA, 0x00, 0x02, 0xBB, 0xBB]);
    }

    #[test]
    fn build_subject_name_embeds_common_name() {
        let name = build_subject_name(Some("example.com"));
        let text = String::from_utf8_lossy(&name);
        assert!(text.contains("example.com"));
    }

    #[test]
    fn build_subject_name_none_is_empty_sequence() {
        let name = build_subject_name(None);
        assert_eq!(name, vec![asn1::TAG_SEQUENCE, 0x00]);
    }
}
