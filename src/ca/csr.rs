//! PKCS#10 CSR parsing and validation (§4.2 step 3, §3 data model).
//!
//! Parsed by hand the same way [`crate::ocsp::generator`] and
//! [`crate::crl`] build their DER by hand, using the generic
//! [`crate::asn1::read_tlv`] reader instead of a full ASN.1 crate: a CSR
//! is a shallow, fixed-shape structure and walking it directly keeps the
//! signature-verification step (over the exact TBS bytes the signer
//! actually signed) unambiguous.

use ring::signature::UnparsedPublicKey;

use crate::asn1;
use crate::error::{CaError, CaResult};
use crate::issuer::KeyAlgorithm;

const OID_RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";
const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_SHA256_WITH_RSA: &str = "1.2.840.113549.1.1.11";
const OID_ECDSA_WITH_SHA256: &str = "1.2.840.10045.4.3.2";
const OID_COMMON_NAME: &str = "2.5.4.3";
const OID_EXTENSION_REQUEST: &str = "1.2.840.113549.1.9.14";
const OID_SUBJECT_ALT_NAME: &str = "2.5.29.17";
const OID_TLS_FEATURE: &str = "1.3.6.1.5.5.7.1.24";

const TAG_DNS_NAME: u8 = 0x82; // context-specific primitive [2]
const TAG_RFC822_NAME: u8 = 0x81; // context-specific primitive [1]
const TAG_IP_ADDRESS: u8 = 0x87; // context-specific primitive [7]
const TAG_ATTRIBUTES: u8 = 0xA0; // context-specific constructed [0]

/// The subset of a CSR this CA acts on, extracted and verified from the
/// submitted DER.
#[derive(Debug, Clone)]
pub struct ParsedCsr {
    pub common_name: Option<String>,
    pub dns_names: Vec<String>,
    pub public_key_algorithm: KeyAlgorithm,
    /// Raw `SubjectPublicKeyInfo` DER (full TLV), copied verbatim into
    /// the issued certificate's TBSCertificate.
    pub spki_der: Vec<u8>,
    /// The raw key material inside the SPKI's `subjectPublicKey` BIT
    /// STRING (modulus+exponent DER for RSA, the uncompressed point for
    /// ECDSA), handed to the key policy for a size/curve check.
    pub public_key_bytes: Vec<u8>,
    pub must_staple: bool,
}

/// Parses `der` as a `CertificationRequest` and verifies its embedded
/// signature against its own `CertificationRequestInfo`, rejecting any
/// CSR that isn't self-consistent before this CA ever looks at its
/// contents.
pub fn parse_and_verify(der: &[u8]) -> CaResult<ParsedCsr> {
    let (outer_tag, outer_content, outer_rest) = asn1::read_tlv(der)?;
    if outer_tag != asn1::TAG_SEQUENCE || !outer_rest.is_empty() {
        return Err(CaError::BadCsr("not a DER CertificationRequest".into()));
    }

    let cri_start = outer_content;
    let (cri_tag, cri_content, rest) = asn1::read_tlv(cri_start)?;
    if cri_tag != asn1::TAG_SEQUENCE {
        return Err(CaError::BadCsr("missing certificationRequestInfo".into()));
    }
    let cri_tlv_len = cri_start.len() - rest.len();
    let cri_tbs = &cri_start[..cri_tlv_len];

    let (sig_alg_tag, sig_alg_content, rest) = asn1::read_tlv(rest)?;
    if sig_alg_tag != asn1::TAG_SEQUENCE {
        return Err(CaError::BadCsr("missing CSR signatureAlgorithm".into()));
    }
    let (sig_oid_tag, sig_oid_bytes, _) = asn1::read_tlv(sig_alg_content)?;
    if sig_oid_tag != asn1::TAG_OID {
        return Err(CaError::BadCsr("malformed CSR signatureAlgorithm".into()));
    }
    let sig_oid = asn1::decode_oid(sig_oid_bytes)?;

    let (sig_tag, sig_bits, _) = asn1::read_tlv(rest)?;
    if sig_tag != asn1::TAG_BIT_STRING || sig_bits.is_empty() {
        return Err(CaError::BadCsr("missing CSR signature".into()));
    }
    let signature = &sig_bits[1..]; // skip unused-bits count octet

    let (common_name, spki_der, key_algorithm) = parse_certification_request_info(cri_content)?;

    verify_signature(&sig_oid, &spki_der, cri_tbs, signature)?;

    let (dns_names, must_staple) = parse_extension_attributes(cri_content)?;
    let public_key_bytes = extract_public_key_bytes(&spki_der)?;

    Ok(ParsedCsr {
        common_name,
        dns_names,
        public_key_algorithm: key_algorithm,
        spki_der,
        public_key_bytes,
        must_staple,
    })
}

/// Strips the SPKI wrapper down to the raw key bytes inside its
/// `subjectPublicKey` BIT STRING. Shared by CSR and precertificate
/// parsing, both of which need the same bytes for different reasons
/// (key policy checks here, signature verification and the
/// `SubjectKeyIdentifier` extension in [`crate::ca::builder`]).
pub(crate) fn extract_public_key_bytes(spki_der: &[u8]) -> CaResult<Vec<u8>> {
    let (_, spki_content, _) = asn1::read_tlv(spki_der)?;
    let (_, _, rest) = asn1::read_tlv(spki_content)?;
    let (key_tag, key_bits, _) = asn1::read_tlv(rest)?;
    if key_tag != asn1::TAG_BIT_STRING || key_bits.is_empty() {
        return Err(CaError::BadCsr("malformed subjectPublicKey".into()));
    }
    Ok(key_bits[1..].to_vec())
}

fn parse_certification_request_info(
    cri_content: &[u8],
) -> CaResult<(Option<String>, Vec<u8>, KeyAlgorithm)> {
    let (version_tag, version_bytes, rest) = asn1::read_tlv(cri_content)?;
    if version_tag != asn1::TAG_INTEGER || version_bytes != [0x00] {
        return Err(CaError::BadCsr("unsupported CertificationRequestInfo version".into()));
    }

    let (subject_tag, subject_content, rest) = asn1::read_tlv(rest)?;
    if subject_tag != asn1::TAG_SEQUENCE {
        return Err(CaError::BadCsr("missing CSR subject".into()));
    }
    let common_name = parse_common_name(subject_content)?;

    let spki_start = rest;
    let (spki_tag, spki_content, rest) = asn1::read_tlv(spki_start)?;
    if spki_tag != asn1::TAG_SEQUENCE {
        return Err(CaError::BadCsr("missing CSR subjectPKInfo".into()));
    }
    let spki_tlv_len = spki_start.len() - rest.len();
    let spki_der = spki_start[..spki_tlv_len].to_vec();

    let (alg_tag, alg_content, _) = asn1::read_tlv(spki_content)?;
    if alg_tag != asn1::TAG_SEQUENCE {
        return Err(CaError::BadCsr("malformed subjectPKInfo algorithm".into()));
    }
    let (oid_tag, oid_bytes, _) = asn1::read_tlv(alg_content)?;
    if oid_tag != asn1::TAG_OID {
        return Err(CaError::BadCsr("malformed subjectPKInfo algorithm".into()));
    }
    let key_algorithm = match asn1::decode_oid(oid_bytes)?.as_str() {
        OID_RSA_ENCRYPTION => KeyAlgorithm::Rsa,
        OID_EC_PUBLIC_KEY => KeyAlgorithm::Ecdsa,
        other => return Err(CaError::BadCsr(format!("unsupported public key algorithm {other}"))),
    };

    Ok((common_name, spki_der, key_algorithm))
}

pub(crate) fn parse_common_name(subject_content: &[u8]) -> CaResult<Option<String>> {
    let mut remaining = subject_content;
    while !remaining.is_empty() {
        let (rdn_tag, rdn_content, rest) = asn1::read_tlv(remaining)?;
        if rdn_tag != asn1::TAG_SET {
            return Err(CaError::BadCsr("malformed subject RDNSequence".into()));
        }
        remaining = rest;

        let mut attrs = rdn_content;
        while !attrs.is_empty() {
            let (atv_tag, atv_content, atv_rest) = asn1::read_tlv(attrs)?;
            if atv_tag != asn1::TAG_SEQUENCE {
                return Err(CaError::BadCsr("malformed RDN attribute".into()));
            }
            attrs = atv_rest;

            let (type_tag, type_bytes, value_rest) = asn1::read_tlv(atv_content)?;
            if type_tag != asn1::TAG_OID {
                continue;
            }
            if asn1::decode_oid(type_bytes)? == OID_COMMON_NAME {
                let (_, value_bytes, _) = asn1::read_tlv(value_rest)?;
                return Ok(Some(String::from_utf8_lossy(value_bytes).into_owned()));
            }
        }
    }
    Ok(None)
}

/// Walks the `attributes [0] IMPLICIT SET OF Attribute` tail (if
/// present) looking for `extensionRequest`, returning its SAN DNS names
/// and whether the TLS Feature (MustStaple) extension was requested.
fn parse_extension_attributes(cri_content: &[u8]) -> CaResult<(Vec<String>, bool)> {
    // Re-walk to the attributes tail: version, subject, subjectPKInfo.
    let (_, _, rest) = asn1::read_tlv(cri_content)?;
    let (_, _, rest) = asn1::read_tlv(rest)?;
    let (_, _, rest) = asn1::read_tlv(rest)?;

    if rest.is_empty() {
        return Ok((Vec::new(), false));
    }
    let (attrs_tag, attrs_content, _) = asn1::read_tlv(rest)?;
    if attrs_tag != TAG_ATTRIBUTES {
        return Err(CaError::BadCsr("malformed CSR attributes".into()));
    }

    let mut dns_names = Vec::new();
    let mut must_staple = false;

    let mut attrs = attrs_content;
    while !attrs.is_empty() {
        let (attr_tag, attr_content, attr_rest) = asn1::read_tlv(attrs)?;
        if attr_tag != asn1::TAG_SEQUENCE {
            return Err(CaError::BadCsr("malformed CSR attribute".into()));
        }
        attrs = attr_rest;

        let (type_tag, type_bytes, values_rest) = asn1::read_tlv(attr_content)?;
        if type_tag != asn1::TAG_OID {
            continue;
        }
        if asn1::decode_oid(type_bytes)? != OID_EXTENSION_REQUEST {
            continue;
        }

        let (values_tag, values_content, _) = asn1::read_tlv(values_rest)?;
        if values_tag != asn1::TAG_SET {
            return Err(CaError::BadCsr("malformed extensionRequest attribute".into()));
        }
        let (extns_tag, extns_content, _) = asn1::read_tlv(values_content)?;
        if extns_tag != asn1::TAG_SEQUENCE {
            return Err(CaError::BadCsr("malformed Extensions value".into()));
        }

        let mut extns = extns_content;
        while !extns.is_empty() {
            let (ext_tag, ext_content, ext_rest) = asn1::read_tlv(extns)?;
            if ext_tag != asn1::TAG_SEQUENCE {
                return Err(CaError::BadCsr("malformed Extension".into()));
            }
            extns = ext_rest;

            let (oid_tag, oid_bytes, rest) = asn1::read_tlv(ext_content)?;
            if oid_tag != asn1::TAG_OID {
                return Err(CaError::BadCsr("malformed Extension extnID".into()));
            }
            let extn_id = asn1::decode_oid(oid_bytes)?;

            // critical BOOLEAN is OPTIONAL DEFAULT FALSE.
            let (next_tag, next_content, rest) = asn1::read_tlv(rest)?;
            let (octet_content, _) = if next_tag == asn1::TAG_BOOLEAN {
                let (tag, content, rest) = asn1::read_tlv(rest)?;
                if tag != asn1::TAG_OCTET_STRING {
                    return Err(CaError::BadCsr("malformed Extension extnValue".into()));
                }
                (content, rest)
            } else if next_tag == asn1::TAG_OCTET_STRING {
                (next_content, rest)
            } else {
                return Err(CaError::BadCsr("malformed Extension extnValue".into()));
            };

            match extn_id.as_str() {
                OID_SUBJECT_ALT_NAME => {
                    dns_names = parse_subject_alt_names(octet_content)?;
                }
                OID_TLS_FEATURE => {
                    must_staple = parse_tls_feature_must_staple(octet_content)?;
                }
                _ => {}
            }
        }
    }

    Ok((dns_names, must_staple))
}

pub(crate) fn parse_subject_alt_names(extn_value: &[u8]) -> CaResult<Vec<String>> {
    let (seq_tag, seq_content, _) = asn1::read_tlv(extn_value)?;
    if seq_tag != asn1::TAG_SEQUENCE {
        return Err(CaError::BadCsr("malformed SubjectAltName extension".into()));
    }
    let mut names = Vec::new();
    let mut remaining = seq_content;
    while !remaining.is_empty() {
        let (tag, content, rest) = asn1::read_tlv(remaining)?;
        remaining = rest;
        match tag {
            TAG_DNS_NAME => names.push(String::from_utf8_lossy(content).into_owned()),
            TAG_RFC822_NAME => {
                return Err(CaError::BadCsr("email SANs are not supported".into()));
            }
            TAG_IP_ADDRESS => {
                return Err(CaError::BadCsr("IP address SANs are not supported".into()));
            }
            _ => {}
        }
    }
    Ok(names)
}

fn parse_tls_feature_must_staple(extn_value: &[u8]) -> CaResult<bool> {
    const STATUS_REQUEST_FEATURE: u8 = 5;
    let (seq_tag, seq_content, _) = asn1::read_tlv(extn_value)?;
    if seq_tag != asn1::TAG_SEQUENCE {
        return Err(CaError::BadCsr("malformed TLS Feature extension".into()));
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

fn verify_signature(sig_oid: &str, spki_der: &[u8], tbs: &[u8], signature: &[u8]) -> CaResult<()> {
    let (_, spki_content, _) = asn1::read_tlv(spki_der)?;
    let (_, alg_content, rest) = asn1::read_tlv(spki_content)?;
    let _ = alg_content;
    let (key_tag, key_bits, _) = asn1::read_tlv(rest)?;
    if key_tag != asn1::TAG_BIT_STRING || key_bits.is_empty() {
        return Err(CaError::BadCsr("malformed subjectPublicKey".into()));
    }
    let public_key_bytes = &key_bits[1..];

    match sig_oid {
        OID_SHA256_WITH_RSA => {
            let key = UnparsedPublicKey::new(
                &ring::signature::RSA_PKCS1_2048_8192_SHA256,
                public_key_bytes,
            );
            key.verify(tbs, signature)
                .map_err(|_| CaError::BadCsr("CSR signature verification failed".into()))
        }
        OID_ECDSA_WITH_SHA256 => {
            let key = UnparsedPublicKey::new(&ring::signature::ECDSA_P256_SHA256_ASN1, public_key_bytes);
            key.verify(tbs, signature)
                .map_err(|_| CaError::BadCsr("CSR signature verification failed".into()))
        }
        other => Err(CaError::BadCsr(format!("unsupported CSR signature algorithm {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_minimal_rsa_spki() -> Vec<u8> {
        // A syntactically valid but cryptographically meaningless RSA SPKI,
        // enough to exercise the shape-walking logic without a real key.
        let rsa_pub = asn1::sequence(&[asn1::integer(&[0x01, 0x00, 0x01]), asn1::integer(&[0x03])].concat());
        let alg = asn1::algorithm_identifier(OID_RSA_ENCRYPTION);
        asn1::sequence(&[alg, asn1::bit_string(&rsa_pub)].concat())
    }

    #[test]
    fn parse_common_name_extracts_cn_from_single_rdn() {
        let atv = asn1::sequence(
            &[
                asn1::oid(&asn1::encode_oid(OID_COMMON_NAME)),
                asn1::utf8_string("example.com"),
            ]
            .concat(),
        );
        let rdn = asn1::set(&atv);
        let subject = rdn;
        let cn = parse_common_name(&subject).unwrap();
        assert_eq!(cn.as_deref(), Some("example.com"));
    }

    #[test]
    fn parse_certification_request_info_rejects_bad_version() {
        let subject = asn1::set(&asn1::sequence(
            &[asn1::oid(&asn1::encode_oid(OID_COMMON_NAME)), asn1::utf8_string("x")].concat(),
        ));
        let spki = build_minimal_rsa_spki();
        let cri = [asn1::integer(&[0x01]), subject, spki].concat();
        assert!(parse_certification_request_info(&cri).is_err());
    }

    #[test]
    fn parse_certification_request_info_extracts_rsa_algorithm_and_spki() {
        let subject = asn1::set(&asn1::sequence(
            &[
                asn1::oid(&asn1::encode_oid(OID_COMMON_NAME)),
                asn1::utf8_string("example.com"),
            ]
            .concat(),
        ));
        let spki = build_minimal_rsa_spki();
        let cri = [asn1::integer(&[0x00]), subject, spki.clone()].concat();
        let (cn, parsed_spki, alg) = parse_certification_request_info(&cri).unwrap();
        assert_eq!(cn.as_deref(), Some("example.com"));
        assert_eq!(parsed_spki, spki);
        assert_eq!(alg, KeyAlgorithm::Rsa);
    }

    #[test]
    fn subject_alt_name_rejects_email_entries() {
        let email = asn1::context_primitive(1, b"user@example.com");
        let san_seq = asn1::sequence(&email);
        let extn_value = asn1::sequence(&san_seq);
        assert!(parse_subject_alt_names(&extn_value).is_err());
    }

    #[test]
    fn subject_alt_name_collects_dns_names() {
        let dns_a = asn1::context_primitive(2, b"a.example.com");
        let dns_b = asn1::context_primitive(2, b"b.example.com");
        let san_seq = asn1::sequence(&[dns_a, dns_b].concat());
        let extn_value = asn1::sequence(&san_seq);
        let names = parse_subject_alt_names(&extn_value).unwrap();
        assert_eq!(names, vec!["a.example.com", "b.example.com"]);
    }

    #[test]
    fn tls_feature_detects_must_staple() {
        let features = asn1::sequence(&asn1::integer(&[5]));
        let extn_value = asn1::sequence(&features);
        assert!(parse_tls_feature_must_staple(&extn_value).unwrap());

        let other_features = asn1::sequence(&asn1::integer(&[17]));
        let extn_value = asn1::sequence(&other_features);
        assert!(!parse_tls_feature_must_staple(&extn_value).unwrap());
    }
}
