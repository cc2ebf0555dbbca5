//! Minimal DER encoding helpers shared by the OCSP and CRL builders.
//!
//! Generalizes the tag/length-pushing style used throughout the
//! certificate machinery into reusable wrappers instead of repeating the
//! same `push(tag); encode_length(...); extend(...)` triplet at every call
//! site.

use chrono::{DateTime, Utc};

use crate::error::{CaError, CaResult};

pub const TAG_BOOLEAN: u8 = 0x01;
pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_BIT_STRING: u8 = 0x03;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_NULL: u8 = 0x05;
pub const TAG_OID: u8 = 0x06;
pub const TAG_ENUMERATED: u8 = 0x0A;
pub const TAG_UTF8_STRING: u8 = 0x0C;
pub const TAG_PRINTABLE_STRING: u8 = 0x13;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_SET: u8 = 0x31;
pub const TAG_GENERALIZED_TIME: u8 = 0x18;
pub const TAG_IA5_STRING: u8 = 0x16;

/// Appends a DER length octet sequence (short or long form) for `length`.
pub fn encode_length(out: &mut Vec<u8>, length: usize) {
    if length < 128 {
        out.push(length as u8);
    } else if length < 256 {
        out.push(0x81);
        out.push(length as u8);
    } else if length < 65536 {
        out.push(0x82);
        out.push((length >> 8) as u8);
        out.push((length & 0xff) as u8);
    } else {
        out.push(0x83);
        out.push((length >> 16) as u8);
        out.push(((length >> 8) & 0xff) as u8);
        out.push((length & 0xff) as u8);
    }
}

/// Wraps `content` in a TLV with the given tag.
pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 4);
    out.push(tag);
    encode_length(&mut out, content.len());
    out.extend_from_slice(content);
    out
}

pub fn sequence(content: &[u8]) -> Vec<u8> {
    tlv(TAG_SEQUENCE, content)
}

/// Context-specific constructed tag, e.g. `[0]` EXPLICIT.
pub fn context_constructed(n: u8, content: &[u8]) -> Vec<u8> {
    tlv(0xA0 | n, content)
}

/// Context-specific primitive tag, e.g. `[0]` IMPLICIT.
pub fn context_primitive(n: u8, content: &[u8]) -> Vec<u8> {
    tlv(0x80 | n, content)
}

pub fn octet_string(content: &[u8]) -> Vec<u8> {
    tlv(TAG_OCTET_STRING, content)
}

pub fn bit_string(content: &[u8]) -> Vec<u8> {
    bit_string_with_unused(0, content)
}

/// A BIT STRING whose trailing `unused_bits` bits of the last content
/// byte carry no meaning, as DER requires for short flag fields like
/// `KeyUsage` rather than always padding to a whole byte of zero bits.
pub fn bit_string_with_unused(unused_bits: u8, content: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(content.len() + 1);
    payload.push(unused_bits);
    payload.extend_from_slice(content);
    tlv(TAG_BIT_STRING, &payload)
}

pub fn oid(der_encoded: &[u8]) -> Vec<u8> {
    tlv(TAG_OID, der_encoded)
}

pub fn null() -> Vec<u8> {
    vec![TAG_NULL, 0x00]
}

pub fn boolean(value: bool) -> Vec<u8> {
    tlv(TAG_BOOLEAN, &[if value { 0xff } else { 0x00 }])
}

pub fn enumerated(value: u8) -> Vec<u8> {
    tlv(TAG_ENUMERATED, &[value])
}

/// Minimal-length two's-complement INTEGER encoding (a leading 0x00 byte
/// is added only when the high bit would otherwise flip the sign).
pub fn integer(bytes: &[u8]) -> Vec<u8> {
    let mut trimmed = bytes;
    while trimmed.len() > 1 && trimmed[0] == 0x00 && trimmed[1] < 0x80 {
        trimmed = &trimmed[1..];
    }
    if trimmed.is_empty() {
        return tlv(TAG_INTEGER, &[0x00]);
    }
    if trimmed[0] & 0x80 != 0 {
        let mut padded = Vec::with_capacity(trimmed.len() + 1);
        padded.push(0x00);
        padded.extend_from_slice(trimmed);
        return tlv(TAG_INTEGER, &padded);
    }
    tlv(TAG_INTEGER, trimmed)
}

pub fn generalized_time(dt: DateTime<Utc>) -> Vec<u8> {
    let s = dt.format("%Y%m%d%H%M%SZ").to_string();
    tlv(TAG_GENERALIZED_TIME, s.as_bytes())
}

/// Parses a DER GeneralizedTime's content octets back into a `DateTime`,
/// the inverse of [`generalized_time`]. Shared by the precertificate
/// re-parser in [`crate::ca`] and the cached-response parser in
/// [`crate::responder`].
pub fn parse_generalized_time(bytes: &[u8]) -> CaResult<DateTime<Utc>> {
    let s = std::str::from_utf8(bytes).map_err(|_| CaError::Malformed("non-UTF8 GeneralizedTime".into()))?;
    chrono::NaiveDateTime::parse_from_str(s, "%Y%m%d%H%M%SZ")
        .map(|naive| naive.and_utc())
        .map_err(|e| CaError::Malformed(format!("bad GeneralizedTime {s}: {e}")))
}

pub fn ia5_string(s: &str) -> Vec<u8> {
    tlv(TAG_IA5_STRING, s.as_bytes())
}

pub fn utf8_string(s: &str) -> Vec<u8> {
    tlv(TAG_UTF8_STRING, s.as_bytes())
}

pub fn printable_string(s: &str) -> Vec<u8> {
    tlv(TAG_PRINTABLE_STRING, s.as_bytes())
}

pub fn set(content: &[u8]) -> Vec<u8> {
    tlv(TAG_SET, content)
}

/// Reads one DER length field starting at `input[0]`, returning the
/// decoded length and the remainder of `input` after the length octets.
fn read_length(input: &[u8]) -> CaResult<(usize, &[u8])> {
    let first = *input
        .first()
        .ok_or_else(|| CaError::Malformed("truncated DER length".into()))?;
    if first & 0x80 == 0 {
        return Ok((first as usize, &input[1..]));
    }
    let n = (first & 0x7f) as usize;
    if n == 0 || n > 4 {
        return Err(CaError::Malformed("unsupported DER length form".into()));
    }
    if input.len() < 1 + n {
        return Err(CaError::Malformed("truncated DER length".into()));
    }
    let mut length = 0usize;
    for &b in &input[1..1 + n] {
        length = (length << 8) | b as usize;
    }
    Ok((length, &input[1 + n..]))
}

/// Reads one DER TLV from the front of `input`, returning `(tag,
/// content, remainder)`. Used by the hand-rolled PKCS#10 CSR parser to
/// walk a `CertificationRequest` without pulling in a full ASN.1 crate.
pub fn read_tlv(input: &[u8]) -> CaResult<(u8, &[u8], &[u8])> {
    let tag = *input
        .first()
        .ok_or_else(|| CaError::Malformed("empty DER input".into()))?;
    let (length, rest) = read_length(&input[1..])?;
    if rest.len() < length {
        return Err(CaError::Malformed("DER content shorter than declared length".into()));
    }
    Ok((tag, &rest[..length], &rest[length..]))
}

/// Reads one DER TLV and requires it to carry the given tag.
pub fn expect_tlv(input: &[u8], expected_tag: u8) -> CaResult<(&[u8], &[u8])> {
    let (tag, content, rest) = read_tlv(input)?;
    if tag != expected_tag {
        return Err(CaError::Malformed(format!(
            "expected DER tag 0x{expected_tag:02x}, got 0x{tag:02x}"
        )));
    }
    Ok((content, rest))
}

pub fn generalized_time_from_nanos(ns: i64) -> DateTime<Utc> {
    let secs = ns.div_euclid(1_000_000_000);
    let nanos = ns.rem_euclid(1_000_000_000) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos).unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap())
}

/// An X.509 `Extension` SEQUENCE: `{ extnID, critical (omitted when
/// false), extnValue OCTET STRING }`, shared by the certificate and CRL
/// builders instead of each inlining the same three-field wrapper.
pub fn extension(oid_dotted: &str, critical: bool, value: &[u8]) -> Vec<u8> {
    let mut content = vec![oid(&encode_oid(oid_dotted))];
    if critical {
        content.push(boolean(true));
    }
    content.push(octet_string(value));
    sequence(&content.concat())
}

/// AlgorithmIdentifier SEQUENCE { OID, NULL } for a dotted OID string.
pub fn algorithm_identifier(oid_dotted: &str) -> Vec<u8> {
    let encoded = encode_oid(oid_dotted);
    sequence(&[oid(&encoded), null()].concat())
}

/// Encodes a dotted-decimal OID string into its DER content bytes.
pub fn encode_oid(dotted: &str) -> Vec<u8> {
    let parts: Vec<u64> = dotted.split('.').map(|p| p.parse().unwrap_or(0)).collect();
    let mut out = Vec::new();
    if parts.len() >= 2 {
        out.push((parts[0] * 40 + parts[1]) as u8);
        for &component in &parts[2..] {
            out.extend(encode_base128(component));
        }
    }
    out
}

fn encode_base128(mut value: u64) -> Vec<u8> {
    let mut stack = vec![(value & 0x7f) as u8];
    value >>= 7;
    while value > 0 {
        stack.push(((value & 0x7f) as u8) | 0x80);
        value >>= 7;
    }
    stack.reverse();
    stack
}

/// Decodes DER OID content bytes back into a dotted-decimal string, the
/// inverse of [`encode_oid`]. Used when walking a parsed CSR's
/// extensions, where the OID arrives as raw bytes rather than chosen by
/// this crate.
pub fn decode_oid(bytes: &[u8]) -> CaResult<String> {
    if bytes.is_empty() {
        return Err(CaError::Malformed("empty OID".into()));
    }
    let first = bytes[0];
    let mut parts = vec![(first / 40) as u64, (first % 40) as u64];
    let mut value: u64 = 0;
    for &b in &bytes[1..] {
        value = (value << 7) | (b & 0x7f) as u64;
        if b & 0x80 == 0 {
            parts.push(value);
            value = 0;
        }
    }
    Ok(parts
        .into_iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_encoding_matches_der_short_and_long_form() {
        let mut out = Vec::new();
        encode_length(&mut out, 5);
        assert_eq!(out, vec![0x05]);

        let mut out = Vec::new();
        encode_length(&mut out, 200);
        assert_eq!(out, vec![0x81, 200]);

        let mut out = Vec::new();
        encode_length(&mut out, 1000);
        assert_eq!(out, vec![0x82, 0x03, 0xe8]);
    }

    #[test]
    fn integer_encoding_adds_padding_only_when_high_bit_set() {
        assert_eq!(integer(&[0x01]), vec![0x02, 0x01, 0x01]);
        assert_eq!(integer(&[0xff]), vec![0x02, 0x02, 0x00, 0xff]);
    }

    #[test]
    fn read_tlv_splits_tag_content_and_remainder() {
        let encoded = sequence(&integer(&[0x01]));
        let (tag, content, rest) = read_tlv(&encoded).unwrap();
        assert_eq!(tag, TAG_SEQUENCE);
        assert_eq!(content, integer(&[0x01]));
        assert!(rest.is_empty());
    }

    #[test]
    fn read_tlv_rejects_truncated_input() {
        assert!(read_tlv(&[TAG_SEQUENCE, 0x05, 0x00]).is_err());
    }

    #[test]
    fn expect_tlv_rejects_mismatched_tag() {
        let encoded = integer(&[0x01]);
        assert!(expect_tlv(&encoded, TAG_SEQUENCE).is_err());
    }

    #[test]
    fn sha256_with_rsa_oid_round_trips_known_bytes() {
        let encoded = encode_oid("1.2.840.113549.1.1.11");
        assert_eq!(
            encoded,
            vec![0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0b]
        );
    }

    #[test]
    fn decode_oid_inverts_encode_oid() {
        let dotted = "1.2.840.10045.4.3.2";
        let encoded = encode_oid(dotted);
        assert_eq!(decode_oid(&encoded).unwrap(), dotted);
    }
}
