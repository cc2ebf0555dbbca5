//! Structured AUDIT log lines.
//!
//! The orphan recovery tool parses these lines, so the format in
//! [`orphaning_line`] is a contract (§6 of the design doc): it must not
//! change without updating that tool too. Every line is checksummed with
//! CRC32 so log shipping can detect truncation/corruption before the
//! recovery tool trusts a line.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use crc32fast::Hasher;
use tracing::info;

fn checksum(line: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(line.as_bytes());
    let crc = hasher.finalize();
    URL_SAFE_NO_PAD.encode(crc.to_be_bytes())
}

fn emit(line: String) {
    let prefix = checksum(&line);
    info!(target: "audit", "[{}] {}", prefix, line);
}

/// `Failed RPC to store at SA, orphaning <certificate|precertificate>: ...`
pub fn orphaning_line(
    is_precert: bool,
    serial_hex: &str,
    der_hex: &str,
    issuer_id: i64,
    reg_id: i64,
    order_id: i64,
    err: &str,
) {
    let kind = if is_precert {
        "precertificate"
    } else {
        "certificate"
    };
    emit(format!(
        "Failed RPC to store at SA, orphaning {}: serial=[{}], cert=[{}], issuerID=[{}], regID=[{}], orderID=[{}], err=[{}]",
        kind, serial_hex, der_hex, issuer_id, reg_id, order_id, err
    ));
}

/// `OCSP signed: <entries>` emitted by the log batcher.
pub fn ocsp_signed_line(entries: &str) {
    emit(format!("OCSP signed: {entries}"));
}

/// Entry logged when a CRL signing stream begins.
pub fn crl_signing_start_line(
    issuer: &str,
    number: i64,
    shard_idx: i32,
    this_update_ns: i64,
    next_update_ns: i64,
    entry_count: usize,
) {
    emit(format!(
        "Signing CRL: issuer=[{}], number=[{}], shard=[{}], thisUpdate=[{}], nextUpdate=[{}], entries=[{}]",
        issuer, number, shard_idx, this_update_ns, next_update_ns, entry_count
    ));
}

/// One or more lines dumping the revoked serials that went into a CRL,
/// each bounded by `max_line_len`.
pub fn crl_entries_dump_lines(entries: &[String], max_line_len: usize) {
    let mut buf = String::new();
    for entry in entries {
        if !buf.is_empty() && buf.len() + entry.len() + 1 > max_line_len {
            emit(format!("CRL entries: {buf}"));
            buf.clear();
        }
        if !buf.is_empty() {
            buf.push(',');
        }
        buf.push_str(entry);
    }
    if !buf.is_empty() {
        emit(format!("CRL entries: {buf}"));
    }
}

/// Emitted once a CRL has been signed successfully.
pub fn crl_signed_line(response_len: usize, sha256_hex: &str) {
    emit(format!(
        "CRL signed: size=[{response_len}], sha256=[{sha256_hex}]"
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_stable_for_identical_input() {
        assert_eq!(checksum("hello"), checksum("hello"));
        assert_ne!(checksum("hello"), checksum("hellp"));
    }
}
