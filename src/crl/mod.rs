//! CRL Generator: assembles a signed CRL from a streamed revocation feed
//! (§4.4), including the Issuing Distribution Point extension.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use crate::asn1;
use crate::audit;
use crate::error::{CaError, CaResult};
use crate::issuer::{Issuer, IssuerNameId, IssuerRegistry};
use crate::metrics::CaMetrics;
use crate::policy::CrlLinter;
use crate::serial::Serial;

pub const CHUNK_SIZE: usize = 1000;
pub const IDP_OID: &str = "2.5.29.28";
pub const CRL_NUMBER_OID: &str = "2.5.29.20";
pub const AUTHORITY_KEY_IDENTIFIER_OID: &str = "2.5.29.35";

/// `0` means "use the default 9-day lifetime"; the effective value must
/// be strictly less than 10 days.
pub const DEFAULT_CRL_LIFETIME: Duration = Duration::days(9);
const MAX_CRL_LIFETIME: Duration = Duration::days(10);

#[derive(Debug, Clone)]
pub struct CrlMetadata {
    pub issuer_name_id: IssuerNameId,
    pub shard_idx: i32,
    pub this_update: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CrlEntry {
    pub serial: Serial,
    /// Nanoseconds since epoch; must be nonzero.
    pub revoked_at_ns: i64,
    pub reason: i32,
}

pub struct CrlGenerator {
    registry: Arc<IssuerRegistry>,
    linter: Arc<dyn CrlLinter>,
    idp_base: String,
    lifetime: Duration,
    max_log_line_len: usize,
    metrics: Arc<CaMetrics>,
}

impl CrlGenerator {
    pub fn new(
        registry: Arc<IssuerRegistry>,
        linter: Arc<dyn CrlLinter>,
        idp_base: String,
        lifetime: std::time::Duration,
        max_log_line_len: usize,
        metrics: Arc<CaMetrics>,
    ) -> CaResult<Self> {
        if !idp_base.starts_with("http://") {
            return Err(CaError::internal("idp_base must start with http://"));
        }
        if idp_base.ends_with('/') {
            return Err(CaError::internal("idp_base must not have a trailing slash"));
        }
        let lifetime = if lifetime.is_zero() {
            DEFAULT_CRL_LIFETIME
        } else {
            Duration::from_std(lifetime).map_err(|e| CaError::internal(e.to_string()))?
        };
        if lifetime <= Duration::zero() {
            return Err(CaError::internal("crl lifetime must be strictly positive"));
        }
        if lifetime >= MAX_CRL_LIFETIME {
            return Err(CaError::internal("crl lifetime must be strictly less than 10 days"));
        }
        Ok(Self {
            registry,
            linter,
            idp_base,
            lifetime,
            max_log_line_len,
            metrics,
        })
    }

    /// Derives the CRL `number` deterministically from `thisUpdate`: the
    /// Unix timestamp in seconds, which is monotone and unique per
    /// generation run under the hour-scale generation cadence this CA
    /// operates at.
    fn crl_number(this_update: DateTime<Utc>) -> i64 {
        this_update.timestamp()
    }

    /// Builds and signs a CRL from a fully-received metadata frame and
    /// entry list (the streaming split into metadata-then-entries is
    /// handled by the gRPC layer; this is the pure assembly step).
    pub fn generate(&self, metadata: CrlMetadata, entries: Vec<CrlEntry>) -> CaResult<Vec<u8>> {
        let issuer = self.registry.lookup_by_name_id(metadata.issuer_name_id)?;
        let next_update = metadata.this_update + self.lifetime - Duration::seconds(1);
        let number = Self::crl_number(metadata.this_update);

        self.linter.check(entries.len(), metadata.shard_idx)?;

        audit::crl_signing_start_line(
            &issuer.name,
            number,
            metadata.shard_idx,
            metadata.this_update.timestamp_nanos_opt().unwrap_or_default(),
            next_update.timestamp_nanos_opt().unwrap_or_default(),
            entries.len(),
        );
        let entry_lines: Vec<String> = entries
            .iter()
            .map(|e| format!("{}:{}", e.serial.to_hex(), e.revoked_at_ns))
            .collect();
        audit::crl_entries_dump_lines(&entry_lines, self.max_log_line_len);

        let tbs = build_tbs_cert_list(&issuer, &metadata, next_update, &entries, &self.idp_base, number)?;

        let signature = issuer.signer.sign_raw(&tbs).map_err(|e| {
            self.metrics.sign_error_count.with_label_values(&["HSM"]).inc();
            e
        })?;
        self.metrics
            .signature_count
            .with_label_values(&["crl", &issuer.name])
            .inc();

        let der = asn1::sequence(
            &[
                tbs,
                asn1::algorithm_identifier(issuer.signer.signature_algorithm_oid()),
                asn1::bit_string(&signature),
            ]
            .concat(),
        );

        let digest = Sha256::digest(&der);
        audit::crl_signed_line(der.len(), &hex::encode(digest));

        Ok(der)
    }

    pub fn chunks(der: &[u8]) -> impl Iterator<Item = &[u8]> {
        der.chunks(CHUNK_SIZE)
    }
}

fn build_tbs_cert_list(
    issuer: &Issuer,
    metadata: &CrlMetadata,
    next_update: DateTime<Utc>,
    entries: &[CrlEntry],
    idp_base: &str,
    number: i64,
) -> CaResult<Vec<u8>> {
    let mut revoked_certificates = Vec::new();
    for entry in entries {
        if entry.revoked_at_ns == 0 {
            return Err(CaError::Malformed(format!(
                "entry {} has zero revokedAt",
                entry.serial
            )));
        }
        let revoked_at = asn1::generalized_time_from_nanos(entry.revoked_at_ns);
        let mut content = vec![
            asn1::integer(entry.serial.as_bytes()),
            asn1::generalized_time(revoked_at),
        ];
        if entry.reason != 0 {
            let reason_ext = asn1::sequence(
                &[
                    asn1::oid(&asn1::encode_oid("2.5.29.21")),
                    asn1::octet_string(&asn1::enumerated(entry.reason as u8)),
                ]
                .concat(),
            );
            content.push(asn1::sequence(&reason_ext));
        }
        revoked_certificates.push(asn1::sequence(&content.concat()));
    }

    let idp_extension = build_idp_extension(idp_base, metadata.issuer_name_id, metadata.shard_idx);
    let crl_number_extension = asn1::sequence(
        &[
            asn1::oid(&asn1::encode_oid(CRL_NUMBER_OID)),
            asn1::octet_string(&asn1::integer(&number.to_be_bytes())),
        ]
        .concat(),
    );
    let extensions = asn1::context_constructed(
        0,
        &asn1::sequence(&[idp_extension, crl_number_extension].concat()),
    );

    let mut tbs_content = vec![
        asn1::integer(&[1]), // version v2
        asn1::algorithm_identifier(issuer.signer.signature_algorithm_oid()),
        issuer_subject_raw(issuer)?.to_vec(),
        asn1::generalized_time(metadata.this_update),
        asn1::generalized_time(next_update),
    ];
    if !revoked_certificates.is_empty() {
        tbs_content.push(asn1::sequence(&revoked_certificates.concat()));
    }
    tbs_content.push(extensions);

    Ok(asn1::sequence(&tbs_content.concat()))
}

fn issuer_subject_raw(issuer: &Issuer) -> CaResult<Vec<u8>> {
    use x509_parser::certificate::X509Certificate;
    use x509_parser::prelude::FromDer;
    let (_, parsed) = X509Certificate::from_der(&issuer.cert_der)
        .map_err(|e| CaError::internal(format!("parsing issuer cert: {e}")))?;
    Ok(parsed.subject().as_raw().to_vec())
}

/// Builds the critical IDP extension:
/// `IssuingDistributionPoint { distributionPoint [0] { fullName [0] { [6] IA5String } }, onlyContainsUserCerts [1] BOOLEAN TRUE }`.
fn build_idp_extension(idp_base: &str, issuer_name_id: IssuerNameId, shard_idx: i32) -> Vec<u8> {
    let uri = format!("{idp_base}/{}/{shard_idx}.crl", issuer_name_id.0);
    let general_name = asn1::context_primitive(6, uri.as_bytes());
    let full_name = asn1::context_constructed(0, &general_name);
    let distribution_point_name = asn1::context_constructed(0, &full_name);
    let only_contains_user_certs = asn1::context_primitive(1, &[0xff]);

    let idp_value = asn1::sequence(&[distribution_point_name, only_contains_user_certs].concat());

    asn1::sequence(
        &[
            asn1::oid(&asn1::encode_oid(IDP_OID)),
            asn1::boolean(true),
            asn1::octet_string(&idp_value),
        ]
        .concat(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idp_extension_embeds_issuer_and_shard_in_uri() {
        let ext = build_idp_extension("http://crl.example.com", IssuerNameId(42), 3);
        let text = String::from_utf8_lossy(&ext);
        assert!(text.contains("crl.example.com/42/3.crl"));
    }

    #[test]
    fn chunking_splits_into_thousand_byte_pieces() {
        let data = vec![0u8; 2500];
        let chunks: Vec<&[u8]> = CrlGenerator::chunks(&data).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 1000);
        assert_eq!(chunks[2].len(), 500);
    }
}
