//! OCSP response generation (§4.3).
//!
//! The DER structure is hand-built the way the teacher's
//! `CertificateServiceImpl::build_ocsp_response_der` does it, generalized
//! onto the shared [`crate::asn1`] helpers and signed for real through
//! the issuer's [`CertificateSigner`] rather than the teacher's
//! placeholder SHA-256 "signature".

use std::sync::Arc;

use chrono::{DateTime, Duration, SubsecRound, Timelike, Utc};
use sha2::{Digest, Sha256};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::asn1;
use crate::error::{CaError, CaResult};
use crate::issuer::{IssuerId, IssuerNameId, IssuerRegistry};
use crate::metrics::CaMetrics;
use crate::ocsp::batcher::{BatchRecord, OcspLogBatcher};
use crate::serial::Serial;

const SHA256_OID: &str = "2.16.840.1.101.3.4.2.1";
const OCSP_BASIC_RESPONSE_OID: &str = "1.3.6.1.5.5.7.48.1.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertStatus {
    Good,
    Revoked,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct OcspRequest {
    pub serial: Serial,
    pub issuer_name_id: Option<IssuerNameId>,
    pub issuer_id: Option<IssuerId>,
    pub status: CertStatus,
    pub revocation_reason: i32,
    pub revoked_at_ns: i64,
}

pub struct OcspGenerator {
    registry: Arc<IssuerRegistry>,
    ocsp_lifetime: chrono::Duration,
    batcher: Option<Arc<OcspLogBatcher>>,
    metrics: Arc<CaMetrics>,
}

impl OcspGenerator {
    pub fn new(
        registry: Arc<IssuerRegistry>,
        ocsp_lifetime: std::time::Duration,
        batcher: Option<Arc<OcspLogBatcher>>,
        metrics: Arc<CaMetrics>,
    ) -> Self {
        Self {
            registry,
            ocsp_lifetime: Duration::from_std(ocsp_lifetime).unwrap_or(Duration::hours(1)),
            batcher,
            metrics,
        }
    }

    pub async fn generate(&self, request: OcspRequest) -> CaResult<Vec<u8>> {
        let issuer = match request.issuer_name_id {
            Some(name_id) => self.registry.lookup_by_name_id(name_id),
            None => Err(CaError::not_found("no IssuerNameID on request")),
        }
        .or_else(|_| {
            request
                .issuer_id
                .map(|id| self.registry.lookup_by_id(id))
                .unwrap_or_else(|| Err(CaError::not_found("no issuer identifier on request")))
        })?;

        let this_update = truncate_to_hour(Utc::now());
        let next_update = this_update + self.ocsp_lifetime - Duration::seconds(1);

        let (_, parsed) = X509Certificate::from_der(&issuer.cert_der)
            .map_err(|e| CaError::internal(format!("parsing issuer certificate: {e}")))?;
        let issuer_name_hash = sha256(parsed.subject().as_raw());
        let issuer_key_hash = sha256(parsed.public_key().subject_public_key.as_ref());

        let tbs = build_tbs_response_data(
            &request,
            this_update,
            next_update,
            &issuer_name_hash,
            &issuer_key_hash,
        );

        let signature = issuer.signer.sign_raw(&tbs).map_err(|e| {
            self.metrics
                .sign_error_count
                .with_label_values(&["HSM"])
                .inc();
            e
        })?;

        self.metrics
            .signature_count
            .with_label_values(&["ocsp", &issuer.name])
            .inc();

        let basic_response = asn1::sequence(
            &[
                tbs.clone(),
                asn1::algorithm_identifier(issuer.signer.signature_algorithm_oid()),
                asn1::bit_string(&signature),
            ]
            .concat(),
        );

        let response_bytes = asn1::sequence(
            &[
                asn1::oid(&asn1::encode_oid(OCSP_BASIC_RESPONSE_OID)),
                asn1::octet_string(&basic_response),
            ]
            .concat(),
        );

        let der = asn1::sequence(
            &[
                asn1::enumerated(0), // successful
                asn1::context_constructed(0, &response_bytes),
            ]
            .concat(),
        );

        if let Some(batcher) = &self.batcher {
            batcher
                .enqueue(BatchRecord {
                    serial: request.serial,
                    status: request.status,
                    reason: request.revocation_reason,
                })
                .await?;
        }

        Ok(der)
    }
}

fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

fn truncate_to_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    t.trunc_subsecs(0)
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .unwrap_or(t)
}

fn build_tbs_response_data(
    request: &OcspRequest,
    this_update: DateTime<Utc>,
    next_update: DateTime<Utc>,
    issuer_name_hash: &[u8],
    issuer_key_hash: &[u8],
) -> Vec<u8> {
    let cert_id = asn1::sequence(
        &[
            asn1::algorithm_identifier(SHA256_OID),
            asn1::octet_string(issuer_name_hash),
            asn1::octet_string(issuer_key_hash),
            asn1::integer(request.serial.as_bytes()),
        ]
        .concat(),
    );

    let cert_status = match request.status {
        CertStatus::Good => asn1::context_primitive(0, &[]),
        CertStatus::Revoked => {
            let revoked_at = asn1::generalized_time_from_nanos(request.revoked_at_ns);
            let mut inner = asn1::generalized_time(revoked_at);
            if request.revocation_reason != 0 {
                inner.extend(asn1::context_constructed(
                    0,
                    &asn1::enumerated(request.revocation_reason as u8),
                ));
            }
            asn1::context_constructed(1, &inner)
        }
        CertStatus::Unknown => asn1::context_primitive(2, &[]),
    };

    let single_response = asn1::sequence(
        &[
            cert_id,
            cert_status,
            asn1::generalized_time(this_update),
            asn1::context_constructed(0, &asn1::generalized_time(next_update)),
        ]
        .concat(),
    );

    let responses = asn1::sequence(&single_response);

    asn1::sequence(
        &[
            asn1::context_constructed(2, &asn1::octet_string(issuer_key_hash)),
            asn1::generalized_time(this_update),
            responses,
        ]
        .concat(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_to_hour_zeroes_minutes_and_seconds() {
        let t = Utc::now().with_minute(37).unwrap().with_second(12).unwrap();
        let truncated = truncate_to_hour(t);
        assert_eq!(truncated.minute(), 0);
        assert_eq!(truncated.second(), 0);
    }
}
