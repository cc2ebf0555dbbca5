//! Live-Signing OCSP Responder (§4.6): serves cached OCSP responses out
//! of Redis, cross-checking the Storage Authority's authoritative
//! revocation status, and falls back to a fresh signature through the
//! Registration Authority on a miss, staleness, or disagreement.
//!
//! The Redis access pattern and the bounded-concurrency admission
//! policy are new to this crate (the teacher has neither a PKI cache nor
//! a semaphore-gated RPC path); both are grounded on the
//! `redis`/`tokio::sync::Semaphore` idiom used across the pack's
//! request-shedding services rather than on any one teacher file.

pub mod http;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::asn1;
use crate::error::{CaError, CaResult};
use crate::issuer::{Issuer, IssuerNameId, IssuerRegistry};
use crate::metrics::CaMetrics;
use crate::ocsp::generator::{CertStatus, OcspRequest};
use crate::ra::RegistrationAuthority;
use crate::sa::{RevocationStatus, StorageAuthority};
use crate::serial::Serial;

const SHA256_OID: &str = "2.16.840.1.101.3.4.2.1";

/// One OCSP lookup: the serial plus the issuer the caller claims it was
/// signed under (recovered from the request path by the HTTP layer).
#[derive(Debug, Clone)]
pub struct OcspResponderRequest {
    pub serial: Serial,
    pub issuer_name_id: IssuerNameId,
}

/// The subset of a parsed OCSP response this responder acts on: enough
/// to compare against the Storage Authority's status and to apply the
/// serving filter, without re-deriving the whole `BasicOCSPResponse`.
#[derive(Debug, Clone)]
struct ParsedOcspResponse {
    hash_algorithm_oid: String,
    issuer_key_hash: Vec<u8>,
    this_update: DateTime<Utc>,
    next_update: DateTime<Utc>,
    status: CertStatus,
    revocation_reason: i32,
    revoked_at_ns: i64,
}

pub struct LiveSigningOcspResponder {
    redis: Option<redis::Client>,
    sa: Arc<dyn StorageAuthority>,
    ra: Arc<dyn RegistrationAuthority>,
    registry: Arc<IssuerRegistry>,
    semaphore: Arc<Semaphore>,
    max_waiters: usize,
    waiters: AtomicUsize,
    live_signing_period: Duration,
    allowed_serial_prefixes: Vec<u8>,
    metrics: Arc<CaMetrics>,
}

impl LiveSigningOcspResponder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        redis_url: Option<&str>,
        sa: Arc<dyn StorageAuthority>,
        ra: Arc<dyn RegistrationAuthority>,
        registry: Arc<IssuerRegistry>,
        max_inflight: usize,
        max_waiters: usize,
        live_signing_period: std::time::Duration,
        allowed_serial_prefixes: Vec<u8>,
        metrics: Arc<CaMetrics>,
    ) -> CaResult<Self> {
        let redis = redis_url
            .map(redis::Client::open)
            .transpose()
            .map_err(CaError::from)?;
        Ok(Self {
            redis,
            sa,
            ra,
            registry,
            semaphore: Arc::new(Semaphore::new(max_inflight)),
            max_waiters,
            waiters: AtomicUsize::new(0),
            live_signing_period: Duration::from_std(live_signing_period)
                .map_err(|e| CaError::internal(e.to_string()))?,
            allowed_serial_prefixes,
            metrics,
        })
    }

    /// Entry point for the HTTP wrapper: decodes a raw DER `OCSPRequest`
    /// (the GET path payload or POST body), resolves its `CertID` to a
    /// known issuer and serial, and serves it the same way
    /// [`Self::response`] does.
    pub async fn respond_to_request_der(&self, request_der: &[u8]) -> CaResult<Vec<u8>> {
        let request = self.resolve_request(request_der)?;
        self.response(&request).await
    }

    fn resolve_request(&self, der: &[u8]) -> CaResult<OcspResponderRequest> {
        let cert_id = parse_ocsp_request_cert_id(der)?;
        if cert_id.hash_algorithm_oid != SHA256_OID {
            return Err(CaError::Malformed("unsupported OCSP request hash algorithm".into()));
        }
        let issuer = self
            .registry
            .lookup_by_hashes(&cert_id.issuer_name_hash, &cert_id.issuer_key_hash)?;
        Ok(OcspResponderRequest {
            serial: cert_id.serial,
            issuer_name_id: issuer.name_id,
        })
    }

    /// Serves one OCSP lookup end to end: filter, cache, SA cross-check,
    /// live-sign fallback. A Redis transport error is a hard failure, not
    /// a cache miss: this responder always has an SA configured, so a
    /// broken cache must not silently widen into unconditional live
    /// signing.
    pub async fn response(&self, request: &OcspResponderRequest) -> CaResult<Vec<u8>> {
        let issuer = self.registry.lookup_by_name_id(request.issuer_name_id)?;
        self.check_allowed_prefix(request.serial.prefix())?;

        let (cached, sa_status) = tokio::join!(self.try_cache(&issuer, request), self.lookup_status(request));
        let sa_status = sa_status?;

        match cached {
            Ok(Some((der, parsed))) => {
                if statuses_agree(&sa_status, &parsed) {
                    self.record_age(&parsed);
                    Ok(der)
                } else {
                    self.resign_and_reconcile(&issuer, request, &sa_status).await
                }
            }
            Ok(None) => self.sign_and_save(&issuer, request, &sa_status).await,
            Err(e) => Err(e),
        }
    }

    async fn lookup_status(&self, request: &OcspResponderRequest) -> CaResult<RevocationStatus> {
        self.sa.get_revocation_status(&request.serial).await
    }

    /// Re-signs after a cache/SA disagreement and requires the fresh
    /// signature to actually agree with the SA; a live signer that still
    /// disagrees with its own authoritative source means the CA's own
    /// state is inconsistent, which must surface as an error rather than
    /// silently serving either side.
    async fn resign_and_reconcile(
        &self,
        issuer: &Issuer,
        request: &OcspResponderRequest,
        sa_status: &RevocationStatus,
    ) -> CaResult<Vec<u8>> {
        let der = self.sign_and_save(issuer, request, sa_status).await?;
        let parsed = parse_ocsp_response(&der)?;
        if statuses_agree(sa_status, &parsed) {
            Ok(der)
        } else {
            Err(CaError::internal(
                "OCSP response still disagrees with the Storage Authority after live signing",
            ))
        }
    }

    async fn try_cache(
        &self,
        issuer: &Issuer,
        request: &OcspResponderRequest,
    ) -> CaResult<Option<(Vec<u8>, ParsedOcspResponse)>> {
        let Some(client) = &self.redis else {
            return Ok(None);
        };
        let mut conn = client
            .get_tokio_connection_manager()
            .await
            .map_err(CaError::from)?;
        let key = cache_key(&request.serial);
        let bytes: Option<Vec<u8>> = conn.get(&key).await.map_err(CaError::from)?;
        let Some(bytes) = bytes else {
            return Ok(None);
        };
        let parsed = parse_ocsp_response(&bytes)?;
        if Utc::now() - parsed.this_update > self.live_signing_period {
            return Ok(None);
        }
        self.filter_response(issuer, &parsed)?;
        Ok(Some((bytes, parsed)))
    }

    /// Acquires an admission slot, calls through to the RA, and writes
    /// the fresh response back into Redis fire-and-forget.
    async fn sign_and_save(
        &self,
        issuer: &Issuer,
        request: &OcspResponderRequest,
        status: &RevocationStatus,
    ) -> CaResult<Vec<u8>> {
        let _permit = self.acquire_permit().await?;

        let (cert_status, revocation_reason, revoked_at_ns) = match status {
            RevocationStatus::Good => (CertStatus::Good, 0, 0),
            RevocationStatus::Revoked { reason, revoked_at } => {
                (CertStatus::Revoked, *reason, revoked_at.timestamp_nanos_opt().unwrap_or_default())
            }
        };

        let der = self
            .ra
            .generate_ocsp(OcspRequest {
                serial: request.serial,
                issuer_name_id: Some(issuer.name_id),
                issuer_id: Some(issuer.id),
                status: cert_status,
                revocation_reason,
                revoked_at_ns,
            })
            .await?;

        self.save_to_cache(&request.serial, &der);
        Ok(der)
    }

    fn save_to_cache(&self, serial: &Serial, der: &[u8]) {
        let Some(client) = self.redis.clone() else { return };
        let key = cache_key(serial);
        let value = der.to_vec();
        tokio::spawn(async move {
            if let Ok(mut conn) = client.get_tokio_connection_manager().await {
                let _: Result<(), _> = conn.set(&key, value).await;
            }
        });
    }

    async fn acquire_permit(&self) -> CaResult<InflightPermit> {
        if self.semaphore.available_permits() == 0 {
            let waiting = self.waiters.fetch_add(1, Ordering::SeqCst) + 1;
            if waiting > self.max_waiters {
                self.waiters.fetch_sub(1, Ordering::SeqCst);
                return Err(CaError::LoadShed);
            }
            let result = self.semaphore.clone().acquire_owned().await;
            self.waiters.fetch_sub(1, Ordering::SeqCst);
            let permit = result.map_err(|_| CaError::Cancelled)?;
            Ok(InflightPermit::new(permit, self.metrics.clone()))
        } else {
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| CaError::Cancelled)?;
            Ok(InflightPermit::new(permit, self.metrics.clone()))
        }
    }

    fn check_allowed_prefix(&self, prefix: u8) -> CaResult<()> {
        if self.allowed_serial_prefixes.contains(&prefix) {
            Ok(())
        } else {
            Err(CaError::Unauthorized(format!("serial prefix {prefix} is not recognized")))
        }
    }

    /// §4.6 Filter: hash algorithm, issuer key hash, and freshness.
    fn filter_response(&self, issuer: &Issuer, parsed: &ParsedOcspResponse) -> CaResult<()> {
        if parsed.hash_algorithm_oid != SHA256_OID {
            return Err(CaError::Malformed("unsupported OCSP hash algorithm".into()));
        }
        if parsed.issuer_key_hash != issuer_key_hash(issuer)? {
            return Err(CaError::Unauthorized("cached OCSP response's issuer key hash does not match".into()));
        }
        if Utc::now() > parsed.next_update {
            return Err(CaError::ResponseExpired);
        }
        Ok(())
    }

    fn record_age(&self, parsed: &ParsedOcspResponse) {
        let age = (Utc::now() - parsed.this_update).num_seconds().max(0);
        self.metrics.ocsp_response_age_seconds.set(age as f64);
    }
}

/// Wraps the owned semaphore permit together with the in-flight gauge
/// it is holding open; decrements the gauge on every exit path
/// (success, error, cancel) when the permit is dropped.
struct InflightPermit {
    _permit: OwnedSemaphorePermit,
    metrics: Arc<CaMetrics>,
}

impl InflightPermit {
    fn new(permit: OwnedSemaphorePermit, metrics: Arc<CaMetrics>) -> Self {
        metrics.live_signing_inflight.inc();
        Self { _permit: permit, metrics }
    }
}

impl Drop for InflightPermit {
    fn drop(&mut self) {
        self.metrics.live_signing_inflight.dec();
    }
}

fn cache_key(serial: &Serial) -> String {
    format!("ocsp:{}", serial.to_hex())
}

fn statuses_agree(sa_status: &RevocationStatus, parsed: &ParsedOcspResponse) -> bool {
    match sa_status {
        RevocationStatus::Good => parsed.status == CertStatus::Good,
        RevocationStatus::Revoked { reason, revoked_at } => {
            parsed.status == CertStatus::Revoked
                && parsed.revocation_reason == *reason
                && (parsed.revoked_at_ns - revoked_at.timestamp_nanos_opt().unwrap_or_default()).abs()
                    < 1_000_000_000
        }
    }
}

fn issuer_key_hash(issuer: &Issuer) -> CaResult<Vec<u8>> {
    let (_, parsed) = X509Certificate::from_der(&issuer.cert_der)
        .map_err(|e| CaError::internal(format!("parsing issuer cert: {e}")))?;
    Ok(Sha256::digest(parsed.public_key().subject_public_key.as_ref()).to_vec())
}

fn serial_from_integer(bytes: &[u8]) -> CaResult<Serial> {
    let mut arr = [0u8; crate::serial::SERIAL_LEN];
    let take = bytes.len().min(crate::serial::SERIAL_LEN);
    arr[crate::serial::SERIAL_LEN - take..].copy_from_slice(&bytes[bytes.len() - take..]);
    Ok(Serial(arr))
}

struct RequestCertId {
    hash_algorithm_oid: String,
    issuer_name_hash: Vec<u8>,
    issuer_key_hash: Vec<u8>,
    serial: Serial,
}

/// Walks a DER `OCSPRequest` far enough to recover the first (and only,
/// for this responder) `Request`'s `CertID`:
/// `OCSPRequest { tbsRequest TBSRequest { version [0] OPTIONAL,
/// requestorName [1] OPTIONAL, requestList SEQUENCE OF Request },
/// optionalSignature [0] OPTIONAL }` where
/// `Request ::= SEQUENCE { reqCert CertID, ... }` and
/// `CertID ::= SEQUENCE { hashAlgorithm AlgorithmIdentifier,
/// issuerNameHash OCTET STRING, issuerKeyHash OCTET STRING,
/// serialNumber INTEGER }`.
fn parse_ocsp_request_cert_id(der: &[u8]) -> CaResult<RequestCertId> {
    let (_, outer_content, _) = asn1::read_tlv(der)?;
    let (tbs_tag, tbs_content, _) = asn1::read_tlv(outer_content)?;
    if tbs_tag != asn1::TAG_SEQUENCE {
        return Err(CaError::Malformed("malformed TBSRequest".into()));
    }

    let mut rest = tbs_content;
    let (tag, _, next) = asn1::read_tlv(rest)?;
    if tag == 0xA0 {
        rest = next;
    }
    let (tag, _, next) = asn1::read_tlv(rest)?;
    if tag == 0xA1 {
        rest = next;
    }

    let (list_tag, list_content, _) = asn1::read_tlv(rest)?;
    if list_tag != asn1::TAG_SEQUENCE {
        return Err(CaError::Malformed("malformed requestList".into()));
    }
    let (request_tag, request_content, _) = asn1::read_tlv(list_content)?;
    if request_tag != asn1::TAG_SEQUENCE {
        return Err(CaError::Malformed("OCSP request carries no Request entries".into()));
    }
    let (cert_id_tag, cert_id_content, _) = asn1::read_tlv(request_content)?;
    if cert_id_tag != asn1::TAG_SEQUENCE {
        return Err(CaError::Malformed("malformed CertID".into()));
    }

    let (alg_tag, alg_content, rest) = asn1::read_tlv(cert_id_content)?;
    if alg_tag != asn1::TAG_SEQUENCE {
        return Err(CaError::Malformed("malformed CertID.hashAlgorithm".into()));
    }
    let (oid_tag, oid_bytes, _) = asn1::read_tlv(alg_content)?;
    if oid_tag != asn1::TAG_OID {
        return Err(CaError::Malformed("malformed CertID.hashAlgorithm".into()));
    }
    let hash_algorithm_oid = asn1::decode_oid(oid_bytes)?;

    let (name_hash_tag, issuer_name_hash, rest) = asn1::read_tlv(rest)?;
    if name_hash_tag != asn1::TAG_OCTET_STRING {
        return Err(CaError::Malformed("malformed CertID.issuerNameHash".into()));
    }
    let (key_hash_tag, issuer_key_hash, rest) = asn1::read_tlv(rest)?;
    if key_hash_tag != asn1::TAG_OCTET_STRING {
        return Err(CaError::Malformed("malformed CertID.issuerKeyHash".into()));
    }
    let (serial_tag, serial_bytes, _) = asn1::read_tlv(rest)?;
    if serial_tag != asn1::TAG_INTEGER {
        return Err(CaError::Malformed("malformed CertID.serialNumber".into()));
    }
    let serial = serial_from_integer(serial_bytes)?;

    Ok(RequestCertId {
        hash_algorithm_oid,
        issuer_name_hash: issuer_name_hash.to_vec(),
        issuer_key_hash: issuer_key_hash.to_vec(),
        serial,
    })
}

/// Walks the same `OCSPResponse`/`BasicOCSPResponse`/`ResponseData` shape
/// [`crate::ocsp::generator`] builds, since this responder only ever
/// parses responses this CA produced itself.
fn parse_ocsp_response(der: &[u8]) -> CaResult<ParsedOcspResponse> {
    let (_, outer_content, _) = asn1::read_tlv(der)?;
    let (status_tag, status_bytes, rest) = asn1::read_tlv(outer_content)?;
    if status_tag != asn1::TAG_ENUMERATED || status_bytes != [0] {
        return Err(CaError::Malformed("OCSP response not successful".into()));
    }
    let (wrapper_tag, wrapper_content, _) = asn1::read_tlv(rest)?;
    if wrapper_tag != 0xA0 {
        return Err(CaError::Malformed("missing OCSP responseBytes".into()));
    }
    let (rb_tag, rb_content, _) = asn1::read_tlv(wrapper_content)?;
    if rb_tag != asn1::TAG_SEQUENCE {
        return Err(CaError::Malformed("malformed ResponseBytes".into()));
    }
    let (_, _, rest) = asn1::read_tlv(rb_content)?; // responseType OID
    let (basic_octet_tag, basic_response_bytes, _) = asn1::read_tlv(rest)?;
    if basic_octet_tag != asn1::TAG_OCTET_STRING {
        return Err(CaError::Malformed("malformed ResponseBytes.response".into()));
    }

    let (_, basic_content, _) = asn1::read_tlv(basic_response_bytes)?;
    let (tbs_tag, tbs_content, _) = asn1::read_tlv(basic_content)?;
    if tbs_tag != asn1::TAG_SEQUENCE {
        return Err(CaError::Malformed("malformed BasicOCSPResponse".into()));
    }

    let (responder_tag, responder_content, rest) = asn1::read_tlv(tbs_content)?;
    if responder_tag != 0xA2 {
        return Err(CaError::Malformed("expected byKey responderID".into()));
    }
    let (issuer_key_hash, _) = asn1::expect_tlv(responder_content, asn1::TAG_OCTET_STRING)?;
    let issuer_key_hash = issuer_key_hash.to_vec();

    let (produced_tag, _, rest) = asn1::read_tlv(rest)?;
    if produced_tag != asn1::TAG_GENERALIZED_TIME {
        return Err(CaError::Malformed("malformed producedAt".into()));
    }

    let (responses_tag, responses_content, _) = asn1::read_tlv(rest)?;
    if responses_tag != asn1::TAG_SEQUENCE {
        return Err(CaError::Malformed("malformed responses".into()));
    }
    let (single_tag, single_content, _) = asn1::read_tlv(responses_content)?;
    if single_tag != asn1::TAG_SEQUENCE {
        return Err(CaError::Malformed("malformed SingleResponse".into()));
    }

    let (cert_id_tag, cert_id_content, rest) = asn1::read_tlv(single_content)?;
    if cert_id_tag != asn1::TAG_SEQUENCE {
        return Err(CaError::Malformed("malformed CertID".into()));
    }
    let (alg_tag, alg_content, r2) = asn1::read_tlv(cert_id_content)?;
    if alg_tag != asn1::TAG_SEQUENCE {
        return Err(CaError::Malformed("malformed CertID.hashAlgorithm".into()));
    }
    let (oid_tag, oid_bytes, _) = asn1::read_tlv(alg_content)?;
    if oid_tag != asn1::TAG_OID {
        return Err(CaError::Malformed("malformed CertID.hashAlgorithm".into()));
    }
    let hash_algorithm_oid = asn1::decode_oid(oid_bytes)?;
    let (_, _, r2) = asn1::read_tlv(r2)?; // issuerNameHash
    let (_, _, r2) = asn1::read_tlv(r2)?; // issuerKeyHash (CertID's own copy)
    let (serial_tag, serial_bytes, _) = asn1::read_tlv(r2)?;
    if serial_tag != asn1::TAG_INTEGER {
        return Err(CaError::Malformed("malformed CertID.serialNumber".into()));
    }
    let _serial = serial_from_integer(serial_bytes)?;

    let (status_choice_tag, status_choice_content, rest) = asn1::read_tlv(rest)?;
    let (status, revocation_reason, revoked_at_ns) = match status_choice_tag {
        0x80 => (CertStatus::Good, 0, 0),
        0xA1 => {
            let (revoked_time_tag, revoked_time_bytes, r3) = asn1::read_tlv(status_choice_content)?;
            if revoked_time_tag != asn1::TAG_GENERALIZED_TIME {
                return Err(CaError::Malformed("malformed RevokedInfo".into()));
            }
            let revoked_at = asn1::parse_generalized_time(revoked_time_bytes)?;
            let revoked_at_ns = revoked_at.timestamp_nanos_opt().unwrap_or_default();
            let reason = if r3.is_empty() {
                0
            } else {
                let (reason_outer_tag, reason_outer_content, _) = asn1::read_tlv(r3)?;
                if reason_outer_tag == 0xA0 {
                    let (reason_bytes, _) = asn1::expect_tlv(reason_outer_content, asn1::TAG_ENUMERATED)?;
                    reason_bytes.first().copied().unwrap_or(0) as i32
                } else {
                    0
                }
            };
            (CertStatus::Revoked, reason, revoked_at_ns)
        }
        0x82 => (CertStatus::Unknown, 0, 0),
        other => return Err(CaError::Malformed(format!("unknown CertStatus tag {other:#x}"))),
    };

    let (this_update_tag, this_update_bytes, rest) = asn1::read_tlv(rest)?;
    if this_update_tag != asn1::TAG_GENERALIZED_TIME {
        return Err(CaError::Malformed("malformed thisUpdate".into()));
    }
    let this_update = asn1::parse_generalized_time(this_update_bytes)?;

    let next_update = if rest.is_empty() {
        this_update
    } else {
        let (nu_outer_tag, nu_outer_content, _) = asn1::read_tlv(rest)?;
        if nu_outer_tag == 0xA0 {
            let (nu_bytes, _) = asn1::expect_tlv(nu_outer_content, asn1::TAG_GENERALIZED_TIME)?;
            asn1::parse_generalized_time(nu_bytes)?
        } else {
            this_update
        }
    };

    Ok(ParsedOcspResponse {
        hash_algorithm_oid,
        issuer_key_hash,
        this_update,
        next_update,
        status,
        revocation_reason,
        revoked_at_ns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_agree_on_good() {
        let parsed = ParsedOcspResponse {
            hash_algorithm_oid: SHA256_OID.into(),
            issuer_key_hash: vec![],
            this_update: Utc::now(),
            next_update: Utc::now(),
            status: CertStatus::Good,
            revocation_reason: 0,
            revoked_at_ns: 0,
        };
        assert!(statuses_agree(&RevocationStatus::Good, &parsed));
    }

    #[test]
    fn statuses_disagree_on_mismatched_reason() {
        let revoked_at = Utc::now();
        let parsed = ParsedOcspResponse {
            hash_algorithm_oid: SHA256_OID.into(),
            issuer_key_hash: vec![],
            this_update: Utc::now(),
            next_update: Utc::now(),
            status: CertStatus::Revoked,
            revocation_reason: 1,
            revoked_at_ns: revoked_at.timestamp_nanos_opt().unwrap_or_default(),
        };
        let sa_status = RevocationStatus::Revoked { reason: 4, revoked_at };
        assert!(!statuses_agree(&sa_status, &parsed));
    }

    #[test]
    fn cache_key_is_serial_hex_prefixed() {
        let serial = Serial([1u8; crate::serial::SERIAL_LEN]);
        assert_eq!(cache_key(&serial), format!("ocsp:{}", serial.to_hex()));
    }
}
