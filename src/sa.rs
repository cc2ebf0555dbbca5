//! StorageAuthority: the persistence boundary this crate calls into but
//! does not own (§6). Grounded on the teacher's `CertificateManager`
//! in-memory stores (`certificates`, `fingerprint_index`), generalized
//! into a trait so the orchestrator and the orphan integrator can be
//! exercised without a real database.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::{CaError, CaResult};
use crate::serial::Serial;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationStatus {
    Good,
    Revoked { reason: i32, revoked_at: DateTime<Utc> },
}

#[derive(Debug, Clone)]
pub struct StoredCertificate {
    pub der: Vec<u8>,
    pub issuer_id: i64,
    pub registration_id: i64,
    pub issued_at: DateTime<Utc>,
    pub status: RevocationStatus,
}

/// The persistence boundary consumed by the CA orchestrator and the
/// orphan integrator. Errors distinguish `NotFound` and `Duplicate` so
/// callers (notably orphan integration, which treats `Duplicate` as
/// success) can react without string matching.
#[async_trait]
pub trait StorageAuthority: Send + Sync {
    async fn add_serial(&self, serial: &Serial, registration_id: i64, issued_at: DateTime<Utc>) -> CaResult<()>;

    async fn add_precertificate(
        &self,
        serial: &Serial,
        der: &[u8],
        ocsp_response: &[u8],
        issuer_id: i64,
        registration_id: i64,
        issued_at: DateTime<Utc>,
    ) -> CaResult<()>;

    async fn add_certificate(
        &self,
        serial: &Serial,
        der: &[u8],
        issuer_id: i64,
        registration_id: i64,
        order_id: i64,
        issued_at: DateTime<Utc>,
    ) -> CaResult<()>;

    async fn get_certificate(&self, serial: &Serial) -> CaResult<StoredCertificate>;

    async fn get_precertificate(&self, serial: &Serial) -> CaResult<StoredCertificate>;

    async fn get_revocation_status(&self, serial: &Serial) -> CaResult<RevocationStatus>;
}

/// Reference in-memory implementation, suitable for the demo binaries
/// and for tests. A production deployment swaps this for a real
/// database-backed client over gRPC.
#[derive(Default)]
pub struct InMemoryStorageAuthority {
    serials: RwLock<HashMap<[u8; 18], DateTime<Utc>>>,
    precerts: RwLock<HashMap<[u8; 18], StoredCertificate>>,
    certs: RwLock<HashMap<[u8; 18], StoredCertificate>>,
}

impl InMemoryStorageAuthority {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl StorageAuthority for InMemoryStorageAuthority {
    async fn add_serial(&self, serial: &Serial, _registration_id: i64, issued_at: DateTime<Utc>) -> CaResult<()> {
        let mut serials = self.serials.write().await;
        if serials.contains_key(serial.as_bytes()) {
            return Err(CaError::duplicate(format!("serial {serial} already registered")));
        }
        serials.insert(*serial.as_bytes(), issued_at);
        Ok(())
    }

    async fn add_precertificate(
        &self,
        serial: &Serial,
        der: &[u8],
        _ocsp_response: &[u8],
        issuer_id: i64,
        registration_id: i64,
        issued_at: DateTime<Utc>,
    ) -> CaResult<()> {
        let mut precerts = self.precerts.write().await;
        if precerts.contains_key(serial.as_bytes()) {
            return Err(CaError::duplicate(format!("precertificate {serial} already stored")));
        }
        precerts.insert(
            *serial.as_bytes(),
            StoredCertificate {
                der: der.to_vec(),
                issuer_id,
                registration_id,
                issued_at,
                status: RevocationStatus::Good,
            },
        );
        Ok(())
    }

    async fn add_certificate(
        &self,
        serial: &Serial,
        der: &[u8],
        issuer_id: i64,
        registration_id: i64,
        _order_id: i64,
        issued_at: DateTime<Utc>,
    ) -> CaResult<()> {
        let mut certs = self.certs.write().await;
        if certs.contains_key(serial.as_bytes()) {
            return Err(CaError::duplicate(format!("certificate {serial} already stored")));
        }
        certs.insert(
            *serial.as_bytes(),
            StoredCertificate {
                der: der.to_vec(),
                issuer_id,
                registration_id,
                issued_at,
                status: RevocationStatus::Good,
            },
        );
        Ok(())
    }

    async fn get_certificate(&self, serial: &Serial) -> CaResult<StoredCertificate> {
        self.certs
            .read()
            .await
            .get(serial.as_bytes())
            .cloned()
            .ok_or_else(|| CaError::not_found(format!("certificate {serial} not found")))
    }

    async fn get_precertificate(&self, serial: &Serial) -> CaResult<StoredCertificate> {
        self.precerts
            .read()
            .await
            .get(serial.as_bytes())
            .cloned()
            .ok_or_else(|| CaError::not_found(format!("precertificate {serial} not found")))
    }

    async fn get_revocation_status(&self, serial: &Serial) -> CaResult<RevocationStatus> {
        if let Some(cert) = self.certs.read().await.get(serial.as_bytes()) {
            return Ok(cert.status);
        }
        if let Some(cert) = self.precerts.read().await.get(serial.as_bytes()) {
            return Ok(cert.status);
        }
        Err(CaError::not_found(format!("no revocation status for {serial}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::SerialAllocator;

    #[tokio::test]
    async fn duplicate_serial_registration_fails() {
        let sa = InMemoryStorageAuthority::new();
        let serial = SerialAllocator::new(1).unwrap().allocate().unwrap();
        sa.add_serial(&serial, 1, Utc::now()).await.unwrap();
        let err = sa.add_serial(&serial, 1, Utc::now()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Duplicate);
    }
}
