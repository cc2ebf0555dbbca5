//! Issuer Registry: the ordered set of CA certificates and HSM-backed
//! signers this instance may sign with.
//!
//! Grounded on the teacher's `CertificateManager` CA bootstrap
//! (`generate_ca_certificate`), generalized from a single hardcoded CA to
//! an on-disk-loaded, multi-issuer registry indexed by algorithm and by
//! two stable IDs, per the data model.

use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::config::IssuerConfig;
use crate::error::{CaError, CaResult};
use crate::policy::CertificateSigner;

/// Public-key algorithm a CSR or issuer may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    Rsa,
    Ecdsa,
}

impl KeyAlgorithm {
    pub fn parse(s: &str) -> CaResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rsa" => Ok(Self::Rsa),
            "ecdsa" => Ok(Self::Ecdsa),
            other => Err(CaError::internal(format!("unknown key algorithm {other}"))),
        }
    }
}

/// A stable identifier derived from a hash of the issuer's Subject DN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IssuerNameId(pub i64);

/// The legacy numeric identifier, kept for backward-compatible lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IssuerId(pub i64);

/// One issuer: certificate, HSM-backed signer, and the algorithms it may
/// sign for. Immutable after construction.
pub struct Issuer {
    pub name: String,
    pub name_id: IssuerNameId,
    pub id: IssuerId,
    pub algorithms: Vec<KeyAlgorithm>,
    pub cert_der: Vec<u8>,
    pub not_after: chrono::DateTime<chrono::Utc>,
    pub signer: Arc<dyn CertificateSigner>,
}

impl Issuer {
    pub fn supports(&self, alg: KeyAlgorithm) -> bool {
        self.algorithms.contains(&alg)
    }
}

/// Derives the stable IssuerNameID from a DER-encoded Subject DN: the
/// low 63 bits of the SHA-256 digest, always non-negative.
pub fn name_id_from_subject_der(subject_der: &[u8]) -> IssuerNameId {
    let mut hasher = Sha256::new();
    hasher.update(subject_der);
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let raw = i64::from_be_bytes(bytes);
    IssuerNameId(raw & i64::MAX)
}

/// Read-only after construction: every issuer certificate and signer
/// loaded at startup from on-disk material.
pub struct IssuerRegistry {
    by_name_id: HashMap<i64, Arc<Issuer>>,
    by_id: HashMap<i64, Arc<Issuer>>,
    by_algorithm: HashMap<KeyAlgorithm, Arc<Issuer>>,
    /// Keyed by `(sha256(subject DER), sha256(SPKI bits))`, the pair an
    /// incoming OCSP request's `CertID` carries instead of either stable
    /// ID — resolved once at load time since neither hash changes after
    /// startup.
    by_hash: HashMap<(Vec<u8>, Vec<u8>), Arc<Issuer>>,
}

impl IssuerRegistry {
    /// Loads one issuer per [`IssuerConfig`] entry, failing fast on any
    /// parse error or duplicate `IssuerNameID`.
    pub fn load(configs: &[IssuerConfig]) -> CaResult<Self> {
        let mut by_name_id = HashMap::new();
        let mut by_id = HashMap::new();
        let mut by_algorithm = HashMap::new();
        let mut by_hash = HashMap::new();

        for cfg in configs {
            let cert_pem = std::fs::read_to_string(&cfg.cert_path)?;
            let key_pem = std::fs::read_to_string(&cfg.key_path)?;
            let cert_der = pem_to_der(&cert_pem)?;

            let (_, parsed) = X509Certificate::from_der(&cert_der)
                .map_err(|e| CaError::internal(format!("parsing issuer cert: {e}")))?;
            if parsed.basic_constraints().ok().flatten().map(|b| b.value.ca) != Some(true) {
                return Err(CaError::internal(format!(
                    "issuer {} certificate is not a CA certificate",
                    cfg.name
                )));
            }
            let not_after = chrono::DateTime::<chrono::Utc>::from_timestamp(
                parsed.validity().not_after.timestamp(),
                0,
            )
            .ok_or_else(|| CaError::internal("issuer notAfter out of range"))?;

            let name_id = name_id_from_subject_der(parsed.subject().as_raw());
            if by_name_id.contains_key(&name_id.0) {
                return Err(CaError::internal(format!(
                    "duplicate IssuerNameID for issuer {}",
                    cfg.name
                )));
            }

            let algorithms = cfg
                .algorithms
                .iter()
                .map(|s| KeyAlgorithm::parse(s))
                .collect::<CaResult<Vec<_>>>()?;

            let signer = crate::policy::SoftwareSigner::from_pem(&key_pem)?;

            let issuer = Arc::new(Issuer {
                name: cfg.name.clone(),
                name_id,
                id: IssuerId(cfg.legacy_id),
                algorithms: algorithms.clone(),
                cert_der,
                not_after,
                signer: Arc::new(signer),
            });

            let name_hash = Sha256::digest(parsed.subject().as_raw()).to_vec();
            let key_hash = Sha256::digest(parsed.public_key().subject_public_key.as_ref()).to_vec();
            by_hash.insert((name_hash, key_hash), issuer.clone());

            by_name_id.insert(name_id.0, issuer.clone());
            by_id.insert(cfg.legacy_id, issuer.clone());
            for alg in algorithms {
                by_algorithm.entry(alg).or_insert_with(|| issuer.clone());
            }
        }

        Ok(Self {
            by_name_id,
            by_id,
            by_algorithm,
            by_hash,
        })
    }

    pub fn lookup_by_name_id(&self, id: IssuerNameId) -> CaResult<Arc<Issuer>> {
        self.by_name_id
            .get(&id.0)
            .cloned()
            .ok_or_else(|| CaError::not_found(format!("unrecognized IssuerNameID {}", id.0)))
    }

    /// Legacy-ID lookup, used only as a fallback.
    pub fn lookup_by_id(&self, id: IssuerId) -> CaResult<Arc<Issuer>> {
        self.by_id
            .get(&id.0)
            .cloned()
            .ok_or_else(|| CaError::not_found(format!("unrecognized IssuerID {}", id.0)))
    }

    pub fn lookup_by_algorithm(&self, alg: KeyAlgorithm) -> CaResult<Arc<Issuer>> {
        self.by_algorithm
            .get(&alg)
            .cloned()
            .ok_or_else(|| CaError::not_found(format!("no issuer for algorithm {alg:?}")))
    }

    /// Resolves the issuer an OCSP request's `CertID` names, by the
    /// `(issuerNameHash, issuerKeyHash)` pair it carries in place of a
    /// stable ID.
    pub fn lookup_by_hashes(&self, name_hash: &[u8], key_hash: &[u8]) -> CaResult<Arc<Issuer>> {
        self.by_hash
            .get(&(name_hash.to_vec(), key_hash.to_vec()))
            .cloned()
            .ok_or_else(|| CaError::not_found("OCSP request names an unrecognized issuer"))
    }
}

fn pem_to_der(pem_str: &str) -> CaResult<Vec<u8>> {
    let doc = pem::parse(pem_str).map_err(|e| CaError::internal(format!("PEM parse: {e}")))?;
    Ok(doc.into_contents())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_id_is_deterministic_and_nonnegative() {
        let a = name_id_from_subject_der(b"CN=Test CA");
        let b = name_id_from_subject_der(b"CN=Test CA");
        assert_eq!(a, b);
        assert!(a.0 >= 0);
        let c = name_id_from_subject_der(b"CN=Other CA");
        assert_ne!(a, c);
    }
}
