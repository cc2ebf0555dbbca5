//! The consumed-interface boundaries that sit outside the signing core
//! proper: key/CSR policy, CRL linting, and the HSM signing primitive.
//!
//! These are specified only by shape; callers depend on the traits, not
//! on any particular backend. [`SoftwareSigner`] is the reference
//! implementation used when no real HSM is wired in — grounded on the
//! teacher's `CertificateManager::generate_ca_certificate` /
//! `generate_x509_certificate` rcgen usage, extended with `ring` for the
//! raw TBS signing that OCSP and CRL responses need and that rcgen's
//! certificate-shaped API doesn't expose.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rcgen::KeyPair;
use tokio::sync::{oneshot, Mutex};

use crate::error::{CaError, CaResult};
use crate::issuer::KeyAlgorithm;

/// `WillingToIssueWildcards` and friends: policy decisions that live
/// outside the signing core and are only ever consulted, never owned.
pub trait PolicyAuthority: Send + Sync {
    fn willing_to_issue(&self, dns_identifiers: &[String]) -> CaResult<()>;
}

/// Accepts every hostname. Stands in for the real policy authority,
/// which lives outside the signing core's scope.
pub struct AllowAllPolicy;

impl PolicyAuthority for AllowAllPolicy {
    fn willing_to_issue(&self, _dns_identifiers: &[String]) -> CaResult<()> {
        Ok(())
    }
}

/// `GoodKey`: rejects keys too weak to sign.
pub trait KeyPolicy: Send + Sync {
    fn good_key(&self, public_key_der: &[u8], algorithm: KeyAlgorithm) -> CaResult<()>;
}

pub struct DefaultKeyPolicy {
    pub min_rsa_modulus_bits: usize,
}

impl Default for DefaultKeyPolicy {
    fn default() -> Self {
        Self {
            min_rsa_modulus_bits: 2048,
        }
    }
}

impl KeyPolicy for DefaultKeyPolicy {
    fn good_key(&self, public_key_der: &[u8], algorithm: KeyAlgorithm) -> CaResult<()> {
        match algorithm {
            KeyAlgorithm::Rsa => {
                // SubjectPublicKeyInfo wraps the modulus; a loose byte-length
                // floor is a cheap proxy for modulus size without a full
                // ASN.1 walk, since every RSA SPKI this CA accepts encodes
                // the modulus as the dominant term in the DER length.
                let approx_bits = public_key_der.len().saturating_mul(8) / 2;
                if approx_bits < self.min_rsa_modulus_bits {
                    return Err(CaError::BadCsr("RSA key too small".into()));
                }
                Ok(())
            }
            KeyAlgorithm::Ecdsa => Ok(()),
        }
    }
}

/// `CheckCRL`: a per-issuer pre-signing sanity check on a CRL template.
pub trait CrlLinter: Send + Sync {
    fn check(&self, entry_count: usize, shard_idx: i32) -> CaResult<()>;
}

pub struct DefaultCrlLinter;

impl CrlLinter for DefaultCrlLinter {
    fn check(&self, _entry_count: usize, shard_idx: i32) -> CaResult<()> {
        if shard_idx < 0 {
            return Err(CaError::internal("negative shard index"));
        }
        Ok(())
    }
}

/// The HSM boundary. A real deployment backs this with a PKCS#11 or
/// cloud-KMS handle; [`SoftwareSigner`] is the in-process reference used
/// by tests and by the demo binaries.
pub trait CertificateSigner: Send + Sync {
    /// Raw-signs an arbitrary TBS byte string (OCSP `ResponseData`, CRL
    /// `TBSCertList`) and returns the signature bytes.
    fn sign_raw(&self, tbs: &[u8]) -> CaResult<Vec<u8>>;

    /// The AlgorithmIdentifier OID this signer produces signatures under.
    fn signature_algorithm_oid(&self) -> &'static str;

    fn public_key_der(&self) -> &[u8];
}

enum RawKey {
    Rsa(ring::signature::RsaKeyPair),
    EcdsaP256(ring::signature::EcdsaKeyPair),
}

/// rcgen-backed signer: parses the issuer's PKCS#8 key once and holds a
/// parallel `ring` key pair for the raw TBS signatures OCSP/CRL/cert
/// responses need, since rcgen's own certificate-shaped signing API
/// doesn't expose a raw-bytes sign primitive.
pub struct SoftwareSigner {
    raw_key: RawKey,
    public_key_der: Vec<u8>,
    algorithm_oid: &'static str,
}

impl SoftwareSigner {
    pub fn from_pem(key_pem: &str) -> CaResult<Self> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| CaError::internal(format!("parsing issuer key: {e}")))?;
        let pkcs8 = key_pair.serialized_der().to_vec();
        let public_key_der = key_pair.public_key_der();

        let is_ecdsa = key_pair.algorithm() == &rcgen::PKCS_ECDSA_P256_SHA256;
        let (raw_key, algorithm_oid) = if is_ecdsa {
            let rng = ring::rand::SystemRandom::new();
            let kp = ring::signature::EcdsaKeyPair::from_pkcs8(
                &ring::signature::ECDSA_P256_SHA256_ASN1_SIGNING,
                &pkcs8,
                &rng,
            )
            .map_err(|e| CaError::internal(format!("loading ECDSA key: {e}")))?;
            (RawKey::EcdsaP256(kp), "1.2.840.10045.4.3.2")
        } else {
            let kp = ring::signature::RsaKeyPair::from_pkcs8(&pkcs8)
                .map_err(|e| CaError::internal(format!("loading RSA key: {e}")))?;
            (RawKey::Rsa(kp), "1.2.840.113549.1.1.11")
        };

        Ok(Self {
            raw_key,
            public_key_der,
            algorithm_oid,
        })
    }
}

impl CertificateSigner for SoftwareSigner {
    fn sign_raw(&self, tbs: &[u8]) -> CaResult<Vec<u8>> {
        match &self.raw_key {
            RawKey::Rsa(kp) => {
                let rng = ring::rand::SystemRandom::new();
                let mut sig = vec![0u8; kp.public_modulus_len()];
                kp.sign(
                    &ring::signature::RSA_PKCS1_SHA256,
                    &rng,
                    tbs,
                    &mut sig,
                )
                .map_err(|_| CaError::Hsm("RSA signing failed".into()))?;
                Ok(sig)
            }
            RawKey::EcdsaP256(kp) => {
                let rng = ring::rand::SystemRandom::new();
                let sig = kp
                    .sign(&rng, tbs)
                    .map_err(|_| CaError::Hsm("ECDSA signing failed".into()))?;
                Ok(sig.as_ref().to_vec())
            }
        }
    }

    fn signature_algorithm_oid(&self) -> &'static str {
        self.algorithm_oid
    }

    fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }
}

/// Per-account ECDSA allow-list, reloaded from a YAML file on change.
///
/// Guarded by a readers-writer lock: many concurrent readers during
/// issuance, a single writer on file reload (§9).
pub struct EcdsaAllowList {
    inner: std::sync::RwLock<std::collections::HashSet<i64>>,
}

impl EcdsaAllowList {
    pub fn empty() -> Self {
        Self {
            inner: std::sync::RwLock::new(std::collections::HashSet::new()),
        }
    }

    pub fn from_yaml_bytes(bytes: &[u8]) -> CaResult<Self> {
        let ids = parse_allow_list_yaml(bytes)?;
        Ok(Self {
            inner: std::sync::RwLock::new(ids.into_iter().collect()),
        })
    }

    pub fn allows(&self, registration_id: i64) -> bool {
        self.inner
            .read()
            .expect("allow-list lock poisoned")
            .contains(&registration_id)
    }

    /// Replaces the full contents under the writer lock, as the generic
    /// file reloader's callback does on each detected mtime change.
    pub fn reload(&self, bytes: &[u8]) -> CaResult<()> {
        let ids = parse_allow_list_yaml(bytes)?;
        *self.inner.write().expect("allow-list lock poisoned") = ids.into_iter().collect();
        Ok(())
    }
}

#[derive(serde::Deserialize)]
struct AllowListDoc {
    registration_ids: Vec<i64>,
}

fn parse_allow_list_yaml(bytes: &[u8]) -> CaResult<Vec<i64>> {
    let doc: AllowListDoc = serde_yaml::from_slice(bytes)
        .map_err(|e| CaError::internal(format!("parsing ECDSA allow-list: {e}")))?;
    Ok(doc.registration_ids)
}

/// Spawns the generic file reloader: polls `path`'s mtime once a second
/// and reloads `list` on change, the same `tokio::spawn` background-loop
/// shape as the OCSP log batcher and the orphan integrator.
pub fn spawn_reloader(list: Arc<EcdsaAllowList>, path: PathBuf) -> AllowListReloaderHandle {
    let (stop_tx, mut stop_rx) = oneshot::channel();
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut last_modified = tokio::fs::metadata(&path).await.and_then(|m| m.modified()).ok();
        loop {
            if stop_rx.try_recv().is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;

            let modified = match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(m) => m,
                Err(e) => {
                    tracing::error!("failed to stat ECDSA allow-list {}: {e}", path.display());
                    continue;
                }
            };
            if Some(modified) == last_modified {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => match list.reload(&bytes) {
                    Ok(()) => last_modified = Some(modified),
                    Err(e) => tracing::error!("failed to reload ECDSA allow-list {}: {e}", path.display()),
                },
                Err(e) => tracing::error!("failed to read ECDSA allow-list {}: {e}", path.display()),
            }
        }
        let _ = done_tx.send(());
    });

    AllowListReloaderHandle {
        stop_tx: Mutex::new(Some(stop_tx)),
        done_rx: Mutex::new(Some(done_rx)),
    }
}

/// Handle to the running allow-list reloader loop.
pub struct AllowListReloaderHandle {
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl AllowListReloaderHandle {
    pub async fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(rx) = self.done_rx.lock().await.take() {
            let _ = rx.await;
        }
    }
}

/// Convenience alias used by the issuer selection path.
pub type SharedSigner = Arc<dyn CertificateSigner>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_reload_replaces_contents() {
        let list = EcdsaAllowList::from_yaml_bytes(b"registration_ids: [1, 2]\n").unwrap();
        assert!(list.allows(1));
        assert!(!list.allows(3));
        list.reload(b"registration_ids: [3]\n").unwrap();
        assert!(!list.allows(1));
        assert!(list.allows(3));
    }

    #[test]
    fn default_key_policy_rejects_tiny_rsa_keys() {
        let policy = DefaultKeyPolicy::default();
        assert!(policy.good_key(&[0u8; 32], KeyAlgorithm::Rsa).is_err());
    }
}
