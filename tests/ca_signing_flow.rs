//! End-to-end exercise of the signing core: issue a precertificate,
//! finalize it into a certificate, generate an OCSP response for it,
//! and generate an empty CRL shard — all through the same public APIs
//! the gRPC service layer calls.

use std::sync::Arc;

use ca_signing_core::ca::{CertificateAuthority, IssueCertificateForPrecertificateRequest, IssuePrecertificateRequest};
use ca_signing_core::config::IssuerConfig;
use ca_signing_core::crl::{CrlGenerator, CrlMetadata};
use ca_signing_core::issuer::IssuerRegistry;
use ca_signing_core::metrics::CaMetrics;
use ca_signing_core::ocsp::generator::{CertStatus, OcspGenerator, OcspRequest};
use ca_signing_core::orphan::OrphanQueue;
use ca_signing_core::policy::{AllowAllPolicy, DefaultCrlLinter, DefaultKeyPolicy, EcdsaAllowList};
use ca_signing_core::sa::InMemoryStorageAuthority;
use rcgen::{BasicConstraints, Certificate, CertificateParams, IsCa};

fn write_issuer(dir: &std::path::Path) -> IssuerConfig {
    let mut params = CertificateParams::new(vec!["Test Root CA".to_string()]);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let issuer_cert = Certificate::from_params(params).unwrap();

    let cert_path = dir.join("issuer.pem");
    let key_path = dir.join("issuer-key.pem");
    std::fs::write(&cert_path, issuer_cert.serialize_pem().unwrap()).unwrap();
    std::fs::write(&key_path, issuer_cert.serialize_private_key_pem()).unwrap();

    IssuerConfig {
        name: "test-root".to_string(),
        cert_path,
        key_path,
        algorithms: vec!["ecdsa".to_string()],
        legacy_id: 1,
    }
}

fn build_csr(common_name: &str, dns_name: &str) -> Vec<u8> {
    let mut params = CertificateParams::new(vec![dns_name.to_string()]);
    params.distinguished_name = rcgen::DistinguishedName::new();
    params.distinguished_name.push(rcgen::DnType::CommonName, common_name);
    let cert = Certificate::from_params(params).unwrap();
    cert.serialize_request_der().unwrap()
}

async fn build_ca(
    dir: &std::path::Path,
) -> (Arc<CertificateAuthority>, Arc<OcspGenerator>, Arc<CrlGenerator>, Arc<IssuerRegistry>) {
    let issuer_config = write_issuer(dir);
    let registry = Arc::new(IssuerRegistry::load(&[issuer_config]).unwrap());
    let metrics = Arc::new(CaMetrics::new());

    let ocsp_generator = Arc::new(OcspGenerator::new(
        registry.clone(),
        std::time::Duration::from_secs(3600),
        None,
        metrics.clone(),
    ));

    let orphan_queue = Arc::new(OrphanQueue::open(dir.join("orphans.bin"), metrics.clone()).await.unwrap());
    let sa = InMemoryStorageAuthority::new();

    let ca = Arc::new(
        CertificateAuthority::new(
            registry.clone(),
            sa,
            ocsp_generator.clone(),
            orphan_queue,
            Arc::new(AllowAllPolicy),
            Arc::new(DefaultKeyPolicy::default()),
            Arc::new(EcdsaAllowList::empty()),
            7,
            std::time::Duration::from_secs(90 * 24 * 3600),
            std::time::Duration::from_secs(3600),
            10,
            metrics.clone(),
        )
        .unwrap(),
    );

    let crl_generator = Arc::new(
        CrlGenerator::new(
            registry.clone(),
            Arc::new(DefaultCrlLinter),
            "http://crl.example.com".to_string(),
            std::time::Duration::from_secs(0),
            4096,
            metrics,
        )
        .unwrap(),
    );

    (ca, ocsp_generator, crl_generator, registry)
}

#[tokio::test]
async fn issues_precertificate_then_finalizes_into_a_certificate() {
    let dir = tempfile::tempdir().unwrap();
    let (ca, _ocsp, _crl, _registry) = build_ca(dir.path()).await;

    let csr_der = build_csr("example.com", "example.com");
    let precert_der = ca
        .issue_precertificate(IssuePrecertificateRequest {
            csr_der,
            registration_id: 42,
            issuer_name_id: None,
        })
        .await
        .unwrap();
    assert!(!precert_der.is_empty());

    let cert_der = ca
        .issue_certificate_for_precertificate(IssueCertificateForPrecertificateRequest {
            precert_der,
            scts: vec![vec![1, 2, 3, 4]],
            registration_id: 42,
            order_id: 99,
        })
        .await
        .unwrap();
    assert!(!cert_der.is_empty());
}

#[tokio::test]
async fn rejects_precertificate_issuance_with_zero_registration_id() {
    let dir = tempfile::tempdir().unwrap();
    let (ca, _ocsp, _crl, _registry) = build_ca(dir.path()).await;

    let csr_der = build_csr("example.com", "example.com");
    let err = ca
        .issue_precertificate(IssuePrecertificateRequest {
            csr_der,
            registration_id: 0,
            issuer_name_id: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ca_signing_core::error::ErrorKind::Malformed);
}

#[tokio::test]
async fn generates_an_ocsp_response_for_a_good_serial() {
    let dir = tempfile::tempdir().unwrap();
    let (_ca, ocsp, _crl, _registry) = build_ca(dir.path()).await;

    let allocator = ca_signing_core::serial::SerialAllocator::new(7).unwrap();
    let serial = allocator.allocate().unwrap();

    let der = ocsp
        .generate(OcspRequest {
            serial,
            issuer_name_id: None,
            issuer_id: Some(ca_signing_core::issuer::IssuerId(1)),
            status: CertStatus::Good,
            revocation_reason: 0,
            revoked_at_ns: 0,
        })
        .await
        .unwrap();
    assert!(!der.is_empty());
}

#[tokio::test]
async fn generates_an_empty_crl_shard() {
    let dir = tempfile::tempdir().unwrap();
    let (_ca, _ocsp, crl, registry) = build_ca(dir.path()).await;
    let issuer = registry.lookup_by_algorithm(ca_signing_core::issuer::KeyAlgorithm::Ecdsa).unwrap();

    let der = crl
        .generate(
            CrlMetadata {
                issuer_name_id: issuer.name_id,
                shard_idx: 0,
                this_update: chrono::Utc::now(),
            },
            vec![],
        )
        .unwrap();
    assert!(!der.is_empty());

    let chunks: Vec<&[u8]> = CrlGenerator::chunks(&der).collect();
    assert!(!chunks.is_empty());
    assert_eq!(chunks.concat(), der);
}
