//! Tonic service implementations bridging `proto::ca::v1` onto the
//! library-level [`crate::ca::CertificateAuthority`],
//! [`crate::ocsp::generator::OcspGenerator`], and [`crate::crl::CrlGenerator`].
//!
//! The CRL handler follows the same `async_stream::stream!` shape the
//! teacher used for its telemetry service: drain one metadata frame,
//! then entry frames, then reply with the signed CRL split into fixed
//! chunks.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tonic::{Request, Response, Status, Streaming};

use crate::ca::{self, CertificateAuthority as CaOrchestrator};
use crate::crl::{self, CrlGenerator as CrlAssembler};
use crate::grpc::proto::{
    self, certificate_authority_server::CertificateAuthority as CertificateAuthorityTrait,
    crl_generator_request::Payload as CrlRequestPayload, crl_generator_server::CrlGenerator as CrlGeneratorTrait,
    ocsp_generator_server::OcspGenerator as OcspGeneratorTrait,
};
use crate::issuer::IssuerNameId;
use crate::ocsp::generator::{CertStatus, OcspGenerator as OcspAssembler, OcspRequest};
use crate::serial::Serial;

fn cert_status_from_proto(status: i32) -> CertStatus {
    match proto::CertStatus::try_from(status).unwrap_or(proto::CertStatus::CertStatusUnknown) {
        proto::CertStatus::CertStatusGood => CertStatus::Good,
        proto::CertStatus::CertStatusRevoked => CertStatus::Revoked,
        proto::CertStatus::CertStatusUnknown => CertStatus::Unknown,
    }
}

/// `CertificateAuthority`: the issuance orchestrator plus read-through
/// access to OCSP and CRL generation for callers that only hold this
/// one connection.
pub struct CertificateAuthorityService {
    ca: Arc<CaOrchestrator>,
    ocsp: Arc<OcspAssembler>,
    crl: Arc<CrlAssembler>,
}

impl CertificateAuthorityService {
    pub fn new(ca: Arc<CaOrchestrator>, ocsp: Arc<OcspAssembler>, crl: Arc<CrlAssembler>) -> Self {
        Self { ca, ocsp, crl }
    }
}

type CrlStream = Pin<Box<dyn Stream<Item = Result<proto::CRLGeneratorResponse, Status>> + Send + 'static>>;

#[tonic::async_trait]
impl CertificateAuthorityTrait for CertificateAuthorityService {
    async fn issue_precertificate(
        &self,
        request: Request<proto::IssuePrecertificateRequest>,
    ) -> Result<Response<proto::IssuePrecertificateResponse>, Status> {
        let req = request.into_inner();
        let issuer_name_id = if req.issuer_name_id == 0 {
            None
        } else {
            Some(IssuerNameId(req.issuer_name_id))
        };
        let der = self
            .ca
            .issue_precertificate(ca::IssuePrecertificateRequest {
                csr_der: req.csr,
                registration_id: req.registration_id,
                issuer_name_id,
            })
            .await?;
        Ok(Response::new(proto::IssuePrecertificateResponse { der }))
    }

    async fn issue_certificate_for_precertificate(
        &self,
        request: Request<proto::IssueCertificateForPrecertificateRequest>,
    ) -> Result<Response<proto::IssueCertificateForPrecertificateResponse>, Status> {
        let req = request.into_inner();
        let der = self
            .ca
            .issue_certificate_for_precertificate(ca::IssueCertificateForPrecertificateRequest {
                precert_der: req.precertificate_der,
                scts: req.scts,
                registration_id: req.registration_id,
                order_id: req.order_id,
            })
            .await?;
        Ok(Response::new(proto::IssueCertificateForPrecertificateResponse { der }))
    }

    async fn generate_ocsp(
        &self,
        request: Request<proto::GenerateOCSPRequest>,
    ) -> Result<Response<proto::GenerateOCSPResponse>, Status> {
        let req = request.into_inner();
        let response = generate_ocsp(&self.ocsp, req).await?;
        Ok(Response::new(response))
    }

    type GenerateCRLStream = CrlStream;

    async fn generate_crl(
        &self,
        request: Request<Streaming<proto::CRLGeneratorRequest>>,
    ) -> Result<Response<Self::GenerateCRLStream>, Status> {
        generate_crl_stream(self.crl.clone(), request)
    }
}

/// `OcspGenerator`: the narrower service the registration authority
/// talks to when it only needs signed OCSP responses, not issuance.
pub struct OcspGeneratorService {
    ocsp: Arc<OcspAssembler>,
}

impl OcspGeneratorService {
    pub fn new(ocsp: Arc<OcspAssembler>) -> Self {
        Self { ocsp }
    }
}

#[tonic::async_trait]
impl OcspGeneratorTrait for OcspGeneratorService {
    async fn generate_ocsp(
        &self,
        request: Request<proto::GenerateOCSPRequest>,
    ) -> Result<Response<proto::GenerateOCSPResponse>, Status> {
        let req = request.into_inner();
        let response = generate_ocsp(&self.ocsp, req).await?;
        Ok(Response::new(response))
    }
}

/// `CrlGenerator`: the bidirectional streaming service used by the CRL
/// generation job, kept separate from `CertificateAuthority` so it can
/// be deployed and scaled on its own.
pub struct CrlGeneratorService {
    crl: Arc<CrlAssembler>,
}

impl CrlGeneratorService {
    pub fn new(crl: Arc<CrlAssembler>) -> Self {
        Self { crl }
    }
}

#[tonic::async_trait]
impl CrlGeneratorTrait for CrlGeneratorService {
    type GenerateCRLStream = CrlStream;

    async fn generate_crl(
        &self,
        request: Request<Streaming<proto::CRLGeneratorRequest>>,
    ) -> Result<Response<Self::GenerateCRLStream>, Status> {
        generate_crl_stream(self.crl.clone(), request)
    }
}

async fn generate_ocsp(
    ocsp: &OcspAssembler,
    req: proto::GenerateOCSPRequest,
) -> Result<proto::GenerateOCSPResponse, Status> {
    let serial = Serial::from_hex(&req.serial).map_err(Status::from)?;
    let response = ocsp
        .generate(OcspRequest {
            serial,
            issuer_name_id: if req.issuer_name_id == 0 {
                None
            } else {
                Some(IssuerNameId(req.issuer_name_id))
            },
            issuer_id: if req.issuer_id == 0 {
                None
            } else {
                Some(crate::issuer::IssuerId(req.issuer_id))
            },
            status: cert_status_from_proto(req.status),
            revocation_reason: req.revocation_reason,
            revoked_at_ns: req.revoked_at_ns,
        })
        .await?;
    Ok(proto::GenerateOCSPResponse { response })
}

fn generate_crl_stream(
    crl: Arc<CrlAssembler>,
    request: Request<Streaming<proto::CRLGeneratorRequest>>,
) -> Result<Response<CrlStream>, Status> {
    let mut stream = request.into_inner();

    let output = async_stream::try_stream! {
        let mut frames = Vec::new();
        while let Some(next) = stream.message().await? {
            frames.push(next);
        }
        let (metadata, entries) = parse_crl_frames(frames)?;

        let der = crl.generate(metadata, entries).map_err(Status::from)?;
        let mut written = 0usize;
        for chunk in CrlAssembler::chunks(&der) {
            written += chunk.len();
            tracing::debug!(bytes_written = written, total = der.len(), "wrote CRL chunk");
            yield proto::CRLGeneratorResponse { chunk: chunk.to_vec() };
        }
    };

    Ok(Response::new(Box::pin(output) as CrlStream))
}

/// Splits a collected CRL generation stream into its leading `CRLMetadata`
/// frame and the `CRLEntry` frames that follow, rejecting a stream with no
/// leading metadata or with more than one metadata frame.
fn parse_crl_frames(frames: Vec<proto::CRLGeneratorRequest>) -> Result<(crl::CrlMetadata, Vec<crl::CrlEntry>), Status> {
    let mut frames = frames.into_iter();
    let first = frames
        .next()
        .ok_or_else(|| Status::invalid_argument("CRL generation stream closed before any frame"))?;
    let metadata = match first.payload {
        Some(CrlRequestPayload::Metadata(m)) => crl::CrlMetadata {
            issuer_name_id: IssuerNameId(m.issuer_name_id),
            shard_idx: m.shard_idx,
            this_update: crate::asn1::generalized_time_from_nanos(m.this_update_ns),
        },
        _ => return Err(Status::invalid_argument("first frame of a CRL generation stream must be CRLMetadata")),
    };

    let mut entries = Vec::new();
    for next in frames {
        match next.payload {
            Some(CrlRequestPayload::Entry(e)) => {
                let serial = Serial::from_hex(&e.serial).map_err(Status::from)?;
                entries.push(crl::CrlEntry {
                    serial,
                    revoked_at_ns: e.revoked_at_ns,
                    reason: e.reason,
                });
            }
            Some(CrlRequestPayload::Metadata(_)) => {
                return Err(Status::invalid_argument("got more than one metadata message"));
            }
            None => {}
        }
    }

    Ok((metadata, entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::proto::crl_generator_request::Payload;

    fn metadata_frame(shard_idx: i32) -> proto::CRLGeneratorRequest {
        proto::CRLGeneratorRequest {
            payload: Some(Payload::Metadata(proto::CRLMetadata {
                issuer_name_id: 1,
                shard_idx,
                this_update_ns: 0,
            })),
        }
    }

    #[test]
    fn duplicate_metadata_frame_is_rejected_with_the_exact_message() {
        let frames = vec![metadata_frame(0), metadata_frame(1)];
        let err = parse_crl_frames(frames).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        assert_eq!(err.message(), "got more than one metadata message");
    }

    #[test]
    fn single_metadata_frame_with_no_entries_parses_cleanly() {
        let frames = vec![metadata_frame(2)];
        let (metadata, entries) = parse_crl_frames(frames).unwrap();
        assert_eq!(metadata.shard_idx, 2);
        assert!(entries.is_empty());
    }
}
