//! gRPC server wiring for the signing core.
//!
//! Assembles the `CertificateAuthority`, `OcspGenerator`, and
//! `CrlGenerator` services behind optional mTLS and optional
//! reflection, the same `Server::builder()...serve(addr)` shape the
//! teacher used, minus its API-key interceptor: this gRPC surface is
//! reached only by other internal components, authenticated (if at
//! all) at the transport layer via mTLS.

use std::net::SocketAddr;
use std::sync::Arc;

use tonic::transport::Server;
use tracing::info;

use super::proto::{
    certificate_authority_server::CertificateAuthorityServer, crl_generator_server::CrlGeneratorServer,
    ocsp_generator_server::OcspGeneratorServer,
};
use super::service::{CertificateAuthorityService, CrlGeneratorService, OcspGeneratorService};
use super::tls::TlsConfiguration;
use crate::ca::CertificateAuthority;
use crate::crl::CrlGenerator;
use crate::error::CaResult;
use crate::ocsp::generator::OcspGenerator;

/// gRPC server configuration: bind address, optional mTLS, optional
/// reflection.
#[derive(Debug, Clone)]
pub struct GrpcServerConfig {
    pub bind_addr: String,
    pub enable_tls: bool,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    pub ca_cert_path: Option<String>,
    pub enable_mtls: bool,
    pub enable_reflection: bool,
}

impl Default for GrpcServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:50051".to_string(),
            enable_tls: false,
            cert_path: None,
            key_path: None,
            ca_cert_path: None,
            enable_mtls: false,
            enable_reflection: true,
        }
    }
}

/// The signing core's gRPC server: one process serving all three
/// proto services over a single listener.
pub struct CaGrpcServer {
    config: GrpcServerConfig,
    ca: Arc<CertificateAuthority>,
    ocsp: Arc<OcspGenerator>,
    crl: Arc<CrlGenerator>,
}

impl CaGrpcServer {
    pub fn new(
        config: GrpcServerConfig,
        ca: Arc<CertificateAuthority>,
        ocsp: Arc<OcspGenerator>,
        crl: Arc<CrlGenerator>,
    ) -> Self {
        Self { config, ca, ocsp, crl }
    }

    pub async fn serve(self) -> CaResult<()> {
        let addr: SocketAddr = self
            .config
            .bind_addr
            .parse()
            .map_err(|e| crate::error::CaError::internal(format!("invalid bind address: {e}")))?;

        let tls_config = if self.config.enable_tls {
            let tls = TlsConfiguration::new_server(
                self.config.cert_path.clone().unwrap_or_default(),
                self.config.key_path.clone().unwrap_or_default(),
                self.config.ca_cert_path.clone(),
                self.config.enable_mtls,
            );
            tls.build_server_config()
                .map_err(|e| crate::error::CaError::internal(e.to_string()))?
        } else {
            None
        };

        let mut builder = if let Some(tls) = tls_config {
            Server::builder()
                .tls_config(tls)
                .map_err(|e| crate::error::CaError::internal(e.to_string()))?
        } else {
            Server::builder()
        };

        let reflection_service = if self.config.enable_reflection {
            Some(
                tonic_reflection::server::Builder::configure()
                    .register_encoded_file_descriptor_set(super::proto::FILE_DESCRIPTOR_SET)
                    .build_v1()
                    .map_err(|e| crate::error::CaError::internal(e.to_string()))?,
            )
        } else {
            None
        };

        let ca_service = CertificateAuthorityServer::new(CertificateAuthorityService::new(
            self.ca.clone(),
            self.ocsp.clone(),
            self.crl.clone(),
        ));
        let ocsp_service = OcspGeneratorServer::new(OcspGeneratorService::new(self.ocsp.clone()));
        let crl_service = CrlGeneratorServer::new(CrlGeneratorService::new(self.crl.clone()));

        let router = builder
            .add_service(ca_service)
            .add_service(ocsp_service)
            .add_service(crl_service);

        let router = if let Some(reflection) = reflection_service {
            router.add_service(reflection)
        } else {
            router
        };

        info!(%addr, tls = self.config.enable_tls, mtls = self.config.enable_mtls, "starting signing core gRPC server");

        router
            .serve(addr)
            .await
            .map_err(|e| crate::error::CaError::internal(e.to_string()))
    }
}
