//! gRPC transport for the signing core: the `CertificateAuthority`,
//! `OcspGenerator`, and `CrlGenerator` services defined in
//! `proto/ca.proto`.

pub mod server;
pub mod service;
pub mod tls;

pub mod proto {
    tonic::include_proto!("ca.v1");

    /// File descriptor set for gRPC reflection.
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("ca_descriptor");
}

pub use proto::{
    certificate_authority_server::{CertificateAuthority, CertificateAuthorityServer},
    crl_generator_server::{CrlGenerator, CrlGeneratorServer},
    ocsp_generator_server::{OcspGenerator, OcspGeneratorServer},
};
pub use proto::*;

pub use server::{CaGrpcServer, GrpcServerConfig};
pub use service::{CertificateAuthorityService, CrlGeneratorService, OcspGeneratorService};
pub use tls::{TlsConfiguration, TlsError};
