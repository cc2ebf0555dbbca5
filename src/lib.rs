//! Signing core for an ACME-style public certificate authority.
//!
//! This crate implements the parts of a CA that hold signing keys:
//! certificate issuance (CSR to precertificate to certificate, with CT
//! SCT embedding), OCSP response generation with batched audit logging,
//! CRL generation, a durable orphan-artifact recovery queue, and a
//! live-signing OCSP responder with Redis caching and storage-authority
//! cross-checks. It does not implement ACME protocol handling, domain
//! validation, or long-term certificate storage — those are the
//! registration authority's and storage authority's jobs, represented
//! here only by the [`ra`] and [`sa`] trait boundaries.

pub mod asn1;
pub mod audit;
pub mod ca;
pub mod config;
pub mod crl;
pub mod error;
pub mod grpc;
pub mod issuer;
pub mod metrics;
pub mod ocsp;
pub mod orphan;
pub mod policy;
pub mod ra;
pub mod responder;
pub mod sa;
pub mod serial;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
