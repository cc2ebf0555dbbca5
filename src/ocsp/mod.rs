pub mod batcher;
pub mod generator;

pub use generator::{CertStatus, OcspGenerator, OcspRequest};
