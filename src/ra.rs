//! RegistrationAuthority: the orchestrator the live-signing OCSP
//! responder calls through to reach the OCSP Generator on a cache miss
//! (§6). In this crate the RA is a thin pass-through to the in-process
//! generator; a full deployment's RA additionally authenticates the
//! caller and enforces rate limits, both out of scope here.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CaResult;
use crate::ocsp::generator::{OcspGenerator, OcspRequest};

#[async_trait]
pub trait RegistrationAuthority: Send + Sync {
    async fn generate_ocsp(&self, request: OcspRequest) -> CaResult<Vec<u8>>;
}

pub struct GeneratorBackedRa {
    generator: Arc<OcspGenerator>,
}

impl GeneratorBackedRa {
    pub fn new(generator: Arc<OcspGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl RegistrationAuthority for GeneratorBackedRa {
    async fn generate_ocsp(&self, request: OcspRequest) -> CaResult<Vec<u8>> {
        self.generator.generate(request).await
    }
}
