//! Process configuration: TOML file + CLI overlay.
//!
//! Mirrors the split the teacher uses between `GrpcServerConfig` (a plain
//! struct with a `Default` impl) and a `clap::Parser` binary args struct: the
//! typed config is what the rest of the crate consumes, the CLI args are only
//! ever used to override a handful of fields at process startup.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{CaError, CaResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerConfig {
    pub name: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// Public-key algorithms this issuer may sign for: "rsa" | "ecdsa".
    pub algorithms: Vec<String>,
    pub legacy_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaConfig {
    pub grpc_bind_addr: String,
    pub http_bind_addr: String,
    pub metrics_bind_addr: String,

    pub issuers: Vec<IssuerConfig>,

    /// Instance byte prefixed onto every serial, 1..=255.
    pub serial_prefix: u8,
    #[serde(with = "humantime_secs")]
    pub validity: Duration,
    #[serde(with = "humantime_secs")]
    pub backdate: Duration,
    #[serde(with = "humantime_secs")]
    pub ocsp_lifetime: Duration,
    #[serde(with = "humantime_secs")]
    pub crl_lifetime: Duration,

    pub idp_base: String,
    pub max_dns_names: usize,
    pub max_log_line_len: usize,

    pub batcher_max_queue_depth: usize,
    #[serde(with = "humantime_secs")]
    pub batcher_emit_interval: Duration,

    pub orphan_queue_path: PathBuf,

    pub redis_url: Option<String>,
    pub responder_max_inflight: usize,
    pub responder_max_waiters: usize,
    /// How long a cached OCSP response may be served before the
    /// responder re-signs it live rather than trusting the cache.
    #[serde(with = "humantime_secs")]
    pub live_signing_period: Duration,
    pub allowed_serial_prefixes: Vec<u8>,

    pub ecdsa_allowlist_path: Option<PathBuf>,
}

impl CaConfig {
    pub fn from_toml_str(s: &str) -> CaResult<Self> {
        let cfg: Self = toml::from_str(s).map_err(|e| CaError::internal(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &std::path::Path) -> CaResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    fn validate(&self) -> CaResult<()> {
        if self.serial_prefix == 0 {
            return Err(CaError::internal("serial_prefix must be in 1..=255"));
        }
        if self.ocsp_lifetime.is_zero() {
            return Err(CaError::internal("ocsp_lifetime must be positive"));
        }
        if self.live_signing_period.is_zero() {
            return Err(CaError::internal("live_signing_period must be positive"));
        }
        let nine_days = Duration::from_secs(9 * 24 * 3600);
        let ten_days = Duration::from_secs(10 * 24 * 3600);
        if self.crl_lifetime.is_zero() {
            // 0 means "use the default", applied by the caller; nothing to validate here.
        } else if self.crl_lifetime >= ten_days {
            return Err(CaError::internal(
                "crl_lifetime must be strictly less than 10 days",
            ));
        }
        let _ = nine_days; // documented default lives in crl::DEFAULT_CRL_LIFETIME
        if !self.idp_base.starts_with("http://") {
            return Err(CaError::internal("idp_base must start with http://"));
        }
        if self.idp_base.ends_with('/') {
            return Err(CaError::internal("idp_base must not have a trailing slash"));
        }
        if self.issuers.is_empty() {
            return Err(CaError::internal("at least one issuer must be configured"));
        }
        let mut seen_legacy = std::collections::HashSet::new();
        for issuer in &self.issuers {
            if !seen_legacy.insert(issuer.legacy_id) {
                return Err(CaError::internal(format!(
                    "duplicate issuer legacy_id {}",
                    issuer.legacy_id
                )));
            }
        }
        Ok(())
    }

    pub fn effective_crl_lifetime(&self) -> Duration {
        if self.crl_lifetime.is_zero() {
            Duration::from_secs(9 * 24 * 3600)
        } else {
            self.crl_lifetime
        }
    }
}

mod humantime_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

/// CLI overlay for the gRPC signing server (`ca-signer`).
#[derive(Parser, Debug)]
#[command(name = "ca-signer")]
#[command(about = "Signing core gRPC server: certificate authority, OCSP, CRL")]
pub struct ServerArgs {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "ca-signer.toml")]
    pub config: PathBuf,

    /// Override the gRPC bind address.
    #[arg(long)]
    pub bind: Option<String>,

    /// Enable gRPC reflection (useful for debugging tools).
    #[arg(long)]
    pub reflection: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// CLI overlay for the live-signing OCSP responder (`ocsp-responder`).
#[derive(Parser, Debug)]
#[command(name = "ocsp-responder")]
#[command(about = "Live-signing OCSP responder: Redis cache with SA cross-check")]
pub struct ResponderArgs {
    #[arg(short, long, default_value = "ocsp-responder.toml")]
    pub config: PathBuf,

    #[arg(long)]
    pub bind: Option<String>,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}
