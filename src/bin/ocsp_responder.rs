//! Live-signing OCSP responder binary (`ocsp-responder`): serves cached
//! OCSP responses out of Redis with a Storage Authority cross-check,
//! falling back to a live signature through the Registration Authority.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use ca_signing_core::config::{CaConfig, ResponderArgs};
use ca_signing_core::issuer::IssuerRegistry;
use ca_signing_core::metrics::CaMetrics;
use ca_signing_core::ocsp::generator::OcspGenerator;
use ca_signing_core::ra::GeneratorBackedRa;
use ca_signing_core::responder::{http, LiveSigningOcspResponder};
use ca_signing_core::sa::InMemoryStorageAuthority;

fn init_logging(log_level: &str) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).with_target(true).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = ResponderArgs::parse();
    init_logging(&args.log_level);

    let config = CaConfig::from_file(&args.config)?;
    let metrics = Arc::new(CaMetrics::new());

    let registry = Arc::new(IssuerRegistry::load(&config.issuers)?);
    let sa = InMemoryStorageAuthority::new();
    let ocsp_generator = Arc::new(OcspGenerator::new(registry.clone(), config.ocsp_lifetime, None, metrics.clone()));
    let ra = Arc::new(GeneratorBackedRa::new(ocsp_generator));

    let responder = Arc::new(LiveSigningOcspResponder::new(
        config.redis_url.as_deref(),
        sa,
        ra,
        registry,
        config.responder_max_inflight,
        config.responder_max_waiters,
        config.live_signing_period,
        config.allowed_serial_prefixes.clone(),
        metrics.clone(),
    )?);

    let metrics_addr = config.metrics_bind_addr.clone();
    let metrics_for_http = metrics.clone();
    tokio::spawn(async move {
        let app = axum::Router::new().route(
            "/metrics",
            axum::routing::get(move || {
                let metrics = metrics_for_http.clone();
                async move { metrics.gather_text() }
            }),
        );
        match tokio::net::TcpListener::bind(&metrics_addr).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!("metrics server failed: {e}");
                }
            }
            Err(e) => tracing::error!("failed to bind metrics listener on {metrics_addr}: {e}"),
        }
    });

    let bind_addr = args.bind.unwrap_or_else(|| config.http_bind_addr.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(%bind_addr, "live-signing OCSP responder starting");

    axum::serve(listener, http::router(responder)).await?;
    Ok(())
}
