//! Signing core gRPC server binary (`ca-signer`): wires the Issuer
//! Registry, Serial Allocator, OCSP Generator and log batcher, Orphan
//! Queue and integrator, and CRL Generator into the `CertificateAuthority`
//! orchestrator, then serves all three proto services over gRPC.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use ca_signing_core::ca::CertificateAuthority;
use ca_signing_core::config::{CaConfig, ServerArgs};
use ca_signing_core::crl::CrlGenerator;
use ca_signing_core::grpc::server::{CaGrpcServer, GrpcServerConfig};
use ca_signing_core::issuer::IssuerRegistry;
use ca_signing_core::metrics::CaMetrics;
use ca_signing_core::ocsp::batcher::OcspLogBatcher;
use ca_signing_core::ocsp::generator::OcspGenerator;
use ca_signing_core::orphan::{self, OrphanQueue};
use ca_signing_core::policy::{self, AllowAllPolicy, DefaultCrlLinter, DefaultKeyPolicy, EcdsaAllowList};
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
    let args = ServerArgs::parse();
    init_logging(&args.log_level);

    let config = CaConfig::from_file(&args.config)?;
    let metrics = Arc::new(CaMetrics::new());

    let registry = Arc::new(IssuerRegistry::load(&config.issuers)?);

    let ecdsa_allow_list = Arc::new(match &config.ecdsa_allowlist_path {
        Some(path) => EcdsaAllowList::from_yaml_bytes(&std::fs::read(path)?)?,
        None => EcdsaAllowList::empty(),
    });
    let allow_list_reloader = config
        .ecdsa_allowlist_path
        .clone()
        .map(|path| policy::spawn_reloader(ecdsa_allow_list.clone(), path));

    let batcher = OcspLogBatcher::spawn(
        config.batcher_max_queue_depth,
        config.max_log_line_len,
        config.batcher_emit_interval,
        metrics.clone(),
    );
    let ocsp_generator = Arc::new(OcspGenerator::new(
        registry.clone(),
        config.ocsp_lifetime,
        Some(batcher.clone()),
        metrics.clone(),
    ));

    let sa = InMemoryStorageAuthority::new();

    let orphan_queue = Arc::new(OrphanQueue::open(config.orphan_queue_path.clone(), metrics.clone()).await?);
    let integrator = orphan::spawn_integrator(orphan_queue.clone(), sa.clone(), config.backdate, metrics.clone());

    let ca = Arc::new(CertificateAuthority::new(
        registry.clone(),
        sa.clone(),
        ocsp_generator.clone(),
        orphan_queue.clone(),
        Arc::new(AllowAllPolicy),
        Arc::new(DefaultKeyPolicy::default()),
        ecdsa_allow_list,
        config.serial_prefix,
        config.validity,
        config.backdate,
        config.max_dns_names,
        metrics.clone(),
    )?);

    let crl_generator = Arc::new(CrlGenerator::new(
        registry.clone(),
        Arc::new(DefaultCrlLinter),
        config.idp_base.clone(),
        config.effective_crl_lifetime(),
        config.max_log_line_len,
        metrics.clone(),
    )?);

    let bind_addr = args.bind.unwrap_or_else(|| config.grpc_bind_addr.clone());
    let grpc_config = GrpcServerConfig {
        bind_addr,
        enable_reflection: args.reflection,
        ..GrpcServerConfig::default()
    };

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

    let server = CaGrpcServer::new(grpc_config, ca, ocsp_generator, crl_generator);

    info!("signing core gRPC server starting");
    let result = server.serve().await;

    integrator.stop().await;
    batcher.stop().await;
    if let Some(reloader) = allow_list_reloader {
        reloader.stop().await;
    }

    result?;
    Ok(())
}
