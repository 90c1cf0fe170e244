//! Turnstile - external authorization sidecar

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use turnstile::bootstrap::BootstrapConfig;
use turnstile::cache::RevocationCache;
use turnstile::config::Config;
use turnstile::jwt::{KeyMaterial, TokenVerifier};
use turnstile::mq::EventConsumer;
use turnstile::server::{AuthzServer, AuthzService};
use turnstile::store::{CachedStore, RedisStore, RevocationStore};
use turnstile::telemetry::{init_telemetry, TelemetryConfig};
use turnstile::{http, metrics};

/// Bound on the final telemetry flush during shutdown
const TELEMETRY_FLUSH_DEADLINE: Duration = Duration::from_secs(10);

/// Turnstile - Envoy external authorization sidecar with JWT verification
/// and a replicated revocation cache
#[derive(Parser, Debug)]
#[command(name = "turnstile", version, about, long_about = None)]
struct Cli {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _cli = Cli::parse();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    let telemetry = init_telemetry(TelemetryConfig {
        service_name: "turnstile".to_string(),
        environment: config.environment.clone(),
        log_filter: config.log_level.clone(),
        ..Default::default()
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize telemetry: {e}"))?;

    info!("turnstile starting...");

    // Verifier first: it is immutable and everything downstream needs it
    let key = KeyMaterial::from_config(
        config.verifier.algorithm,
        config.jwt_secret.as_deref(),
        config.jwt_public_key.as_deref(),
    )
    .map_err(|e| anyhow::anyhow!("{e}"))?;
    let verifier = Arc::new(TokenVerifier::new(config.verifier.clone(), key));
    info!(algorithm = %verifier.algorithm(), "credential verifier ready");

    let shutdown = CancellationToken::new();

    // Revocation backend: local cache with bootstrap + live events, or the
    // legacy per-request store lookup
    let mut cache: Option<Arc<RevocationCache>> = None;
    let mut consumer: Option<EventConsumer> = None;
    let mut consumer_handle = None;

    let store: Arc<dyn RevocationStore> = if config.local_cache_enabled {
        let revocations = Arc::new(RevocationCache::new(config.cleanup_interval));

        // Bootstrap is fatal on failure: serving without the revocation
        // snapshot would silently fail open for already-revoked credentials.
        let redis = RedisStore::connect(
            &config.revocation_store_url,
            &config.revocation_key_prefix,
            config.read_timeout,
        )
        .await
        .map_err(|e| anyhow::anyhow!("failed to connect to revocation store: {e}"))?;

        let loaded = turnstile::bootstrap::seed_cache(
            redis.connection(),
            &BootstrapConfig::from(&config),
            &revocations,
        )
        .await
        .map_err(|e| anyhow::anyhow!("revocation bootstrap failed: {e}"))?;
        metrics::set_cache_entries(revocations.len());
        info!(loaded, "revocation cache seeded");

        match &config.event_bus_url {
            Some(url) => {
                let event_consumer = EventConsumer::new(url.clone(), revocations.clone());
                consumer_handle = Some(event_consumer.start());
                consumer = Some(event_consumer);
            }
            None => {
                warn!("EVENT_BUS_URL not set; revocation cache will not receive live updates");
            }
        }

        let store = Arc::new(CachedStore::new(revocations.clone()));
        cache = Some(revocations);
        store
    } else {
        info!("local cache disabled; consulting revocation store per request");
        let redis = RedisStore::connect(
            &config.revocation_store_url,
            &config.revocation_key_prefix,
            config.read_timeout,
        )
        .await
        .map_err(|e| anyhow::anyhow!("failed to connect to revocation store: {e}"))?;
        Arc::new(redis)
    };

    // Telemetry endpoints
    let metrics_addr: SocketAddr = ([0, 0, 0, 0], config.metrics_port).into();
    let http_router = http::router(telemetry.metrics_handle());
    let http_shutdown = shutdown.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http::serve(metrics_addr, http_router, http_shutdown).await {
            error!(error = %e, "telemetry HTTP server error");
        }
    });

    // Shutdown on SIGTERM or ctrl-c
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    // ext-authz transport, serving until shutdown
    let grpc_addr: SocketAddr = ([0, 0, 0, 0], config.grpc_port).into();
    let service = AuthzService::new(verifier, store, config.cors_allowed_origins.clone());
    let server = AuthzServer::new(service, grpc_addr, shutdown.clone());

    let serve_result = server.run().await;

    // Teardown in reverse acquisition order: transport is already
    // drained, then the consumer, then the sweeper, then telemetry.
    shutdown.cancel();
    if let Some(consumer) = &consumer {
        consumer.stop();
    }
    if let Some(handle) = consumer_handle {
        let _ = handle.await;
    }
    if let Some(cache) = &cache {
        cache.stop();
    }
    let _ = http_handle.await;
    telemetry.shutdown(TELEMETRY_FLUSH_DEADLINE).await;

    serve_result.map_err(|e| anyhow::anyhow!("{e}"))?;
    info!("turnstile shut down");
    Ok(())
}

/// Wait for SIGTERM or ctrl-c
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
