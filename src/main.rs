use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum_server::tls_rustls::RustlsConfig;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use liveshare_relay::{
    build_router, AppState, Config, ControlHub, DocEngine, EngineConfig, GithubOauth,
    IdentityVerifier, Persistence, RateLimiter, RocksStore, RoomRegistry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,liveshare_relay=debug")),
        )
        .init();

    info!(
        "starting liveshare relay v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Startup aborts here when the identity gate lacks a secret.
    let config = Config::from_env()?;
    info!(
        port = config.port,
        tls = config.tls_pair().is_some(),
        identity_auth = config.require_github_auth,
        data_dir = %config.data_dir.display(),
        "loaded configuration"
    );

    let store: Arc<dyn Persistence> = Arc::new(RocksStore::open(&config.data_dir)?);
    let registry = Arc::new(RoomRegistry::load(store.clone())?);
    let docs = DocEngine::new(store.clone(), EngineConfig::default());
    let control = Arc::new(ControlHub::new());

    let verifier = match (config.require_github_auth, &config.jwt_secret) {
        (true, Some(secret)) => Some(Arc::new(IdentityVerifier::new(secret))),
        _ => None,
    };

    let oauth = match (
        &config.github_client_id,
        &config.github_client_secret,
        &config.jwt_secret,
    ) {
        (Some(id), Some(secret), Some(jwt_secret)) => Some(GithubOauth::new(
            id.clone(),
            secret.clone(),
            jwt_secret.clone(),
        )),
        _ => None,
    };

    let rate_limiter = RateLimiter::default();

    // Evict idle rate-limit buckets periodically.
    let limiter = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            limiter.purge_stale().await;
        }
    });

    let state = AppState {
        registry: registry.clone(),
        docs: docs.clone(),
        control,
        verifier,
        oauth,
        rate_limiter,
        started: Instant::now(),
    };

    let app = build_router(state, &config.cors_origin);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let handle = axum_server::Handle::new();

    let server = match config.tls_pair() {
        Some((cert, key)) => {
            let tls = RustlsConfig::from_pem_file(cert, key).await?;
            info!(%addr, "listening (tls)");
            tokio::spawn(
                axum_server::bind_rustls(addr, tls)
                    .handle(handle.clone())
                    .serve(app.into_make_service_with_connect_info::<SocketAddr>()),
            )
        }
        None => {
            info!(%addr, "listening");
            tokio::spawn(
                axum_server::bind(addr)
                    .handle(handle.clone())
                    .serve(app.into_make_service_with_connect_info::<SocketAddr>()),
            )
        }
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    // Persist every document and close client sockets before the listener
    // goes away, then close the store exactly once.
    docs.shutdown().await;
    handle.graceful_shutdown(Some(Duration::from_secs(5)));
    if let Ok(Err(e)) = server.await {
        error!(error = %e, "server terminated with error");
    }
    if let Err(e) = store.close() {
        error!(error = %e, "store close failed");
    }
    info!("shutdown complete");

    Ok(())
}
