use std::{future::IntoFuture, process, sync::Arc};

use backoffice_cacher::{
    application::{engine::ProxyEngine, error::AppError, upstream::Upstream},
    cache::{CacheConfig, CacheStore, MemoryStore, ResponseStore},
    config::{self, StoreBackend},
    infra::{
        error::InfraError,
        http::{self, AppState, MetricsEndpoint},
        redis::RedisStore,
        telemetry,
        upstream::HttpUpstream,
    },
};
use tokio::sync::watch;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::CheckConfig(_) => run_check_config(&settings),
    }
}

fn run_check_config(settings: &config::Settings) -> Result<(), AppError> {
    build_store(&settings.store)?;
    HttpUpstream::new(&settings.upstream)?;

    info!(
        target = "cacher::config",
        addr = %settings.server.addr,
        upstream = %settings.upstream.url,
        store = store_kind(&settings.store.backend),
        key_version = %settings.cache.key_version,
        routes = settings.cache.routes.rules().len(),
        "configuration is valid"
    );
    Ok(())
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let metrics = if settings.metrics.enabled {
        Some(MetricsEndpoint {
            path: settings.metrics.path.clone(),
            handle: telemetry::install_metrics()?,
        })
    } else {
        None
    };

    let store = build_store(&settings.store)?;
    let upstream: Arc<dyn Upstream> = Arc::new(HttpUpstream::new(&settings.upstream)?);
    let cache_config = CacheConfig::from(&settings.cache);
    let engine = Arc::new(ProxyEngine::new(&cache_config, store, upstream));

    let state = AppState {
        engine,
        metrics,
        max_request_bytes: settings.server.max_request_bytes,
    };

    info!(
        target = "cacher::serve",
        addr = %settings.server.addr,
        upstream = %settings.upstream.url,
        store = store_kind(&settings.store.backend),
        key_version = %cache_config.key_version,
        "starting cacher"
    );

    serve_http(&settings, http::build_router(state)).await
}

fn build_store(settings: &config::StoreSettings) -> Result<CacheStore, AppError> {
    let backend: Arc<dyn ResponseStore> = match &settings.backend {
        StoreBackend::Redis { url } => Arc::new(RedisStore::new(url)?),
        StoreBackend::Memory { capacity } => Arc::new(MemoryStore::new(*capacity)),
    };
    Ok(CacheStore::new(backend))
}

fn store_kind(backend: &StoreBackend) -> &'static str {
    match backend {
        StoreBackend::Redis { .. } => "redis",
        StoreBackend::Memory { .. } => "memory",
    }
}

async fn serve_http(settings: &config::Settings, router: axum::Router) -> Result<(), AppError> {
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    let (signalled_tx, mut signalled_rx) = watch::channel(false);
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = signalled_tx.send(true);
        })
        .into_future();

    let grace = settings.server.graceful_shutdown;
    let deadline = async move {
        if signalled_rx.changed().await.is_ok() {
            tokio::time::sleep(grace).await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        result = server => {
            result.map_err(|err| AppError::from(InfraError::from(err)))?;
            info!(target = "cacher::serve", "server stopped");
        }
        () = deadline => {
            warn!(
                target = "cacher::serve",
                grace_seconds = grace.as_secs(),
                "graceful shutdown timed out; dropping in-flight requests"
            );
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!(target = "cacher::serve", "shutdown signal received");
}
