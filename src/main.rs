mod audit_log;
mod config;
mod error;
mod fetcher;
mod handlers;
mod interceptor;
mod metrics;
mod middleware;
mod models;
mod oidc;
mod proxy;
mod ratelimit;
mod registry;
mod router;
mod state;

use axum::routing::{get, post};
use axum::Router;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::audit_log::AuditLogger;
use crate::config::Config;
use crate::fetcher::ModelFetcher;
use crate::metrics::{init_metrics, init_metrics_noop, MetricsExporterConfig};
use crate::models::ModelsCache;
use crate::oidc::OidcAuthenticator;
use crate::proxy::ProxyCore;
use crate::ratelimit::{KvStore, MemoryStore, RedisStore};
use crate::registry::ProviderRegistry;
use crate::router::ModelRouter;
use crate::state::AppState;

fn parse_level(level: &str) -> LevelFilter {
    match level {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

fn open_log_file(path: &str) -> Option<std::fs::File> {
    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            eprintln!("log file create dir error: {}", err);
            return None;
        }
    }
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(err) => {
            eprintln!("log file open error: {}", err);
            None
        }
    }
}

#[tokio::main]
async fn main() {
    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("config error: {}", err);
            std::process::exit(1);
        }
    };

    let log_level = parse_level(config.observability.logging.level.as_str());
    let log_format = config.observability.logging.format.as_str();
    let file_writer = config
        .observability
        .logging
        .file
        .as_deref()
        .and_then(open_log_file)
        .map(Arc::new);

    let writer = match (config.observability.logging.stdout, file_writer) {
        (true, Some(file)) => BoxMakeWriter::new(std::io::stdout.and(file)),
        (true, None) => BoxMakeWriter::new(std::io::stdout),
        (false, Some(file)) => BoxMakeWriter::new(file),
        (false, None) => BoxMakeWriter::new(std::io::stdout),
    };

    if log_format == "json" {
        eprintln!("logging.format=json is not enabled; falling back to text");
    }
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_filter(log_level);
    tracing_subscriber::registry().with(fmt_layer).init();

    let metrics = match config.observability.exporters.metrics.as_str() {
        "otlp_grpc" => init_metrics(
            config.observability.service_name.clone(),
            MetricsExporterConfig {
                endpoint: config.observability.otlp_grpc.endpoint.clone(),
                timeout_ms: config.observability.otlp_grpc.timeout_ms,
            },
        )
        .unwrap_or_else(|err| {
            eprintln!("metrics init error (fallback to noop): {}", err);
            init_metrics_noop()
        }),
        _ => init_metrics_noop(),
    };

    let registry = match ProviderRegistry::new(&config.providers) {
        Ok(registry) => Arc::new(registry),
        Err(err) => {
            eprintln!("provider registry error: {}", err);
            std::process::exit(1);
        }
    };
    let models_cache = Arc::new(ModelsCache::new());
    let model_router = ModelRouter::new(&config.strategies);

    let audit_logger = if config.observability.audit_log.enabled {
        match config.observability.audit_log.path.as_deref() {
            Some(path) => AuditLogger::new(
                path.to_string(),
                config.observability.audit_log.max_file_bytes,
            )
            .ok(),
            None => None,
        }
    } else {
        None
    };

    let mut proxy = ProxyCore::new(registry.clone(), model_router, metrics.clone());
    if let Some(logger) = audit_logger {
        proxy = proxy.with_response_hook(audit_log::completion_hook(logger));
    }
    let proxy = Arc::new(proxy);

    let kv_store: Arc<dyn KvStore> = match config.ratelimit.backend.as_str() {
        "redis" => match RedisStore::new(&config.ratelimit.redis_address) {
            Ok(store) => Arc::new(store),
            Err(err) => {
                eprintln!("redis store error: {}", err);
                std::process::exit(1);
            }
        },
        _ => Arc::new(MemoryStore::new()),
    };

    let authenticator = if config.auth.enabled {
        Some(Arc::new(OidcAuthenticator::new(
            config.auth.issuer.clone(),
            config.auth.audience.clone(),
            config.auth.cache_ttl(),
        )))
    } else {
        None
    };

    let config = Arc::new(config);
    let state = AppState {
        config: config.clone(),
        registry: registry.clone(),
        models_cache: models_cache.clone(),
        proxy,
        kv_store,
        authenticator,
        metrics,
    };

    let model_fetcher = ModelFetcher::new(
        registry,
        models_cache,
        config.fetcher.refresh_interval(),
    )
    .start();

    // Layers run outermost-last, so each router adds its innermost layer
    // first. Authorization and rate limiting inspect the model or the
    // caller's bucket, which only exist on completion requests; they wrap
    // that route alone. Effective order on completions is logging,
    // authentication, authorization, rate limiting.
    let mut completions =
        Router::new().route("/v1/chat/completions", post(handlers::chat_completions));
    if config.ratelimit.enabled {
        completions = completions.layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limiting,
        ));
    }
    if config.auth.enabled {
        completions = completions.layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::authorization,
        ));
    }

    let mut app = Router::new()
        .route("/v1/models", get(handlers::get_models))
        .route("/v1/info", get(handlers::get_info))
        .merge(completions);
    if config.auth.enabled {
        app = app.layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::authentication,
        ));
    }
    let app = app
        .layer(axum::middleware::from_fn(middleware::request_logging))
        .with_state(state);

    let addr = config.bind_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("bind error: {}", err);
            std::process::exit(1);
        }
    };

    tracing::info!("listening on {}", addr);
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        eprintln!("server error: {}", err);
        std::process::exit(1);
    }

    model_fetcher.stop().await;
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("failed to install shutdown signal handler");
        std::future::pending::<()>().await;
    }
}
