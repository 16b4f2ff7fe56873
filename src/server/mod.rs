mod block_handlers;
mod file_handlers;
mod response;

use anyhow::{Context, Result};
use axum::{
    error_handling::HandleErrorLayer,
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    BoxError, Router,
};
use hyper::{
    header::{ACCEPT, CONTENT_TYPE},
    Method,
};
use std::{borrow::Cow, sync::Arc, time::Duration};
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    bfs::{redis::RedisStats, AesEncryptor, BlockStorage, Encryptor, NoopStats, StatsSink},
    config::Config,
    heartbeat,
    meta::HttpMetaClient,
    peer::HttpPeerClient,
    service::BlockService,
};
use block_handlers::BlockApi;
use file_handlers::FileApi;

pub struct AppState {
    pub config: Arc<Config>,
    pub blocks: Arc<BlockService>,
}

/// Wires the storage and the remote clients described by config.
pub async fn state(config: Config) -> Result<Arc<AppState>> {
    let encryptor: Arc<dyn Encryptor> = match config.key_path {
        Some(ref path) => Arc::new(
            AesEncryptor::load_or_create(path)
                .await
                .context("failed to load encryption key")?,
        ),
        None => Arc::new(AesEncryptor::ephemeral()),
    };

    let stats: Arc<dyn StatsSink> = match config.redis_url {
        Some(ref url) => {
            log::info!("reporting storage stats to redis at {}", url);
            Arc::new(
                RedisStats::new(url)
                    .await
                    .context("failed to connect to redis")?,
            )
        }
        None => Arc::new(NoopStats),
    };

    let storage = BlockStorage::new(
        &config.storage_dir,
        &config.container_url,
        encryptor,
        stats,
    )
    .await
    .context("failed to open block storage")?;

    let meta = HttpMetaClient::new(&config.meta_url).context("failed to create meta client")?;
    let peers = HttpPeerClient::new().context("failed to create peer client")?;

    let config = Arc::new(config);
    let blocks = Arc::new(BlockService::new(
        Arc::clone(&config),
        Arc::new(storage),
        Arc::new(meta),
        Arc::new(peers),
    ));

    Ok(Arc::new(AppState { config, blocks }))
}

pub fn router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([ACCEPT, CONTENT_TYPE]);

    let dfs_routes = Router::new()
        .route("/dfs/ping", get(block_handlers::ping_handler))
        .route("/dfs/block/store", post(block_handlers::store_block_handler))
        .route(
            "/dfs/block/read/:hash",
            get(block_handlers::read_block_handler),
        )
        .route(
            "/dfs/block/delete/:hash",
            delete(block_handlers::delete_block_handler),
        )
        .route(
            "/dfs/block/replicate-to-another-node",
            post(block_handlers::replicate_block_handler),
        )
        .route(
            "/dfs/block/clear-files",
            delete(block_handlers::clear_files_handler),
        )
        .route("/dfs/file/upload", post(file_handlers::upload_file_handler))
        .route(
            "/dfs/file/download",
            post(file_handlers::download_file_handler),
        )
        .route(
            "/dfs/file/downloadByHash",
            get(file_handlers::download_by_hash_handler),
        );

    Router::new()
        .merge(
            SwaggerUi::new("/swagger-ui")
                .url("/api-docs/block-api.json", BlockApi::openapi())
                .url("/api-docs/file-api.json", FileApi::openapi()),
        )
        .merge(dfs_routes)
        .layer(DefaultBodyLimit::max(app_state.config.max_upload_size))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_error))
                .load_shed()
                .concurrency_limit(1024)
                .timeout(Duration::from_secs(300))
                .layer(TraceLayer::new_for_http()),
        )
        .with_state(app_state)
        .layer(cors)
}

/// Runs the node described by config until ctrl-c or SIGTERM.
pub async fn app(config: Config) -> Result<()> {
    let app_state = state(config).await?;
    let heartbeat = heartbeat::spawn(Arc::clone(&app_state.blocks));

    let address = format!("{}:{}", app_state.config.host, app_state.config.port);
    let listener = TcpListener::bind(address)
        .await
        .context("failed to bind address")?;

    log::info!(
        "🚀 Server started successfully at {}:{}",
        app_state.config.host,
        app_state.config.port
    );

    axum::serve(listener, router(app_state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("failed to serve listener")?;

    heartbeat.abort();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                log::error!("failed to install signal handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::info!("shutting down");
}

async fn handle_error(error: BoxError) -> impl IntoResponse {
    if error.is::<tower::timeout::error::Elapsed>() {
        return (StatusCode::REQUEST_TIMEOUT, Cow::from("request timed out"));
    }

    if error.is::<tower::load_shed::error::Overloaded>() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Cow::from("service is overloaded, try again later"),
        );
    }

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Cow::from(format!("Unhandled internal error: {}", error)),
    )
}
