//! AxoTransfer server binary.
//!
//! This crate wires together resumable uploads, concatenation of partial
//! uploads, archive download and guarded extraction behind per-user access
//! rules. The main entry point builds the Axum router, opens the upload
//! registry backend and starts the HTTP (and optional HTTPS) listeners.

mod archive;
mod auth;
mod background;
mod config;
mod error;
mod http;
mod inplace;
mod locking;
mod logging;
mod rules;
mod storage;
mod tls;
mod tus;
mod upload;
mod users;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, head, options, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::background::spawn_background_tasks;
use crate::config::Args;
use crate::http::build_cors_layer;
use crate::inplace::InPlaceStore;
use crate::locking::LockManager;
use crate::storage::Storage;
use crate::upload::CacheBackend;
use crate::users::Directory;

/// Starts the AxoTransfer server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage = Arc::new(Storage::new(PathBuf::from(&args.storage_dir)));
    storage.ensure_root().await?;

    let directory = match args.users_file.as_deref() {
        Some(path) => Directory::load(Path::new(path))
            .await
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?,
        None => Directory::single(&args.auth_user, &args.auth_pass),
    };
    info!(users = directory.len(), "loaded user directory");
    let directory = Arc::new(directory);

    let (backend, events) = CacheBackend::open(args.redis_url.as_deref(), args.upload_ttl())
        .await
        .map_err(io::Error::other)?;
    let cache = backend.cache();
    let locks = Arc::new(LockManager::new());
    let store = Arc::new(InPlaceStore::new(args.upload_ttl()));
    let archive_config = Arc::new(args.archive_config());
    spawn_background_tasks(
        &backend,
        events,
        args.upload_sweep(),
        locks.clone(),
        store.clone(),
    );

    let tus_routes = Router::new()
        .route("/api/tus", options(tus::tus_options))
        .route(
            "/api/tus/{*path}",
            post(tus::tus_create)
                .head(tus::tus_status)
                .patch(tus::tus_append)
                .delete(tus::tus_delete)
                .options(tus::tus_options),
        )
        .route(
            "/api/tus-parts/{id}",
            head(tus::part_status).patch(tus::part_append),
        )
        .layer(middleware::map_response(http::add_tus_resumable))
        .layer(DefaultBodyLimit::disable());

    let mut app = Router::new()
        .merge(tus_routes)
        .route("/api/archive", get(archive::download_root_archive))
        .route("/api/archive/{*path}", get(archive::download_archive))
        .route("/api/unzip/{*path}", post(archive::unzip))
        .layer(middleware::from_fn(auth::auth_middleware))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let forwarded_ip = request
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.split(',').next().unwrap_or("").trim().to_string());
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.to_string());
                    let client_ip = forwarded_ip
                        .or(connect_ip)
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage))
        .layer(Extension(directory))
        .layer(Extension(cache))
        .layer(Extension(locks))
        .layer(Extension(store))
        .layer(Extension(archive_config));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let tls_config = tls::build_rustls_config(&args).await?;
    let handle = Handle::new();

    info!("Starting HTTP server at {}", http_addr);
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(
            app.clone()
                .into_make_service_with_connect_info::<SocketAddr>(),
        );

    match tls_config {
        Some(tls_config) => {
            let https_addr = SocketAddr::new(host, args.https_port);
            info!("Starting HTTPS server at {}", https_addr);
            let https_server = axum_server::bind_rustls(https_addr, tls_config)
                .handle(handle.clone())
                .serve(app.into_make_service_with_connect_info::<SocketAddr>());
            tokio::select! {
                result = http_server => result?,
                result = https_server => result?,
                _ = shutdown_signal(handle) => {}
            }
        }
        None => {
            tokio::select! {
                result = http_server => result?,
                _ = shutdown_signal(handle) => {}
            }
        }
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
