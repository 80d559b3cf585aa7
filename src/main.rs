//! Cortex server binary.
//!
//! A prompt-management web service: SQLite-backed prompt store with backups
//! and JSON export/import, a TTL-bounded file drop, and a single access gate
//! that accepts either a shared-secret bearer token or a signed session cookie.
//! The main entry point loads configuration, builds the Axum router, starts the
//! background sweepers and runs HTTP (and optionally HTTPS) listeners.

mod access;
mod app;
mod atomic;
mod auth;
mod background;
mod backups;
mod config;
mod db;
mod error;
mod files;
mod frontend;
mod http;
mod logging;
mod prompts;
mod session;
mod signature;
mod storage;
mod tls;
mod transfer;
mod version;

use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

use crate::app::{Services, build_router};
use crate::background::BackgroundTasks;
use crate::config::{Args, DEFAULT_API_SECRET, DEFAULT_SESSION_SECRET, DEFAULT_WEB_PASSWORD};

shadow!(build);

/// Starts the Cortex server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), io::Error> {
    let _ = dotenvy::dotenv();
    logging::init_logging();

    let args = Args::parse();
    warn_on_default_secrets(&args);

    let services = Services::from_args(&args).await?;
    let tasks = BackgroundTasks::new();
    tasks.start(
        services.uploads.clone(),
        services.auth.clone(),
        Duration::from_secs(args.sweep_interval_secs.max(1)),
    );
    let app = build_router(&services, args.cors_origins.as_deref());

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let handle = Handle::new();

    info!(
        database = ?services.db.path(),
        uploads = ?services.uploads.root_path(),
        "🚀 Starting HTTP server at {}",
        http_addr
    );
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(
            app.clone()
                .into_make_service_with_connect_info::<SocketAddr>(),
        );

    let https_server = match args.https_port {
        Some(port) => {
            let tls_config =
                tls::build_rustls_config(args.tls_cert.as_deref(), args.tls_key.as_deref(), host)
                    .await?;
            let https_addr = SocketAddr::new(host, port);
            info!("🔒 Starting HTTPS server at {}", https_addr);
            Some(
                axum_server::bind_rustls(https_addr, tls_config)
                    .handle(handle.clone())
                    .serve(app.into_make_service_with_connect_info::<SocketAddr>()),
            )
        }
        None => None,
    };
    let https_server = async move {
        match https_server {
            Some(server) => server.await,
            None => std::future::pending().await,
        }
    };

    let result = tokio::select! {
        result = http_server => result,
        result = https_server => result,
        _ = shutdown_signal(handle) => Ok(()),
    };

    tasks.shutdown();
    result
}

fn warn_on_default_secrets(args: &Args) {
    if args.web_password == DEFAULT_WEB_PASSWORD {
        warn!("using the default web password, set CORTEX_WEB_PASSWORD");
    }
    if args.api_secret == DEFAULT_API_SECRET {
        warn!("using the default API secret, set CORTEX_API_SECRET");
    }
    if args.session_secret == DEFAULT_SESSION_SECRET {
        warn!("using the default session secret, set CORTEX_SESSION_SECRET");
    }
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
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

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
