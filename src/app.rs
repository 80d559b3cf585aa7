//! 路由装配：共享服务、中间件层与全部 HTTP 路由。

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{any, delete, get, patch, post};
use axum::{Router, middleware};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::access::AccessRules;
use crate::auth::{self, AuthConfig, LoginThrottle};
use crate::backups::{self, BackupStore};
use crate::config::{Args, MULTIPART_OVERHEAD};
use crate::db::Database;
use crate::error::ApiError;
use crate::http::{add_security_headers, build_cors_layer, resolve_client_ip};
use crate::session::SessionSettings;
use crate::storage::UploadStore;
use crate::{files, frontend, prompts, transfer, version};

/// 路由处理器共享的服务实例。
pub struct Services {
    pub auth: Arc<AuthConfig>,
    pub db: Arc<Database>,
    pub backups: Arc<BackupStore>,
    pub uploads: Arc<UploadStore>,
    pub static_dir: PathBuf,
}

impl Services {
    /// 按启动参数打开数据库并准备目录。
    pub async fn from_args(args: &Args) -> io::Result<Self> {
        let db = Database::open(&args.database_path).map_err(io::Error::other)?;
        let uploads = UploadStore::new(
            PathBuf::from(&args.upload_dir),
            PathBuf::from(&args.upload_temp_dir),
            args.max_file_size,
            args.max_total_size,
            Duration::from_millis(args.file_ttl_ms),
        );
        uploads.ensure_dirs().await?;

        let auth = AuthConfig {
            password: args.web_password.clone(),
            api_secret: args.api_secret.clone(),
            session: SessionSettings {
                secret: args.session_secret.clone(),
                max_age_secs: args.session_max_age_secs,
                secure: args.use_secure_cookie(),
            },
            rules: AccessRules::default(),
            throttle: LoginThrottle::new(
                args.login_max_attempts,
                Duration::from_secs(args.login_window_secs),
                Duration::from_secs(args.login_lockout_secs),
            ),
            trust_proxy: args.trust_proxy,
        };

        Ok(Self {
            auth: Arc::new(auth),
            db: Arc::new(db),
            backups: Arc::new(BackupStore::new(PathBuf::from(&args.backup_dir))),
            uploads: Arc::new(uploads),
            static_dir: PathBuf::from(&args.static_dir),
        })
    }
}

async fn api_not_found() -> ApiError {
    ApiError::NotFound("Not found".into())
}

/// 构建完整的应用路由。
pub fn build_router(services: &Services, cors_origins: Option<&str>) -> Router {
    let upload_limit =
        usize::try_from(services.uploads.max_file_size.saturating_add(MULTIPART_OVERHEAD))
            .unwrap_or(usize::MAX);
    let trust_proxy = services.auth.trust_proxy;

    let mut app = Router::new()
        .route("/login", get(auth::login_page).post(auth::login))
        .route("/logout", post(auth::logout))
        .route("/api/auth/status", get(auth::auth_status))
        .route("/api/version", get(version::get_version_info))
        .route(
            "/api/prompts",
            get(prompts::list_prompts).post(prompts::create_prompt),
        )
        .route(
            "/api/prompts/analysis-results",
            patch(prompts::update_analysis_results),
        )
        .route(
            "/api/prompts/{id}",
            get(prompts::get_prompt)
                .put(prompts::update_prompt)
                .delete(prompts::delete_prompt),
        )
        .route("/api/categories", get(prompts::categories))
        .route("/api/explorer", get(prompts::explorer))
        .route("/api/export", get(transfer::export_prompts))
        .route("/api/import", post(transfer::import_prompts))
        .route("/api/backups", get(backups::list_backups))
        .route("/api/backups/restore", post(backups::restore_backup))
        .route("/api/backups/{*filename}", delete(backups::delete_backup))
        .route(
            "/api/files",
            get(files::list_files)
                .post(files::upload_file)
                .layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/file/{filename}", get(files::download_file))
        .route("/api/files/{filename}", delete(files::delete_file))
        .route("/api/{*rest}", any(api_not_found))
        .fallback_service(frontend::static_files(&services.static_dir))
        .layer(middleware::from_fn(auth::auth_middleware))
        .layer(middleware::from_fn(add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(move |request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip, trust_proxy)
                        .map(|ip| ip.to_string())
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
        .layer(Extension(services.auth.clone()))
        .layer(Extension(services.db.clone()))
        .layer(Extension(services.backups.clone()))
        .layer(Extension(services.uploads.clone()));

    if let Some(cors_layer) = build_cors_layer(cors_origins) {
        app = app.layer(cors_layer);
    }
    app
}
