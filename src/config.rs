//! CLI 参数、环境变量与默认配置。

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const SESSION_COOKIE_NAME: &str = "cortex_session";
pub const DEFAULT_WEB_PASSWORD: &str = "admin";
pub const DEFAULT_API_SECRET: &str = "dev-secret-key";
pub const DEFAULT_SESSION_SECRET: &str = "default-secret-change-in-production";
pub const DEFAULT_SESSION_MAX_AGE_SECS: u64 = 7 * 24 * 60 * 60;
pub const DEFAULT_LOGIN_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOGIN_WINDOW_SECS: u64 = 5 * 60;
pub const DEFAULT_LOGIN_LOCKOUT_SECS: u64 = 10 * 60;
pub const DEFAULT_FILE_TTL_MS: u64 = 12 * 60 * 60 * 1000;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;
pub const DEFAULT_MAX_TOTAL_SIZE: u64 = 20 * 1024 * 1024 * 1024;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60 * 60;
pub const LOGIN_PRUNE_INTERVAL_SECS: u64 = 300;
/// multipart 包体相对单文件上限的额外余量。
pub const MULTIPART_OVERHEAD: u64 = 1024 * 1024;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "cortex", version = VERSION_INFO, about = "Cortex prompt server")]
pub struct Args {
    #[arg(
        short = 'b',
        long,
        env = "CORTEX_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "CORTEX_HTTP_PORT",
        default_value_t = 3000,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "CORTEX_HTTPS_PORT",
        help = "HTTPS port (HTTPS disabled when unset)"
    )]
    pub https_port: Option<u16>,
    #[arg(short = 'c', long, env = "CORTEX_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "CORTEX_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(long, env = "CORTEX_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "CORTEX_STATIC_DIR",
        default_value = "static",
        help = "Directory holding the built web frontend"
    )]
    pub static_dir: String,
    #[arg(
        long,
        env = "CORTEX_DATABASE_PATH",
        default_value = "data/cortex.db",
        help = "SQLite database path"
    )]
    pub database_path: String,
    #[arg(
        long,
        env = "CORTEX_BACKUP_DIR",
        default_value = "backups",
        help = "Directory for database backups"
    )]
    pub backup_dir: String,
    #[arg(
        long,
        env = "CORTEX_UPLOAD_DIR",
        default_value = "data/upload",
        help = "Directory for uploaded files"
    )]
    pub upload_dir: String,
    #[arg(
        long,
        env = "CORTEX_UPLOAD_TEMP_DIR",
        default_value = "data/.upload_tmp",
        help = "Staging directory for in-flight uploads (same filesystem as the upload dir)"
    )]
    pub upload_temp_dir: String,
    #[arg(
        long,
        env = "CORTEX_WEB_PASSWORD",
        default_value = DEFAULT_WEB_PASSWORD,
        hide_env_values = true,
        help = "Shared login password for the web UI"
    )]
    pub web_password: String,
    #[arg(
        long,
        env = "CORTEX_API_SECRET",
        default_value = DEFAULT_API_SECRET,
        hide_env_values = true,
        help = "Bearer token for scripted API access"
    )]
    pub api_secret: String,
    #[arg(
        long,
        env = "CORTEX_SESSION_SECRET",
        default_value = DEFAULT_SESSION_SECRET,
        hide_env_values = true,
        help = "HMAC key for session cookies"
    )]
    pub session_secret: String,
    #[arg(
        long,
        env = "CORTEX_SESSION_MAX_AGE",
        default_value_t = DEFAULT_SESSION_MAX_AGE_SECS,
        help = "Session lifetime in seconds"
    )]
    pub session_max_age_secs: u64,
    #[arg(
        long,
        env = "CORTEX_SECURE_COOKIE",
        help = "Force the Secure cookie flag on (true) or off (false)"
    )]
    pub secure_cookie: Option<bool>,
    #[arg(
        long,
        env = "CORTEX_PRODUCTION",
        help = "Production mode (Secure cookies unless overridden)"
    )]
    pub production: bool,
    #[arg(
        long,
        env = "CORTEX_FILE_TTL_MS",
        default_value_t = DEFAULT_FILE_TTL_MS,
        help = "Uploaded file lifetime in milliseconds"
    )]
    pub file_ttl_ms: u64,
    #[arg(
        long,
        env = "CORTEX_MAX_FILE_SIZE",
        default_value_t = DEFAULT_MAX_FILE_SIZE,
        help = "Max size of a single upload in bytes"
    )]
    pub max_file_size: u64,
    #[arg(
        long,
        env = "CORTEX_MAX_TOTAL_SIZE",
        default_value_t = DEFAULT_MAX_TOTAL_SIZE,
        help = "Max total size of the upload directory in bytes"
    )]
    pub max_total_size: u64,
    #[arg(
        long,
        env = "CORTEX_SWEEP_INTERVAL_SECS",
        default_value_t = DEFAULT_SWEEP_INTERVAL_SECS,
        help = "Interval between expired file sweeps in seconds"
    )]
    pub sweep_interval_secs: u64,
    #[arg(
        long,
        env = "CORTEX_LOGIN_MAX_ATTEMPTS",
        default_value_t = DEFAULT_LOGIN_MAX_ATTEMPTS,
        help = "Max login attempts before lockout (0 to disable)"
    )]
    pub login_max_attempts: u32,
    #[arg(
        long,
        env = "CORTEX_LOGIN_WINDOW_SECS",
        default_value_t = DEFAULT_LOGIN_WINDOW_SECS,
        help = "Login attempt window in seconds"
    )]
    pub login_window_secs: u64,
    #[arg(
        long,
        env = "CORTEX_LOGIN_LOCKOUT_SECS",
        default_value_t = DEFAULT_LOGIN_LOCKOUT_SECS,
        help = "Login lockout time after max attempts"
    )]
    pub login_lockout_secs: u64,
    #[arg(
        long,
        env = "CORTEX_TRUST_PROXY",
        help = "Take the client IP from X-Forwarded-For (only behind a trusted reverse proxy)"
    )]
    pub trust_proxy: bool,
}

impl Args {
    /// Secure 标志：显式覆盖优先，否则取决于生产模式。
    pub fn use_secure_cookie(&self) -> bool {
        self.secure_cookie.unwrap_or(self.production)
    }
}

#[cfg(test)]
mod tests {
    use super::Args;
    use clap::Parser;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["cortex"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).expect("parse args")
    }

    #[test]
    fn secure_cookie_follows_production_mode_by_default() {
        assert!(!parse(&[]).use_secure_cookie());
        assert!(parse(&["--production"]).use_secure_cookie());
    }

    #[test]
    fn forwarded_header_is_untrusted_by_default() {
        assert!(!parse(&[]).trust_proxy);
        assert!(parse(&["--trust-proxy"]).trust_proxy);
    }

    #[test]
    fn secure_cookie_override_wins() {
        assert!(!parse(&["--production", "--secure-cookie", "false"]).use_secure_cookie());
        assert!(parse(&["--secure-cookie", "true"]).use_secure_cookie());
    }
}
