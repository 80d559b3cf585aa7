//! 认证处理：访问控制中间件、登录/登出、登录限流。

use axum::extract::{Extension, Form, Query, connect_info::ConnectInfo};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{Html, Redirect, Response};
use axum::{body::Body as AxumBody, middleware};
use axum_extra::extract::CookieJar;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::access::{AccessRules, Decision, authorize, bearer_token};
use crate::config::SESSION_COOKIE_NAME;
use crate::error::ApiError;
use crate::http::resolve_client_ip;
use crate::session::{SessionSettings, destroy_session, issue_session, validate_session};

#[derive(Debug)]
pub struct AuthConfig {
    pub password: String,
    pub api_secret: String,
    pub session: SessionSettings,
    pub rules: AccessRules,
    pub throttle: LoginThrottle,
    /// 是否采信反向代理写入的 `x-forwarded-for`。
    pub trust_proxy: bool,
}

impl AuthConfig {
    fn has_valid_session(&self, jar: &CookieJar) -> bool {
        jar.get(SESSION_COOKIE_NAME).is_some_and(|cookie| {
            validate_session(
                cookie.value(),
                &self.session.secret,
                self.session.max_age_secs,
            )
        })
    }
}

/// 校验提交的密码（常量时间比较）。
pub fn verify_password(submitted: &str, configured: &str) -> bool {
    submitted.as_bytes().ct_eq(configured.as_bytes()).into()
}

/// 访问控制中间件：所有请求在进入路由前经过判定。
pub async fn auth_middleware(
    Extension(auth): Extension<Arc<AuthConfig>>,
    jar: CookieJar,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    let decision = authorize(
        &auth.rules,
        &auth.api_secret,
        req.method(),
        req.uri(),
        bearer_token(req.headers()),
        || auth.has_valid_session(&jar),
    );
    match decision {
        Decision::Allow => Ok(next.run(req).await),
        Decision::Reject(err) => {
            debug!(
                method = %req.method(),
                path = req.uri().path(),
                status = err.status().as_u16(),
                "request rejected"
            );
            Err(err)
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct LoginQuery {
    redirect: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct LoginForm {
    #[serde(default)]
    password: String,
}

/// 只允许站内相对路径作为登录后的跳转目标。
fn safe_redirect_target(target: Option<&str>) -> &str {
    match target {
        Some(value)
            if value.starts_with('/') && !value.starts_with("//") && !value.starts_with("/\\") =>
        {
            value
        }
        _ => "/",
    }
}

/// 登录页。
pub async fn login_page(Query(query): Query<LoginQuery>) -> Html<String> {
    let target = safe_redirect_target(query.redirect.as_deref());
    let action = format!("/login?redirect={}", urlencoding::encode(target));
    Html(format!(
        r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Cortex login</title></head>
<body>
<form method="post" action="{action}">
<input type="password" name="password" autofocus required>
<button type="submit">Sign in</button>
</form>
</body>
</html>"#
    ))
}

/// 登录：校验密码、写入会话 Cookie 并跳转。
pub async fn login(
    Extension(auth): Extension<Arc<AuthConfig>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<LoginQuery>,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> Result<(CookieJar, Redirect), ApiError> {
    let client_ip =
        resolve_client_ip(&headers, Some(addr.ip()), auth.trust_proxy).unwrap_or_else(|| addr.ip());

    if let Some(retry_after) = auth.throttle.check(client_ip).await {
        return Err(ApiError::TooManyRequests(retry_after));
    }

    if form.password.is_empty() {
        return Err(ApiError::BadRequest("Password is required".into()));
    }

    if !verify_password(&form.password, &auth.password) {
        auth.throttle.register_failure(client_ip).await;
        warn!(client_ip = %client_ip, "login rejected");
        return Err(ApiError::Forbidden("Incorrect password".into()));
    }

    auth.throttle.clear(client_ip).await;
    info!(client_ip = %client_ip, secure = auth.session.secure, "session issued");

    let jar = issue_session(jar, &auth.session);
    let target = safe_redirect_target(query.redirect.as_deref());
    Ok((jar, Redirect::to(target)))
}

/// 登出：删除 Cookie 并回到登录页。
pub async fn logout(jar: CookieJar) -> (CookieJar, Redirect) {
    (destroy_session(jar), Redirect::to("/login"))
}

/// 查询当前登录状态。
pub async fn auth_status(
    Extension(auth): Extension<Arc<AuthConfig>>,
    jar: CookieJar,
) -> StatusCode {
    if auth.has_valid_session(&jar) {
        return StatusCode::NO_CONTENT;
    }
    StatusCode::UNAUTHORIZED
}

#[derive(Debug)]
struct LoginAttempt {
    window_start: Instant,
    failures: u32,
    locked_until: Option<Instant>,
}

/// 按客户端 IP 统计登录失败并在超限后锁定。
#[derive(Debug)]
pub struct LoginThrottle {
    attempts: Mutex<HashMap<IpAddr, LoginAttempt>>,
    max_attempts: u32,
    window: Duration,
    lockout: Duration,
}

impl LoginThrottle {
    pub fn new(max_attempts: u32, window: Duration, lockout: Duration) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            max_attempts,
            window,
            lockout,
        }
    }

    /// 若处于锁定期，返回剩余秒数。
    pub async fn check(&self, ip: IpAddr) -> Option<u64> {
        if self.max_attempts == 0 {
            return None;
        }

        let mut attempts = self.attempts.lock().await;
        let now = Instant::now();
        let entry = attempts.get_mut(&ip)?;

        if let Some(locked_until) = entry.locked_until {
            if now < locked_until {
                return Some(locked_until.saturating_duration_since(now).as_secs().max(1));
            }
            entry.locked_until = None;
            entry.failures = 0;
            entry.window_start = now;
        }

        if now.duration_since(entry.window_start) > self.window {
            entry.window_start = now;
            entry.failures = 0;
        }

        None
    }

    pub async fn register_failure(&self, ip: IpAddr) {
        if self.max_attempts == 0 {
            return;
        }

        let mut attempts = self.attempts.lock().await;
        let now = Instant::now();
        let entry = attempts.entry(ip).or_insert(LoginAttempt {
            window_start: now,
            failures: 0,
            locked_until: None,
        });

        if now.duration_since(entry.window_start) > self.window {
            entry.window_start = now;
            entry.failures = 0;
            entry.locked_until = None;
        }

        entry.failures = entry.failures.saturating_add(1);
        if entry.failures >= self.max_attempts {
            entry.locked_until = Some(now + self.lockout);
            warn!(client_ip = %ip, "login locked out");
        }
    }

    pub async fn clear(&self, ip: IpAddr) {
        self.attempts.lock().await.remove(&ip);
    }

    /// 清理过期的失败记录。
    pub async fn prune(&self) {
        let mut attempts = self.attempts.lock().await;
        let now = Instant::now();
        attempts.retain(|_, entry| {
            if let Some(locked_until) = entry.locked_until {
                return locked_until > now;
            }
            now.duration_since(entry.window_start) <= self.window
        });
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.attempts.lock().await.len()
    }
}
