//! 会话令牌编解码与 Cookie 写入/删除。
//!
//! 令牌格式为 `base64(json).hex(hmac_sha256(json))`，状态完全保存在客户端；
//! 有效性只取决于密钥、最大存活时间与当前时间。

use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use cookie::time::Duration as CookieDuration;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SESSION_COOKIE_NAME;
use crate::signature;

/// 允许签发时间略晚于本机时钟的容差（毫秒）。
const CLOCK_SKEW_MS: i64 = 60_000;

#[derive(Serialize, Deserialize)]
struct SessionClaims {
    auth: bool,
    timestamp: i64,
}

/// 会话签发所需的配置。
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub secret: String,
    pub max_age_secs: u64,
    pub secure: bool,
}

/// 当前时间（Unix 毫秒）。
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 生成以 `now_ms` 为签发时间的令牌。
pub fn issue_token(secret: &str, now_ms: i64) -> String {
    let claims = SessionClaims {
        auth: true,
        timestamp: now_ms,
    };
    // Field order is fixed by the struct, so the JSON text is canonical.
    let json = match serde_json::to_string(&claims) {
        Ok(json) => json,
        Err(_) => format!(r#"{{"auth":true,"timestamp":{now_ms}}}"#),
    };
    let signature = signature::sign(json.as_bytes(), secret.as_bytes());
    format!("{}.{}", BASE64.encode(json.as_bytes()), signature)
}

/// 校验令牌；任何解析失败都视为无效，不向调用方抛出错误。
pub fn validate_token(token: &str, secret: &str, max_age_secs: u64, now_ms: i64) -> bool {
    let Some((payload, signature)) = token.split_once('.') else {
        debug!("session token without separator");
        return false;
    };
    if payload.is_empty() || signature.is_empty() {
        return false;
    }
    let Ok(decoded) = BASE64.decode(payload) else {
        debug!("session payload is not base64");
        return false;
    };
    let Ok(json) = String::from_utf8(decoded) else {
        return false;
    };
    if !signature::verify(json.as_bytes(), signature, secret.as_bytes()) {
        debug!("session signature mismatch");
        return false;
    }
    let Ok(claims) = serde_json::from_str::<SessionClaims>(&json) else {
        debug!("session payload is not valid claims json");
        return false;
    };
    if !claims.auth {
        return false;
    }

    let max_age_ms = i64::try_from(max_age_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
    let age = now_ms.saturating_sub(claims.timestamp);
    if age > max_age_ms {
        debug!(age_ms = age, "session expired");
        return false;
    }
    if age < -CLOCK_SKEW_MS {
        debug!(age_ms = age, "session stamped in the future");
        return false;
    }
    true
}

/// 以当前时间校验 Cookie 值。
pub fn validate_session(cookie_value: &str, secret: &str, max_age_secs: u64) -> bool {
    validate_token(cookie_value, secret, max_age_secs, now_millis())
}

/// 签发新会话并写入 Cookie。
pub fn issue_session(jar: CookieJar, settings: &SessionSettings) -> CookieJar {
    let token = issue_token(&settings.secret, now_millis());
    let max_age = i64::try_from(settings.max_age_secs).unwrap_or(i64::MAX);
    let cookie = Cookie::build((SESSION_COOKIE_NAME, token))
        .path("/")
        .http_only(true)
        .secure(settings.secure)
        .same_site(SameSite::Lax)
        .max_age(CookieDuration::seconds(max_age))
        .build();
    jar.add(cookie)
}

/// 删除会话 Cookie（仅客户端侧，已签发令牌在过期前仍然有效）。
pub fn destroy_session(jar: CookieJar) -> CookieJar {
    jar.remove(Cookie::build(SESSION_COOKIE_NAME).path("/").build())
}
