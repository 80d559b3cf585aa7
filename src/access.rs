//! 请求访问控制：公共路径、Bearer 令牌、受保护路径规则与会话回退。
//!
//! 判定顺序固定：公共路径 → Bearer 令牌 → 始终受保护 → 按方法受保护
//! → 备份文件名校验 → 会话。判定只依赖请求与启动时确定的配置。

use axum::http::{HeaderMap, Method, Uri, header};
use subtle::ConstantTimeEq;

use crate::error::ApiError;

/// 路径保护规则表。
#[derive(Debug, Clone)]
pub struct AccessRules {
    pub public_prefixes: Vec<String>,
    pub api_prefix: String,
    pub always_protected: Vec<String>,
    pub mutation_protected: Vec<String>,
    pub protected_methods: Vec<Method>,
    pub backup_file_prefix: String,
    pub login_path: String,
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

impl Default for AccessRules {
    fn default() -> Self {
        Self {
            public_prefixes: owned(&[
                "/_app",
                "/favicon.ico",
                "/robots.txt",
                "/login",
                "/api/auth/status",
                "/api/version",
            ]),
            api_prefix: "/api/".into(),
            always_protected: owned(&["/api/prompts/analysis-results", "/api/import"]),
            mutation_protected: owned(&["/api/prompts", "/api/backups", "/api/import"]),
            protected_methods: vec![Method::POST, Method::PUT, Method::DELETE, Method::PATCH],
            backup_file_prefix: "/api/backups/".into(),
            login_path: "/login".into(),
        }
    }
}

#[derive(Debug)]
pub enum Decision {
    Allow,
    Reject(ApiError),
}

#[cfg(test)]
impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// 从 `Authorization: Bearer <token>` 中取出令牌。
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    (scheme == "Bearer" && !token.is_empty()).then_some(token)
}

fn starts_with_any(path: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
}

/// 备份路由中的文件名不得包含 `..`、`/` 或 `\`。
pub fn is_traversal_name(name: &str) -> bool {
    name.contains("..") || name.contains('/') || name.contains('\\')
}

/// 对单个请求作出放行或拒绝判定。`session_valid` 仅在需要时调用。
pub fn authorize(
    rules: &AccessRules,
    api_secret: &str,
    method: &Method,
    uri: &Uri,
    bearer: Option<&str>,
    session_valid: impl FnOnce() -> bool,
) -> Decision {
    let path = uri.path();
    if starts_with_any(path, &rules.public_prefixes) {
        return Decision::Allow;
    }

    if let Some(token) = bearer
        && bool::from(token.as_bytes().ct_eq(api_secret.as_bytes()))
    {
        return Decision::Allow;
    }

    let is_api = path.starts_with(rules.api_prefix.as_str());
    if is_api {
        if starts_with_any(path, &rules.always_protected) {
            return Decision::Reject(ApiError::Unauthorized);
        }
        if rules.protected_methods.contains(method)
            && starts_with_any(path, &rules.mutation_protected)
        {
            return Decision::Reject(ApiError::Unauthorized);
        }
        if (*method == Method::DELETE || *method == Method::POST)
            && let Some(name) = path.strip_prefix(rules.backup_file_prefix.as_str())
            && is_traversal_name(name)
        {
            return Decision::Reject(ApiError::BadRequest("Invalid filename".into()));
        }
    }

    if session_valid() {
        return Decision::Allow;
    }

    if is_api {
        Decision::Reject(ApiError::Unauthorized)
    } else {
        Decision::Reject(ApiError::LoginRedirect(login_redirect(rules, uri)))
    }
}

fn login_redirect(rules: &AccessRules, uri: &Uri) -> String {
    let target = uri
        .path_and_query()
        .map(|value| value.as_str())
        .unwrap_or("/");
    format!(
        "{}?redirect={}",
        rules.login_path,
        urlencoding::encode(target)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "api-secret";

    fn decide(method: Method, path: &str, bearer: Option<&str>, session: bool) -> Decision {
        let uri: Uri = path.parse().expect("uri");
        authorize(
            &AccessRules::default(),
            SECRET,
            &method,
            &uri,
            bearer,
            || session,
        )
    }

    fn status(decision: Decision) -> Option<u16> {
        match decision {
            Decision::Allow => None,
            Decision::Reject(err) => Some(err.status().as_u16()),
        }
    }

    #[test]
    fn public_path_outranks_everything() {
        assert!(decide(Method::GET, "/_app/immutable/app.js", Some("wrong"), false).is_allowed());
        assert!(decide(Method::GET, "/favicon.ico", None, false).is_allowed());
        assert!(decide(Method::POST, "/login", None, false).is_allowed());
    }

    #[test]
    fn valid_bearer_allows_protected_routes() {
        assert!(decide(Method::POST, "/api/import", Some(SECRET), false).is_allowed());
        assert!(
            decide(
                Method::PATCH,
                "/api/prompts/analysis-results",
                Some(SECRET),
                false
            )
            .is_allowed()
        );
    }

    #[test]
    fn always_protected_rejects_even_with_session() {
        assert_eq!(
            status(decide(Method::GET, "/api/import", None, true)),
            Some(401)
        );
        assert_eq!(
            status(decide(Method::POST, "/api/import", Some("wrong-secret"), false)),
            Some(401)
        );
    }

    #[test]
    fn mutations_need_bearer_token() {
        assert_eq!(
            status(decide(Method::DELETE, "/api/prompts/1", None, true)),
            Some(401)
        );
        assert_eq!(
            status(decide(Method::POST, "/api/backups/restore", None, true)),
            Some(401)
        );
        assert!(decide(Method::GET, "/api/prompts", None, true).is_allowed());
    }

    #[test]
    fn backup_traversal_rejected_when_mutations_unprotected() {
        let rules = AccessRules {
            mutation_protected: vec!["/api/prompts".into()],
            ..AccessRules::default()
        };
        let uri: Uri = "/api/backups/../../etc/passwd".parse().expect("uri");
        let decision = authorize(&rules, SECRET, &Method::DELETE, &uri, None, || true);
        assert_eq!(status(decision), Some(400));

        let uri: Uri = "/api/backups/backup-1.db".parse().expect("uri");
        let decision = authorize(&rules, SECRET, &Method::DELETE, &uri, None, || true);
        assert!(decision.is_allowed());
    }

    #[test]
    fn session_fallback_and_redirect() {
        assert!(decide(Method::GET, "/", None, true).is_allowed());
        assert!(decide(Method::GET, "/api/files", None, true).is_allowed());
        assert_eq!(status(decide(Method::GET, "/api/files", None, false)), Some(401));

        match decide(Method::GET, "/upload?tab=1", None, false) {
            Decision::Reject(ApiError::LoginRedirect(location)) => {
                assert_eq!(location, "/login?redirect=%2Fupload%3Ftab%3D1");
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn session_is_not_consulted_when_bearer_matches() {
        let uri: Uri = "/api/files".parse().expect("uri");
        let decision = authorize(
            &AccessRules::default(),
            SECRET,
            &Method::GET,
            &uri,
            Some(SECRET),
            || panic!("session check should be skipped"),
        );
        assert!(decision.is_allowed());
    }

    #[test]
    fn bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer"));
        assert_eq!(bearer_token(&headers), None);
    }
}
