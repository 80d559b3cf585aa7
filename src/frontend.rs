//! 前端静态资源服务与 SPA 回退。

use std::path::Path;
use tower_http::services::{ServeDir, ServeFile};
use tracing::warn;

/// 静态目录服务；未命中的路径回退到 `index.html`，由前端路由处理。
pub fn static_files(dir: &Path) -> ServeDir<ServeFile> {
    if !dir.join("index.html").is_file() {
        warn!(path = %dir.display(), "static directory has no index.html");
    }
    ServeDir::new(dir)
        .append_index_html_on_directories(true)
        .fallback(ServeFile::new(dir.join("index.html")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body as AxumBody;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tempfile::tempdir;
    use tower::ServiceExt;

    async fn fetch(dir: &Path, uri: &str) -> (StatusCode, String) {
        let response = static_files(dir)
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .body(AxumBody::empty())
                    .expect("request"),
            )
            .await
            .expect("infallible");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        (status, String::from_utf8_lossy(&bytes).to_string())
    }

    #[tokio::test]
    async fn serves_assets_and_falls_back_to_index() {
        let temp = tempdir().expect("tempdir");
        std::fs::write(temp.path().join("index.html"), "<html>app</html>").expect("index");
        std::fs::create_dir_all(temp.path().join("_app")).expect("assets dir");
        std::fs::write(temp.path().join("_app").join("main.js"), "console.log(1)").expect("js");

        assert_eq!(
            fetch(temp.path(), "/_app/main.js").await,
            (StatusCode::OK, "console.log(1)".to_string())
        );
        assert_eq!(
            fetch(temp.path(), "/").await,
            (StatusCode::OK, "<html>app</html>".to_string())
        );
        assert_eq!(
            fetch(temp.path(), "/prompts/12").await,
            (StatusCode::OK, "<html>app</html>".to_string())
        );
    }
}
