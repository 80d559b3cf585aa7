//! JSON 导出与整体替换式导入。

use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Json};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::backups::BackupStore;
use crate::db::{Database, PortablePrompt, run_blocking};
use crate::error::ApiError;

const EXPORT_VERSION: &str = "1.0";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExportDocument {
    version: &'static str,
    exported_at: String,
    prompts: Vec<PortablePrompt>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ImportResponse {
    success: bool,
    imported: usize,
    backup_created: String,
}

#[derive(Deserialize)]
struct ImportDocument {
    prompts: Vec<PortablePrompt>,
}

/// 导出全部提示词为 JSON 附件。
pub async fn export_prompts(
    Extension(db): Extension<Arc<Database>>,
) -> Result<Response, ApiError> {
    let prompts = run_blocking(move || db.list_prompts().map_err(ApiError::from))
        .await?
        .into_iter()
        .map(|entry| PortablePrompt {
            title: entry.prompt.title,
            user_category: entry.prompt.user_category,
            algo_category: entry.prompt.algo_category,
            pos_x: entry.prompt.pos_x,
            pos_y: entry.prompt.pos_y,
            blocks: entry.blocks.into_iter().map(|block| block.content).collect(),
        })
        .collect::<Vec<_>>();

    let now = Utc::now();
    let document = ExportDocument {
        version: EXPORT_VERSION,
        exported_at: now.to_rfc3339_opts(SecondsFormat::Millis, true),
        prompts,
    };
    let body = serde_json::to_string_pretty(&document)
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let disposition = format!(
        "attachment; filename=\"cortex-export-{}.json\"",
        now.format("%Y-%m-%d")
    );
    let disposition = HeaderValue::from_str(&disposition)
        .map_err(|_| ApiError::Internal("Failed to build headers".into()))?;

    info!(count = document.prompts.len(), "prompts exported");
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/json")),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

/// 校验导入文档的结构，返回可写入的数据。
fn parse_import(body: Value) -> Result<Vec<PortablePrompt>, ApiError> {
    let Some(entries) = body.get("prompts").and_then(Value::as_array) else {
        return Err(ApiError::BadRequest(
            "Invalid import format: prompts array required".into(),
        ));
    };
    for entry in entries {
        let has_title = entry
            .get("title")
            .and_then(Value::as_str)
            .is_some_and(|title| !title.is_empty());
        if !has_title {
            return Err(ApiError::BadRequest("Each prompt must have a title".into()));
        }
        let has_blocks = entry
            .get("blocks")
            .and_then(Value::as_array)
            .is_some_and(|blocks| !blocks.is_empty());
        if !has_blocks {
            return Err(ApiError::BadRequest(
                "Each prompt must have at least one block".into(),
            ));
        }
    }

    let document: ImportDocument = serde_json::from_value(body)
        .map_err(|err| ApiError::BadRequest(format!("Invalid import format: {err}")))?;
    Ok(document
        .prompts
        .into_iter()
        .map(|prompt| PortablePrompt {
            user_category: prompt.user_category.filter(|value| !value.is_empty()),
            algo_category: prompt.algo_category.filter(|value| !value.is_empty()),
            ..prompt
        })
        .collect())
}

/// 先备份，再在单个事务中替换全部提示词。
pub async fn import_prompts(
    Extension(db): Extension<Arc<Database>>,
    Extension(backups): Extension<Arc<BackupStore>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<JsonResponse<ImportResponse>, ApiError> {
    let Json(body) = payload.map_err(|err| ApiError::BadRequest(err.body_text()))?;
    let prompts = parse_import(body)?;

    let (backup_created, imported) = run_blocking(move || {
        let backup = backups.create(&db)?;
        let imported = db.replace_all(&prompts)?;
        Ok((backup, imported))
    })
    .await?;

    info!(imported, backup = backup_created, "import finished");
    Ok(JsonResponse(ImportResponse {
        success: true,
        imported,
        backup_created,
    }))
}
