//! 提示词 REST 处理器：增删改查、分析结果回写、分类与散点视图数据。

use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Json, Path};
use axum::http::StatusCode;
use axum::response::Json as JsonResponse;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

use crate::db::{AnalysisResult, BlockInput, Database, Prompt, PromptWithBlocks, run_blocking};
use crate::error::ApiError;

#[derive(Deserialize)]
pub(crate) struct CreatePromptRequest {
    title: Option<String>,
    user_category: Option<String>,
    blocks: Option<Vec<String>>,
}

#[derive(Deserialize)]
pub(crate) struct UpdatePromptRequest {
    title: Option<String>,
    user_category: Option<String>,
    blocks: Option<Vec<BlockInput>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Categories {
    user_categories: Vec<String>,
    algo_categories: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExplorerData {
    prompts: Vec<Prompt>,
    algo_categories: Vec<String>,
}

fn parse_id(raw: &str) -> Result<i64, ApiError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| ApiError::BadRequest("Invalid prompt ID".into()))
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|err| ApiError::BadRequest(err.body_text()))
}

fn required_title(title: Option<String>) -> Result<String, ApiError> {
    match title.as_deref().map(str::trim) {
        Some(title) if !title.is_empty() => Ok(title.to_string()),
        _ => Err(ApiError::BadRequest("Title is required".into())),
    }
}

fn require_blocks<T>(blocks: Option<Vec<T>>) -> Result<Vec<T>, ApiError> {
    match blocks {
        Some(blocks) if !blocks.is_empty() => Ok(blocks),
        _ => Err(ApiError::BadRequest(
            "At least one block is required".into(),
        )),
    }
}

/// 去除首尾空白，空串视为未分类。
fn normalize_category(category: Option<String>) -> Option<String> {
    category
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub async fn list_prompts(
    Extension(db): Extension<Arc<Database>>,
) -> Result<JsonResponse<Vec<PromptWithBlocks>>, ApiError> {
    let prompts = run_blocking(move || db.list_prompts().map_err(ApiError::from)).await?;
    Ok(JsonResponse(prompts))
}

pub async fn create_prompt(
    Extension(db): Extension<Arc<Database>>,
    payload: Result<Json<CreatePromptRequest>, JsonRejection>,
) -> Result<(StatusCode, JsonResponse<Value>), ApiError> {
    let request = json_body(payload)?;
    let title = required_title(request.title)?;
    let blocks: Vec<String> = require_blocks(request.blocks)?
        .into_iter()
        .map(|block| block.trim().to_string())
        .filter(|block| !block.is_empty())
        .collect();
    let category = normalize_category(request.user_category);

    let count = blocks.len();
    let id = run_blocking(move || {
        db.create_prompt(&title, category.as_deref(), &blocks)
            .map_err(ApiError::from)
    })
    .await?;
    info!(id, blocks = count, "prompt created");
    Ok((StatusCode::CREATED, JsonResponse(json!({ "id": id }))))
}

pub async fn get_prompt(
    Path(raw_id): Path<String>,
    Extension(db): Extension<Arc<Database>>,
) -> Result<JsonResponse<PromptWithBlocks>, ApiError> {
    let id = parse_id(&raw_id)?;
    run_blocking(move || db.get_prompt(id).map_err(ApiError::from))
        .await?
        .map(JsonResponse)
        .ok_or_else(|| ApiError::NotFound("Prompt not found".into()))
}

pub async fn update_prompt(
    Path(raw_id): Path<String>,
    Extension(db): Extension<Arc<Database>>,
    payload: Result<Json<UpdatePromptRequest>, JsonRejection>,
) -> Result<JsonResponse<Value>, ApiError> {
    let id = parse_id(&raw_id)?;
    let request = json_body(payload)?;
    let title = required_title(request.title)?;
    let blocks: Vec<BlockInput> = require_blocks(request.blocks)?
        .into_iter()
        .map(|block| BlockInput {
            content: block.content.trim().to_string(),
            sort_order: block.sort_order,
        })
        .filter(|block| !block.content.is_empty())
        .collect();
    let category = normalize_category(request.user_category);

    let count = blocks.len();
    let updated = run_blocking(move || {
        db.update_prompt(id, &title, category.as_deref(), &blocks)
            .map_err(ApiError::from)
    })
    .await?;
    if !updated {
        return Err(ApiError::NotFound("Prompt not found".into()));
    }
    info!(id, blocks = count, "prompt updated");
    Ok(JsonResponse(json!({ "success": true })))
}

pub async fn delete_prompt(
    Path(raw_id): Path<String>,
    Extension(db): Extension<Arc<Database>>,
) -> Result<JsonResponse<Value>, ApiError> {
    let id = parse_id(&raw_id)?;
    if !run_blocking(move || db.delete_prompt(id).map_err(ApiError::from)).await? {
        return Err(ApiError::NotFound("Prompt not found".into()));
    }
    info!(id, "prompt deleted");
    Ok(JsonResponse(json!({ "success": true })))
}

/// 批量回写聚类类别与二维坐标。
pub async fn update_analysis_results(
    Extension(db): Extension<Arc<Database>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<JsonResponse<Value>, ApiError> {
    let body = json_body(payload)?;
    if !body.is_array() {
        return Err(ApiError::BadRequest("Expected array of results".into()));
    }
    let results: Vec<AnalysisResult> = serde_json::from_value(body).map_err(|_| {
        ApiError::BadRequest(
            "Each result must have id (number), algo_category (string), pos_x (number), pos_y (number)"
                .into(),
        )
    })?;

    let updated =
        run_blocking(move || db.update_analysis_results(&results).map_err(ApiError::from))
            .await?;
    info!(count = updated, "analysis results stored");
    Ok(JsonResponse(json!({ "success": true, "updated": updated })))
}

pub async fn categories(
    Extension(db): Extension<Arc<Database>>,
) -> Result<JsonResponse<Categories>, ApiError> {
    run_blocking(move || {
        Ok(JsonResponse(Categories {
            user_categories: db.user_categories()?,
            algo_categories: db.algo_categories()?,
        }))
    })
    .await
}

/// 散点视图所需数据：带坐标的提示词与算法类别。
pub async fn explorer(
    Extension(db): Extension<Arc<Database>>,
) -> Result<JsonResponse<ExplorerData>, ApiError> {
    run_blocking(move || {
        Ok(JsonResponse(ExplorerData {
            prompts: db.prompts_with_coordinates()?,
            algo_categories: db.algo_categories()?,
        }))
    })
    .await
}
