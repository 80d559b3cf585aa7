//! 上传文件的接收、列表、下载与删除处理器。

use axum::body::Body as AxumBody;
use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{Extension, Multipart, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use httpdate::fmt_http_date;
use serde::Serialize;
use std::sync::Arc;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::atomic::StagedFile;
use crate::error::ApiError;
use crate::storage::{Admission, FileRecord, StorageError, UploadStore, format_bytes};

const UPLOAD_FIELD: &str = "file";

#[derive(Serialize)]
pub(crate) struct UploadResponse {
    success: bool,
    filename: String,
}

#[derive(Serialize)]
pub(crate) struct DeleteResponse {
    success: bool,
    deleted: String,
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return ApiError::PayloadTooLarge("Request body too large".into());
    }
    debug!(error = %err, "malformed multipart body");
    ApiError::BadRequest(err.body_text())
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|_| ApiError::Internal("Failed to build headers".into()))
}

async fn stream_field(
    store: &UploadStore,
    field: &mut Field<'_>,
    staged: &mut StagedFile,
) -> Result<(), ApiError> {
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        if staged.written().saturating_add(chunk.len() as u64) > store.max_file_size {
            return Err(ApiError::PayloadTooLarge(format!(
                "File exceeds the {} limit",
                format_bytes(store.max_file_size)
            )));
        }
        staged
            .write_chunk(&chunk)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
    }
    Ok(())
}

/// 接收 multipart 上传，先写入暂存目录，通过配额校验后落地。
pub async fn upload_file(
    Extension(store): Extension<Arc<UploadStore>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, JsonResponse<UploadResponse>), ApiError> {
    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let (name, target) = store.target_path(field.file_name().unwrap_or_default());
        let mut staged = StagedFile::create(store.temp_path(), target)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;

        if let Err(err) = stream_field(&store, &mut field, &mut staged).await {
            warn!(filename = %name, written = staged.written(), "upload aborted");
            staged.discard().await;
            return Err(err);
        }

        let size = staged.written();
        match store.admit_upload(size).await {
            Admission::Accepted => {}
            Admission::TooLarge => {
                staged.discard().await;
                return Err(ApiError::PayloadTooLarge(format!(
                    "File exceeds the {} limit",
                    format_bytes(store.max_file_size)
                )));
            }
            Admission::InsufficientStorage => {
                staged.discard().await;
                warn!(filename = %name, size, "upload rejected by storage quota");
                return Err(ApiError::InsufficientStorage(
                    "Insufficient storage space".into(),
                ));
            }
        }

        staged
            .commit()
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        info!(filename = %name, size, "file uploaded");
        return Ok((
            StatusCode::CREATED,
            JsonResponse(UploadResponse {
                success: true,
                filename: name,
            }),
        ));
    }

    Err(ApiError::BadRequest("No file provided".into()))
}

/// 列出上传目录中的文件。
pub async fn list_files(
    Extension(store): Extension<Arc<UploadStore>>,
) -> Result<JsonResponse<Vec<FileRecord>>, ApiError> {
    let records = store.list_files().await?;
    debug!(count = records.len(), "list files");
    Ok(JsonResponse(records))
}

/// 以附件形式下载文件。
pub async fn download_file(
    Path(filename): Path<String>,
    Extension(store): Extension<Arc<UploadStore>>,
) -> Result<Response, ApiError> {
    let (name, path, metadata) = store.resolve_file(&filename).await?;
    let file = File::open(&path).await.map_err(StorageError::from)?;

    let encoded = urlencoding::encode(&name);
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        header_value(&format!(
            "attachment; filename=\"{encoded}\"; filename*=UTF-8''{encoded}"
        ))?,
    );
    headers.insert(
        header::CONTENT_LENGTH,
        header_value(&metadata.len().to_string())?,
    );
    if let Ok(modified) = metadata.modified() {
        headers.insert(header::LAST_MODIFIED, header_value(&fmt_http_date(modified))?);
    }

    info!(filename = %name, size = metadata.len(), "download file");
    Ok((
        StatusCode::OK,
        headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// 删除上传文件。
pub async fn delete_file(
    Path(filename): Path<String>,
    Extension(store): Extension<Arc<UploadStore>>,
) -> Result<JsonResponse<DeleteResponse>, ApiError> {
    let deleted = store.delete_file(&filename).await?;
    Ok(JsonResponse(DeleteResponse {
        success: true,
        deleted,
    }))
}
