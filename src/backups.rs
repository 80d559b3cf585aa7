//! 数据库备份目录：列表、创建、删除与恢复。

use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Json, Path};
use axum::response::Json as JsonResponse;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::{Database, run_blocking};
use crate::error::ApiError;
use crate::storage::StorageError;

const BACKUP_EXTENSION: &str = ".db";
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// 备份文件名必须是目录内的 `.db` 文件名。
pub fn is_valid_backup_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains("..")
        && !name.contains('/')
        && !name.contains('\\')
        && name.ends_with(BACKUP_EXTENSION)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub filename: String,
    pub size: u64,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
}

impl BackupStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// 校验文件名并返回已存在备份的路径。
    fn resolve(&self, name: &str) -> Result<PathBuf, StorageError> {
        if !is_valid_backup_name(name) {
            return Err(StorageError::InvalidName);
        }
        let path = self.dir.join(name);
        let metadata = std::fs::symlink_metadata(&path)?;
        if !metadata.is_file() {
            return Err(StorageError::Io(io::Error::from(io::ErrorKind::NotFound)));
        }
        Ok(path)
    }

    /// 按创建时间倒序列出 `.db` 备份。
    pub fn list(&self) -> Result<Vec<BackupInfo>, StorageError> {
        std::fs::create_dir_all(&self.dir)?;
        let mut backups = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let filename = entry.file_name().to_string_lossy().to_string();
            if !filename.ends_with(BACKUP_EXTENSION) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(err) => {
                    warn!(filename = %filename, error = %err, "skip unreadable backup");
                    continue;
                }
            };
            let created = metadata.created().or_else(|_| metadata.modified());
            let created_at = created
                .map(|time| DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Millis, true))
                .unwrap_or_default();
            backups.push(BackupInfo {
                filename,
                size: metadata.len(),
                created_at,
            });
        }
        // RFC 3339 UTC strings sort chronologically
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    /// 创建 `backup-<时间戳>.db` 快照，返回文件名。
    pub fn create(&self, db: &Database) -> Result<String, ApiError> {
        std::fs::create_dir_all(&self.dir).map_err(StorageError::from)?;
        let timestamp = Utc::now()
            .to_rfc3339_opts(SecondsFormat::Millis, true)
            .replace([':', '.'], "-");
        let (filename, path) = self.reserve(&timestamp).map_err(ApiError::from)?;
        if let Err(err) = db.backup_to(&path) {
            let _ = std::fs::remove_file(&path);
            return Err(err.into());
        }
        info!(filename = %filename, "backup created");
        Ok(filename)
    }

    /// 以 `create_new` 占用一个空文件名；同一毫秒内的多次备份依次追加序号。
    fn reserve(&self, timestamp: &str) -> Result<(String, PathBuf), StorageError> {
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let filename = match attempt {
                0 => format!("backup-{timestamp}{BACKUP_EXTENSION}"),
                n => format!("backup-{timestamp}-{n}{BACKUP_EXTENSION}"),
            };
            let path = self.dir.join(&filename);
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok((filename, path)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(io::Error::new(io::ErrorKind::AlreadyExists, "no free backup filename").into())
    }

    pub fn delete(&self, name: &str) -> Result<(), ApiError> {
        let path = self.resolve(name).map_err(backup_error)?;
        std::fs::remove_file(path).map_err(|err| backup_error(err.into()))?;
        info!(filename = name, "backup deleted");
        Ok(())
    }

    pub fn restore(&self, db: &Database, name: &str) -> Result<(), ApiError> {
        let path = self.resolve(name).map_err(backup_error)?;
        db.restore_from(&path)?;
        info!(filename = name, "backup restored");
        Ok(())
    }
}

fn backup_error(err: StorageError) -> ApiError {
    match err {
        StorageError::Io(err) if err.kind() == io::ErrorKind::NotFound => {
            ApiError::NotFound("Backup file not found".into())
        }
        other => other.into(),
    }
}

#[derive(Deserialize)]
pub(crate) struct RestoreRequest {
    #[serde(default)]
    filename: String,
}

#[derive(Serialize)]
pub(crate) struct DeleteBackupResponse {
    success: bool,
    deleted: String,
}

#[derive(Serialize)]
pub(crate) struct RestoreResponse {
    success: bool,
    restored: String,
}

pub async fn list_backups(
    Extension(store): Extension<Arc<BackupStore>>,
) -> Result<JsonResponse<Vec<BackupInfo>>, ApiError> {
    let backups = run_blocking(move || store.list().map_err(ApiError::from)).await?;
    Ok(JsonResponse(backups))
}

/// 删除备份。路径参数取剩余全部片段，以便拒绝包含分隔符的名称。
pub async fn delete_backup(
    Path(filename): Path<String>,
    Extension(store): Extension<Arc<BackupStore>>,
) -> Result<JsonResponse<DeleteBackupResponse>, ApiError> {
    if !is_valid_backup_name(&filename) {
        return Err(ApiError::BadRequest("Invalid filename".into()));
    }
    let name = filename.clone();
    run_blocking(move || store.delete(&name)).await?;
    Ok(JsonResponse(DeleteBackupResponse {
        success: true,
        deleted: filename,
    }))
}

pub async fn restore_backup(
    Extension(store): Extension<Arc<BackupStore>>,
    Extension(db): Extension<Arc<Database>>,
    payload: Result<Json<RestoreRequest>, JsonRejection>,
) -> Result<JsonResponse<RestoreResponse>, ApiError> {
    let Json(request) = payload.map_err(|err| ApiError::BadRequest(err.body_text()))?;
    if !is_valid_backup_name(&request.filename) {
        return Err(ApiError::BadRequest("Invalid filename".into()));
    }
    let name = request.filename.clone();
    run_blocking(move || store.restore(&db, &name)).await?;
    Ok(JsonResponse(RestoreResponse {
        success: true,
        restored: request.filename,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::open_temp;

    #[test]
    fn backup_name_validation() {
        assert!(is_valid_backup_name("backup-2024-01-01T00-00-00-000Z.db"));
        assert!(!is_valid_backup_name(""));
        assert!(!is_valid_backup_name("../cortex.db"));
        assert!(!is_valid_backup_name("nested/cortex.db"));
        assert!(!is_valid_backup_name("nested\\cortex.db"));
        assert!(!is_valid_backup_name("cortex.sqlite"));
    }

    #[test]
    fn create_list_restore_and_delete() {
        let (temp, db) = open_temp();
        let store = BackupStore::new(temp.path().join("backups"));
        assert!(store.list().expect("list").is_empty());

        db.create_prompt("Original", None, &["a".to_string()])
            .expect("create");
        let filename = store.create(&db).expect("backup");
        assert!(filename.starts_with("backup-"));
        assert!(is_valid_backup_name(&filename));
        std::fs::write(temp.path().join("backups").join("notes.txt"), b"x").expect("noise");

        let listed = store.list().expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].filename, filename);
        assert!(listed[0].size > 0);

        db.create_prompt("Extra", None, &["b".to_string()])
            .expect("create");
        store.restore(&db, &filename).expect("restore");
        assert_eq!(db.list_prompts().expect("list").len(), 1);

        store.delete(&filename).expect("delete");
        assert!(store.list().expect("list").is_empty());
        assert!(matches!(
            store.delete(&filename),
            Err(ApiError::NotFound(_))
        ));
        assert!(matches!(
            store.delete("../cortex.db"),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[test]
    fn same_timestamp_gets_a_suffixed_name() {
        let (temp, _db) = open_temp();
        let store = BackupStore::new(temp.path().join("backups"));
        std::fs::create_dir_all(temp.path().join("backups")).expect("backup dir");

        let stamp = "2024-01-01T00-00-00-000Z";
        let (first, _) = store.reserve(stamp).expect("first name");
        let (second, _) = store.reserve(stamp).expect("second name");
        assert_eq!(first, "backup-2024-01-01T00-00-00-000Z.db");
        assert_eq!(second, "backup-2024-01-01T00-00-00-000Z-1.db");
        assert!(is_valid_backup_name(&second));
    }

    #[test]
    fn back_to_back_backups_all_succeed() {
        let (temp, db) = open_temp();
        let store = BackupStore::new(temp.path().join("backups"));
        db.create_prompt("Snapshot", None, &["a".to_string()])
            .expect("create");

        let mut names: Vec<String> = (0..5)
            .map(|_| store.create(&db).expect("backup"))
            .collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 5);
        assert_eq!(store.list().expect("list").len(), 5);
    }
}
