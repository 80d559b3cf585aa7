//! 上传目录管理：文件名清洗、容量配额、文件列表与过期清理。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tracing::{info, warn};

use crate::session::now_millis;

/// 文件名上限按字节计算，与常见文件系统的 NAME_MAX 一致。
const MAX_FILENAME_LEN: usize = 255;
const FORBIDDEN_CHARS: [char; 9] = ['/', '\\', '<', '>', ':', '"', '|', '?', '*'];

/// 扁平上传目录及其限制。
#[derive(Clone, Debug)]
pub struct UploadStore {
    root: PathBuf,
    temp_dir: PathBuf,
    pub max_file_size: u64,
    pub max_total_size: u64,
    pub ttl: Duration,
}

/// 上传准入判定结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    TooLarge,
    InsufficientStorage,
}

impl UploadStore {
    pub fn new(
        root: PathBuf,
        temp_dir: PathBuf,
        max_file_size: u64,
        max_total_size: u64,
        ttl: Duration,
    ) -> Self {
        Self {
            root,
            temp_dir,
            max_file_size,
            max_total_size,
            ttl,
        }
    }

    pub async fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await?;
        fs::create_dir_all(&self.temp_dir).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_dir
    }

    /// 单文件上限优先判定，其次是目录总容量。
    pub async fn admit_upload(&self, size: u64) -> Admission {
        if size > self.max_file_size {
            return Admission::TooLarge;
        }
        let current = directory_size(&self.root).await;
        if current.saturating_add(size) > self.max_total_size {
            return Admission::InsufficientStorage;
        }
        Admission::Accepted
    }

    /// 将客户端文件名映射为目录内的目标路径。
    pub fn target_path(&self, raw_name: &str) -> (String, PathBuf) {
        let name = sanitize_filename(raw_name);
        let path = self.root.join(&name);
        (name, path)
    }

    /// 查找已存在的普通文件。
    pub async fn resolve_file(
        &self,
        raw_name: &str,
    ) -> Result<(String, PathBuf, Metadata), StorageError> {
        if raw_name.trim().is_empty() {
            return Err(StorageError::InvalidName);
        }
        let (name, path) = self.target_path(raw_name);
        let metadata = fs::symlink_metadata(&path).await?;
        if !metadata.is_file() {
            return Err(StorageError::Io(io::Error::from(io::ErrorKind::NotFound)));
        }
        Ok((name, path, metadata))
    }

    pub async fn delete_file(&self, raw_name: &str) -> Result<String, StorageError> {
        let (name, path, _) = self.resolve_file(raw_name).await?;
        fs::remove_file(&path).await?;
        info!(filename = %name, "deleted uploaded file");
        Ok(name)
    }

    /// 每次调用重新读取目录，按上传时间倒序返回。
    pub async fn list_files(&self) -> Result<Vec<FileRecord>, StorageError> {
        fs::create_dir_all(&self.root).await?;
        let now = now_millis();
        let mut dir = fs::read_dir(&self.root).await?;
        let mut records = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!(path = ?entry.path(), error = %err, "skip unreadable upload entry");
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            records.push(FileRecord::from_metadata(name, &metadata, now, self.ttl));
        }

        records.sort_by(|a, b| b.upload_time.cmp(&a.upload_time));
        Ok(records)
    }

    /// 删除超过 TTL 的文件，返回删除数量。单个文件失败不会中断清理。
    pub async fn cleanup_expired(&self) -> usize {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) => {
                warn!(path = ?self.root, error = %err, "cannot read upload dir for cleanup");
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut deleted = 0;
        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "upload dir iteration failed");
                    break;
                }
            };
            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!(path = ?path, error = %err, "failed to stat upload");
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            // mtime in the future counts as age zero
            let age = now.duration_since(modified).unwrap_or_default();
            if age <= self.ttl {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => {
                    deleted += 1;
                    info!(path = ?path, "deleted expired file");
                }
                Err(err) => warn!(path = ?path, error = %err, "failed to delete expired file"),
            }
        }

        deleted
    }
}

/// 目录内普通文件大小之和（不递归）。读取错误记录日志并返回已统计部分。
pub async fn directory_size(dir: &Path) -> u64 {
    let mut total = 0u64;
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(path = ?dir, error = %err, "failed to read directory size");
            return total;
        }
    };
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => total = total.saturating_add(metadata.len()),
                Ok(_) => {}
                Err(err) => warn!(path = ?entry.path(), error = %err, "failed to stat entry"),
            },
            Ok(None) => break,
            Err(err) => {
                warn!(path = ?dir, error = %err, "directory size scan aborted");
                break;
            }
        }
    }
    total
}

/// 清洗客户端文件名：去除路径分隔符与非法字符，折叠 `..`，限制长度。
pub fn sanitize_filename(raw: &str) -> String {
    let stripped: String = raw
        .chars()
        .filter(|ch| !FORBIDDEN_CHARS.contains(ch) && !ch.is_control())
        .collect();

    let mut collapsed = stripped;
    while collapsed.contains("..") {
        collapsed = collapsed.replace("..", ".");
    }

    let mut name = collapsed.trim().to_string();
    if name.is_empty() || name == "." || name == ".." {
        name = format!("file_{}", now_millis());
    }

    if name.len() > MAX_FILENAME_LEN {
        name = truncate_keeping_extension(&name);
    }
    name
}

fn truncate_keeping_extension(name: &str) -> String {
    let extension = match name.rfind('.') {
        Some(index) if index > 0 => &name[index..],
        _ => "",
    };
    if extension.len() >= MAX_FILENAME_LEN {
        return prefix_within(name, MAX_FILENAME_LEN).to_string();
    }
    let stem = &name[..name.len() - extension.len()];
    let head = prefix_within(stem, MAX_FILENAME_LEN - extension.len());
    // keep the joint from forming ".."
    let head = head.trim_end_matches('.');
    format!("{head}{extension}")
}

/// 不超过 `max_bytes` 的最长前缀，截断点落在字符边界上。
fn prefix_within(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn system_time_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(duration) => i64::try_from(duration.as_millis()).unwrap_or(i64::MAX),
        Err(_) => 0,
    }
}

fn format_timestamp(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|datetime| datetime.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 B".into();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

fn format_remaining(millis: u64) -> String {
    if millis == 0 {
        return "expired".into();
    }
    let hours = millis / (60 * 60 * 1000);
    let minutes = (millis % (60 * 60 * 1000)) / (60 * 1000);
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

#[derive(Debug)]
pub enum StorageError {
    InvalidName,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

/// 由文件元数据推导出的上传记录。
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub name: String,
    pub size: u64,
    pub size_formatted: String,
    pub upload_time: i64,
    pub upload_time_formatted: String,
    pub remaining_time: u64,
    pub remaining_time_formatted: String,
    pub is_expired: bool,
}

impl FileRecord {
    fn from_metadata(name: String, metadata: &Metadata, now: i64, ttl: Duration) -> Self {
        let upload_time = metadata.modified().map(system_time_millis).unwrap_or(0);
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let age = u64::try_from(now.saturating_sub(upload_time)).unwrap_or(0);
        let remaining_time = ttl_ms.saturating_sub(age);
        Self {
            size: metadata.len(),
            size_formatted: format_bytes(metadata.len()),
            upload_time,
            upload_time_formatted: format_timestamp(upload_time),
            remaining_time,
            remaining_time_formatted: format_remaining(remaining_time),
            is_expired: age > ttl_ms,
            name,
        }
    }
}
