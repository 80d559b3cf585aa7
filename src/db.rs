//! 提示词数据库：SQLite 存储、结构初始化、事务化写入与在线备份/恢复。

use rusqlite::backup::Progress;
use rusqlite::{Connection, DatabaseName, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::ApiError;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS prompts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    user_category TEXT,
    algo_category TEXT,
    pos_x REAL,
    pos_y REAL,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS prompt_blocks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    prompt_id INTEGER NOT NULL,
    content TEXT NOT NULL,
    sort_order INTEGER NOT NULL,
    FOREIGN KEY(prompt_id) REFERENCES prompts(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_user_category ON prompts(user_category);
CREATE INDEX IF NOT EXISTS idx_algo_category ON prompts(algo_category);
CREATE INDEX IF NOT EXISTS idx_prompt_blocks_prompt_id ON prompt_blocks(prompt_id);

CREATE TRIGGER IF NOT EXISTS update_prompt_timestamp
AFTER UPDATE ON prompts
FOR EACH ROW
BEGIN
    UPDATE prompts SET updated_at = CURRENT_TIMESTAMP WHERE id = OLD.id;
END;
";

const PROMPT_COLUMNS: &str =
    "id, title, user_category, algo_category, pos_x, pos_y, created_at, updated_at";

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database connection lock poisoned")]
    Poisoned,
}

/// 在阻塞线程池中执行 SQLite 与数据库文件操作，异步工作线程不会被连接锁卡住。
pub(crate) async fn run_blocking<T, F>(task: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
}

#[derive(Debug, Clone, Serialize)]
pub struct Prompt {
    pub id: i64,
    pub title: String,
    pub user_category: Option<String>,
    pub algo_category: Option<String>,
    pub pos_x: Option<f64>,
    pub pos_y: Option<f64>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptBlock {
    pub id: i64,
    pub prompt_id: i64,
    pub content: String,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptWithBlocks {
    #[serde(flatten)]
    pub prompt: Prompt,
    pub blocks: Vec<PromptBlock>,
}

/// 更新提示词时提交的块。
#[derive(Debug, Clone, Deserialize)]
pub struct BlockInput {
    pub content: String,
    pub sort_order: i64,
}

/// 聚类分析回写的一条结果。
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisResult {
    pub id: i64,
    pub algo_category: String,
    pub pos_x: f64,
    pub pos_y: f64,
}

/// 导出/导入使用的可移植提示词。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortablePrompt {
    pub title: String,
    #[serde(default)]
    pub user_category: Option<String>,
    #[serde(default)]
    pub algo_category: Option<String>,
    #[serde(default)]
    pub pos_x: Option<f64>,
    #[serde(default)]
    pub pos_y: Option<f64>,
    pub blocks: Vec<String>,
}

fn prompt_from_row(row: &Row<'_>) -> rusqlite::Result<Prompt> {
    Ok(Prompt {
        id: row.get("id")?,
        title: row.get("title")?,
        user_category: row.get("user_category")?,
        algo_category: row.get("algo_category")?,
        pos_x: row.get("pos_x")?,
        pos_y: row.get("pos_y")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn block_from_row(row: &Row<'_>) -> rusqlite::Result<PromptBlock> {
    Ok(PromptBlock {
        id: row.get("id")?,
        prompt_id: row.get("prompt_id")?,
        content: row.get("content")?,
        sort_order: row.get("sort_order")?,
    })
}

fn blocks_for(conn: &Connection, prompt_id: i64) -> rusqlite::Result<Vec<PromptBlock>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, prompt_id, content, sort_order FROM prompt_blocks
         WHERE prompt_id = ?1 ORDER BY sort_order ASC, id ASC",
    )?;
    let rows = stmt.query_map([prompt_id], block_from_row)?;
    rows.collect()
}

fn insert_prompt(
    conn: &Connection,
    title: &str,
    user_category: Option<&str>,
    blocks: &[String],
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO prompts (title, user_category) VALUES (?1, ?2)",
        params![title, user_category],
    )?;
    let id = conn.last_insert_rowid();
    let mut stmt = conn.prepare_cached(
        "INSERT INTO prompt_blocks (prompt_id, content, sort_order) VALUES (?1, ?2, ?3)",
    )?;
    for (index, content) in blocks.iter().enumerate() {
        stmt.execute(params![id, content, index as i64])?;
    }
    Ok(id)
}

/// 单连接 SQLite 数据库，语句均为短操作，由互斥锁串行化。
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Database {
    /// 打开（必要时创建）数据库文件并初始化结构。
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        info!(path = ?path, journal_mode = mode, "database ready");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    /// 所有提示词（含块），按更新时间倒序。
    pub fn list_prompts(&self) -> Result<Vec<PromptWithBlocks>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {PROMPT_COLUMNS} FROM prompts ORDER BY updated_at DESC, id DESC"
        ))?;
        let prompts = stmt
            .query_map([], prompt_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut result = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let blocks = blocks_for(&conn, prompt.id)?;
            result.push(PromptWithBlocks { prompt, blocks });
        }
        Ok(result)
    }

    pub fn get_prompt(&self, id: i64) -> Result<Option<PromptWithBlocks>, DbError> {
        let conn = self.lock()?;
        let prompt = conn
            .query_row(
                &format!("SELECT {PROMPT_COLUMNS} FROM prompts WHERE id = ?1"),
                [id],
                prompt_from_row,
            )
            .optional()?;
        match prompt {
            Some(prompt) => {
                let blocks = blocks_for(&conn, prompt.id)?;
                Ok(Some(PromptWithBlocks { prompt, blocks }))
            }
            None => Ok(None),
        }
    }

    /// 在一个事务中创建提示词及其块，块顺序即提交顺序。
    pub fn create_prompt(
        &self,
        title: &str,
        user_category: Option<&str>,
        blocks: &[String],
    ) -> Result<i64, DbError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let id = insert_prompt(&tx, title, user_category, blocks)?;
        tx.commit()?;
        debug!(id, blocks = blocks.len(), "prompt created");
        Ok(id)
    }

    /// 替换标题、分类与全部块。提示词不存在时返回 `false`。
    pub fn update_prompt(
        &self,
        id: i64,
        title: &str,
        user_category: Option<&str>,
        blocks: &[BlockInput],
    ) -> Result<bool, DbError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE prompts SET title = ?1, user_category = ?2 WHERE id = ?3",
            params![title, user_category, id],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        tx.execute("DELETE FROM prompt_blocks WHERE prompt_id = ?1", [id])?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO prompt_blocks (prompt_id, content, sort_order) VALUES (?1, ?2, ?3)",
            )?;
            for block in blocks {
                stmt.execute(params![id, block.content, block.sort_order])?;
            }
        }
        tx.commit()?;
        Ok(true)
    }

    pub fn delete_prompt(&self, id: i64) -> Result<bool, DbError> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM prompts WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    /// 批量写入分析结果，整体在一个事务中完成。
    pub fn update_analysis_results(&self, results: &[AnalysisResult]) -> Result<usize, DbError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE prompts SET algo_category = ?1, pos_x = ?2, pos_y = ?3 WHERE id = ?4",
            )?;
            for result in results {
                stmt.execute(params![
                    result.algo_category,
                    result.pos_x,
                    result.pos_y,
                    result.id
                ])?;
            }
        }
        tx.commit()?;
        Ok(results.len())
    }

    fn distinct_column(&self, sql: &str) -> Result<Vec<String>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let values = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(values)
    }

    pub fn user_categories(&self) -> Result<Vec<String>, DbError> {
        self.distinct_column(
            "SELECT DISTINCT user_category FROM prompts
             WHERE user_category IS NOT NULL ORDER BY user_category",
        )
    }

    pub fn algo_categories(&self) -> Result<Vec<String>, DbError> {
        self.distinct_column(
            "SELECT DISTINCT algo_category FROM prompts
             WHERE algo_category IS NOT NULL ORDER BY algo_category",
        )
    }

    /// 已有二维坐标的提示词。
    pub fn prompts_with_coordinates(&self) -> Result<Vec<Prompt>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {PROMPT_COLUMNS} FROM prompts
             WHERE pos_x IS NOT NULL AND pos_y IS NOT NULL ORDER BY id"
        ))?;
        let prompts = stmt
            .query_map([], prompt_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(prompts)
    }

    /// 清空并写入导入的提示词，失败时整体回滚。
    pub fn replace_all(&self, prompts: &[PortablePrompt]) -> Result<usize, DbError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM prompt_blocks", [])?;
        tx.execute("DELETE FROM prompts", [])?;
        for prompt in prompts {
            let id = insert_prompt(
                &tx,
                &prompt.title,
                prompt.user_category.as_deref(),
                &prompt.blocks,
            )?;
            if prompt.algo_category.is_some() || prompt.pos_x.is_some() || prompt.pos_y.is_some() {
                tx.execute(
                    "UPDATE prompts SET algo_category = ?1, pos_x = ?2, pos_y = ?3 WHERE id = ?4",
                    params![prompt.algo_category, prompt.pos_x, prompt.pos_y, id],
                )?;
            }
        }
        tx.commit()?;
        info!(count = prompts.len(), "prompts replaced by import");
        Ok(prompts.len())
    }

    /// 生成一致的数据库快照（包含 WAL 中尚未检查点的内容）。
    pub fn backup_to(&self, target: &Path) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute("VACUUM INTO ?1", [target.to_string_lossy()])?;
        Ok(())
    }

    /// 用备份文件覆盖当前数据库内容，连接保持可用。
    pub fn restore_from(&self, source: &Path) -> Result<(), DbError> {
        let mut conn = self.lock()?;
        conn.restore(DatabaseName::Main, source, None::<fn(Progress)>)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        info!(source = ?source, "database restored");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    /// 在另一个线程中持有连接锁，返回前确保锁已被占用。
    pub(crate) fn hold_connection(
        db: std::sync::Arc<Database>,
        hold: std::time::Duration,
    ) -> std::thread::JoinHandle<()> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let _guard = db.lock().expect("lock connection");
            ready_tx.send(()).expect("signal ready");
            std::thread::sleep(hold);
        });
        ready_rx.recv().expect("holder ready");
        holder
    }

    pub(crate) fn open_temp() -> (TempDir, Database) {
        let temp = tempdir().expect("tempdir");
        let db = Database::open(temp.path().join("data").join("cortex.db")).expect("open db");
        (temp, db)
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn open_creates_parent_and_reports_path() {
        let (temp, db) = open_temp();
        assert_eq!(db.path(), temp.path().join("data").join("cortex.db"));
        assert!(db.path().exists());
    }

    #[test]
    fn create_and_get_prompt_with_ordered_blocks() {
        let (_temp, db) = open_temp();
        let id = db
            .create_prompt("Greeting", Some("writing"), &strings(&["first", "second"]))
            .expect("create");

        let prompt = db.get_prompt(id).expect("get").expect("exists");
        assert_eq!(prompt.prompt.title, "Greeting");
        assert_eq!(prompt.prompt.user_category.as_deref(), Some("writing"));
        let contents: Vec<_> = prompt.blocks.iter().map(|b| b.content.as_str()).collect();
        assert_eq!(contents, ["first", "second"]);
        assert_eq!(prompt.blocks[1].sort_order, 1);

        assert!(db.get_prompt(id + 100).expect("get").is_none());
    }

    #[test]
    fn update_replaces_blocks_and_reports_missing() {
        let (_temp, db) = open_temp();
        let id = db
            .create_prompt("Old", None, &strings(&["a", "b", "c"]))
            .expect("create");

        let blocks = vec![
            BlockInput {
                content: "z".into(),
                sort_order: 2,
            },
            BlockInput {
                content: "y".into(),
                sort_order: 1,
            },
        ];
        assert!(db.update_prompt(id, "New", Some("misc"), &blocks).expect("update"));
        let prompt = db.get_prompt(id).expect("get").expect("exists");
        assert_eq!(prompt.prompt.title, "New");
        let contents: Vec<_> = prompt.blocks.iter().map(|b| b.content.as_str()).collect();
        assert_eq!(contents, ["y", "z"]);

        assert!(!db.update_prompt(9999, "x", None, &blocks).expect("update"));
    }

    #[test]
    fn delete_cascades_to_blocks() {
        let (_temp, db) = open_temp();
        let id = db
            .create_prompt("Doomed", None, &strings(&["a"]))
            .expect("create");
        assert!(db.delete_prompt(id).expect("delete"));
        assert!(!db.delete_prompt(id).expect("delete again"));

        let conn = db.lock().expect("lock");
        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM prompt_blocks", [], |row| row.get(0))
            .expect("count");
        assert_eq!(remaining, 0);
    }

    #[test]
    fn analysis_results_feed_categories_and_explorer() {
        let (_temp, db) = open_temp();
        let a = db
            .create_prompt("A", Some("beta"), &strings(&["a"]))
            .expect("create");
        let b = db
            .create_prompt("B", Some("alpha"), &strings(&["b"]))
            .expect("create");
        db.create_prompt("C", None, &strings(&["c"]))
            .expect("create");

        let updated = db
            .update_analysis_results(&[
                AnalysisResult {
                    id: a,
                    algo_category: "cluster-2".into(),
                    pos_x: 0.5,
                    pos_y: -1.0,
                },
                AnalysisResult {
                    id: b,
                    algo_category: "cluster-1".into(),
                    pos_x: 2.0,
                    pos_y: 3.0,
                },
            ])
            .expect("analysis");
        assert_eq!(updated, 2);

        assert_eq!(db.user_categories().expect("user"), ["alpha", "beta"]);
        assert_eq!(
            db.algo_categories().expect("algo"),
            ["cluster-1", "cluster-2"]
        );
        let placed = db.prompts_with_coordinates().expect("coords");
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[0].pos_x, Some(0.5));
    }

    #[test]
    fn replace_all_swaps_content() {
        let (_temp, db) = open_temp();
        db.create_prompt("Existing", None, &strings(&["x"]))
            .expect("create");

        let imported = vec![PortablePrompt {
            title: "Imported".into(),
            user_category: Some("ops".into()),
            algo_category: Some("cluster-9".into()),
            pos_x: Some(1.0),
            pos_y: None,
            blocks: strings(&["one", "two"]),
        }];
        assert_eq!(db.replace_all(&imported).expect("replace"), 1);

        let prompts = db.list_prompts().expect("list");
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].prompt.title, "Imported");
        assert_eq!(prompts[0].prompt.algo_category.as_deref(), Some("cluster-9"));
        assert_eq!(prompts[0].blocks.len(), 2);
    }

    #[test]
    fn backup_and_restore_round_trip_keeps_connection_usable() {
        let (temp, db) = open_temp();
        db.create_prompt("Keep me", None, &strings(&["a"]))
            .expect("create");
        let snapshot = temp.path().join("snapshot.db");
        db.backup_to(&snapshot).expect("backup");
        assert!(snapshot.exists());

        db.create_prompt("Later", None, &strings(&["b"]))
            .expect("create");
        assert_eq!(db.list_prompts().expect("list").len(), 2);

        db.restore_from(&snapshot).expect("restore");
        let prompts = db.list_prompts().expect("list");
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].prompt.title, "Keep me");

        db.create_prompt("After restore", None, &strings(&["c"]))
            .expect("create after restore");
    }
}
