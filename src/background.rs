//! 过期文件清理与登录限流记录清理的后台任务。

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::AuthConfig;
use crate::config::LOGIN_PRUNE_INTERVAL_SECS;
use crate::storage::UploadStore;

/// 后台任务的所有者：只允许启动一次，关闭时中止全部任务。
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    started: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 启动清理任务。重复调用返回 `false` 且不会再次启动。
    pub fn start(&self, store: Arc<UploadStore>, auth: Arc<AuthConfig>, sweep_every: Duration) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("background tasks already running");
            return false;
        }

        let sweeper = tokio::spawn(async move {
            // first tick completes immediately, so one sweep runs at startup
            let mut interval = tokio::time::interval(sweep_every);
            loop {
                interval.tick().await;
                let deleted = store.cleanup_expired().await;
                if deleted > 0 {
                    info!(count = deleted, "expired files removed");
                } else {
                    debug!("no expired files");
                }
            }
        });

        let pruner = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(LOGIN_PRUNE_INTERVAL_SECS));
            loop {
                interval.tick().await;
                auth.throttle.prune().await;
            }
        });

        match self.handles.lock() {
            Ok(mut handles) => handles.extend([sweeper, pruner]),
            Err(poisoned) => poisoned.into_inner().extend([sweeper, pruner]),
        }
        info!(sweep_interval_secs = sweep_every.as_secs(), "background tasks started");
        true
    }

    /// 中止所有任务，之后可以重新启动。
    pub fn shutdown(&self) {
        let handles = match self.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in &handles {
            handle.abort();
        }
        self.started.store(false, Ordering::SeqCst);
        if !handles.is_empty() {
            info!(count = handles.len(), "background tasks stopped");
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::make_auth;
    use crate::storage::tests::make_store;
    use std::time::SystemTime;
    use tempfile::tempdir;

    fn write_old(path: &std::path::Path) {
        std::fs::write(path, b"old").expect("write");
        let file = std::fs::File::options()
            .write(true)
            .open(path)
            .expect("open");
        file.set_modified(SystemTime::now() - Duration::from_secs(13 * 60 * 60))
            .expect("set mtime");
    }

    #[tokio::test]
    async fn start_runs_initial_sweep_and_refuses_second_start() {
        let temp = tempdir().expect("tempdir");
        let store = Arc::new(make_store(&temp, 1024, 4096));
        let stale = store.root_path().join("stale.txt");
        write_old(&stale);

        let tasks = BackgroundTasks::new();
        let auth = make_auth("pw", "secret");
        assert!(tasks.start(store.clone(), auth.clone(), Duration::from_secs(3600)));
        assert!(!tasks.start(store.clone(), auth.clone(), Duration::from_secs(3600)));

        for _ in 0..100 {
            if !stale.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!stale.exists());

        tasks.shutdown();
        assert!(tasks.start(store, auth, Duration::from_secs(3600)));
        tasks.shutdown();
    }

    #[tokio::test]
    async fn shutdown_stops_sweeping() {
        let temp = tempdir().expect("tempdir");
        let store = Arc::new(make_store(&temp, 1024, 4096));
        let tasks = BackgroundTasks::new();
        assert!(tasks.start(store.clone(), make_auth("pw", "secret"), Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tasks.shutdown();
        tokio::task::yield_now().await;

        let stale = store.root_path().join("late.txt");
        write_old(&stale);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(stale.exists());
    }
}
