//! 上传会话过期、原地上传过期、残留文件清理与锁表回收的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::LOCK_PRUNE_INTERVAL_SECS;
use crate::inplace::InPlaceStore;
use crate::locking::LockManager;
use crate::upload::{CacheBackend, EventReceiver, remove_orphaned_uploads};

/// 启动后台任务（会话过期、原地上传过期、残留文件清理、锁表回收）。
pub fn spawn_background_tasks(
    backend: &CacheBackend,
    events: EventReceiver,
    sweep_interval: Duration,
    locks: Arc<LockManager>,
    store: Arc<InPlaceStore>,
) {
    tokio::spawn(remove_orphaned_uploads(events));

    match backend {
        CacheBackend::Memory(cache) => {
            let cache = cache.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(sweep_interval);
                loop {
                    interval.tick().await;
                    let expired = cache.sweep().await;
                    if expired > 0 {
                        debug!(expired, "swept expired upload sessions");
                    }
                }
            });
        }
        CacheBackend::Shared(cache) => {
            let cache = cache.clone();
            tokio::spawn(async move { cache.listen_expirations().await });
        }
    }

    let expiring = store.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            let expired = expiring.prune_expired().await;
            if expired > 0 {
                debug!(expired, "expired abandoned in-place uploads");
            }
        }
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(LOCK_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let pruned = locks.prune_idle().await + store.prune_locks().await;
            if pruned > 0 {
                debug!(pruned, "pruned idle upload locks");
            }
        }
    });
}
