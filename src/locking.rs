//! 内存路径锁：串行化同一目标上的偏移校验与写入。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time;

/// Manages asynchronous mutexes keyed by canonical destination.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

#[derive(Debug)]
pub struct LockTimeout;

impl LockManager {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// 在给定超时时间内获取路径锁，超时返回 Err。
    pub async fn lock_path_with_timeout(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<OwnedMutexGuard<()>, LockTimeout> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| LockTimeout)
    }

    /// 移除无人持有或等待的锁条目，返回移除数量。
    pub async fn prune_idle(&self) -> usize {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_locker_times_out_while_held() {
        let manager = LockManager::new();
        let guard = manager
            .lock_path_with_timeout("/a.bin", Duration::from_millis(50))
            .await
            .expect("first lock");
        let second = manager
            .lock_path_with_timeout("/a.bin", Duration::from_millis(20))
            .await;
        assert!(second.is_err());

        let other = manager
            .lock_path_with_timeout("/b.bin", Duration::from_millis(20))
            .await;
        assert!(other.is_ok());
        drop(guard);
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let manager = LockManager::new();
        let held = manager
            .lock_path_with_timeout("held", Duration::from_millis(50))
            .await
            .expect("lock");
        drop(
            manager
                .lock_path_with_timeout("idle", Duration::from_millis(50))
                .await
                .expect("lock"),
        );

        assert_eq!(manager.prune_idle().await, 1);
        drop(held);
        assert_eq!(manager.prune_idle().await, 1);
    }
}
