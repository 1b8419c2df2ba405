//! 上传会话登记：目标路径 → 预期总长度，带过期回收。
//!
//! 两种后端（进程内与 Redis）对外语义一致：会话过期而未完成时，
//! 后端通过事件通道上报 [`UploadEvent::Expired`]，由统一的清理任务删除残留文件。

pub mod memory;
pub mod shared;

use async_trait::async_trait;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use memory::MemoryUploadCache;
pub use shared::SharedUploadCache;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    /// 会话在未完成时过期，`path` 为目标文件的真实路径。
    Expired { path: String },
}

pub type EventSender = mpsc::UnboundedSender<UploadEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<UploadEvent>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no active upload found for the given path")]
    NotFound,
    #[error("upload cache backend error: {0}")]
    Backend(String),
    #[error("invalid upload length in cache: {0}")]
    Corrupt(String),
}

/// 活跃上传的登记表，键为目标文件的规范化真实路径。
#[async_trait]
pub trait UploadCache: Send + Sync {
    /// 登记（或覆盖）上传及其预期总长度，并重置过期时间。
    async fn register(&self, path: &str, length: u64) -> Result<(), CacheError>;

    /// 刷新过期时间，不改变记录的长度。
    async fn touch(&self, path: &str) -> Result<(), CacheError>;

    /// 返回预期总长度；没有活跃会话时返回 [`CacheError::NotFound`]。
    async fn get_length(&self, path: &str) -> Result<u64, CacheError>;

    /// 移除会话，不触碰文件系统。
    async fn complete(&self, path: &str) -> Result<(), CacheError>;
}

/// 已构建的登记后端，保留具体类型以便后台任务驱动其过期机制。
pub enum CacheBackend {
    Memory(Arc<MemoryUploadCache>),
    Shared(Arc<SharedUploadCache>),
}

impl CacheBackend {
    /// 根据是否配置 Redis 地址选择后端。
    pub async fn open(
        redis_url: Option<&str>,
        ttl: Duration,
    ) -> Result<(Self, EventReceiver), CacheError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let backend = match redis_url.map(str::trim).filter(|url| !url.is_empty()) {
            Some(url) => {
                let cache = SharedUploadCache::connect(url, ttl, sender).await?;
                info!("using redis upload cache");
                CacheBackend::Shared(Arc::new(cache))
            }
            None => {
                info!("using in-memory upload cache");
                CacheBackend::Memory(Arc::new(MemoryUploadCache::new(ttl, sender)))
            }
        };
        Ok((backend, receiver))
    }

    pub fn cache(&self) -> Arc<dyn UploadCache> {
        match self {
            CacheBackend::Memory(cache) => cache.clone(),
            CacheBackend::Shared(cache) => cache.clone(),
        }
    }
}

/// 消费过期事件并删除未完成的上传文件（尽力而为）。
pub async fn remove_orphaned_uploads(mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        let UploadEvent::Expired { path } = event;
        match fs::remove_file(&path).await {
            Ok(()) => info!(path, "deleted incomplete upload file"),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path, "incomplete upload file already gone");
            }
            Err(err) => warn!(path, error = %err, "failed to delete incomplete upload file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn expired_event_removes_partial_file() {
        let temp = tempdir().expect("tempdir");
        let partial = temp.path().join("partial.bin");
        std::fs::write(&partial, b"half").expect("write partial");
        let missing = temp.path().join("missing.bin");

        let (sender, receiver) = mpsc::unbounded_channel();
        sender
            .send(UploadEvent::Expired {
                path: missing.to_string_lossy().into_owned(),
            })
            .expect("send");
        sender
            .send(UploadEvent::Expired {
                path: partial.to_string_lossy().into_owned(),
            })
            .expect("send");
        drop(sender);

        remove_orphaned_uploads(receiver).await;
        assert!(!partial.exists());
    }

    #[tokio::test]
    async fn open_without_redis_uses_memory_backend() {
        let (backend, _events) = CacheBackend::open(Some("  "), Duration::from_secs(60))
            .await
            .unwrap_or_else(|_| panic!("open cache"));
        assert!(matches!(backend, CacheBackend::Memory(_)));
        let cache = backend.cache();
        cache.register("/tmp/x", 5).await.expect("register");
        assert_eq!(cache.get_length("/tmp/x").await.expect("length"), 5);
    }
}
