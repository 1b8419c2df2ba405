//! 进程内上传登记：带独立过期时间的哈希表，由后台扫描驱动回收。

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{CacheError, EventSender, UploadCache, UploadEvent};

#[derive(Debug)]
struct CacheEntry {
    length: u64,
    registered_at: Instant,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct MemoryUploadCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    events: EventSender,
}

impl MemoryUploadCache {
    pub fn new(ttl: Duration, events: EventSender) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            events,
        }
    }

    /// 回收所有已过期的会话并上报过期事件，返回回收数量。
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired = {
            let mut entries = self.entries.lock().await;
            let keys = entries
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(key, _)| key.clone())
                .collect::<Vec<_>>();
            keys.into_iter()
                .filter_map(|key| entries.remove(&key).map(|entry| (key, entry)))
                .collect::<Vec<_>>()
        };

        for (path, entry) in &expired {
            debug!(
                path,
                length = entry.length,
                age_secs = now.duration_since(entry.registered_at).as_secs(),
                "upload session expired"
            );
            self.emit_expired(path.clone());
        }
        expired.len()
    }

    fn emit_expired(&self, path: String) {
        if self.events.send(UploadEvent::Expired { path }).is_err() {
            warn!("upload cleanup channel closed");
        }
    }
}

#[async_trait]
impl UploadCache for MemoryUploadCache {
    async fn register(&self, path: &str, length: u64) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.insert(
            path.to_string(),
            CacheEntry {
                length,
                registered_at: now,
                expires_at: now + self.ttl,
            },
        );
        Ok(())
    }

    async fn touch(&self, path: &str) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(path)
            && entry.expires_at > now
        {
            entry.expires_at = now + self.ttl;
        }
        Ok(())
    }

    async fn get_length(&self, path: &str) -> Result<u64, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let expired = match entries.get(path) {
            Some(entry) if entry.expires_at > now => return Ok(entry.length),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(path);
            drop(entries);
            self.emit_expired(path.to_string());
        }
        Err(CacheError::NotFound)
    }

    async fn complete(&self, path: &str) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().await;
        entries.remove(path);
        Ok(())
    }
}
