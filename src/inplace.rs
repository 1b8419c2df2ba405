//! 原地上传存储：多个分段上传写入同一目标文件的互不重叠区间。
//!
//! 每个分段在创建时于目标文件末尾预留 `[actual_offset, actual_offset + size)`，
//! 预留过程由存储内唯一的互斥锁串行化；分片写入只持有该分段自己的锁，
//! 不会阻塞其它分段的数据复制。
//!
//! 同一目标文件的全部记录空闲超过 TTL 后整组失效，未合并的目标文件随之删除。

use std::collections::HashMap;
use std::io::{self, ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::locking::LockManager;
use crate::users::Permissions;

const PART_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// 文件长度在各平台上以 `i64` 表示，预留区间的终点不能越过它。
pub const MAX_FILE_LENGTH: u64 = i64::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Partial,
    Final,
}

/// 一条上传记录的快照，本身不携带任何同步原语。
#[derive(Debug, Clone)]
pub struct InPlaceUpload {
    pub id: String,
    pub path: PathBuf,
    pub kind: UploadKind,
    pub size: u64,
    /// 在目标文件中的起始位置。
    pub actual_offset: u64,
    /// 已写入的逻辑字节数。
    pub written: u64,
}

impl InPlaceUpload {
    pub fn is_complete(&self) -> bool {
        self.written >= self.size
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("upload `{0}` not found")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("upload offset mismatch, current offset is {actual}")]
    OffsetMismatch { actual: u64 },
    #[error("chunk exceeds the reserved size of {size} bytes")]
    Exceeds { size: u64 },
    #[error("partial upload `{0}` is not complete")]
    Incomplete(String),
    #[error("partial uploads target a different file")]
    Mismatch,
    #[error("upload `{0}` is busy")]
    Busy(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug)]
struct Record {
    upload: InPlaceUpload,
    touched: Instant,
    /// 有分片正在写入时不参与过期。
    writing: bool,
}

impl Record {
    fn idle(&self, ttl: Duration, now: Instant) -> bool {
        !self.writing && now.saturating_duration_since(self.touched) >= ttl
    }
}

#[derive(Debug, Default)]
struct StoreState {
    by_id: HashMap<String, Record>,
    by_path: HashMap<PathBuf, Vec<String>>,
}

impl StoreState {
    fn insert(&mut self, upload: InPlaceUpload) {
        self.by_path
            .entry(upload.path.clone())
            .or_default()
            .push(upload.id.clone());
        self.by_id.insert(
            upload.id.clone(),
            Record {
                upload,
                touched: Instant::now(),
                writing: false,
            },
        );
    }

    fn remove(&mut self, id: &str) -> Option<InPlaceUpload> {
        let record = self.by_id.remove(id)?;
        if let Some(ids) = self.by_path.get_mut(&record.upload.path) {
            ids.retain(|other| other != id);
            if ids.is_empty() {
                self.by_path.remove(&record.upload.path);
            }
        }
        Some(record.upload)
    }

    fn drop_path(&mut self, path: &Path) -> usize {
        let ids = self.by_path.remove(path).unwrap_or_default();
        for id in &ids {
            self.by_id.remove(id);
        }
        ids.len()
    }

    fn expired_paths(&self, ttl: Duration) -> Vec<PathBuf> {
        let now = Instant::now();
        self.by_path
            .iter()
            .filter(|(_, ids)| {
                ids.iter().all(|id| {
                    self.by_id
                        .get(id)
                        .map_or(true, |record| record.idle(ttl, now))
                })
            })
            .map(|(path, _)| path.clone())
            .collect()
    }
}

#[derive(Debug)]
pub struct InPlaceStore {
    state: Mutex<StoreState>,
    part_locks: LockManager,
    ttl: Duration,
}

impl InPlaceStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            part_locks: LockManager::new(),
            ttl,
        }
    }

    /// 创建分段（预留区间）或最终上传（仅登记）。
    pub async fn new_upload(
        &self,
        path: &Path,
        size: u64,
        kind: UploadKind,
        perm: &Permissions,
    ) -> Result<InPlaceUpload, StoreError> {
        let mut state = self.state.lock().await;
        let mut upload = InPlaceUpload {
            id: Uuid::new_v4().simple().to_string(),
            path: path.to_path_buf(),
            kind,
            size,
            actual_offset: 0,
            written: 0,
        };
        if kind == UploadKind::Partial {
            upload.actual_offset = reserve_region(&mut state, path, size, perm).await?;
        }
        debug!(
            id = upload.id,
            path = %path.display(),
            offset = upload.actual_offset,
            size,
            "in-place upload created"
        );
        state.insert(upload.clone());
        Ok(upload)
    }

    pub async fn get_upload(&self, id: &str) -> Result<InPlaceUpload, StoreError> {
        let state = self.state.lock().await;
        state
            .by_id
            .get(id)
            .map(|record| record.upload.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// 将数据写入分段的预留区间，返回新的逻辑偏移。
    ///
    /// 超出预留大小的数据不会写入相邻区间，而是返回 [`StoreError::Exceeds`]。
    pub async fn write_chunk<R>(&self, id: &str, offset: u64, body: R) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        let _guard = self
            .part_locks
            .lock_path_with_timeout(id, PART_LOCK_TIMEOUT)
            .await
            .map_err(|_| StoreError::Busy(id.to_string()))?;
        let upload = self.begin_write(id, offset).await?;
        let result = copy_into_region(&upload, offset, body).await;
        self.end_write(id, result.as_ref().ok().map(|(written, _)| *written))
            .await;

        let (new_offset, overflow) = result?;
        if overflow {
            return Err(StoreError::Exceeds { size: upload.size });
        }
        Ok(new_offset)
    }

    async fn begin_write(&self, id: &str, offset: u64) -> Result<InPlaceUpload, StoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .by_id
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if record.upload.kind != UploadKind::Partial {
            return Err(StoreError::Forbidden(
                "final uploads do not accept data".into(),
            ));
        }
        if offset != record.upload.written {
            return Err(StoreError::OffsetMismatch {
                actual: record.upload.written,
            });
        }
        record.writing = true;
        record.touched = Instant::now();
        Ok(record.upload.clone())
    }

    async fn end_write(&self, id: &str, written: Option<u64>) {
        let mut state = self.state.lock().await;
        if let Some(record) = state.by_id.get_mut(id) {
            if let Some(written) = written {
                record.upload.written = written;
            }
            record.writing = false;
            record.touched = Instant::now();
        }
    }

    /// 合并分段：校验全部分段已完成且与最终上传指向同一文件，
    /// 随后移除分段与最终上传的记录，返回合并后的最终上传。
    pub async fn concat(
        &self,
        final_id: &str,
        parts: &[String],
    ) -> Result<InPlaceUpload, StoreError> {
        let mut state = self.state.lock().await;
        let mut target = state
            .by_id
            .get(final_id)
            .map(|record| record.upload.clone())
            .ok_or_else(|| StoreError::NotFound(final_id.to_string()))?;
        if target.kind != UploadKind::Final {
            return Err(StoreError::Mismatch);
        }

        let mut total = 0u64;
        for id in parts {
            let upload = state
                .by_id
                .get(id)
                .map(|record| &record.upload)
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            if upload.kind != UploadKind::Partial || upload.path != target.path {
                return Err(StoreError::Mismatch);
            }
            if !upload.is_complete() {
                return Err(StoreError::Incomplete(id.clone()));
            }
            total = total
                .checked_add(upload.size)
                .ok_or(StoreError::Exceeds { size: upload.size })?;
        }
        for id in parts {
            state.remove(id);
        }
        state.remove(final_id);

        target.size = total;
        target.written = total;
        info!(
            path = %target.path.display(),
            parts = parts.len(),
            bytes = total,
            "in-place upload concatenated"
        );
        Ok(target)
    }

    /// 清理空闲的分段锁条目。
    pub async fn prune_locks(&self) -> usize {
        self.part_locks.prune_idle().await
    }

    /// 丢弃所有记录都已空闲超过 TTL 的目标文件，返回丢弃的文件数。
    ///
    /// 删除文件时仍持有状态锁，新的预留不会落在正被删除的文件上。
    pub async fn prune_expired(&self) -> usize {
        let mut state = self.state.lock().await;
        let expired = state.expired_paths(self.ttl);
        for path in &expired {
            let dropped = state.drop_path(path);
            match fs::remove_file(path).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(path = %path.display(), "failed to remove abandoned upload: {err}"),
            }
            debug!(path = %path.display(), dropped, "expired in-place uploads");
        }
        expired.len()
    }

    /// 移除单条记录，未知 id 时返回 `None`。
    pub async fn finish(&self, id: &str) -> Option<InPlaceUpload> {
        self.state.lock().await.remove(id)
    }
}

/// 复制至多 `size - offset` 字节到预留区间；返回新偏移以及请求体是否还有剩余数据。
async fn copy_into_region<R>(
    upload: &InPlaceUpload,
    offset: u64,
    mut body: R,
) -> Result<(u64, bool), StoreError>
where
    R: AsyncRead + Unpin,
{
    let mut file = OpenOptions::new().write(true).open(&upload.path).await?;
    file.seek(SeekFrom::Start(upload.actual_offset + offset))
        .await?;
    let remaining = upload.size - offset;
    let copied = tokio::io::copy(&mut (&mut body).take(remaining), &mut file).await?;
    file.sync_all().await?;

    let overflow = copied == remaining && body.read(&mut [0u8; 1]).await? > 0;
    Ok((offset + copied, overflow))
}

/// 在目标文件末尾扩展 `size` 字节并返回扩展前的长度。
async fn reserve_region(
    state: &mut StoreState,
    path: &Path,
    size: u64,
    perm: &Permissions,
) -> Result<u64, StoreError> {
    let current = match fs::metadata(path).await {
        Ok(metadata) if metadata.is_dir() => {
            return Err(StoreError::Forbidden("cannot upload to a directory".into()));
        }
        Ok(metadata) => Some(metadata.len()),
        Err(err) if err.kind() == ErrorKind::NotFound => None,
        Err(err) => return Err(err.into()),
    };
    let exists = current.is_some();
    if !exists {
        let dropped = state.drop_path(path);
        if dropped > 0 {
            debug!(path = %path.display(), dropped, "dropped stale in-place uploads");
        }
    }
    let starts_new = !state.by_path.contains_key(path);

    if !perm.create {
        return Err(StoreError::Forbidden(
            "user is not allowed to create uploads".into(),
        ));
    }
    if starts_new && exists && !perm.modify {
        return Err(StoreError::Forbidden(
            "user is not allowed to modify existing files".into(),
        ));
    }

    // 先校验区间终点，避免截断或扩展文件之后才发现越界
    let base = if starts_new { 0 } else { current.unwrap_or(0) };
    base.checked_add(size)
        .filter(|end| *end <= MAX_FILE_LENGTH)
        .ok_or(StoreError::Exceeds { size })?;

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await?;
    if starts_new {
        file.set_len(0).await?;
    }
    let actual_offset = file.metadata().await?.len();
    let end = actual_offset
        .checked_add(size)
        .filter(|end| *end <= MAX_FILE_LENGTH)
        .ok_or(StoreError::Exceeds { size })?;
    file.set_len(end).await?;
    Ok(actual_offset)
}
