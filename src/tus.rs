//! 可续传上传协议处理器：创建、状态、追加分片、终止与分段合并。
//!
//! 普通上传直接写入目标文件，会话登记表记录预期总长度；
//! 分段上传（`Upload-Concat`）交由 [`InPlaceStore`] 管理各自的预留区间。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path, Query};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::io::{self, ErrorKind, SeekFrom};
use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncSeekExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, warn};

use crate::auth::Session;
use crate::error::ApiError;
use crate::http::{
    OFFSET_OCTET_STREAM, TUS_EXTENSION, TUS_EXTENSIONS, TUS_PROTOCOL_VERSION, TUS_VERSION,
    UPLOAD_CONCAT, UPLOAD_LENGTH, UPLOAD_OFFSET, body_reader, header_u64, location_header,
    parse_u64_header,
};
use crate::inplace::{InPlaceStore, InPlaceUpload, MAX_FILE_LENGTH, UploadKind};
use crate::locking::LockManager;
use crate::storage::{StorageError, clean_virtual_path};
use crate::upload::{CacheError, UploadCache};

pub const TUS_PREFIX: &str = "/api/tus";
pub const PARTS_PREFIX: &str = "/api/tus-parts/";

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(2);
const APPEND_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Deserialize)]
pub(crate) struct TusQuery {
    #[serde(default, rename = "override")]
    overwrite: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum ConcatRequest {
    Single,
    Partial,
    Final(Vec<String>),
}

fn parse_concat(headers: &HeaderMap) -> Result<ConcatRequest, ApiError> {
    let Some(value) = headers.get(UPLOAD_CONCAT) else {
        return Ok(ConcatRequest::Single);
    };
    let value = value
        .to_str()
        .map_err(|_| ApiError::BadRequest("invalid Upload-Concat header".into()))?
        .trim();
    if value == "partial" {
        return Ok(ConcatRequest::Partial);
    }
    let Some(locations) = value.strip_prefix("final;") else {
        return Err(ApiError::BadRequest("invalid Upload-Concat header".into()));
    };
    let ids = locations
        .split_whitespace()
        .map(|location| match location.rfind(PARTS_PREFIX) {
            Some(index) => location[index + PARTS_PREFIX.len()..].trim_matches('/'),
            None => location.trim_matches('/'),
        })
        .map(str::to_string)
        .collect::<Vec<_>>();
    if ids.is_empty() || ids.iter().any(|id| id.is_empty() || id.contains('/')) {
        return Err(ApiError::BadRequest(
            "Upload-Concat final needs partial upload locations".into(),
        ));
    }
    Ok(ConcatRequest::Final(ids))
}

fn require_chunk_content_type(headers: &HeaderMap) -> Result<(), ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    if content_type != Some(OFFSET_OCTET_STREAM) {
        return Err(ApiError::UnsupportedMedia(format!(
            "Content-Type must be {OFFSET_OCTET_STREAM}"
        )));
    }
    Ok(())
}

fn require_offset(headers: &HeaderMap) -> Result<u64, ApiError> {
    parse_u64_header(headers, &UPLOAD_OFFSET)
        .ok_or_else(|| ApiError::BadRequest("invalid upload offset".into()))
}

fn require_length(headers: &HeaderMap) -> Result<u64, ApiError> {
    parse_u64_header(headers, &UPLOAD_LENGTH)
        .filter(|length| *length <= MAX_FILE_LENGTH)
        .ok_or_else(|| ApiError::BadRequest("invalid upload length".into()))
}

/// 登记表键：目标文件的真实路径。
fn session_key(real: &FsPath) -> String {
    real.to_string_lossy().into_owned()
}

fn no_store(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

async fn ensure_parent(real: &FsPath) -> Result<(), ApiError> {
    if let Some(parent) = real.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(StorageError::from)?;
    }
    Ok(())
}

/// 传输期间定时刷新会话，防止慢速分片在复制中途过期。
struct KeepAlive(JoinHandle<()>);

impl KeepAlive {
    fn start(cache: Arc<dyn UploadCache>, key: String) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + KEEP_ALIVE_INTERVAL, KEEP_ALIVE_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(err) = cache.touch(&key).await {
                    warn!(path = key, error = %err, "failed to keep upload session alive");
                }
            }
        });
        Self(task)
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// 创建上传；根据 `Upload-Concat` 分派为普通、分段或最终合并。
pub async fn tus_create(
    Extension(session): Extension<Session>,
    Extension(cache): Extension<Arc<dyn UploadCache>>,
    Extension(store): Extension<Arc<InPlaceStore>>,
    Path(path): Path<String>,
    Query(query): Query<TusQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let virtual_path = clean_virtual_path(&path);
    session.require_create(&virtual_path)?;

    match parse_concat(&headers)? {
        ConcatRequest::Single => {
            create_upload(&session, cache.as_ref(), &virtual_path, query.overwrite, &headers).await
        }
        ConcatRequest::Partial => create_partial(&session, &store, &virtual_path, &headers).await,
        ConcatRequest::Final(parts) => create_final(&session, &store, &virtual_path, &parts).await,
    }
}

async fn create_upload(
    session: &Session,
    cache: &dyn UploadCache,
    virtual_path: &str,
    overwrite: bool,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let length = require_length(headers)?;
    let real = session
        .storage
        .resolve_path_checked(virtual_path, true)
        .await?;

    match session.storage.stat(&real).await? {
        Some(metadata) if metadata.is_dir() => {
            return Err(ApiError::InvalidState(format!(
                "cannot upload to a directory {virtual_path}"
            )));
        }
        Some(_) => {
            if !overwrite {
                return Err(ApiError::conflict(format!("{virtual_path} already exists")));
            }
            if !session.user.perm.modify {
                return Err(ApiError::Forbidden(format!(
                    "modifying {virtual_path} is not permitted"
                )));
            }
        }
        None => ensure_parent(&real).await?,
    }

    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&real)
        .await
        .map_err(StorageError::from)?;

    cache.register(&session_key(&real), length).await?;
    info!(
        user = session.user.username,
        path = virtual_path,
        length,
        "upload created"
    );

    let location = location_header(TUS_PREFIX, virtual_path)?;
    Ok((StatusCode::CREATED, [(header::LOCATION, location)]).into_response())
}

async fn create_partial(
    session: &Session,
    store: &InPlaceStore,
    virtual_path: &str,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let length = require_length(headers)?;
    let real = session
        .storage
        .resolve_path_checked(virtual_path, true)
        .await?;
    ensure_parent(&real).await?;

    let upload = store
        .new_upload(&real, length, UploadKind::Partial, &session.user.perm)
        .await?;
    info!(
        user = session.user.username,
        path = virtual_path,
        id = upload.id,
        offset = upload.actual_offset,
        length,
        "partial upload created"
    );

    let location = location_header(PARTS_PREFIX, &upload.id)?;
    Ok((StatusCode::CREATED, [(header::LOCATION, location)]).into_response())
}

async fn create_final(
    session: &Session,
    store: &InPlaceStore,
    virtual_path: &str,
    parts: &[String],
) -> Result<Response, ApiError> {
    let real = session
        .storage
        .resolve_path_checked(virtual_path, true)
        .await?;
    let target = store
        .new_upload(&real, 0, UploadKind::Final, &session.user.perm)
        .await?;
    let joined = match store.concat(&target.id, parts).await {
        Ok(joined) => joined,
        Err(err) => {
            store.finish(&target.id).await;
            return Err(err.into());
        }
    };
    info!(
        user = session.user.username,
        path = virtual_path,
        parts = parts.len(),
        length = joined.size,
        "concatenated upload completed"
    );

    let location = location_header(PARTS_PREFIX, &joined.id)?;
    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, location),
            (UPLOAD_LENGTH, header_u64(joined.size)),
        ],
    )
        .into_response())
}

/// 查询上传进度：`Upload-Offset` 为当前文件大小，`Upload-Length` 来自登记表。
pub async fn tus_status(
    Extension(session): Extension<Session>,
    Extension(cache): Extension<Arc<dyn UploadCache>>,
    Path(path): Path<String>,
) -> Response {
    let response = upload_status(&session, cache.as_ref(), &clean_virtual_path(&path))
        .await
        .unwrap_or_else(IntoResponse::into_response);
    no_store(response)
}

async fn upload_status(
    session: &Session,
    cache: &dyn UploadCache,
    virtual_path: &str,
) -> Result<Response, ApiError> {
    // 只需规则允许
    if !session.check(virtual_path) {
        return Err(ApiError::Forbidden(format!(
            "access to {virtual_path} denied"
        )));
    }
    let real = session
        .storage
        .resolve_path_checked(virtual_path, true)
        .await?;
    let metadata = session
        .storage
        .stat(&real)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("{virtual_path} not found")))?;
    if metadata.is_dir() {
        return Err(ApiError::InvalidState(format!(
            "{virtual_path} is a directory"
        )));
    }
    let length = cache.get_length(&session_key(&real)).await?;

    Ok((
        StatusCode::OK,
        [
            (UPLOAD_OFFSET, header_u64(metadata.len())),
            (UPLOAD_LENGTH, header_u64(length)),
        ],
    )
        .into_response())
}

/// 追加分片：偏移必须与当前文件大小完全一致，否则返回冲突且不写入。
pub async fn tus_append(
    Extension(session): Extension<Session>,
    Extension(cache): Extension<Arc<dyn UploadCache>>,
    Extension(locks): Extension<Arc<LockManager>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: AxumBody,
) -> Result<Response, ApiError> {
    let virtual_path = clean_virtual_path(&path);
    session.require_create(&virtual_path)?;
    require_chunk_content_type(&headers)?;
    let offset = require_offset(&headers)?;

    let real = session
        .storage
        .resolve_path_checked(&virtual_path, true)
        .await?;
    let metadata = session
        .storage
        .stat(&real)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("{virtual_path} not found")))?;
    if metadata.is_dir() {
        return Err(ApiError::InvalidState(format!(
            "cannot upload to a directory {virtual_path}"
        )));
    }

    let key = session_key(&real);
    let _guard = locks
        .lock_path_with_timeout(&key, APPEND_LOCK_TIMEOUT)
        .await
        .map_err(|_| ApiError::conflict(format!("{virtual_path} is being written")))?;
    // 持锁后再读登记表，上一个写入者可能刚刚完成了会话
    let length = match cache.get_length(&key).await {
        Ok(length) => length,
        Err(CacheError::NotFound) => {
            return Err(ApiError::Forbidden(format!(
                "no active upload for {virtual_path}"
            )));
        }
        Err(err) => return Err(err.into()),
    };
    let current = fs::metadata(&real)
        .await
        .map_err(StorageError::from)?
        .len();
    if current != offset {
        debug!(path = virtual_path, offset, current, "stale upload offset");
        return Err(ApiError::offset_conflict(current));
    }

    let keep_alive = KeepAlive::start(cache.clone(), key.clone());
    let written = write_at(&real, offset, body)
        .await
        .map_err(|err| ApiError::Internal(format!("could not write to file: {err}")))?;
    drop(keep_alive);

    let new_offset = offset + written;
    if let Err(err) = cache.touch(&key).await {
        warn!(path = virtual_path, error = %err, "failed to refresh upload session");
    }
    if new_offset >= length {
        if let Err(err) = cache.complete(&key).await {
            warn!(path = virtual_path, error = %err, "failed to complete upload session");
        }
        info!(
            user = session.user.username,
            path = virtual_path,
            length,
            "upload completed"
        );
    } else {
        debug!(path = virtual_path, offset = new_offset, bytes = written, "chunk stored");
    }

    Ok((
        StatusCode::NO_CONTENT,
        [(UPLOAD_OFFSET, header_u64(new_offset))],
    )
        .into_response())
}

/// 从 `offset` 处写入请求体并落盘，返回写入字节数。
async fn write_at(path: &FsPath, offset: u64, body: AxumBody) -> io::Result<u64> {
    let mut file = OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut reader = body_reader(body);
    let written = tokio::io::copy(&mut reader, &mut file).await?;
    file.sync_all().await?;
    Ok(written)
}

/// 终止上传：删除未完成文件并移除会话。
pub async fn tus_delete(
    Extension(session): Extension<Session>,
    Extension(cache): Extension<Arc<dyn UploadCache>>,
    Path(path): Path<String>,
) -> Result<StatusCode, ApiError> {
    let virtual_path = clean_virtual_path(&path);
    if virtual_path == "/" {
        return Err(ApiError::Forbidden("cannot terminate the root".into()));
    }
    session.require_create(&virtual_path)?;
    let real = session
        .storage
        .resolve_path_checked(&virtual_path, true)
        .await?;
    let key = session_key(&real);
    cache.get_length(&key).await?;

    match fs::remove_file(&real).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(StorageError::from(err).into()),
    }
    cache.complete(&key).await?;
    info!(
        user = session.user.username,
        path = virtual_path,
        "upload terminated"
    );
    Ok(StatusCode::NO_CONTENT)
}

/// 协议能力发现。
pub async fn tus_options() -> impl IntoResponse {
    (
        StatusCode::NO_CONTENT,
        [
            (TUS_VERSION, HeaderValue::from_static(TUS_PROTOCOL_VERSION)),
            (TUS_EXTENSION, HeaderValue::from_static(TUS_EXTENSIONS)),
        ],
    )
}

/// 查找属于当前用户作用域且规则允许的分段。
async fn owned_part(
    session: &Session,
    store: &InPlaceStore,
    id: &str,
) -> Result<InPlaceUpload, ApiError> {
    let upload = store.get_upload(id).await?;
    let virtual_path = session
        .storage
        .virtual_path(&upload.path)
        .ok_or_else(|| ApiError::NotFound(format!("upload `{id}` not found")))?;
    session.require_create(&virtual_path)?;
    Ok(upload)
}

pub async fn part_status(
    Extension(session): Extension<Session>,
    Extension(store): Extension<Arc<InPlaceStore>>,
    Path(id): Path<String>,
) -> Response {
    let response = match owned_part(&session, &store, &id).await {
        Ok(upload) => (
            StatusCode::OK,
            [
                (UPLOAD_OFFSET, header_u64(upload.written)),
                (UPLOAD_LENGTH, header_u64(upload.size)),
                (UPLOAD_CONCAT, HeaderValue::from_static("partial")),
            ],
        )
            .into_response(),
        Err(err) => err.into_response(),
    };
    no_store(response)
}

pub async fn part_append(
    Extension(session): Extension<Session>,
    Extension(store): Extension<Arc<InPlaceStore>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: AxumBody,
) -> Result<Response, ApiError> {
    require_chunk_content_type(&headers)?;
    let offset = require_offset(&headers)?;
    owned_part(&session, &store, &id).await?;

    let new_offset = store.write_chunk(&id, offset, body_reader(body)).await?;
    debug!(id, offset = new_offset, "partial chunk stored");
    Ok((
        StatusCode::NO_CONTENT,
        [(UPLOAD_OFFSET, header_u64(new_offset))],
    )
        .into_response())
}
