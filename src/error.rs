//! 统一的 API 错误类型与转换。

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use serde::Serialize;
use std::io::ErrorKind;
use tracing::error;

use crate::archive::ArchiveError;
use crate::http::UPLOAD_OFFSET;
use crate::inplace::StoreError;
use crate::storage::StorageError;
use crate::upload::CacheError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    InvalidState(String),
    NotFound(String),
    Forbidden(String),
    /// 偏移冲突时携带服务端实际偏移。
    Conflict {
        message: String,
        offset: Option<u64>,
    },
    UnsupportedMedia(String),
    NotImplemented(String),
    /// 归档限制（大小、条目数、压缩率）超限。
    ResourceExceeded {
        code: &'static str,
        message: String,
    },
    /// 归档条目元数据非法（路径穿越、谎报大小等）。
    InvalidArchive {
        code: &'static str,
        message: String,
    },
    Unauthorized(HeaderMap),
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: &'a str,
}

impl ApiError {
    pub fn conflict(message: impl Into<String>) -> Self {
        ApiError::Conflict {
            message: message.into(),
            offset: None,
        }
    }

    pub fn offset_conflict(offset: u64) -> Self {
        ApiError::Conflict {
            message: format!("upload offset mismatch, current offset is {offset}"),
            offset: Some(offset),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) | ApiError::InvalidState(msg) => {
                (StatusCode::BAD_REQUEST, msg).into_response()
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            ApiError::Conflict { message, offset } => {
                let mut headers = HeaderMap::new();
                if let Some(offset) = offset
                    && let Ok(value) = HeaderValue::from_str(&offset.to_string())
                {
                    headers.insert(UPLOAD_OFFSET, value);
                }
                (StatusCode::CONFLICT, headers, message).into_response()
            }
            ApiError::UnsupportedMedia(msg) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, msg).into_response()
            }
            ApiError::NotImplemented(msg) => (StatusCode::NOT_IMPLEMENTED, msg).into_response(),
            ApiError::ResourceExceeded { code, message } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                JsonResponse(ErrorBody {
                    code,
                    message: &message,
                }),
            )
                .into_response(),
            ApiError::InvalidArchive { code, message } => (
                StatusCode::BAD_REQUEST,
                JsonResponse(ErrorBody {
                    code,
                    message: &message,
                }),
            )
                .into_response(),
            ApiError::Unauthorized(headers) => {
                (StatusCode::UNAUTHORIZED, headers, "unauthorized").into_response()
            }
            ApiError::Internal(msg) => {
                error!(error = msg, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response()
            }
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => ApiError::BadRequest("invalid path".into()),
            StorageError::Io(err) => match err.kind() {
                ErrorKind::NotFound => ApiError::NotFound(err.to_string()),
                ErrorKind::PermissionDenied => ApiError::Forbidden(err.to_string()),
                _ => ApiError::Internal(err.to_string()),
            },
        }
    }
}

impl From<CacheError> for ApiError {
    fn from(error: CacheError) -> Self {
        match error {
            CacheError::NotFound => ApiError::NotFound(error.to_string()),
            CacheError::Backend(_) | CacheError::Corrupt(_) => {
                ApiError::Internal(error.to_string())
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(_) => ApiError::NotFound(error.to_string()),
            StoreError::Forbidden(_) => ApiError::Forbidden(error.to_string()),
            StoreError::OffsetMismatch { actual } => ApiError::offset_conflict(actual),
            StoreError::Busy(_) => ApiError::conflict(error.to_string()),
            StoreError::Exceeds { .. } | StoreError::Incomplete(_) | StoreError::Mismatch => {
                ApiError::BadRequest(error.to_string())
            }
            StoreError::Io(_) => ApiError::Internal(error.to_string()),
        }
    }
}

impl From<ArchiveError> for ApiError {
    fn from(error: ArchiveError) -> Self {
        let message = error.to_string();
        let code = error.code();
        match error {
            ArchiveError::UnknownFormat(_) => ApiError::NotImplemented(message),
            ArchiveError::ArchiveTooLarge { .. }
            | ArchiveError::TooManyEntries { .. }
            | ArchiveError::TotalSizeTooLarge { .. }
            | ArchiveError::EntryTooLarge { .. }
            | ArchiveError::RatioTooLow { .. } => ApiError::ResourceExceeded { code, message },
            ArchiveError::InvalidEntry(_) | ArchiveError::InvalidEntryPath(_) => {
                ApiError::InvalidArchive { code, message }
            }
            ArchiveError::Corrupt(_) => ApiError::BadRequest(message),
            ArchiveError::Storage(err) => err.into(),
            ArchiveError::Io(err) => ApiError::Internal(err.to_string()),
        }
    }
}
