//! 归档引擎：打包下载与受限解压。

pub mod create;
pub mod extract;
pub mod format;
mod zipstream;

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path, Query};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use serde::Deserialize;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio_util::io::{ReaderStream, SyncIoBridge};
use tracing::{info, warn};

use crate::auth::Session;
use crate::error::ApiError;
use crate::http::attachment_disposition;
use crate::storage::{StorageError, clean_virtual_path, join_virtual};

pub use create::{collect_entries, write_archive};
pub use extract::{ExtractLimits, ExtractSummary, extract_archive};
pub use format::ArchiveFormat;

const ARCHIVE_PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("format not implemented: {0}")]
    UnknownFormat(String),
    #[error("archive is {size} bytes, exceeding the limit of {max} bytes")]
    ArchiveTooLarge { size: u64, max: u64 },
    #[error("archive has more than {max} entries")]
    TooManyEntries { max: usize },
    #[error("total uncompressed size exceeds the limit of {max} bytes")]
    TotalSizeTooLarge { max: u64 },
    #[error("entry `{name}` uncompresses to {size} bytes, exceeding the limit of {max} bytes")]
    EntryTooLarge { name: String, size: u64, max: u64 },
    #[error("entry `{name}` has compression ratio {ratio:.6}, below the minimum of {min}")]
    RatioTooLow { name: String, ratio: f64, min: f64 },
    #[error("invalid archive entry `{0}`")]
    InvalidEntry(String),
    #[error("invalid archive entry path `{0}`")]
    InvalidEntryPath(String),
    #[error("corrupt archive: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ArchiveError {
    /// 稳定的错误代码，便于客户端区分各类限制。
    pub fn code(&self) -> &'static str {
        match self {
            ArchiveError::UnknownFormat(_) => "format_not_implemented",
            ArchiveError::ArchiveTooLarge { .. } => "archive_too_large",
            ArchiveError::TooManyEntries { .. } => "too_many_entries",
            ArchiveError::TotalSizeTooLarge { .. } => "uncompressed_size_too_large",
            ArchiveError::EntryTooLarge { .. } => "entry_too_large",
            ArchiveError::RatioTooLow { .. } => "compression_ratio_too_low",
            ArchiveError::InvalidEntry(_) => "invalid_entry",
            ArchiveError::InvalidEntryPath(_) => "invalid_entry_path",
            ArchiveError::Corrupt(_) => "corrupt_archive",
            ArchiveError::Storage(_) => "storage_error",
            ArchiveError::Io(_) => "io_error",
        }
    }
}

impl From<zip::result::ZipError> for ArchiveError {
    fn from(error: zip::result::ZipError) -> Self {
        match error {
            zip::result::ZipError::Io(err) => ArchiveError::Io(err),
            other => ArchiveError::Corrupt(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub unzip_enabled: bool,
    pub limits: ExtractLimits,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ArchiveQuery {
    #[serde(default)]
    algo: String,
    #[serde(default)]
    files: String,
}

/// 打包下载目录（或其中的若干子路径）。
pub async fn download_archive(
    Extension(session): Extension<Session>,
    Path(path): Path<String>,
    Query(query): Query<ArchiveQuery>,
) -> Result<Response, ApiError> {
    archive_response(&session, &clean_virtual_path(&path), &query).await
}

/// 打包下载作用域根目录。
pub async fn download_root_archive(
    Extension(session): Extension<Session>,
    Query(query): Query<ArchiveQuery>,
) -> Result<Response, ApiError> {
    archive_response(&session, "/", &query).await
}

async fn archive_response(
    session: &Session,
    base: &str,
    query: &ArchiveQuery,
) -> Result<Response, ApiError> {
    if !session.user.perm.download || !session.check(base) {
        return Err(ApiError::Forbidden(format!("download of {base} denied")));
    }
    let format = ArchiveFormat::from_query(&query.algo)?;
    let real = session.storage.resolve_path_checked(base, false).await?;
    let is_dir = fs::metadata(&real)
        .await
        .map_err(StorageError::from)?
        .is_dir();

    let mut selections = query
        .files
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| join_virtual(base, name))
        .collect::<Vec<_>>();
    if selections.is_empty() || !is_dir {
        selections = vec![base.to_string()];
    }

    let collected = collect_entries(session, &selections).await?;
    let file_name = format!("{}{}", collected.name, format.extension());
    info!(
        user = session.user.username,
        base,
        entries = collected.entries.len(),
        archive = file_name,
        "streaming archive"
    );

    let disposition = attachment_disposition(&file_name)?;
    let (reader, writer) = tokio::io::duplex(ARCHIVE_PIPE_CAPACITY);
    let entries = collected.entries;
    tokio::task::spawn_blocking(move || {
        let bridge = SyncIoBridge::new(writer);
        match write_archive(format, &entries, bridge) {
            Ok(mut bridge) => {
                if let Err(err) = bridge.shutdown() {
                    warn!(error = %err, "failed to close archive stream");
                }
            }
            Err(err) => warn!(error = %err, "archive stream aborted"),
        }
    });

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_DISPOSITION, disposition),
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            ),
        ],
        AxumBody::from_stream(ReaderStream::new(reader)),
    )
        .into_response())
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct UnzipQuery {
    #[serde(default)]
    destination: Option<String>,
    #[serde(default, rename = "override")]
    overwrite: bool,
}

/// 将存储中的归档解压到目标目录。
pub async fn unzip(
    Extension(session): Extension<Session>,
    Extension(config): Extension<Arc<ArchiveConfig>>,
    Path(path): Path<String>,
    Query(query): Query<UnzipQuery>,
) -> Result<JsonResponse<ExtractSummary>, ApiError> {
    let source = clean_virtual_path(&path);
    let destination = match query.destination.as_deref() {
        Some(destination) if !destination.trim().is_empty() => clean_virtual_path(destination),
        _ => parent_virtual(&source),
    };
    if !config.unzip_enabled
        || !session.user.perm.create
        || !session.check(&source)
        || !session.check(&destination)
    {
        return Err(ApiError::Forbidden("unzip is not permitted".into()));
    }

    let real = session.storage.resolve_path_checked(&source, false).await?;
    let metadata = fs::metadata(&real).await.map_err(StorageError::from)?;
    if metadata.is_dir() {
        return Err(ApiError::InvalidState(format!("{source} is a directory")));
    }
    let format = ArchiveFormat::from_file_name(&source)
        .ok_or_else(|| ArchiveError::UnknownFormat(source.clone()))?;

    let summary = extract_archive(
        &session,
        &real,
        format,
        &destination,
        query.overwrite,
        &config.limits,
    )
    .await?;
    info!(
        user = session.user.username,
        source,
        destination,
        files = summary.files,
        directories = summary.directories,
        skipped = summary.skipped,
        "archive extracted"
    );
    Ok(JsonResponse(summary))
}

pub(crate) fn parent_virtual(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(index) => path[..index].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Rule;
    use crate::storage::Storage;
    use crate::users::{Permissions, Settings, User};
    use std::io::{Cursor, Read};
    use tempfile::tempdir;

    fn session_for(root: &std::path::Path, perm: Permissions, rules: Vec<Rule>) -> Session {
        let user = Arc::new(User {
            username: "tester".into(),
            password: "pw".into(),
            scope: String::new(),
            perm,
            rules,
            hide_dotfiles: false,
        });
        Session::new(
            user,
            Arc::new(Settings::default()),
            Storage::new(root.to_path_buf()),
        )
    }

    fn zip_names(bytes: &[u8]) -> Vec<String> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).expect("open zip");
        let mut names = (0..archive.len())
            .map(|index| {
                archive
                    .by_index(index)
                    .expect("entry")
                    .name()
                    .to_string()
            })
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    #[tokio::test]
    async fn zip_download_contains_only_permitted_files() {
        let temp = tempdir().expect("tempdir");
        let docs = temp.path().join("docs");
        std::fs::create_dir_all(&docs).expect("mkdir");
        std::fs::write(docs.join("public.txt"), b"hello").expect("write");
        std::fs::write(docs.join("secret.txt"), b"classified").expect("write");
        let session = session_for(
            temp.path(),
            Permissions::all(),
            vec![Rule::prefix("/docs/secret", false)],
        );

        let response = download_archive(
            Extension(session),
            Path("docs".to_string()),
            Query(ArchiveQuery::default()),
        )
        .await
        .unwrap_or_else(|_| panic!("archive response"));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_DISPOSITION),
            Some(&HeaderValue::from_static(
                "attachment; filename*=utf-8''docs.zip"
            ))
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        assert_eq!(zip_names(&body), vec!["public.txt".to_string()]);

        let mut archive = zip::ZipArchive::new(Cursor::new(body.to_vec())).expect("zip");
        let mut content = String::new();
        archive
            .by_name("public.txt")
            .expect("entry")
            .read_to_string(&mut content)
            .expect("read");
        assert_eq!(content, "hello");
    }

    #[tokio::test]
    async fn selected_files_share_an_underscored_name() {
        let temp = tempdir().expect("tempdir");
        let photos = temp.path().join("photos");
        std::fs::create_dir_all(photos.join("2020")).expect("mkdir");
        std::fs::write(photos.join("2020/a.jpg"), b"a").expect("write");
        std::fs::write(photos.join("b.jpg"), b"b").expect("write");
        let session = session_for(temp.path(), Permissions::all(), Vec::new());

        let response = download_archive(
            Extension(session),
            Path("photos".to_string()),
            Query(ArchiveQuery {
                algo: "targz".into(),
                files: "2020,b.jpg".into(),
            }),
        )
        .await
        .unwrap_or_else(|_| panic!("archive response"));
        assert_eq!(
            response.headers().get(header::CONTENT_DISPOSITION),
            Some(&HeaderValue::from_static(
                "attachment; filename*=utf-8''_photos.tar.gz"
            ))
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let mut archive = tar::Archive::new(format::Decompressor::new(
            ArchiveFormat::TarGz,
            Cursor::new(body.to_vec()),
        ));
        let mut names = archive
            .entries()
            .expect("entries")
            .map(|entry| {
                entry
                    .expect("entry")
                    .path()
                    .expect("path")
                    .to_string_lossy()
                    .trim_end_matches('/')
                    .to_string()
            })
            .collect::<Vec<_>>();
        names.sort();
        assert_eq!(names, vec!["2020", "2020/a.jpg", "b.jpg"]);
    }

    #[tokio::test]
    async fn unknown_format_and_missing_permission_are_rejected() {
        let temp = tempdir().expect("tempdir");
        let session = session_for(temp.path(), Permissions::all(), Vec::new());
        let result = download_root_archive(
            Extension(session),
            Query(ArchiveQuery {
                algo: "rar".into(),
                files: String::new(),
            }),
        )
        .await;
        assert!(matches!(result, Err(ApiError::NotImplemented(_))));

        let no_download = session_for(
            temp.path(),
            Permissions {
                create: true,
                modify: true,
                download: false,
            },
            Vec::new(),
        );
        let result =
            download_root_archive(Extension(no_download), Query(ArchiveQuery::default())).await;
        assert!(matches!(result, Err(ApiError::Forbidden(_))));
    }

    fn archive_config(enabled: bool) -> Arc<ArchiveConfig> {
        Arc::new(ArchiveConfig {
            unzip_enabled: enabled,
            limits: ExtractLimits::default(),
        })
    }

    fn write_zip(path: &std::path::Path, files: &[(&str, &[u8])]) {
        use std::io::Write;

        let file = std::fs::File::create(path).expect("create zip");
        let mut writer = zip::ZipWriter::new(file);
        for (name, data) in files {
            writer
                .start_file(*name, zip::write::FileOptions::default())
                .expect("start file");
            writer.write_all(data).expect("write entry");
        }
        writer.finish().expect("finish zip");
    }

    #[tokio::test]
    async fn unzip_requires_feature_flag() {
        let temp = tempdir().expect("tempdir");
        write_zip(&temp.path().join("a.zip"), &[("x.txt", b"x")]);
        let session = session_for(temp.path(), Permissions::all(), Vec::new());

        let result = unzip(
            Extension(session),
            Extension(archive_config(false)),
            Path("a.zip".to_string()),
            Query(UnzipQuery::default()),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Forbidden(_))));
        assert!(!temp.path().join("x.txt").exists());
    }

    #[tokio::test]
    async fn unzip_extracts_next_to_the_archive_by_default() {
        let temp = tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join("in")).expect("mkdir");
        write_zip(
            &temp.path().join("in/bundle.zip"),
            &[("readme.md", b"# hi"), ("src/main.rs", b"fn main() {}")],
        );
        let session = session_for(temp.path(), Permissions::all(), Vec::new());

        let JsonResponse(summary) = unzip(
            Extension(session.clone()),
            Extension(archive_config(true)),
            Path("in/bundle.zip".to_string()),
            Query(UnzipQuery::default()),
        )
        .await
        .unwrap_or_else(|_| panic!("unzip"));
        assert_eq!(summary.files, 2);
        assert_eq!(
            std::fs::read(temp.path().join("in/src/main.rs")).expect("read"),
            b"fn main() {}"
        );

        let result = unzip(
            Extension(session),
            Extension(archive_config(true)),
            Path("in/readme.md".to_string()),
            Query(UnzipQuery {
                destination: Some("/out".into()),
                overwrite: false,
            }),
        )
        .await;
        assert!(matches!(result, Err(ApiError::NotImplemented(_))));
    }

    #[tokio::test]
    async fn oversized_archive_reports_resource_exceeded() {
        let temp = tempdir().expect("tempdir");
        write_zip(&temp.path().join("big.zip"), &[("x.bin", &[7u8; 4096])]);
        let session = session_for(temp.path(), Permissions::all(), Vec::new());
        let config = Arc::new(ArchiveConfig {
            unzip_enabled: true,
            limits: ExtractLimits {
                max_archive_size: 100,
                ..ExtractLimits::default()
            },
        });

        let result = unzip(
            Extension(session),
            Extension(config),
            Path("big.zip".to_string()),
            Query(UnzipQuery::default()),
        )
        .await;
        let response = match result {
            Err(err) => err.into_response(),
            Ok(_) => panic!("oversized archive accepted"),
        };
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["code"], "archive_too_large");
    }

    #[test]
    fn parent_of_virtual_paths() {
        assert_eq!(parent_virtual("/a.zip"), "/");
        assert_eq!(parent_virtual("/in/deep/a.zip"), "/in/deep");
    }
}
