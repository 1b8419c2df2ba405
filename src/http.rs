//! HTTP 辅助工具：上传协议头、CORS、安全头与下载文件名。

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header};
use axum::{middleware, response::Response};
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use percent_encoding::{AsciiSet, CONTROLS, NON_ALPHANUMERIC, utf8_percent_encode};
use std::io;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::warn;

use crate::error::ApiError;

pub const TUS_RESUMABLE: HeaderName = HeaderName::from_static("tus-resumable");
pub const TUS_VERSION: HeaderName = HeaderName::from_static("tus-version");
pub const TUS_EXTENSION: HeaderName = HeaderName::from_static("tus-extension");
pub const UPLOAD_OFFSET: HeaderName = HeaderName::from_static("upload-offset");
pub const UPLOAD_LENGTH: HeaderName = HeaderName::from_static("upload-length");
pub const UPLOAD_CONCAT: HeaderName = HeaderName::from_static("upload-concat");

pub const TUS_PROTOCOL_VERSION: &str = "1.0.0";
pub const TUS_EXTENSIONS: &str = "creation,termination,concatenation";
/// 分片请求体必须使用的 Content-Type。
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

/// RFC 5987 `attr-char` 之外的字符全部转义。
const FILENAME_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// URL 路径中需要转义的字符（`/` 保留）。
const PATH_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// 构建 CORS Layer（支持逗号分隔的来源列表），并暴露上传协议头。
pub fn build_cors_layer(cors_origins: Option<&str>) -> Option<CorsLayer> {
    let origins = cors_origins?
        .split(',')
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "invalid cors origin");
                None
            }
        })
        .collect::<Vec<_>>();

    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(AllowMethods::mirror_request())
            .allow_headers(AllowHeaders::mirror_request())
            .expose_headers([
                header::LOCATION,
                header::CONTENT_DISPOSITION,
                TUS_RESUMABLE,
                TUS_VERSION,
                TUS_EXTENSION,
                UPLOAD_OFFSET,
                UPLOAD_LENGTH,
                UPLOAD_CONCAT,
            ])
            .allow_credentials(true),
    )
}

/// 读取非负整数请求头，缺失或格式错误时返回 `None`。
pub fn parse_u64_header(headers: &HeaderMap, name: &HeaderName) -> Option<u64> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}

pub fn header_u64(value: u64) -> HeaderValue {
    HeaderValue::from(value)
}

/// 生成 `attachment` 形式的 Content-Disposition。
pub fn attachment_disposition(file_name: &str) -> Result<HeaderValue, ApiError> {
    let encoded = utf8_percent_encode(file_name, FILENAME_ESCAPE);
    HeaderValue::from_str(&format!("attachment; filename*=utf-8''{encoded}"))
        .map_err(|_| ApiError::Internal("响应头构建失败".into()))
}

/// 拼接资源地址并转义为合法的 `Location` 头。
pub fn location_header(prefix: &str, path: &str) -> Result<HeaderValue, ApiError> {
    let encoded = utf8_percent_encode(path, PATH_ESCAPE);
    HeaderValue::from_str(&format!("{prefix}{encoded}"))
        .map_err(|_| ApiError::Internal("响应头构建失败".into()))
}

/// 将请求体适配为 `AsyncRead`，读取错误转换为 `io::Error`。
pub fn body_reader(body: AxumBody) -> impl AsyncRead + Unpin + Send {
    let stream = BodyExt::into_data_stream(body).map(|chunk| chunk.map_err(io::Error::other));
    StreamReader::new(stream)
}

/// 为上传协议响应附加 `Tus-Resumable` 头。
pub async fn add_tus_resumable(mut response: Response) -> Response {
    response.headers_mut().insert(
        TUS_RESUMABLE,
        HeaderValue::from_static(TUS_PROTOCOL_VERSION),
    );
    response
}

/// 添加基础安全响应头。
pub async fn add_security_headers(
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, StatusCode> {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_headers_only() {
        let mut headers = HeaderMap::new();
        headers.insert(UPLOAD_OFFSET, HeaderValue::from_static(" 42 "));
        headers.insert(UPLOAD_LENGTH, HeaderValue::from_static("-1"));
        assert_eq!(parse_u64_header(&headers, &UPLOAD_OFFSET), Some(42));
        assert_eq!(parse_u64_header(&headers, &UPLOAD_LENGTH), None);
        assert_eq!(parse_u64_header(&headers, &UPLOAD_CONCAT), None);
    }

    #[test]
    fn disposition_escapes_non_ascii_and_spaces() {
        let value = attachment_disposition("my files 文档.tar.gz").expect("header");
        assert_eq!(
            value.to_str().expect("ascii"),
            "attachment; filename*=utf-8''my%20files%20%E6%96%87%E6%A1%A3.tar.gz"
        );
    }

    #[test]
    fn location_keeps_slashes_and_escapes_the_rest() {
        let value = location_header("/api/tus", "/dir/a b#1/报告.txt").expect("header");
        assert_eq!(
            value.to_str().expect("ascii"),
            "/api/tus/dir/a%20b%231/%E6%8A%A5%E5%91%8A.txt"
        );
    }

    #[tokio::test]
    async fn body_reader_streams_request_bytes() {
        use tokio::io::AsyncReadExt;

        let mut reader = body_reader(AxumBody::from("chunk-data"));
        let mut buffer = Vec::new();
        reader.read_to_end(&mut buffer).await.expect("read body");
        assert_eq!(buffer, b"chunk-data");
    }

    #[test]
    fn cors_layer_requires_valid_origin() {
        assert!(build_cors_layer(None).is_none());
        assert!(build_cors_layer(Some(" , ")).is_none());
        assert!(build_cors_layer(Some("https://drive.example.com")).is_some());
    }
}
