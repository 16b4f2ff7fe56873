use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use axum_macros::debug_handler;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{OpenApi, ToSchema};

use super::{
    response::{ResponseError, ResponseResult},
    AppState,
};
use crate::{
    dedupe::{self, UploadRequest},
    download::{self, FileStream},
    meta::RequestFileByPath,
    Error,
};

#[derive(OpenApi)]
#[openapi(
    paths(upload_file_handler, download_file_handler, download_by_hash_handler),
    components(schemas(UploadFileParams, RequestFileByPath, DownloadByHashParams)),
    tags(
        (name = "files", description = "File upload and download API")
    )
)]
pub struct FileApi;

/// Query parameters of a file upload
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadFileParams {
    /// Owner of the file
    pub user: String,
    /// Directory the file is placed in
    pub target_dir: String,
    pub filename: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DownloadByHashParams {
    /// File hash
    pub hash: String,
}

/// Upload a file.
/// The file is split into blocks which are placed on the nodes chosen by the
/// metadata service, the response holds the file hash.
#[utoipa::path(
    post,
    path = "/dfs/file/upload",
    request_body(content = Vec<u8>, description = "File content", content_type = "application/octet-stream"),
    params(
        ("user" = String, Query, description = "Owner of the file"),
        ("targetDir" = String, Query, description = "Directory the file is placed in"),
        ("filename" = String, Query, description = "Name of the file")
    ),
    responses(
        (status = 200, description = "File uploaded", body = String),
        (status = 400, description = "Bad request"),
        (status = 500, description = "Internal server error"),
    )
)]
#[debug_handler]
pub async fn upload_file_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UploadFileParams>,
    body: Bytes,
) -> Result<ResponseResult, ResponseError> {
    if params.filename.trim().is_empty() {
        return Err(ResponseError::BadRequest("filename is required".into()));
    }

    let request = UploadRequest {
        user: params.user,
        target_dir: params.target_dir,
        filename: params.filename,
    };

    match dedupe::upload(&state.blocks, &body[..], &request).await {
        Ok(hash) => Ok(ResponseResult::FileUploaded(hash)),
        Err(err) => {
            log::error!("Failed to upload file {}: {}", request.filename, err);
            Err(ResponseError::InternalServerError)
        }
    }
}

/// names that are not plain ascii are sent in the RFC 5987 encoded form
fn content_disposition(name: &str) -> String {
    let plain = name
        .bytes()
        .all(|b| (b.is_ascii_graphic() && b != b'"' && b != b'\\') || b == b' ');
    if plain {
        format!("attachment; filename=\"{}\"", name)
    } else {
        format!(
            "attachment; filename*=UTF-8''{}",
            utf8_percent_encode(name, NON_ALPHANUMERIC)
        )
    }
}

fn stream_response(file: FileStream) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if let Ok(disposition) = HeaderValue::from_str(&content_disposition(&file.name)) {
        headers.insert(header::CONTENT_DISPOSITION, disposition);
    }
    if let Some(size) = file.size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }

    (StatusCode::OK, headers, Body::from_stream(file.stream))
}

/// Download a file by owner and path.
/// The file is rebuilt from its blocks while it is sent.
#[utoipa::path(
    post,
    path = "/dfs/file/download",
    request_body = RequestFileByPath,
    responses(
        (status = 200, description = "File content", content_type = "application/octet-stream"),
        (status = 404, description = "File not found"),
        (status = 500, description = "Internal server error"),
    )
)]
#[debug_handler]
pub async fn download_file_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RequestFileByPath>,
) -> Result<impl IntoResponse, ResponseError> {
    match download::download_file(state.blocks.clone(), &request).await {
        Ok(file) => Ok(stream_response(file)),
        Err(Error::NotFound(_)) => Err(ResponseError::NotFound(format!(
            "File '{}' of '{}' not found",
            request.file_path, request.username
        ))),
        Err(err) => {
            log::error!("Failed to download file {}: {}", request.file_path, err);
            Err(ResponseError::InternalServerError)
        }
    }
}

/// Download a file by its hash.
#[utoipa::path(
    get,
    path = "/dfs/file/downloadByHash",
    params(
        ("hash" = String, Query, description = "File hash")
    ),
    responses(
        (status = 200, description = "File content", content_type = "application/octet-stream"),
        (status = 204, description = "No blocks are known for this file"),
        (status = 500, description = "Internal server error"),
    )
)]
#[debug_handler]
pub async fn download_by_hash_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DownloadByHashParams>,
) -> Result<impl IntoResponse, ResponseError> {
    match download::download_by_hash(state.blocks.clone(), &params.hash).await {
        Ok(Some(file)) => Ok(stream_response(file)),
        Ok(None) => Err(ResponseError::NoContent),
        Err(err) => {
            log::error!("Failed to download file {}: {}", params.hash, err);
            Err(ResponseError::InternalServerError)
        }
    }
}
