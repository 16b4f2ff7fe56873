use axum::{
    body::Body,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub enum ResponseError {
    InternalServerError,
    NotFound(String),
    BadRequest(String),
    /// the requested content does not exist on this node
    NoContent,
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response<Body> {
        match self {
            ResponseError::InternalServerError => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
            ResponseError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ResponseError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ResponseError::NoContent => StatusCode::NO_CONTENT.into_response(),
        }
    }
}

/// Reference count left after a logical delete.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeleted {
    pub hash: String,
    /// None if the block was unknown or already unreferenced
    pub reference_count: Option<u32>,
}

pub enum ResponseResult {
    Health,
    BlockStored(String),
    BlockDeleted(BlockDeleted),
    BlockReplicated(String),
    FilesCleared,
    FileUploaded(String),
}

impl IntoResponse for ResponseResult {
    fn into_response(self) -> Response<Body> {
        match self {
            ResponseResult::Health => (
                StatusCode::OK,
                Json(serde_json::json!({"msg": "dfs node is working"})),
            )
                .into_response(),
            ResponseResult::BlockStored(hash) => (StatusCode::CREATED, hash).into_response(),
            ResponseResult::BlockDeleted(deleted) => {
                (StatusCode::OK, Json(deleted)).into_response()
            }
            ResponseResult::BlockReplicated(msg) => (StatusCode::OK, msg).into_response(),
            ResponseResult::FilesCleared => {
                (StatusCode::OK, "All block files are removed").into_response()
            }
            ResponseResult::FileUploaded(hash) => (StatusCode::OK, hash).into_response(),
        }
    }
}
