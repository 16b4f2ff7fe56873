use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use axum_macros::debug_handler;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{OpenApi, ToSchema};

use super::{
    response::{BlockDeleted, ResponseError, ResponseResult},
    AppState,
};
use crate::{hash::is_valid_hash, meta::DfsNode, Error};

#[derive(OpenApi)]
#[openapi(
    paths(
        ping_handler,
        store_block_handler,
        read_block_handler,
        delete_block_handler,
        replicate_block_handler,
        clear_files_handler
    ),
    components(schemas(StoreBlockParams, RequestReplicateBlock, DfsNode, BlockDeleted)),
    tags(
        (name = "blocks", description = "Block storage API")
    )
)]
pub struct BlockApi;

/// Query parameters for storing a block
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StoreBlockParams {
    /// Hash of the block content
    pub hash: String,
}

/// Ask this node to push one of its blocks to another node
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestReplicateBlock {
    pub block_hash: String,
    pub target_node: DfsNode,
}

#[utoipa::path(
    get,
    path = "/dfs/ping",
    responses(
        (status = 200, description = "Node is alive"),
    )
)]
#[debug_handler]
pub async fn ping_handler() -> ResponseResult {
    ResponseResult::Health
}

/// Store a block on this node.
/// Storing a block that is already present increases its reference count.
#[utoipa::path(
    post,
    path = "/dfs/block/store",
    request_body(content = Vec<u8>, description = "Block data to store", content_type = "application/octet-stream"),
    params(
        ("hash" = String, Query, description = "Hash of the block content")
    ),
    responses(
        (status = 201, description = "Block stored", body = String),
        (status = 400, description = "Invalid block hash or content not matching it"),
        (status = 500, description = "Internal server error"),
    )
)]
#[debug_handler]
pub async fn store_block_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StoreBlockParams>,
    body: Bytes,
) -> Result<ResponseResult, ResponseError> {
    if !is_valid_hash(&params.hash) {
        return Err(ResponseError::BadRequest(format!(
            "invalid block hash '{}'",
            params.hash
        )));
    }

    match state.blocks.store_block_locally(&params.hash, &body).await {
        Ok(_) => Ok(ResponseResult::BlockStored(params.hash)),
        Err(Error::HashMismatch(_)) => Err(ResponseError::BadRequest(format!(
            "content does not match block hash '{}'",
            params.hash
        ))),
        Err(err) => {
            log::error!("Failed to store block {}: {}", params.hash, err);
            Err(ResponseError::InternalServerError)
        }
    }
}

/// Read a block stored on this node.
#[utoipa::path(
    get,
    path = "/dfs/block/read/{hash}",
    responses(
        (status = 200, description = "Block found", content_type = "application/octet-stream"),
        (status = 204, description = "Block is not stored on this node"),
        (status = 400, description = "Invalid block hash"),
        (status = 500, description = "Internal server error"),
    ),
    params(
        ("hash" = String, Path, description = "Block hash")
    )
)]
#[debug_handler]
pub async fn read_block_handler(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> Result<impl IntoResponse, ResponseError> {
    match state.blocks.read_block(&hash).await {
        Ok(data) => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            Bytes::from(data),
        )),
        Err(Error::NotFound(_)) => Err(ResponseError::NoContent),
        Err(Error::InvalidHash(_)) => Err(ResponseError::BadRequest(format!(
            "invalid block hash '{}'",
            hash
        ))),
        Err(err) => {
            log::error!("Failed to read block {}: {}", hash, err);
            Err(ResponseError::InternalServerError)
        }
    }
}

/// Drop one reference to a block stored on this node.
#[utoipa::path(
    delete,
    path = "/dfs/block/delete/{hash}",
    responses(
        (status = 200, description = "Reference dropped", body = BlockDeleted),
        (status = 400, description = "Invalid block hash"),
        (status = 500, description = "Internal server error"),
    ),
    params(
        ("hash" = String, Path, description = "Block hash")
    )
)]
#[debug_handler]
pub async fn delete_block_handler(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> Result<ResponseResult, ResponseError> {
    match state.blocks.delete_block(&hash).await {
        Ok(reference_count) => Ok(ResponseResult::BlockDeleted(BlockDeleted {
            hash,
            reference_count,
        })),
        Err(Error::InvalidHash(_)) => Err(ResponseError::BadRequest(format!(
            "invalid block hash '{}'",
            hash
        ))),
        Err(err) => {
            log::error!("Failed to delete block {}: {}", hash, err);
            Err(ResponseError::InternalServerError)
        }
    }
}

/// Push a block held by this node to another node.
#[utoipa::path(
    post,
    path = "/dfs/block/replicate-to-another-node",
    request_body = RequestReplicateBlock,
    responses(
        (status = 200, description = "Block replicated", body = String),
        (status = 204, description = "Block is not stored on this node"),
        (status = 500, description = "Internal server error"),
    )
)]
#[debug_handler]
pub async fn replicate_block_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RequestReplicateBlock>,
) -> Result<ResponseResult, ResponseError> {
    match state
        .blocks
        .replicate_to_node(&request.block_hash, &request.target_node)
        .await
    {
        Ok(true) => Ok(ResponseResult::BlockReplicated(format!(
            "Block {} replicated to {}",
            request.block_hash, request.target_node.container_url
        ))),
        Ok(false) => Err(ResponseError::NoContent),
        Err(err) => {
            log::error!(
                "Failed to replicate block {} to {}: {}",
                request.block_hash,
                request.target_node.container_url,
                err
            );
            Err(ResponseError::InternalServerError)
        }
    }
}

/// Remove every block stored on this node.
#[utoipa::path(
    delete,
    path = "/dfs/block/clear-files",
    responses(
        (status = 200, description = "Block files removed"),
        (status = 500, description = "Internal server error"),
    )
)]
#[debug_handler]
pub async fn clear_files_handler(
    State(state): State<Arc<AppState>>,
) -> Result<ResponseResult, ResponseError> {
    match state.blocks.clear_block_files().await {
        Ok(_) => Ok(ResponseResult::FilesCleared),
        Err(err) => {
            log::error!("Failed to clear block files: {}", err);
            Err(ResponseError::InternalServerError)
        }
    }
}
