//! Types and client contract of the metadata service that tracks nodes,
//! block holders and file metadata for the fleet.
pub mod http;

pub use http::HttpMetaClient;

use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Registry entry of a storage node.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DfsNode {
    /// address reachable from inside the node fleet
    pub container_url: String,
    /// address reachable from outside the fleet
    pub local_url: String,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    #[schema(value_type = Option<i64>)]
    pub last_time_report: Option<DateTime<Utc>>,
    #[serde(default)]
    pub block_count: u64,
    #[serde(default)]
    pub block_total_size: u64,
}

impl DfsNode {
    pub fn new<C: Into<String>, L: Into<String>>(container_url: C, local_url: L) -> Self {
        Self {
            container_url: container_url.into(),
            local_url: local_url.into(),
            ..Default::default()
        }
    }
}

/// File level metadata as kept by the metadata service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DfsFile {
    /// hash over the ordered block hashes
    pub hash: String,
    pub owner: String,
    pub name: String,
    pub path: String,
    #[serde(rename = "directory", alias = "isDirectory", default)]
    pub is_directory: bool,
    #[serde(default)]
    pub parent_hash: Option<String>,
    pub size: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub create_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_modified_time: DateTime<Utc>,
    #[serde(default)]
    pub block_hashes: Vec<String>,
}

/// Holders of one block, the urls are container urls in the order they
/// should be tried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockNode {
    pub hash: String,
    #[serde(default)]
    pub node_urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestNodesForBlock {
    pub hash: String,
    /// container url of the node asking, the service may leave it out
    pub node_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodesForBlockStatus {
    Success,
    NoNodesAvailable,
    AlreadyEnoughCopies,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseNodesForBlock {
    pub status: NodesForBlockStatus,
    #[serde(default)]
    pub nodes: Vec<DfsNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBlockNode {
    pub hash: String,
    pub node_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSaveFile {
    pub dfs_file: DfsFile,
    pub target_directory: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestFileByPath {
    pub username: String,
    #[serde(alias = "filepath")]
    pub file_path: String,
}

/// MetaService is the contract this node consumes from the metadata service.
#[async_trait::async_trait]
pub trait MetaService: Send + Sync + 'static {
    /// candidate nodes that should store the given block
    async fn nodes_for_block(&self, request: &RequestNodesForBlock)
        -> Result<ResponseNodesForBlock>;

    async fn register_block_location(&self, request: &RequestBlockNode) -> Result<()>;

    async fn unregister_block(&self, hash: &str) -> Result<()>;

    /// nodes currently known to hold the block
    async fn block_nodes(&self, hash: &str) -> Result<Vec<DfsNode>>;

    /// registers the node, also used as heartbeat
    async fn register_node(&self, node: &DfsNode) -> Result<()>;

    async fn save_file(&self, request: &RequestSaveFile) -> Result<()>;

    async fn file_by_path(&self, request: &RequestFileByPath) -> Result<Option<DfsFile>>;

    async fn file_by_hash(&self, hash: &str) -> Result<Option<DfsFile>>;

    /// holders of every block of a file, in block order
    async fn file_block_nodes(&self, file_hash: &str) -> Result<Vec<BlockNode>>;

    /// maps a container url to the address reachable from outside the fleet
    async fn local_url_for_node(&self, container_url: &str) -> Result<String>;
}
