use crate::bfs::BlockStorage;
use crate::config::Config;
use crate::hash::calculate_hash;
use crate::meta::{
    DfsNode, MetaService, NodesForBlockStatus, RequestBlockNode, RequestNodesForBlock,
};
use crate::peer::PeerClient;
use crate::{Error, Result};
use futures::future::join_all;
use std::sync::Arc;

/// Outcome of asking the metadata service where a block should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidates {
    /// store on every listed node
    Nodes(Vec<DfsNode>),
    /// the fleet already keeps enough copies, nothing to store
    AlreadyHeld,
    /// no node can take the block
    Unavailable,
}

/// BlockService places blocks on the fleet and serves the local block
/// operations of this node.
pub struct BlockService {
    config: Arc<Config>,
    storage: Arc<BlockStorage>,
    meta: Arc<dyn MetaService>,
    peers: Arc<dyn PeerClient>,
}

impl BlockService {
    pub fn new(
        config: Arc<Config>,
        storage: Arc<BlockStorage>,
        meta: Arc<dyn MetaService>,
        peers: Arc<dyn PeerClient>,
    ) -> Self {
        Self {
            config,
            storage,
            meta,
            peers,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &BlockStorage {
        &self.storage
    }

    pub fn meta(&self) -> &dyn MetaService {
        self.meta.as_ref()
    }

    pub fn peers(&self) -> &dyn PeerClient {
        self.peers.as_ref()
    }

    /// Saves the block in the local storage and registers this node as a
    /// holder. Returns true if the block was new to this node.
    ///
    /// Content that does not hash to `hash` is refused, a stored payload is
    /// never rewritten by later saves of the same hash.
    pub async fn store_block_locally(&self, hash: &str, data: &[u8]) -> Result<bool> {
        if calculate_hash(data) != hash {
            return Err(Error::HashMismatch(hash.into()));
        }

        let is_new = self
            .storage
            .save_block(hash, data, self.config.encrypt_blocks)
            .await?;

        self.register_block_location(hash).await;
        Ok(is_new)
    }

    async fn register_block_location(&self, hash: &str) {
        let request = RequestBlockNode {
            hash: hash.into(),
            node_url: self.config.container_url.clone(),
        };

        if let Err(err) = self.meta.register_block_location(&request).await {
            warn!("failed to register location of block {}: {:#}", hash, err);
        }
    }

    /// Candidate nodes for a block. A failing metadata call counts as no
    /// candidates.
    pub async fn candidates(&self, hash: &str) -> Candidates {
        let request = RequestNodesForBlock {
            hash: hash.into(),
            node_url: self.config.container_url.clone(),
        };

        let response = match self.meta.nodes_for_block(&request).await {
            Ok(response) => response,
            Err(err) => {
                error!("failed to get nodes for block {}: {:#}", hash, err);
                return Candidates::Unavailable;
            }
        };

        debug!(
            "nodes for block {}: {:?} {:?}",
            hash,
            response.status,
            response
                .nodes
                .iter()
                .map(|n| n.container_url.as_str())
                .collect::<Vec<_>>()
        );

        if !response.nodes.is_empty() {
            return Candidates::Nodes(response.nodes);
        }

        match response.status {
            NodesForBlockStatus::AlreadyEnoughCopies => Candidates::AlreadyHeld,
            _ => Candidates::Unavailable,
        }
    }

    /// Hashes the block and stores it on the nodes chosen by the metadata
    /// service. Fails with [`Error::Unplaced`] if no node accepted it.
    pub async fn check_and_store_block(&self, data: &[u8]) -> Result<String> {
        let hash = calculate_hash(data);

        match self.candidates(&hash).await {
            Candidates::Nodes(nodes) => {
                if self.store_on_nodes(&nodes, &hash, data).await {
                    Ok(hash)
                } else {
                    Err(Error::Unplaced(hash))
                }
            }
            Candidates::AlreadyHeld => {
                debug!("block {} already has enough copies", hash);
                Ok(hash)
            }
            Candidates::Unavailable => Err(Error::Unplaced(hash)),
        }
    }

    /// Stores the block on every candidate concurrently. Returns true if at
    /// least one of them accepted it.
    pub async fn store_on_nodes(&self, nodes: &[DfsNode], hash: &str, data: &[u8]) -> bool {
        let attempts = nodes.iter().map(|node| async move {
            let result = if self.config.is_self(&node.container_url) {
                self.store_block_locally(hash, data).await.map(|_| ())
            } else {
                self.store_block_on_remote_node(node, hash, data).await
            };

            if let Err(ref err) = result {
                warn!(
                    "failed to store block {} on {}: {:#}",
                    hash, node.container_url, err
                );
            }
            result.is_ok()
        });

        let stored = join_all(attempts)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();

        debug!("block {} stored on {}/{} nodes", hash, stored, nodes.len());
        stored > 0
    }

    pub async fn store_block_on_remote_node(
        &self,
        node: &DfsNode,
        hash: &str,
        data: &[u8],
    ) -> Result<()> {
        let url = self.config.peer_url(node);
        debug!("storing block {} on remote node {}", hash, url);
        self.peers.store_block(url, hash, data).await
    }

    /// Pushes a locally held block to another node. Returns false if this
    /// node does not have the block.
    pub async fn replicate_to_node(&self, hash: &str, target: &DfsNode) -> Result<bool> {
        let data = match self.storage.read_block(hash).await {
            Ok(data) => data,
            Err(Error::NotFound(_)) => return Ok(false),
            Err(err) => return Err(err),
        };

        self.store_block_on_remote_node(target, hash, &data).await?;
        info!("replicated block {} to {}", hash, target.container_url);
        Ok(true)
    }

    pub async fn read_block(&self, hash: &str) -> Result<Vec<u8>> {
        self.storage.read_block(hash).await
    }

    /// Logical delete of one reference. Once the block has no references
    /// left this node is removed as its holder.
    pub async fn delete_block(&self, hash: &str) -> Result<Option<u32>> {
        let remaining = self.storage.delete_block(hash).await?;
        if remaining == Some(0) {
            if let Err(err) = self.meta.unregister_block(hash).await {
                warn!("failed to unregister block {}: {:#}", hash, err);
            }
        }

        Ok(remaining)
    }

    pub async fn clear_block_files(&self) -> Result<()> {
        self.storage.clear_files().await
    }

    pub fn block_count(&self) -> u64 {
        self.storage.block_count()
    }

    pub fn total_size(&self) -> u64 {
        self.storage.total_size()
    }
}
