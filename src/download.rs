use crate::hash::calculate_hash;
use crate::meta::{BlockNode, RequestFileByPath};
use crate::service::BlockService;
use crate::{Error, Result};
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::Arc;

/// A block of a file together with the urls of the nodes that hold it, in
/// the order they should be tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPlan {
    pub hash: String,
    pub holders: Vec<String>,
}

/// FileStream produces the content of a file block by block.
pub struct FileStream {
    pub name: String,
    /// total length if known up front
    pub size: Option<u64>,
    pub stream: BoxStream<'static, Result<Bytes>>,
}

impl FileStream {
    /// drains the stream into memory
    pub async fn collect(self) -> Result<Vec<u8>> {
        self.stream
            .try_fold(Vec::new(), |mut out, chunk| async move {
                out.extend_from_slice(&chunk);
                Ok::<_, Error>(out)
            })
            .await
    }
}

/// Fetches one block trying every holder in turn until one returns content
/// that matches the hash.
pub async fn fetch_block(service: &BlockService, plan: &BlockPlan) -> Result<Bytes> {
    for url in plan.holders.iter() {
        let result = if service.config().is_self(url) {
            service.read_block(&plan.hash).await.map(Some)
        } else {
            service.peers().read_block(url, &plan.hash).await
        };

        match result {
            Ok(Some(data)) if calculate_hash(&data) == plan.hash => {
                debug!("block {} fetched from {}", plan.hash, url);
                return Ok(data.into());
            }
            Ok(Some(_)) => warn!("block {} from {} failed verification", plan.hash, url),
            Ok(None) => warn!("block {} is missing on {}", plan.hash, url),
            Err(err) => warn!("failed to read block {} from {}: {:#}", plan.hash, url, err),
        }
    }

    Err(Error::NoHolders(plan.hash.clone()))
}

/// Streams the blocks in plan order. Up to `parallel_fetch` blocks are
/// fetched ahead of the one being delivered.
pub fn reconstruct(service: Arc<BlockService>, plan: Vec<BlockPlan>) -> BoxStream<'static, Result<Bytes>> {
    let parallel = service.config().parallel_fetch.max(1);
    stream::iter(plan)
        .map(move |block| {
            let service = Arc::clone(&service);
            async move { fetch_block(&service, &block).await }
        })
        .buffered(parallel)
        .boxed()
}

async fn holders_of(service: &BlockService, hash: &str) -> Result<BlockPlan> {
    let nodes = service.meta().block_nodes(hash).await?;
    if nodes.is_empty() {
        return Err(Error::NoHolders(hash.into()));
    }

    Ok(BlockPlan {
        hash: hash.into(),
        holders: nodes
            .iter()
            .map(|node| service.config().peer_url(node).to_owned())
            .collect(),
    })
}

/// Resolves the holders of every block of a file, failing if any block has
/// none.
async fn plan_for_blocks(service: &BlockService, hashes: &[String]) -> Result<Vec<BlockPlan>> {
    let parallel = service.config().parallel_fetch.max(1);
    let lookups: Vec<_> = hashes.iter().map(|hash| holders_of(service, hash)).collect();
    stream::iter(lookups)
        .buffered(parallel)
        .try_collect()
        .await
}

/// Builds the plan from the block holder list of the metadata service. The
/// urls there are container urls, outside the fleet they are mapped to the
/// matching local urls.
async fn plan_for_block_nodes(service: &BlockService, blocks: Vec<BlockNode>) -> Result<Vec<BlockPlan>> {
    let mut local_urls: HashMap<String, String> = HashMap::new();
    let mut plan = Vec::with_capacity(blocks.len());

    for block in blocks {
        if block.node_urls.is_empty() {
            return Err(Error::NoHolders(block.hash));
        }

        let mut holders = Vec::with_capacity(block.node_urls.len());
        for url in block.node_urls {
            if service.config().in_fleet || service.config().is_self(&url) {
                holders.push(url);
                continue;
            }

            if let Some(local) = local_urls.get(&url) {
                holders.push(local.clone());
                continue;
            }

            match service.meta().local_url_for_node(&url).await {
                Ok(local) => {
                    local_urls.insert(url, local.clone());
                    holders.push(local);
                }
                Err(err) => warn!("cannot resolve local url of {}: {:#}", url, err),
            }
        }

        plan.push(BlockPlan {
            hash: block.hash,
            holders,
        });
    }

    Ok(plan)
}

/// Rebuilds the file stored at the given path for the given user.
pub async fn download_file(service: Arc<BlockService>, request: &RequestFileByPath) -> Result<FileStream> {
    let file = service
        .meta()
        .file_by_path(request)
        .await?
        .ok_or_else(|| Error::NotFound(request.file_path.clone()))?;

    let plan = plan_for_blocks(&service, &file.block_hashes).await?;
    info!(
        "downloading '{}' ({} bytes in {} blocks)",
        file.path,
        file.size,
        plan.len()
    );

    Ok(FileStream {
        name: file.name,
        size: Some(file.size),
        stream: reconstruct(service, plan),
    })
}

/// Rebuilds a file from its hash. Returns None if the metadata service knows
/// no blocks for it.
pub async fn download_by_hash(service: Arc<BlockService>, hash: &str) -> Result<Option<FileStream>> {
    let blocks = service.meta().file_block_nodes(hash).await?;
    if blocks.is_empty() {
        return Ok(None);
    }

    let size = match service.meta().file_by_hash(hash).await {
        Ok(file) => file.map(|f| f.size),
        Err(err) => {
            warn!("failed to get file {}: {:#}", hash, err);
            None
        }
    };

    let plan = plan_for_block_nodes(&service, blocks).await?;
    info!("downloading file {} ({} blocks)", hash, plan.len());

    Ok(Some(FileStream {
        name: hash.to_owned(),
        size,
        stream: reconstruct(service, plan),
    }))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dedupe::{upload, UploadRequest};
    use crate::service::test::{config, service, FakeMeta, FakePeers, DEAD_URL, PEER_URL, SELF_URL};

    fn request() -> UploadRequest {
        UploadRequest {
            user: "alice".into(),
            target_dir: "/docs".into(),
            filename: "data.bin".into(),
        }
    }

    fn by_path() -> RequestFileByPath {
        RequestFileByPath {
            username: "alice".into(),
            file_path: "/docs/data.bin".into(),
        }
    }

    #[tokio::test]
    async fn upload_then_download() {
        let dir = tempfile::tempdir().unwrap();
        let meta = Arc::new(FakeMeta::with_targets(&[SELF_URL]));
        let svc = Arc::new(service(config(dir.path()), meta, Default::default()).await);

        let data: Vec<u8> = (0..21).collect();
        upload(&svc, data.as_slice(), &request()).await.unwrap();

        let file = download_file(svc.clone(), &by_path()).await.unwrap();
        assert_eq!(file.name, "data.bin");
        assert_eq!(file.size, Some(21));
        assert_eq!(file.collect().await.unwrap(), data);
    }

    #[tokio::test]
    async fn remote_blocks_keep_order() {
        let dir = tempfile::tempdir().unwrap();
        let meta = Arc::new(FakeMeta::with_targets(&[PEER_URL]));
        let peers = Arc::new(FakePeers::default());
        let svc = Arc::new(service(config(dir.path()), meta.clone(), peers.clone()).await);

        let data: Vec<u8> = (0..200u8).collect();
        upload(&svc, data.as_slice(), &request()).await.unwrap();
        assert_eq!(svc.block_count(), 0);

        // peers do not register themselves in the fake, do it for them
        for (_, hash) in peers.blocks.lock().unwrap().keys() {
            meta.holders
                .lock()
                .unwrap()
                .insert(hash.clone(), vec![PEER_URL.into()]);
        }

        let file = download_file(svc, &by_path()).await.unwrap();
        assert_eq!(file.collect().await.unwrap(), data);
    }

    #[tokio::test]
    async fn falls_back_to_next_holder() {
        let dir = tempfile::tempdir().unwrap();
        let peers = Arc::new(FakePeers {
            dead: vec![DEAD_URL.into()],
            ..Default::default()
        });
        let svc = service(config(dir.path()), Default::default(), peers.clone()).await;

        let hash = calculate_hash(b"block");
        peers
            .blocks
            .lock()
            .unwrap()
            .insert((PEER_URL.into(), hash.clone()), b"block".to_vec());

        let plan = BlockPlan {
            hash: hash.clone(),
            holders: vec![DEAD_URL.into(), SELF_URL.into(), PEER_URL.into()],
        };
        assert_eq!(fetch_block(&svc, &plan).await.unwrap(), &b"block"[..]);

        let plan = BlockPlan {
            hash,
            holders: vec![DEAD_URL.into()],
        };
        assert!(matches!(
            fetch_block(&svc, &plan).await,
            Err(Error::NoHolders(_))
        ));
    }

    #[tokio::test]
    async fn holder_order_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.in_fleet = false;
        let svc = service(cfg, Default::default(), Default::default()).await;

        let blocks = vec![BlockNode {
            hash: calculate_hash(b"block"),
            node_urls: vec![PEER_URL.into(), DEAD_URL.into(), SELF_URL.into()],
        }];
        let plan = plan_for_block_nodes(&svc, blocks).await.unwrap();
        assert_eq!(plan[0].holders, vec![PEER_URL, DEAD_URL, SELF_URL]);
    }

    #[tokio::test]
    async fn corrupted_copy_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let peers = Arc::new(FakePeers::default());
        let svc = service(config(dir.path()), Default::default(), peers.clone()).await;

        let hash = calculate_hash(b"block");
        svc.store_block_locally(&hash, b"block").await.unwrap();
        peers
            .blocks
            .lock()
            .unwrap()
            .insert((PEER_URL.into(), hash.clone()), b"other".to_vec());

        let plan = BlockPlan {
            hash,
            holders: vec![PEER_URL.into(), SELF_URL.into()],
        };
        assert_eq!(fetch_block(&svc, &plan).await.unwrap(), &b"block"[..]);
    }

    #[tokio::test]
    async fn missing_holders_fail_the_read() {
        let dir = tempfile::tempdir().unwrap();
        let meta = Arc::new(FakeMeta::with_targets(&[SELF_URL]));
        let svc = Arc::new(service(config(dir.path()), meta.clone(), Default::default()).await);

        upload(&svc, &b"0123456789"[..], &request()).await.unwrap();
        meta.holders.lock().unwrap().clear();

        assert!(matches!(
            download_file(svc.clone(), &by_path()).await,
            Err(Error::NoHolders(_))
        ));

        let unknown = RequestFileByPath {
            username: "bob".into(),
            file_path: "/docs/data.bin".into(),
        };
        assert!(matches!(
            download_file(svc, &unknown).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn download_by_file_hash() {
        let dir = tempfile::tempdir().unwrap();
        let meta = Arc::new(FakeMeta::with_targets(&[SELF_URL]));
        let svc = Arc::new(service(config(dir.path()), meta, Default::default()).await);

        let data = b"content addressed and deduplicated".to_vec();
        let hash = upload(&svc, data.as_slice(), &request()).await.unwrap();

        let file = download_by_hash(svc.clone(), &hash).await.unwrap().unwrap();
        assert_eq!(file.name, hash);
        assert_eq!(file.size, Some(data.len() as u64));
        assert_eq!(file.collect().await.unwrap(), data);

        assert!(download_by_hash(svc, "unknown").await.unwrap().is_none());
    }
}
