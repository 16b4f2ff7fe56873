use crate::hash::{calculate_file_hash, calculate_hash};
use crate::meta::{DfsFile, RequestSaveFile};
use crate::service::BlockService;
use crate::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Chunker splits a byte stream into fixed size blocks, only the last block
/// may be shorter.
pub struct Chunker<R> {
    reader: R,
    block_size: usize,
    done: bool,
}

impl<R> Chunker<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, block_size: usize) -> Self {
        Self {
            reader,
            block_size: block_size.max(1),
            done: false,
        }
    }

    /// next block, None once the stream is exhausted
    pub async fn next_block(&mut self) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.block_size];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                self.done = true;
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }

        buf.truncate(filled);
        Ok(Some(buf))
    }
}

/// Hashes of the blocks of the stream, in order.
pub async fn block_hashes<R: AsyncRead + Unpin>(reader: R, block_size: usize) -> Result<Vec<String>> {
    let mut chunker = Chunker::new(reader, block_size);
    let mut hashes = Vec::new();
    while let Some(block) = chunker.next_block().await? {
        hashes.push(calculate_hash(&block));
    }

    Ok(hashes)
}

/// Who uploads what, and where it goes in the file tree.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub user: String,
    pub target_dir: String,
    pub filename: String,
}

/// removes single quotes and surrounding white space
pub fn sanitize_filename(name: &str) -> String {
    name.replace('\'', "").trim().to_owned()
}

/// Splits the stream into blocks, places every block on the fleet and
/// saves the file metadata. Returns the file hash.
///
/// The upload is committed only once the metadata service accepted the file,
/// a failure there fails the upload even if every block was placed.
pub async fn upload<R>(service: &BlockService, reader: R, request: &UploadRequest) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let config = service.config();
    let name = sanitize_filename(&request.filename);
    debug!(
        "uploading '{}' to '{}' for {} with block size {}",
        name, request.target_dir, request.user, config.block_size
    );

    let mut chunker = Chunker::new(reader, config.block_size);
    let mut block_hashes = Vec::new();
    let mut read = 0u64;
    let mut placed = 0u64;

    while let Some(block) = chunker.next_block().await? {
        read += block.len() as u64;
        match service.check_and_store_block(&block).await {
            Ok(hash) => {
                debug!("block {} ({} bytes) placed", hash, block.len());
                placed += block.len() as u64;
                block_hashes.push(hash);
            }
            Err(Error::Unplaced(hash)) if !config.fail_on_unplaced_block => {
                warn!("block {} could not be placed, leaving it out of '{}'", hash, name);
            }
            Err(err) => return Err(err),
        }
    }

    if placed != read {
        warn!(
            "'{}' is incomplete, {} of {} bytes were placed",
            name, placed, read
        );
    }

    let hash = calculate_file_hash(&block_hashes);
    let now = chrono::Utc::now();
    let file = DfsFile {
        hash: hash.clone(),
        owner: request.user.clone(),
        path: format!("{}/{}", request.target_dir, name),
        name,
        is_directory: false,
        parent_hash: Some(calculate_hash(request.target_dir.as_bytes())),
        size: placed,
        create_time: now,
        last_modified_time: now,
        block_hashes,
    };

    service
        .meta()
        .save_file(&RequestSaveFile {
            dfs_file: file,
            target_directory: request.target_dir.clone(),
        })
        .await?;

    info!("uploaded file {} ({} bytes)", hash, placed);
    Ok(hash)
}
