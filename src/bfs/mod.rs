//! Local block storage engine.
//!
//! Blocks are kept in shard file pairs selected by the first 8 hex digits of
//! their hash: `{root}/{h[0..2]}/{h[2..4]}/{h[4..6]}/{h[6..8]}.idx` holds the
//! fixed width [`BlockSchema`] records, the sibling `.bfs` file holds the
//! payloads referenced by offset and size. Many hashes share one shard, so the
//! index is scanned linearly comparing full hashes.
pub mod block;
pub mod crypto;
pub mod redis;
pub mod schema;
pub mod stats;

pub use block::Block;
pub use crypto::{AesEncryptor, Encryptor};
pub use schema::{BlockSchema, SCHEMA_SIZE};
pub use stats::{NoopStats, StatsSink, StorageStats};

use crate::hash::is_valid_hash;
use crate::{Error, Result};
use std::collections::HashMap;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};

const INDEX_EXT: &str = "idx";
const DATA_EXT: &str = "bfs";

struct Shard {
    index: PathBuf,
    data: PathBuf,
}

/// outcome of a save inside a shard
struct Saved {
    is_new: bool,
    /// the block counters changed and must be published
    counted: bool,
}

/// BlockStorage is the deduplicating, reference counted block store of a node.
///
/// Mutations of a shard are serialized by a per shard lock, different shards
/// are written in parallel. [`BlockStorage::clear_files`] excludes every
/// other operation while it wipes the tree.
pub struct BlockStorage {
    root: PathBuf,
    node: String,
    encryptor: Arc<dyn Encryptor>,
    stats: Arc<dyn StatsSink>,
    tree: RwLock<()>,
    shards: Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>,
    block_count: AtomicU64,
    total_size: AtomicU64,
}

impl BlockStorage {
    /// Opens (or creates) the storage tree at root. `node` is the name under
    /// which the counters are reported to the stats sink.
    pub async fn new<P, S>(
        root: P,
        node: S,
        encryptor: Arc<dyn Encryptor>,
        stats: Arc<dyn StatsSink>,
    ) -> Result<Self>
    where
        P: Into<PathBuf>,
        S: Into<String>,
    {
        let root = root.into();
        let node = node.into();
        fs::create_dir_all(&root).await?;

        let initial = match stats.load(&node).await {
            Ok(stats) => stats.unwrap_or_default(),
            Err(err) => {
                warn!("failed to load storage stats for {}: {:#}", node, err);
                StorageStats::default()
            }
        };

        Ok(Self {
            root,
            node,
            encryptor,
            stats,
            tree: RwLock::new(()),
            shards: Mutex::new(HashMap::new()),
            block_count: AtomicU64::new(initial.block_count),
            total_size: AtomicU64::new(initial.total_size),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn block_count(&self) -> u64 {
        self.block_count.load(Ordering::SeqCst)
    }

    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            block_count: self.block_count(),
            total_size: self.total_size(),
        }
    }

    fn shard(&self, hash: &str) -> Result<Shard> {
        if !is_valid_hash(hash) {
            return Err(Error::InvalidHash(hash.into()));
        }

        let dir = self.root.join(&hash[0..2]).join(&hash[2..4]).join(&hash[4..6]);
        let name = &hash[6..8];
        Ok(Shard {
            index: dir.join(name).with_extension(INDEX_EXT),
            data: dir.join(name).with_extension(DATA_EXT),
        })
    }

    async fn shard_lock(&self, shard: &Shard) -> Arc<RwLock<()>> {
        let mut shards = self.shards.lock().await;
        shards
            .entry(shard.index.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Drops the lock of a shard from the map once nobody else holds or waits
    /// for it. Clones are only handed out under the map mutex, so the count
    /// seen here cannot grow concurrently.
    async fn release_shard(&self, shard: &Shard, lock: Arc<RwLock<()>>) {
        let mut shards = self.shards.lock().await;
        // one reference in the map, one here
        if Arc::strong_count(&lock) == 2 {
            shards.remove(&shard.index);
        }
    }

    /// Stores data under hash.
    ///
    /// If the hash is already present its reference count is increased and
    /// the payload is left untouched. Returns true if the block was new.
    pub async fn save_block(&self, hash: &str, data: &[u8], encrypt: bool) -> Result<bool> {
        let shard = self.shard(hash)?;
        let tree = self.tree.read().await;
        let lock = self.shard_lock(&shard).await;
        let saved = {
            let _guard = lock.write().await;
            self.save_in_shard(&shard, hash, data, encrypt).await
        };
        self.release_shard(&shard, lock).await;
        drop(tree);

        let saved = saved?;
        if saved.counted {
            self.publish().await;
        }

        Ok(saved.is_new)
    }

    async fn save_in_shard(
        &self,
        shard: &Shard,
        hash: &str,
        data: &[u8],
        encrypt: bool,
    ) -> Result<Saved> {
        if let Some(parent) = shard.index.parent() {
            fs::create_dir_all(parent).await?;
        }

        let records = read_index(&shard.index).await?;
        if let Some((position, mut schema)) = find(&records, hash)? {
            let revived = schema.reference_count == 0;
            schema.reference_count = schema.reference_count.saturating_add(1);
            schema.touch();
            write_record(&shard.index, position, &schema).await?;
            debug!(
                "block {} already stored, reference count is now {}",
                hash, schema.reference_count
            );

            // a block at zero references is not counted, take it back
            if revived {
                self.block_count.fetch_add(1, Ordering::SeqCst);
                self.total_size
                    .fetch_add(schema.size as u64, Ordering::SeqCst);
            }

            return Ok(Saved {
                is_new: false,
                counted: revived,
            });
        }

        let mut block = Block::new(hash, data.to_vec())?;
        if encrypt {
            block.encrypt(self.encryptor.as_ref())?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&shard.data)
            .await?;
        block.schema.offset = file.seek(SeekFrom::End(0)).await?;
        file.write_all(&block.data).await?;
        file.flush().await?;

        // payload goes first so an index record never points past the data file
        let position = records.len() / SCHEMA_SIZE;
        write_record(&shard.index, position, &block.schema).await?;
        if records.len() % SCHEMA_SIZE != 0 {
            truncate_index(&shard.index, position + 1).await?;
        }

        self.block_count.fetch_add(1, Ordering::SeqCst);
        self.total_size
            .fetch_add(block.schema.size as u64, Ordering::SeqCst);
        debug!(
            "stored block {} ({} bytes at offset {})",
            hash, block.schema.size, block.schema.offset
        );

        Ok(Saved {
            is_new: true,
            counted: true,
        })
    }

    /// Reads back the plain content of a block.
    pub async fn read_block(&self, hash: &str) -> Result<Vec<u8>> {
        let shard = self.shard(hash)?;
        let tree = self.tree.read().await;
        let lock = self.shard_lock(&shard).await;
        let stored = {
            let _guard = lock.read().await;
            read_stored(&shard, hash).await
        };
        self.release_shard(&shard, lock).await;
        drop(tree);

        let (schema, data) = stored?;
        let mut block = Block::from_stored(schema, data);
        block.decrypt(self.encryptor.as_ref())?;

        Ok(block.into_data())
    }

    /// Drops one reference to a block.
    ///
    /// Returns the reference count after the call, or None if the hash is
    /// unknown or the count was already zero, in which case nothing changes.
    /// Records are never removed, a block at zero references stays readable.
    pub async fn delete_block(&self, hash: &str) -> Result<Option<u32>> {
        let shard = self.shard(hash)?;
        let tree = self.tree.read().await;
        let lock = self.shard_lock(&shard).await;
        let remaining = {
            let _guard = lock.write().await;
            self.delete_in_shard(&shard, hash).await
        };
        self.release_shard(&shard, lock).await;
        drop(tree);

        let remaining = remaining?;
        if remaining == Some(0) {
            self.publish().await;
        }

        Ok(remaining)
    }

    async fn delete_in_shard(&self, shard: &Shard, hash: &str) -> Result<Option<u32>> {
        let records = read_index(&shard.index).await?;
        let (position, mut schema) = match find(&records, hash)? {
            Some(found) => found,
            None => {
                debug!("delete of unknown block {} ignored", hash);
                return Ok(None);
            }
        };

        if schema.reference_count == 0 {
            return Ok(None);
        }

        schema.reference_count -= 1;
        schema.touch();
        write_record(&shard.index, position, &schema).await?;

        if schema.reference_count == 0 {
            info!("block {} has no references left and can be purged", hash);
            decrement(&self.block_count, 1);
            decrement(&self.total_size, schema.size as u64);
        }

        Ok(Some(schema.reference_count))
    }

    pub async fn reference_count(&self, hash: &str) -> Result<u32> {
        let shard = self.shard(hash)?;
        let tree = self.tree.read().await;
        let lock = self.shard_lock(&shard).await;
        let found = {
            let _guard = lock.read().await;
            match read_index(&shard.index).await {
                Ok(records) => find(&records, hash),
                Err(err) => Err(err),
            }
        };
        self.release_shard(&shard, lock).await;
        drop(tree);

        found?
            .map(|(_, schema)| schema.reference_count)
            .ok_or_else(|| Error::NotFound(hash.into()))
    }

    /// Removes every shard of this node and resets the counters.
    pub async fn clear_files(&self) -> Result<()> {
        {
            let _tree = self.tree.write().await;

            match fs::remove_dir_all(&self.root).await {
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            fs::create_dir_all(&self.root).await?;

            self.shards.lock().await.clear();
            self.block_count.store(0, Ordering::SeqCst);
            self.total_size.store(0, Ordering::SeqCst);
        }
        info!("cleared block storage at {}", self.root.display());

        self.publish().await;
        Ok(())
    }

    async fn publish(&self) {
        if let Err(err) = self.stats.update(&self.node, self.stats()).await {
            warn!("failed to update storage stats for {}: {:#}", self.node, err);
        }
    }
}

/// content of an index file, a missing file is an empty index
async fn read_index(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path).await {
        Ok(data) => {
            if data.len() % SCHEMA_SIZE != 0 {
                warn!(
                    "index {} has a torn trailing record, ignoring {} bytes",
                    path.display(),
                    data.len() % SCHEMA_SIZE
                );
            }
            Ok(data)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

/// record and stored payload of hash
async fn read_stored(shard: &Shard, hash: &str) -> Result<(BlockSchema, Vec<u8>)> {
    let records = read_index(&shard.index).await?;
    let (_, schema) = find(&records, hash)?.ok_or_else(|| Error::NotFound(hash.into()))?;

    let mut file = fs::File::open(&shard.data).await?;
    file.seek(SeekFrom::Start(schema.offset)).await?;
    let mut data = vec![0u8; schema.size as usize];
    file.read_exact(&mut data).await?;

    Ok((schema, data))
}

/// position (in records) and content of the record matching hash
fn find(records: &[u8], hash: &str) -> Result<Option<(usize, BlockSchema)>> {
    for (position, record) in records.chunks_exact(SCHEMA_SIZE).enumerate() {
        let schema = BlockSchema::decode(record)?;
        if schema.hash == hash {
            return Ok(Some((position, schema)));
        }
    }

    Ok(None)
}

/// writes schema as record number `position` of the index file
async fn write_record(path: &Path, position: usize, schema: &BlockSchema) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await?;

    let start = (position * SCHEMA_SIZE) as u64;
    file.seek(SeekFrom::Start(start)).await?;
    file.write_all(&schema.encode()).await?;

    file.flush().await?;

    Ok(())
}

async fn truncate_index(path: &Path, records: usize) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len((records * SCHEMA_SIZE) as u64).await?;
    Ok(())
}

fn decrement(counter: &AtomicU64, by: u64) {
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
        Some(v.saturating_sub(by))
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hash::calculate_hash;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    async fn storage(root: &Path) -> BlockStorage {
        BlockStorage::new(
            root,
            "http://node:8080",
            Arc::new(AesEncryptor::ephemeral()),
            Arc::new(NoopStats),
        )
        .await
        .unwrap()
    }

    fn data_file(root: &Path, hash: &str) -> PathBuf {
        root.join(&hash[0..2])
            .join(&hash[2..4])
            .join(&hash[4..6])
            .join(format!("{}.bfs", &hash[6..8]))
    }

    #[tokio::test]
    async fn roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path()).await;

        let data = b"some block data".to_vec();
        let hash = calculate_hash(&data);
        assert!(storage.save_block(&hash, &data, false).await.unwrap());

        assert_eq!(storage.read_block(&hash).await.unwrap(), data);
        assert_eq!(storage.block_count(), 1);
        assert_eq!(storage.total_size(), data.len() as u64);

        let index = data_file(dir.path(), &hash).with_extension("idx");
        assert_eq!(fs::metadata(index).await.unwrap().len(), SCHEMA_SIZE as u64);
    }

    #[tokio::test]
    async fn empty_block() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path()).await;

        let hash = calculate_hash(b"");
        storage.save_block(&hash, b"", false).await.unwrap();
        assert!(storage.read_block(&hash).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dedup_keeps_payload() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path()).await;

        let data = vec![7u8; 100];
        let hash = calculate_hash(&data);
        assert!(storage.save_block(&hash, &data, false).await.unwrap());
        let len = fs::metadata(data_file(dir.path(), &hash)).await.unwrap().len();

        assert!(!storage.save_block(&hash, &data, false).await.unwrap());
        assert_eq!(storage.reference_count(&hash).await.unwrap(), 2);
        assert_eq!(
            fs::metadata(data_file(dir.path(), &hash)).await.unwrap().len(),
            len
        );
        assert_eq!(storage.block_count(), 1);
        assert_eq!(storage.total_size(), 100);
    }

    #[tokio::test]
    async fn reference_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path()).await;

        let data = b"twenty bytes of data".to_vec();
        assert_eq!(data.len(), 20);
        let h1 = calculate_hash(&data);

        storage.save_block(&h1, &data, false).await.unwrap();
        assert_eq!(storage.reference_count(&h1).await.unwrap(), 1);
        storage.save_block(&h1, &data, false).await.unwrap();
        assert_eq!(storage.reference_count(&h1).await.unwrap(), 2);

        assert_eq!(storage.delete_block(&h1).await.unwrap(), Some(1));
        assert_eq!(storage.delete_block(&h1).await.unwrap(), Some(0));
        assert_eq!(storage.reference_count(&h1).await.unwrap(), 0);
        assert_eq!(storage.block_count(), 0);
        assert_eq!(storage.total_size(), 0);

        // floor at zero, record kept and readable
        assert_eq!(storage.delete_block(&h1).await.unwrap(), None);
        assert_eq!(storage.reference_count(&h1).await.unwrap(), 0);
        assert_eq!(storage.read_block(&h1).await.unwrap(), data);

        // saving again brings the block back into the counters
        assert!(!storage.save_block(&h1, &data, false).await.unwrap());
        assert_eq!(storage.reference_count(&h1).await.unwrap(), 1);
        assert_eq!(storage.block_count(), 1);
        assert_eq!(storage.total_size(), 20);
    }

    #[tokio::test]
    async fn unknown_hash() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path()).await;
        let hash = calculate_hash(b"missing");

        assert!(matches!(
            storage.read_block(&hash).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            storage.reference_count(&hash).await,
            Err(Error::NotFound(_))
        ));
        assert_eq!(storage.delete_block(&hash).await.unwrap(), None);
        assert!(matches!(
            storage.read_block("../../etc").await,
            Err(Error::InvalidHash(_))
        ));
    }

    #[tokio::test]
    async fn shard_collision() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path()).await;

        let first = format!("abcdef12{}", "0".repeat(56));
        let second = format!("abcdef12{}", "1".repeat(56));
        storage.save_block(&first, b"first payload", false).await.unwrap();
        storage.save_block(&second, b"second", false).await.unwrap();
        storage.save_block(&second, b"second", false).await.unwrap();

        let index = data_file(dir.path(), &first).with_extension("idx");
        assert_eq!(
            fs::metadata(&index).await.unwrap().len(),
            2 * SCHEMA_SIZE as u64
        );

        assert_eq!(storage.read_block(&first).await.unwrap(), b"first payload");
        assert_eq!(storage.read_block(&second).await.unwrap(), b"second");
        assert_eq!(storage.reference_count(&first).await.unwrap(), 1);
        assert_eq!(storage.reference_count(&second).await.unwrap(), 2);

        storage.delete_block(&first).await.unwrap();
        assert_eq!(storage.reference_count(&first).await.unwrap(), 0);
        assert_eq!(storage.reference_count(&second).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn encrypted_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path()).await;

        let data = b"a secret that must not hit the disk in clear".to_vec();
        let hash = calculate_hash(&data);
        storage.save_block(&hash, &data, true).await.unwrap();

        let stored = fs::read(data_file(dir.path(), &hash)).await.unwrap();
        assert_ne!(stored, data);
        assert_eq!(stored.len(), data.len() + 12 + 16);
        assert_eq!(storage.total_size(), stored.len() as u64);

        assert_eq!(storage.read_block(&hash).await.unwrap(), data);
    }

    #[tokio::test]
    async fn concurrent_saves_same_shard() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(storage(dir.path()).await);

        let mut handles = Vec::new();
        for i in 0..16u8 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                let hash = format!("00000000{:056x}", i);
                storage.save_block(&hash, &[i; 10], false).await.unwrap();
                hash
            }));
        }

        for (i, handle) in handles.into_iter().enumerate() {
            let hash = handle.await.unwrap();
            assert_eq!(storage.read_block(&hash).await.unwrap(), vec![i as u8; 10]);
        }
        assert_eq!(storage.block_count(), 16);

        // locks of idle shards are not kept around
        assert!(storage.shards.lock().await.is_empty());
    }

    #[tokio::test]
    async fn clear_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path()).await;

        let hash = calculate_hash(b"x");
        storage.save_block(&hash, b"x", false).await.unwrap();
        storage.clear_files().await.unwrap();

        assert_eq!(storage.block_count(), 0);
        assert!(matches!(
            storage.read_block(&hash).await,
            Err(Error::NotFound(_))
        ));
        assert!(dir.path().exists());
    }

    #[derive(Default)]
    struct MemStats {
        last: StdMutex<Option<StorageStats>>,
    }

    #[async_trait::async_trait]
    impl StatsSink for MemStats {
        async fn load(&self, _node: &str) -> Result<Option<StorageStats>> {
            Ok(Some(StorageStats {
                block_count: 5,
                total_size: 500,
            }))
        }

        async fn update(&self, _node: &str, stats: StorageStats) -> Result<()> {
            *self.last.lock().unwrap() = Some(stats);
            Ok(())
        }
    }

    #[tokio::test]
    async fn stats_are_published() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemStats::default());
        let storage = BlockStorage::new(
            dir.path(),
            "node",
            Arc::new(AesEncryptor::ephemeral()),
            sink.clone(),
        )
        .await
        .unwrap();
        assert_eq!(storage.block_count(), 5);

        let hash = calculate_hash(b"abc");
        storage.save_block(&hash, b"abc", false).await.unwrap();
        assert_eq!(
            *sink.last.lock().unwrap(),
            Some(StorageStats {
                block_count: 6,
                total_size: 503
            })
        );
    }

    /// sink that takes its time, signalling when an update starts
    struct SlowStats {
        started: Notify,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl StatsSink for SlowStats {
        async fn load(&self, _node: &str) -> Result<Option<StorageStats>> {
            Ok(None)
        }

        async fn update(&self, _node: &str, _stats: StorageStats) -> Result<()> {
            self.started.notify_one();
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn slow_stats_do_not_block_the_shard() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(SlowStats {
            started: Notify::new(),
            delay: Duration::from_secs(2),
        });
        let storage = Arc::new(
            BlockStorage::new(
                dir.path(),
                "node",
                Arc::new(AesEncryptor::ephemeral()),
                sink.clone(),
            )
            .await
            .unwrap(),
        );

        let first = format!("00000000aa{}", "0".repeat(54));
        let second = format!("00000000bb{}", "0".repeat(54));

        let save = {
            let storage = storage.clone();
            let first = first.clone();
            tokio::spawn(async move { storage.save_block(&first, b"first", false).await })
        };
        sink.started.notified().await;

        // the save is now publishing, the shard must be free again
        let start = tokio::time::Instant::now();
        assert!(matches!(
            storage.read_block(&second).await,
            Err(Error::NotFound(_))
        ));
        assert_eq!(storage.read_block(&first).await.unwrap(), b"first");
        assert!(start.elapsed() < Duration::from_secs(1));

        assert!(save.await.unwrap().unwrap());
    }
}
