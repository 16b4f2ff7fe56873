use super::stats::{StatsSink, StorageStats};
use crate::Result;
use anyhow::Context;
use bb8_redis::{bb8::Pool, redis::AsyncCommands, RedisConnectionManager};

/// RedisStats mirrors the storage counters into redis so they survive restarts
/// and can be read by other tools.
#[derive(Clone)]
pub struct RedisStats {
    pool: Pool<RedisConnectionManager>,
}

impl RedisStats {
    pub async fn new<U: AsRef<str>>(u: U) -> Result<Self> {
        let mgr = RedisConnectionManager::new(u.as_ref()).context("invalid redis url")?;
        let pool = Pool::builder()
            .max_size(10)
            .build(mgr)
            .await
            .context("failed to build redis pool")?;

        Ok(Self { pool })
    }

    fn key(node: &str, field: &str) -> String {
        format!("block_storage:{}:{}", node, field)
    }
}

#[async_trait::async_trait]
impl StatsSink for RedisStats {
    async fn load(&self, node: &str) -> Result<Option<StorageStats>> {
        let mut con = self.pool.get().await.context("failed to get connection")?;

        let count: Option<u64> = con
            .get(Self::key(node, "blockCount"))
            .await
            .context("failed to get block count")?;
        let size: Option<u64> = con
            .get(Self::key(node, "totalSize"))
            .await
            .context("failed to get total size")?;

        Ok(match (count, size) {
            (None, None) => None,
            (count, size) => Some(StorageStats {
                block_count: count.unwrap_or_default(),
                total_size: size.unwrap_or_default(),
            }),
        })
    }

    async fn update(&self, node: &str, stats: StorageStats) -> Result<()> {
        let mut con = self.pool.get().await.context("failed to get connection")?;

        con.set::<_, _, ()>(Self::key(node, "blockCount"), stats.block_count)
            .await
            .context("failed to set block count")?;
        con.set::<_, _, ()>(Self::key(node, "totalSize"), stats.total_size)
            .await
            .context("failed to set total size")?;

        Ok(())
    }
}
