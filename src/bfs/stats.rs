use crate::Result;
use serde::{Deserialize, Serialize};

/// Aggregate counters of a node's block storage.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub block_count: u64,
    pub total_size: u64,
}

/// StatsSink receives the storage counters after every mutating operation.
///
/// Implementations must not assume they are called in order, the storage
/// always hands over the latest snapshot.
#[async_trait::async_trait]
pub trait StatsSink: Send + Sync + 'static {
    /// last known counters for the node, used to seed the storage on start
    async fn load(&self, node: &str) -> Result<Option<StorageStats>>;
    async fn update(&self, node: &str, stats: StorageStats) -> Result<()>;
}

/// NoopStats keeps nothing, the in process counters are the only source.
#[derive(Debug, Default, Clone)]
pub struct NoopStats;

#[async_trait::async_trait]
impl StatsSink for NoopStats {
    async fn load(&self, _node: &str) -> Result<Option<StorageStats>> {
        Ok(None)
    }

    async fn update(&self, _node: &str, _stats: StorageStats) -> Result<()> {
        Ok(())
    }
}
