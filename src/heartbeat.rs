use crate::service::BlockService;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Registers this node with the metadata service, reporting its counters.
pub async fn report(service: &BlockService) -> Result<()> {
    let mut node = service.config().node();
    node.last_time_report = Some(chrono::Utc::now());
    node.block_count = service.block_count();
    node.block_total_size = service.total_size();

    service.meta().register_node(&node).await
}

/// Starts the background heartbeat. The first report is sent right away,
/// then one every `heartbeat_secs`. A failed report is retried on the next
/// tick.
pub fn spawn(service: Arc<BlockService>) -> JoinHandle<()> {
    let period = Duration::from_secs(service.config().heartbeat_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            match report(&service).await {
                Ok(_) => debug!("heartbeat sent for {}", service.config().container_url),
                Err(err) => warn!("failed to send heartbeat: {:#}", err),
            }
        }
    })
}
