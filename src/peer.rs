use crate::{Error, Result};
use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use std::time::Duration;

/// PeerClient moves block payloads between storage nodes.
#[async_trait::async_trait]
pub trait PeerClient: Send + Sync + 'static {
    /// stores data under hash on the node at url
    async fn store_block(&self, url: &str, hash: &str, data: &[u8]) -> Result<()>;

    /// reads a block from the node at url, None if the node does not have it
    async fn read_block(&self, url: &str, hash: &str) -> Result<Option<Vec<u8>>>;
}

/// HttpPeerClient uses the block endpoints every node serves.
#[derive(Clone)]
pub struct HttpPeerClient {
    client: Client,
}

impl HttpPeerClient {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl PeerClient for HttpPeerClient {
    async fn store_block(&self, url: &str, hash: &str, data: &[u8]) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/dfs/block/store", url.trim_end_matches('/')))
            .query(&[("hash", hash)])
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data.to_vec())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Remote(format!(
                "storing block {} on {} failed with status {}",
                hash,
                url,
                response.status()
            )));
        }

        Ok(())
    }

    async fn read_block(&self, url: &str, hash: &str) -> Result<Option<Vec<u8>>> {
        let response = self
            .client
            .get(format!("{}/dfs/block/read/{}", url.trim_end_matches('/'), hash))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(Some(response.bytes().await?.to_vec())),
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(None),
            status => Err(Error::Remote(format!(
                "reading block {} from {} failed with status {}",
                hash, url, status
            ))),
        }
    }
}
