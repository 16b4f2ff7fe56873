use super::{
    BlockNode, DfsFile, DfsNode, MetaService, RequestBlockNode, RequestFileByPath,
    RequestNodesForBlock, RequestSaveFile, ResponseNodesForBlock,
};
use crate::{Error, Result};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// HttpMetaClient talks to the metadata service REST api.
#[derive(Clone)]
pub struct HttpMetaClient {
    client: Client,
    base: String,
}

impl HttpMetaClient {
    pub fn new<U: AsRef<str>>(base: U) -> Result<Self> {
        let base = url::Url::parse(base.as_ref())?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base: base.as_str().trim_end_matches('/').to_owned(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/metadata/{}", self.base, path)
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::Remote(format!(
                "{} failed with status {}: {}",
                what,
                response.status(),
                response.text().await.unwrap_or_default()
            )));
        }

        Ok(response)
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        Ok(self.send(request, what).await?.json().await?)
    }

    /// like json but maps an empty or not found answer to None
    async fn optional<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<Option<T>> {
        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT => return Ok(None),
            status if !status.is_success() => {
                return Err(Error::Remote(format!(
                    "{} failed with status {}",
                    what, status
                )))
            }
            _ => {}
        }

        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(None);
        }

        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|err| Error::Remote(format!("{}: invalid response: {}", what, err)))
    }
}

#[async_trait::async_trait]
impl MetaService for HttpMetaClient {
    async fn nodes_for_block(
        &self,
        request: &RequestNodesForBlock,
    ) -> Result<ResponseNodesForBlock> {
        let req = self
            .client
            .post(self.url("block/nodes-for-block"))
            .json(request);
        self.json(req, "nodes for block").await
    }

    async fn register_block_location(&self, request: &RequestBlockNode) -> Result<()> {
        let req = self
            .client
            .post(self.url("block/register-block-location"))
            .json(request);
        self.send(req, "register block location").await?;
        Ok(())
    }

    async fn unregister_block(&self, hash: &str) -> Result<()> {
        let req = self
            .client
            .delete(self.url(&format!("block/unregister-block/{}", hash)));
        self.send(req, "unregister block").await?;
        Ok(())
    }

    async fn block_nodes(&self, hash: &str) -> Result<Vec<DfsNode>> {
        let req = self
            .client
            .get(self.url(&format!("block/block-nodes/{}", hash)));
        Ok(self
            .optional(req, "block nodes")
            .await?
            .unwrap_or_default())
    }

    async fn register_node(&self, node: &DfsNode) -> Result<()> {
        let req = self.client.post(self.url("register-node")).json(node);
        self.send(req, "register node").await?;
        Ok(())
    }

    async fn save_file(&self, request: &RequestSaveFile) -> Result<()> {
        let req = self.client.post(self.url("file/save")).json(request);
        self.send(req, "save file").await?;
        Ok(())
    }

    async fn file_by_path(&self, request: &RequestFileByPath) -> Result<Option<DfsFile>> {
        let req = self
            .client
            .post(self.url("file/get-by-filepath"))
            .json(request);
        self.optional(req, "get file by path").await
    }

    async fn file_by_hash(&self, hash: &str) -> Result<Option<DfsFile>> {
        let req = self.client.get(self.url(&format!("file/{}", hash)));
        self.optional(req, "get file by hash").await
    }

    async fn file_block_nodes(&self, file_hash: &str) -> Result<Vec<BlockNode>> {
        let req = self
            .client
            .post(self.url("file/block-nodes"))
            .body(file_hash.to_owned());
        Ok(self
            .optional(req, "file block nodes")
            .await?
            .unwrap_or_default())
    }

    async fn local_url_for_node(&self, container_url: &str) -> Result<String> {
        let req = self
            .client
            .post(self.url("get-localurl-for-node"))
            .body(container_url.to_owned());
        let url = self.send(req, "local url for node").await?.text().await?;
        if url.trim().is_empty() {
            return Err(Error::NotFound(format!("local url of {}", container_url)));
        }

        Ok(url.trim().to_owned())
    }
}
