use crate::meta::DfsNode;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

/// Node configuration, parsed once at start and shared by every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,

    /// address of this node inside the fleet network, also the node identity
    pub container_url: String,
    /// address of this node from outside the fleet
    pub local_url: String,
    pub meta_url: String,
    /// true if this node runs inside the fleet network
    #[serde(default = "default_true")]
    pub in_fleet: bool,

    pub storage_dir: PathBuf,
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default)]
    pub encrypt_blocks: bool,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// fail an upload if one of its blocks could not be placed anywhere,
    /// otherwise the block is left out of the file
    #[serde(default)]
    pub fail_on_unplaced_block: bool,
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: usize,
    /// number of blocks fetched concurrently while rebuilding a file
    #[serde(default = "default_parallel_fetch")]
    pub parallel_fetch: usize,
}

fn default_true() -> bool {
    true
}

fn default_block_size() -> usize {
    8 * 1024
}

fn default_heartbeat_secs() -> u64 {
    60
}

fn default_max_upload_size() -> usize {
    512 * 1024 * 1024
}

fn default_parallel_fetch() -> usize {
    8
}

impl Config {
    /// Address to use to reach the given node from this one.
    pub fn peer_url<'a>(&self, node: &'a DfsNode) -> &'a str {
        if self.in_fleet || node.local_url.is_empty() {
            &node.container_url
        } else {
            &node.local_url
        }
    }

    /// true if url designates this node
    pub fn is_self(&self, url: &str) -> bool {
        let url = url.trim_end_matches('/');
        url == self.container_url.trim_end_matches('/')
            || url == self.local_url.trim_end_matches('/')
    }

    /// registry entry describing this node
    pub fn node(&self) -> DfsNode {
        DfsNode::new(&self.container_url, &self.local_url)
    }
}

/// Parse the config file into Config struct.
pub fn parse_config(filepath: &str) -> Result<Config> {
    let content = fs::read_to_string(filepath).context("failed to read config file")?;
    let c: Config = toml::from_str(&content).context("failed to convert toml config data")?;
    validate(&c)?;

    fs::create_dir_all(&c.storage_dir).context("failed to create storage directory")?;

    Ok(c)
}

fn validate(c: &Config) -> Result<()> {
    if !hostname_validator::is_valid(&c.host) {
        return Err(anyhow::Error::msg(format!("host '{}' is invalid", c.host)));
    }

    for (name, u) in [
        ("container_url", &c.container_url),
        ("local_url", &c.local_url),
        ("meta_url", &c.meta_url),
    ] {
        url::Url::parse(u).with_context(|| format!("{} '{}' is invalid", name, u))?;
    }

    if let Some(ref u) = c.redis_url {
        url::Url::parse(u).with_context(|| format!("redis_url '{}' is invalid", u))?;
    }

    if c.block_size == 0 || c.block_size > u32::MAX as usize {
        return Err(anyhow::Error::msg(format!(
            "block size '{}' is invalid, must be between [1, {}]",
            c.block_size,
            u32::MAX
        )));
    }

    // a block stored through the block endpoint has to fit a u32 size
    if c.max_upload_size == 0 || c.max_upload_size as u64 > u32::MAX as u64 {
        return Err(anyhow::Error::msg(format!(
            "max upload size '{}' is invalid, must be between [1, {}]",
            c.max_upload_size,
            u32::MAX
        )));
    }

    if c.heartbeat_secs == 0 {
        return Err(anyhow::Error::msg("heartbeat interval must be at least 1 second"));
    }

    if c.parallel_fetch == 0 {
        return Err(anyhow::Error::msg("parallel fetch must be at least 1"));
    }

    if c.encrypt_blocks && c.key_path.is_none() {
        return Err(anyhow::Error::msg(
            "key_path is required when encrypt_blocks is enabled",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    const CONFIG: &str = r#"
host = "localhost"
port = 8081
container_url = "http://dfs-node-1:8081"
local_url = "http://localhost:8081"
meta_url = "http://localhost:8080"
storage_dir = "/tmp/dfs"
"#;

    fn config() -> Config {
        toml::from_str(CONFIG).unwrap()
    }

    #[test]
    fn defaults() {
        let c = config();
        assert_eq!(c.block_size, 8192);
        assert_eq!(c.heartbeat_secs, 60);
        assert_eq!(c.parallel_fetch, 8);
        assert!(c.in_fleet);
        assert!(!c.encrypt_blocks);
        assert!(!c.fail_on_unplaced_block);
        assert!(validate(&c).is_ok());
    }

    #[test]
    fn invalid() {
        let mut c = config();
        c.host = "not a host".into();
        assert!(validate(&c).is_err());

        let mut c = config();
        c.block_size = 0;
        assert!(validate(&c).is_err());

        let mut c = config();
        c.meta_url = "meta".into();
        assert!(validate(&c).is_err());

        let mut c = config();
        c.encrypt_blocks = true;
        assert!(validate(&c).is_err());

        let mut c = config();
        c.max_upload_size = u32::MAX as usize;
        assert!(validate(&c).is_ok());
        c.max_upload_size = (u32::MAX as u64 + 1) as usize;
        assert!(validate(&c).is_err());
    }

    #[test]
    fn address_resolution() {
        let mut c = config();
        let node = DfsNode::new("http://dfs-node-2:8082", "http://localhost:8082");
        assert_eq!(c.peer_url(&node), "http://dfs-node-2:8082");

        c.in_fleet = false;
        assert_eq!(c.peer_url(&node), "http://localhost:8082");

        assert!(c.is_self("http://dfs-node-1:8081/"));
        assert!(c.is_self("http://localhost:8081"));
        assert!(!c.is_self("http://dfs-node-2:8082"));
    }

    #[test]
    fn parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = dir.path().join("blocks");
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            CONFIG.replace("/tmp/dfs", storage.to_str().unwrap()),
        )
        .unwrap();

        let c = parse_config(path.to_str().unwrap()).unwrap();
        assert_eq!(c.port, 8081);
        assert!(storage.is_dir());
    }
}
