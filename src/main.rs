use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tokio::runtime::Builder;

use dfs::{config, server};

/// content addressed block storage node
#[derive(Parser, Debug)]
#[clap(name ="dfs-node", author, version = env!("GIT_VERSION"), about, long_about = None)]
struct Options {
    /// enable debugging logs
    #[clap(short, long, action=ArgAction::Count)]
    debug: u8,

    /// config file path
    #[clap(short, long)]
    config_path: String,
}

fn main() -> Result<()> {
    let rt = Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    rt.block_on(app())
}

async fn app() -> Result<()> {
    let opts = Options::parse();
    simple_logger::SimpleLogger::new()
        .with_utc_timestamps()
        .with_level({
            match opts.debug {
                0 => log::LevelFilter::Info,
                1 => log::LevelFilter::Debug,
                _ => log::LevelFilter::Trace,
            }
        })
        .with_module_level("hyper", log::Level::Warn.to_level_filter())
        .with_module_level("reqwest", log::Level::Warn.to_level_filter())
        .init()?;

    let config = config::parse_config(&opts.config_path).context("failed to parse config file")?;
    log::info!(
        "starting node {} (meta service at {}, storage at {})",
        config.container_url,
        config.meta_url,
        config.storage_dir.display()
    );

    server::app(config).await
}
