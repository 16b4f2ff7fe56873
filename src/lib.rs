#[macro_use]
extern crate log;

pub mod bfs;
pub mod config;
pub mod dedupe;
pub mod download;
pub mod error;
pub mod hash;
pub mod heartbeat;
pub mod meta;
pub mod peer;
pub mod server;
pub mod service;

pub use error::{Error, Result};
