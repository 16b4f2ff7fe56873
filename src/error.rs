#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid hash '{0}'")]
    InvalidHash(String),

    #[error("content does not match block hash {0}")]
    HashMismatch(String),

    #[error("block of {0} bytes is too large")]
    TooLarge(usize),

    #[error("encryption error")]
    Encryption,

    #[error("no holder could serve block {0}")]
    NoHolders(String),

    #[error("block {0} could not be placed on any node")]
    Unplaced(String),

    #[error("remote call failed: {0}")]
    Remote(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    IO(#[from] std::io::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("unknown error {0:#}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
