use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeeperError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("token load failed: {0}")]
    TokenLoad(String),

    #[error("no token available for encryption")]
    NoEncryptionToken,

    #[error("crypto operation failed: {0}")]
    Crypto(String),

    #[error("store operation failed: {0}")]
    Store(String),

    #[error("no configured token can decrypt '{0}'")]
    NoKey(String),

    #[error("invalid secret key '{0}'")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<openssl::error::ErrorStack> for KeeperError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        KeeperError::Crypto(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KeeperError>;
