use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] lancache_store::Error),

    #[error("state error: {0}")]
    Ops(#[from] lancache_ops::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cache path does not exist: {0}")]
    CachePathMissing(std::path::PathBuf),

    #[error("{count} file(s) could not be modified due to permission errors")]
    PermissionErrors { count: usize },

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
