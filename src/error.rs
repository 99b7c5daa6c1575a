use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("store operation timed out after {0:?}")]
    StoreTimeout(Duration),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
