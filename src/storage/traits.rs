use crate::codec::Block;
use async_trait::async_trait;

/// Destination for decoded, in-window blocks.
#[async_trait]
pub trait BlockSink: Send + Sync {
    /// Prepares the sink before the first block. Called once per run.
    async fn init(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn persist(&self, block: &Block) -> Result<(), SinkError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize block: {0}")]
    Json(#[from] serde_json::Error),
}
