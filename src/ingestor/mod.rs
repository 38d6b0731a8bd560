pub mod runner;

use crate::blockstream::ServerError;
use crate::config::ConfigError;
use crate::pipeline::PipelineError;
use crate::source::SourceError;
use crate::storage::SinkError;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use runner::Ingestor;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("block stream server error: {0}")]
    Server(#[from] ServerError),

    #[error("block store error: {0}")]
    Storage(#[from] SinkError),

    #[error("block stream server stopped before becoming ready")]
    ServerNotReady,

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Why a run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    StopBlockReached(u64),
    SourceExhausted,
    Signal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestorState {
    Configuring,
    Running,
    ShuttingDown,
    Stopped,
}

/// Requests a graceful stop of a running [`Ingestor`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }
}
