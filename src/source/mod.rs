pub mod logs;
pub mod node;
pub mod reader;

use crate::config::types::{Config, Mode};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, BufReader};

pub use logs::LogsSource;
pub use node::NodeSource;
pub use reader::ReaderSource;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {seq} exceeds the line buffer size of {limit} bytes")]
    LineTooLong { seq: u64, limit: usize },

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("{0} is not configured")]
    Missing(&'static str),

    #[error("failed to spawn node process '{}': {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("node process exited unexpectedly: {0}")]
    ProcessExited(ExitStatus),
}

/// A single line of node output with its provenance.
#[derive(Debug, Clone)]
pub struct RawLine {
    pub source: Arc<str>,
    /// Position of the line within this run, starting at 0
    pub seq: u64,
    pub text: String,
}

/// The origin of raw lines for a run. Chosen once at startup.
pub enum LineSource {
    Stdin(ReaderSource),
    Logs(LogsSource),
    Node(NodeSource),
}

impl LineSource {
    /// Builds the source selected by `ingestor.mode`.
    ///
    /// No I/O happens here: files are scanned and the node process is
    /// spawned on the first call to [`LineSource::next_line`].
    pub fn from_config(config: &Config) -> Result<Self, SourceError> {
        let limit = config.ingestor.line_buffer_size;
        match config.ingestor.mode {
            Mode::Stdin => Ok(Self::stdin(limit)),
            Mode::Logs => Ok(LineSource::Logs(LogsSource::new(&config.logs, limit)?)),
            Mode::Node => Ok(LineSource::Node(NodeSource::new(&config.node, limit)?)),
        }
    }

    pub fn stdin(line_buffer_size: usize) -> Self {
        Self::from_reader("stdin", tokio::io::stdin(), line_buffer_size)
    }

    /// Wraps any async reader as a stdin-like source.
    pub fn from_reader<R>(name: &str, reader: R, line_buffer_size: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        LineSource::Stdin(ReaderSource::new(
            name,
            Box::new(BufReader::new(reader)),
            line_buffer_size,
        ))
    }

    pub fn name(&self) -> &str {
        match self {
            LineSource::Stdin(source) => source.name(),
            LineSource::Logs(source) => source.name(),
            LineSource::Node(source) => source.name(),
        }
    }

    /// Returns the next line, or `None` once the origin is exhausted.
    pub async fn next_line(&mut self) -> Result<Option<RawLine>, SourceError> {
        match self {
            LineSource::Stdin(source) => source.next_line().await,
            LineSource::Logs(source) => source.next_line().await,
            LineSource::Node(source) => source.next_line().await,
        }
    }

    /// Releases the underlying resource. For `node` this stops the child
    /// process, killing it if it outlives `grace`.
    pub async fn shutdown(&mut self, grace: Duration) {
        if let LineSource::Node(source) = self {
            source.shutdown(grace).await;
        }
    }
}
