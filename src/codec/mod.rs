pub mod console;

use crate::source::RawLine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use console::FireConsoleDecoder;

/// A decoded block, ordered by `number` and identified by `hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub number: u64,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_hash: Option<String>,
    /// Opaque content produced by the decoder
    pub payload: String,
}

impl Block {
    pub fn block_ref(&self) -> BlockRef {
        BlockRef {
            number: self.number,
            hash: self.hash.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: u64,
    pub hash: String,
}

impl std::fmt::Display for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} ({})", self.number, self.hash)
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed line {seq}: {reason}")]
    Malformed { seq: u64, reason: String },

    #[error("corrupted stream at line {seq}: {reason}")]
    Corrupted { seq: u64, reason: String },

    #[error("line {seq} exceeds the line buffer size of {limit} bytes")]
    LineTooLong { seq: u64, limit: usize },
}

impl DecodeError {
    /// Fatal errors halt ingestion; the others are logged and the line skipped.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DecodeError::Malformed { .. })
    }
}

/// Turns raw console lines into blocks.
///
/// Lines are handed over in arrival order. A decoder may keep state across
/// lines to assemble multi-line records, so `decode` returns `Ok(None)` both
/// for lines that are not block data and for lines that only extend a
/// partial record.
pub trait ConsoleDecoder: Send {
    fn decode(&mut self, line: &RawLine) -> Result<Option<Block>, DecodeError>;

    /// Called once the line source is exhausted.
    fn finish(&mut self) -> Result<(), DecodeError> {
        Ok(())
    }
}
